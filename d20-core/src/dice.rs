//! Dice sources and rolled dice terms.
//!
//! Formulas never touch an RNG directly. Every die goes through a
//! [`DiceRoller`], so a resolution can be reproduced from a seed, forced
//! to specific faces in tests, or maximized by metamagic.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Largest number of dice a single term may roll.
pub const MAX_DICE_PER_TERM: u32 = 1000;

/// Error type for dice terms that cannot be rolled.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DiceError {
    #[error("Invalid die size: {0}")]
    InvalidDieSize(i64),
    #[error("Invalid dice count: {0}")]
    InvalidCount(i64),
    #[error("Cannot keep {keep} dice when only rolling {count}")]
    InvalidKeepCount { keep: u32, count: u32 },
}

/// A source of die faces.
pub trait DiceRoller: Send + Sync {
    /// Roll one die with the given number of sides, returning a face in `1..=sides`.
    fn roll_die(&mut self, sides: u32) -> u32;
}

impl<T: DiceRoller + ?Sized> DiceRoller for Box<T> {
    fn roll_die(&mut self, sides: u32) -> u32 {
        (**self).roll_die(sides)
    }
}

/// Reproducible roller backed by ChaCha8.
#[derive(Debug, Clone)]
pub struct SeededRoller {
    seed: u64,
    rng: ChaCha8Rng,
}

impl SeededRoller {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl DiceRoller for SeededRoller {
    fn roll_die(&mut self, sides: u32) -> u32 {
        self.rng.gen_range(1..=sides.max(1))
    }
}

/// Roller using the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRoller;

impl DiceRoller for ThreadRoller {
    fn roll_die(&mut self, sides: u32) -> u32 {
        rand::thread_rng().gen_range(1..=sides.max(1))
    }
}

/// Always rolls the highest face (maximized effects).
#[derive(Debug, Clone, Copy, Default)]
pub struct MaximizedRoller;

impl DiceRoller for MaximizedRoller {
    fn roll_die(&mut self, sides: u32) -> u32 {
        sides.max(1)
    }
}

/// Which dice of a term count toward its subtotal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Keep {
    #[default]
    All,
    Highest(u32),
    Lowest(u32),
}

/// One rolled `NdM` term with its individual faces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceTerm {
    pub count: u32,
    pub sides: u32,
    #[serde(default)]
    pub keep: Keep,
    pub faces: Vec<u32>,
    /// Indices into `faces` that were discarded by a keep rule.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dropped: Vec<usize>,
}

impl DiceTerm {
    /// Validate raw count/sides values produced by a formula.
    pub fn check(count: i64, sides: i64, keep: Keep) -> Result<(u32, u32), DiceError> {
        if !(0..=i64::from(MAX_DICE_PER_TERM)).contains(&count) {
            return Err(DiceError::InvalidCount(count));
        }
        if !(1..=10_000).contains(&sides) {
            return Err(DiceError::InvalidDieSize(sides));
        }
        let count = count as u32;
        match keep {
            Keep::Highest(k) | Keep::Lowest(k) if k > count => {
                Err(DiceError::InvalidKeepCount { keep: k, count })
            }
            _ => Ok((count, sides as u32)),
        }
    }

    /// Roll `count` dice of `sides` through `roller`.
    pub fn roll(count: u32, sides: u32, keep: Keep, roller: &mut dyn DiceRoller) -> Self {
        let faces: Vec<u32> = (0..count).map(|_| roller.roll_die(sides)).collect();
        let dropped = dropped_indices(&faces, keep);
        Self {
            count,
            sides,
            keep,
            faces,
            dropped,
        }
    }

    /// Sum of kept faces.
    pub fn subtotal(&self) -> i64 {
        self.kept().map(i64::from).sum()
    }

    pub fn kept(&self) -> impl Iterator<Item = u32> + '_ {
        self.faces
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.dropped.contains(i))
            .map(|(_, f)| *f)
    }

    /// Format the faces for display, marking dropped dice with `~`.
    pub fn dice_display(&self) -> String {
        let faces: Vec<String> = self
            .faces
            .iter()
            .enumerate()
            .map(|(i, f)| {
                if self.dropped.contains(&i) {
                    format!("~{f}")
                } else {
                    f.to_string()
                }
            })
            .collect();
        format!("[{}]", faces.join(", "))
    }
}

impl fmt::Display for DiceTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}d{}", self.count, self.sides)?;
        match self.keep {
            Keep::All => Ok(()),
            Keep::Highest(k) => write!(f, "kh{k}"),
            Keep::Lowest(k) => write!(f, "kl{k}"),
        }
    }
}

fn dropped_indices(faces: &[u32], keep: Keep) -> Vec<usize> {
    let keep_n = match keep {
        Keep::All => return Vec::new(),
        Keep::Highest(k) | Keep::Lowest(k) => k as usize,
    };
    let mut order: Vec<usize> = (0..faces.len()).collect();
    match keep {
        Keep::Highest(_) => order.sort_by(|a, b| faces[*b].cmp(&faces[*a])),
        _ => order.sort_by(|a, b| faces[*a].cmp(&faces[*b])),
    }
    let mut dropped: Vec<usize> = order.into_iter().skip(keep_n).collect();
    dropped.sort_unstable();
    dropped
}
