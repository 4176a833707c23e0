//! Testing utilities for the engine.
//!
//! This module provides tools for integration testing:
//! - `ScriptedRoller` for forced die faces
//! - `CancelPrompt` and `RecordingPrompt` for the options dialog
//! - `TestHarness` for driving invocations against a single actor
//! - Assertion helpers for verifying resource state

use crate::actor::{AbilityScores, Actor, ActorId, Spellbook, User};
use crate::catalog;
use crate::config::EngineConfig;
use crate::dice::{DiceRoller, SeededRoller};
use crate::engine::{Engine, EngineError, OptionsPrompt, ResolutionBundle};
use crate::entity::{ActionableEntity, EntityId, SpellData};
use crate::options::{InvocationOptions, OptionsRequest};
use crate::store::{ActorStore, StoreError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A roller that returns scripted faces in order, then falls back to a
/// fixed-seed roller.
///
/// Clones share the same queue, so a test can keep a handle and queue more
/// faces after handing the roller to an engine.
#[derive(Debug, Clone)]
pub struct ScriptedRoller {
    faces: Arc<Mutex<VecDeque<u32>>>,
    fallback: SeededRoller,
}

impl ScriptedRoller {
    pub fn new(faces: Vec<u32>) -> Self {
        Self {
            faces: Arc::new(Mutex::new(faces.into())),
            fallback: SeededRoller::new(0),
        }
    }

    /// Queue more faces behind any still pending.
    pub fn push(&self, faces: &[u32]) {
        locked(&self.faces).extend(faces.iter().copied());
    }

    /// Faces not yet consumed.
    pub fn remaining(&self) -> usize {
        locked(&self.faces).len()
    }
}

impl DiceRoller for ScriptedRoller {
    fn roll_die(&mut self, sides: u32) -> u32 {
        match locked(&self.faces).pop_front() {
            Some(face) => face.clamp(1, sides.max(1)),
            None => self.fallback.roll_die(sides),
        }
    }
}

/// Cancels every invocation at the prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct CancelPrompt;

#[async_trait]
impl OptionsPrompt for CancelPrompt {
    async fn choose(&self, _request: &OptionsRequest) -> Option<InvocationOptions> {
        None
    }
}

/// Answers with fixed options and keeps every request it was shown.
#[derive(Debug, Clone, Default)]
pub struct RecordingPrompt {
    answer: Option<InvocationOptions>,
    requests: Arc<Mutex<Vec<OptionsRequest>>>,
}

impl RecordingPrompt {
    pub fn answering(options: InvocationOptions) -> Self {
        Self {
            answer: Some(options),
            requests: Arc::default(),
        }
    }

    pub fn requests(&self) -> Vec<OptionsRequest> {
        locked(&self.requests).clone()
    }
}

#[async_trait]
impl OptionsPrompt for RecordingPrompt {
    async fn choose(&self, request: &OptionsRequest) -> Option<InvocationOptions> {
        locked(&self.requests).push(request.clone());
        self.answer.clone()
    }
}

// ============================================================================
// Sample actors
// ============================================================================

/// A 6th-level fighter: STR 16, BAB +6, longsword with an iterative attack.
pub fn sample_fighter(name: &str) -> Actor {
    let mut actor = Actor::new(name)
        .with_abilities(AbilityScores::new(16, 13, 14, 10, 12, 8))
        .with_bab(6)
        .with_hit_points(52)
        .with_class_level("fighter", 6);
    actor
        .entities
        .extend(catalog::instantiate("Longsword").map(|sword| sword.with_extra_attack("-5", "Attack 2")));
    actor.entities.extend(catalog::instantiate("Power Attack"));
    actor.entities.extend(catalog::instantiate("Weapon Focus"));
    actor
}

/// A 6th-level ranger-style archer with rapid shot, manyshot and arrows.
pub fn sample_archer(name: &str) -> Actor {
    let mut actor = Actor::new(name)
        .with_abilities(AbilityScores::new(12, 18, 12, 10, 14, 8))
        .with_bab(6)
        .with_hit_points(40)
        .with_class_level("ranger", 6);
    actor
        .entities
        .extend(catalog::instantiate("Longbow").map(|bow| bow.with_extra_attack("-5", "Attack 2")));
    for name in ["Arrows", "Rapid Shot", "Manyshot"] {
        actor.entities.extend(catalog::instantiate(name));
    }
    actor
}

/// A 5th-level wizard with two prepared magic missiles and a wand.
pub fn sample_wizard(name: &str) -> Actor {
    let mut actor = Actor::new(name)
        .with_abilities(AbilityScores::new(8, 14, 12, 18, 12, 10))
        .with_bab(2)
        .with_hit_points(22)
        .with_class_level("wizard", 5)
        .with_spellbook("primary", Spellbook::prepared(5));
    for (spell, prepared) in [("Magic Missile", 2), ("Fireball", 1)] {
        actor.entities.extend(catalog::instantiate(spell).map(|mut entity| {
            if let Some(data) = entity.spell.as_mut() {
                data.prepared = prepared;
                data.max_prepared = prepared;
            }
            entity
        }));
    }
    actor.entities.extend(catalog::instantiate("Wand of Magic Missile"));
    actor
}

/// A spell entity bound to the `primary` spellbook.
pub fn prepared_spell(entity: ActionableEntity, level: u8, prepared: i64) -> ActionableEntity {
    entity.with_spell(SpellData {
        spellbook: "primary".to_string(),
        level,
        at_will: false,
        prepared,
        max_prepared: prepared,
        power_point_cost: 0,
    })
}

// ============================================================================
// Harness
// ============================================================================

/// Drives invocations for one actor owned by a test user.
pub struct TestHarness {
    pub engine: Engine,
    pub user: User,
    pub actor: ActorId,
    /// Shared with the engine; queue faces here.
    pub roller: ScriptedRoller,
}

impl TestHarness {
    pub fn new(actor: Actor) -> Self {
        Self::with_config(actor, EngineConfig::default())
    }

    pub fn with_config(actor: Actor, config: EngineConfig) -> Self {
        let user = User::player("Tester");
        let actor = actor.with_owner(&user);
        let id = actor.id;
        let roller = ScriptedRoller::new(Vec::new());
        let engine = Engine::new(ActorStore::from_actors([actor]), config).with_roller(roller.clone());
        Self {
            engine,
            user,
            actor: id,
            roller,
        }
    }

    /// Queue die faces for the next rolls.
    pub fn faces(&self, faces: &[u32]) -> &Self {
        self.roller.push(faces);
        self
    }

    pub async fn actor(&self) -> Result<Actor, StoreError> {
        self.engine.store().get(self.actor).await
    }

    pub async fn entity_id(&self, name: &str) -> Option<EntityId> {
        let actor = self.actor().await.ok()?;
        actor.find_entity(name, None).map(|e| e.id)
    }

    /// Invoke the named entity with fixed options.
    pub async fn invoke(&self, name: &str, options: InvocationOptions) -> Result<ResolutionBundle, EngineError> {
        self.invoke_with(name, &options).await
    }

    /// Invoke the named entity, asking `prompt` for options. Unknown names
    /// surface as [`EngineError::EntityNotFound`].
    pub async fn invoke_with(&self, name: &str, prompt: &dyn OptionsPrompt) -> Result<ResolutionBundle, EngineError> {
        let id = self.entity_id(name).await.unwrap_or_default();
        self.engine.invoke(&self.user, self.actor, id, prompt).await
    }

    /// Remaining uses of the named entity.
    pub async fn uses(&self, name: &str) -> Option<i64> {
        let actor = self.actor().await.ok()?;
        actor.find_entity(name, None).map(|e| e.uses.state.value)
    }

    pub async fn quantity(&self, name: &str) -> Option<i64> {
        let actor = self.actor().await.ok()?;
        actor.find_entity(name, None).and_then(|e| e.quantity)
    }
}

// ============================================================================
// Assertion Helpers
// ============================================================================

/// Assert the named entity has `expected` uses left.
#[track_caller]
pub fn assert_uses(actor: &Actor, name: &str, expected: i64) {
    let actual = actor.find_entity(name, None).map(|e| e.uses.state.value);
    assert_eq!(actual, Some(expected), "Expected {name} to have {expected} uses, got {actual:?}");
}

/// Assert the named entity's stack holds `expected` items.
#[track_caller]
pub fn assert_quantity(actor: &Actor, name: &str, expected: i64) {
    let actual = actor.find_entity(name, None).and_then(|e| e.quantity);
    assert_eq!(actual, Some(expected), "Expected {expected} {name}, got {actual:?}");
}
