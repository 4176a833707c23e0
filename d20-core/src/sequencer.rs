//! Expansion of one invocation into its ordered sub-attacks.
//!
//! Sequence-wide penalties (rapid shot, two-weapon fighting, manyshot) are
//! written into the roll context and referenced from
//! [`Sequence::attack_parts`] so that every sub-attack's formula shows
//! where its numbers came from.

use crate::actor::Actor;
use crate::config::EngineConfig;
use crate::context::RollContext;
use crate::entity::{ActionClass, ActionableEntity, AttackKind, AutoScale, Capability, ConditionalScope, ConditionalTarget, DamagePart};
use crate::formula::{Formula, FormulaError};
use crate::options::{InvocationOptions, TwoWeaponMode};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One attack-roll-plus-damage unit within an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAttackDescriptor {
    pub index: usize,
    /// Attack bonus delta formula (`0`, `-5`).
    pub bonus: String,
    pub label: String,
    pub primary: bool,
    /// Attack parts for this sub-attack only.
    #[serde(default)]
    pub attack_parts: Vec<String>,
    /// Damage parts for this sub-attack only.
    #[serde(default)]
    pub damage_parts: Vec<DamagePart>,
    /// Additional non-critical damage rolls (manyshot arrows).
    #[serde(default)]
    pub extra_damage_rolls: u32,
}

impl SubAttackDescriptor {
    fn new(bonus: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            index: 0,
            bonus: bonus.into(),
            label: label.into(),
            primary: true,
            attack_parts: Vec::new(),
            damage_parts: Vec::new(),
            extra_damage_rolls: 0,
        }
    }

    pub fn bonus_delta(&self, ctx: &RollContext) -> Result<i64, FormulaError> {
        if self.bonus.trim().is_empty() {
            return Ok(0);
        }
        Formula::parse(&self.bonus)?.compute(ctx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceMode {
    /// Attack rolls, each with damage when the entity has any.
    Attack,
    /// Damage without an attack roll, once per attack count.
    DamageOnly,
    EffectOnly,
    Special,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sequence {
    pub mode: SequenceMode,
    pub descriptors: Vec<SubAttackDescriptor>,
    /// Attack parts shared by every sub-attack.
    pub attack_parts: Vec<String>,
    /// Damage parts shared by every sub-attack.
    pub damage_parts: Vec<DamagePart>,
    pub labels: Vec<String>,
}

impl Sequence {
    fn new(mode: SequenceMode) -> Self {
        Self {
            mode,
            descriptors: Vec::new(),
            attack_parts: Vec::new(),
            damage_parts: Vec::new(),
            labels: Vec::new(),
        }
    }

    fn penalty(&mut self, ctx: &mut RollContext, key: &str, value: i64) {
        ctx.set(key, value);
        self.attack_parts.push(format!("@{key}"));
    }
}

pub fn mode_of(entity: &ActionableEntity) -> SequenceMode {
    if entity.has_attack() {
        SequenceMode::Attack
    } else if entity.has_damage() {
        SequenceMode::DamageOnly
    } else if entity.action == ActionClass::Special && !entity.has_effect() {
        SequenceMode::Special
    } else {
        SequenceMode::EffectOnly
    }
}

fn attack_count(entity: &ActionableEntity, ctx: &RollContext) -> Result<i64, FormulaError> {
    match entity.attack_count.as_deref().map(str::trim) {
        None | Some("") => Ok(1),
        Some(source) => Ok(Formula::parse(source)?.compute(ctx)?.max(1)),
    }
}

/// Build the ordered sub-attack list for one invocation. Aggregated
/// modifiers must already be in `ctx`.
pub fn sequence(
    actor: &Actor,
    entity: &ActionableEntity,
    options: &InvocationOptions,
    config: &EngineConfig,
    ctx: &mut RollContext,
) -> Result<Sequence, FormulaError> {
    let mode = mode_of(entity);
    let mut seq = Sequence::new(mode);
    match mode {
        SequenceMode::Attack => build_attacks(&mut seq, actor, entity, options, config, ctx)?,
        SequenceMode::DamageOnly => {
            for _ in 0..attack_count(entity, ctx)? {
                seq.descriptors.push(SubAttackDescriptor::new("0", ""));
            }
        }
        SequenceMode::EffectOnly | SequenceMode::Special => {
            seq.descriptors.push(SubAttackDescriptor::new("0", ""));
        }
    }

    let primary = options.primary.unwrap_or(entity.primary);
    for (index, descriptor) in seq.descriptors.iter_mut().enumerate() {
        descriptor.index = index;
        descriptor.primary = primary;
    }

    for conditional in entity
        .conditionals
        .iter()
        .filter(|c| options.conditional_enabled(&c.name))
    {
        seq.labels.push(conditional.name.clone());
        for modifier in &conditional.modifiers {
            let slot = match modifier.scope {
                ConditionalScope::All => None,
                ConditionalScope::Index(i) => match seq.descriptors.get_mut(i) {
                    Some(descriptor) => Some(descriptor),
                    None => {
                        debug!(conditional = %conditional.name, index = i, "conditional targets a missing sub-attack");
                        continue;
                    }
                },
            };
            match (modifier.target, slot) {
                (ConditionalTarget::Attack, None) => seq.attack_parts.push(modifier.formula.clone()),
                (ConditionalTarget::Attack, Some(d)) => d.attack_parts.push(modifier.formula.clone()),
                (ConditionalTarget::Damage, None) => seq
                    .damage_parts
                    .push(DamagePart::new(modifier.formula.clone(), modifier.damage_type.clone())),
                (ConditionalTarget::Damage, Some(d)) => d
                    .damage_parts
                    .push(DamagePart::new(modifier.formula.clone(), modifier.damage_type.clone())),
            }
        }
    }

    debug!(
        entity = %entity.name,
        ?mode,
        labels = ?seq.descriptors.iter().map(|d| d.label.as_str()).collect::<Vec<_>>(),
        "sequenced"
    );
    Ok(seq)
}

fn build_attacks(
    seq: &mut Sequence,
    actor: &Actor,
    entity: &ActionableEntity,
    options: &InvocationOptions,
    config: &EngineConfig,
    ctx: &mut RollContext,
) -> Result<(), FormulaError> {
    let bab = actor.stats.bab;
    let full = options.full_attack;
    let attacks = &mut seq.descriptors;

    let auto_scale = (config.auto_scale_attacks_bab
        && !actor.is_npc
        && entity.attack_kind == AttackKind::Weapon
        && entity.auto_scale != AutoScale::Never)
        || entity.auto_scale == AutoScale::Always;
    attacks.push(SubAttackDescriptor::new("0", "Attack"));
    if full && auto_scale {
        let mut delta = 5;
        while delta < bab {
            attacks.push(SubAttackDescriptor::new(format!("-{delta}"), format!("Attack {}", (delta + 5) / 5)));
            delta += 5;
        }
    } else if full {
        attacks.extend(
            entity
                .extra_attacks
                .iter()
                .map(|extra| SubAttackDescriptor::new(extra.bonus.clone(), extra.label.clone())),
        );
    }

    if options.rapid_shot && (full || bab < 6) {
        attacks.insert(0, SubAttackDescriptor::new("0", "Rapid Shot"));
        seq.labels.push("Rapid Shot".to_string());
        ctx.set("rapidShotPenalty", -2);
        seq.attack_parts.push("@rapidShotPenalty".to_string());
    }

    if options.flurry {
        let attacks = &mut seq.descriptors;
        attacks.push(SubAttackDescriptor::new("0", "Flurry of Blows"));
        let monk = actor.class_level("monk");
        let penalty = if monk < 5 {
            -2
        } else if monk < 9 {
            -1
        } else {
            0
        };
        if monk > 10 {
            attacks.push(SubAttackDescriptor::new("0", "Flurry of Blows 2"));
        }
        seq.labels.push("Flurry of Blows".to_string());
        if penalty != 0 {
            seq.penalty(ctx, "flurryOfBlowsPenalty", penalty);
        }
    }

    let hasted = actor.has_capability(Capability::Hasted);
    if (full || bab < 6) && hasted && matches!(entity.attack_kind, AttackKind::Weapon | AttackKind::Natural) {
        seq.descriptors.insert(0, SubAttackDescriptor::new("0", "Haste"));
    }

    let trained = actor.has_capability(Capability::TwoWeaponFighting)
        || actor.has_capability(Capability::MultiweaponFighting);
    let twf = options.two_weapon.penalty(trained);
    if twf != 0 {
        seq.penalty(ctx, "twoWeaponPenalty", twf);
    }
    ctx.set("weaponHands", if options.two_weapon == TwoWeaponMode::TwoHanded { 2 } else { 1 });
    if options.two_weapon.is_offhand() {
        if actor.has_capability(Capability::ImprovedTwoWeaponFighting) {
            seq.descriptors.push(SubAttackDescriptor::new("-5", "Attack 2"));
        }
        if actor.has_capability(Capability::GreaterTwoWeaponFighting) {
            seq.descriptors.push(SubAttackDescriptor::new("-10", "Attack 3"));
        }
    }

    if ctx.number("featAdditionalAttacksBAB") > 0.0 {
        for _ in 0..ctx.int("featAttackNumberBonus").max(0) {
            seq.descriptors.push(SubAttackDescriptor::new("0", "Feat Bonus Attack"));
        }
    }

    let manyshot = options.manyshot_count();
    if manyshot > 0 {
        seq.penalty(ctx, "manyshotPenalty", -2 * i64::from(manyshot));
        seq.labels.push("Manyshot".to_string());
        for descriptor in &mut seq.descriptors {
            descriptor.extra_damage_rolls = manyshot - 1;
        }
    }

    let greater = options.greater_manyshot_count();
    if greater > 0 {
        seq.penalty(ctx, "greaterManyshotPenalty", -2 * i64::from(greater));
        seq.labels.push("Greater Manyshot".to_string());
        seq.descriptors = seq
            .descriptors
            .iter()
            .flat_map(|attack| {
                (1..=greater).map(move |arrow| SubAttackDescriptor {
                    label: format!("{} (Greater Manyshot Arrow {arrow})", attack.label),
                    ..attack.clone()
                })
            })
            .collect();
    }

    if entity.attack_count.is_some() && entity.extra_attacks.is_empty() {
        for _ in 1..attack_count(entity, ctx)? {
            seq.descriptors.push(SubAttackDescriptor::new("0", "Attack"));
        }
    }
    Ok(())
}
