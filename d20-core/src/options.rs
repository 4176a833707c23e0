//! Per-invocation selections, and the dialog data offered to whoever
//! chooses them.

use crate::actor::Actor;
use crate::entity::{ActionableEntity, AttackKind, Capability, EntityId, EntityKind};
use crate::modifiers;
use crate::resources::{self, Availability};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TwoWeaponMode {
    #[default]
    None,
    MainOffhandLight,
    MainOffhandNormal,
    OffhandLight,
    OffhandNormal,
    TwoHanded,
}

impl TwoWeaponMode {
    pub fn is_offhand(&self) -> bool {
        matches!(self, TwoWeaponMode::OffhandLight | TwoWeaponMode::OffhandNormal)
    }

    /// Attack penalty, with and without a two-weapon feat.
    pub fn penalty(&self, trained: bool) -> i64 {
        match (self, trained) {
            (TwoWeaponMode::MainOffhandLight, false) => -4,
            (TwoWeaponMode::MainOffhandLight, true) => -2,
            (TwoWeaponMode::MainOffhandNormal, false) => -6,
            (TwoWeaponMode::MainOffhandNormal, true) => -4,
            (TwoWeaponMode::OffhandLight, false) => -8,
            (TwoWeaponMode::OffhandLight, true) => -2,
            (TwoWeaponMode::OffhandNormal, false) => -10,
            (TwoWeaponMode::OffhandNormal, true) => -4,
            (TwoWeaponMode::None | TwoWeaponMode::TwoHanded, _) => 0,
        }
    }
}

/// Situational attack toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Situational {
    #[serde(default)]
    pub prone: bool,
    #[serde(default)]
    pub squeezing: bool,
    #[serde(default)]
    pub high_ground: bool,
    #[serde(default)]
    pub defensive: bool,
    #[serde(default)]
    pub charge: bool,
    #[serde(default)]
    pub close_quarters_shot: bool,
    #[serde(default)]
    pub flanking: bool,
}

impl Situational {
    /// `(context key, bonus, label)` for every enabled toggle.
    pub fn active(&self) -> Vec<(&'static str, i64, &'static str)> {
        [
            (self.prone, "pronePenalty", -4, "Prone"),
            (self.squeezing, "squeezingPenalty", -4, "Squeezing"),
            (self.high_ground, "highground", 1, "High Ground"),
            (self.defensive, "defensive", -4, "Fighting Defensively"),
            (self.charge, "charge", 2, "Charge"),
            (self.close_quarters_shot, "ccshot", -4, "Close Quarters Shot"),
            (self.flanking, "flanking", 2, "Flanking"),
        ]
        .into_iter()
        .filter(|(on, ..)| *on)
        .map(|(_, key, bonus, label)| (key, bonus, label))
        .collect()
    }
}

/// An optional modifier source picked for this invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionalSelection {
    pub source: EntityId,
    /// Base value followed by up to three sliders (`@range`, `@range1..3`).
    #[serde(default)]
    pub ranges: Vec<i64>,
}

impl OptionalSelection {
    pub fn new(source: EntityId) -> Self {
        Self {
            source,
            ranges: Vec::new(),
        }
    }

    pub fn with_range(mut self, value: i64) -> Self {
        self.ranges.push(value);
        self
    }

    pub fn base(&self) -> i64 {
        self.ranges.first().copied().unwrap_or(0)
    }
}

/// Every transient choice made for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationOptions {
    #[serde(default)]
    pub full_attack: bool,
    #[serde(default)]
    pub attack_bonus: Option<String>,
    #[serde(default)]
    pub damage_bonus: Option<String>,
    #[serde(default)]
    pub power_attack: Option<i64>,
    #[serde(default)]
    pub two_weapon: TwoWeaponMode,
    /// Overrides the entity's primary/secondary flag for natural attacks.
    #[serde(default)]
    pub primary: Option<bool>,
    #[serde(default)]
    pub ammunition: Option<EntityId>,
    #[serde(default)]
    pub rapid_shot: bool,
    #[serde(default)]
    pub flurry: bool,
    #[serde(default)]
    pub manyshot: Option<u32>,
    #[serde(default)]
    pub greater_manyshot: Option<u32>,
    /// Deal non-lethal damage; a mismatch with the entity costs −4.
    #[serde(default)]
    pub non_lethal: Option<bool>,
    #[serde(default)]
    pub situational: Situational,
    #[serde(default)]
    pub optional_sources: Vec<OptionalSelection>,
    #[serde(default)]
    pub conditionals: Vec<String>,
    #[serde(default = "default_use_amount")]
    pub use_amount: i64,
    #[serde(default)]
    pub damage_ability_multiplier: Option<f64>,
    #[serde(default)]
    pub target_ac: Option<i64>,
}

fn default_use_amount() -> i64 {
    1
}

impl Default for InvocationOptions {
    fn default() -> Self {
        Self {
            full_attack: false,
            attack_bonus: None,
            damage_bonus: None,
            power_attack: None,
            two_weapon: TwoWeaponMode::None,
            primary: None,
            ammunition: None,
            rapid_shot: false,
            flurry: false,
            manyshot: None,
            greater_manyshot: None,
            non_lethal: None,
            situational: Situational::default(),
            optional_sources: Vec::new(),
            conditionals: Vec::new(),
            use_amount: 1,
            damage_ability_multiplier: None,
            target_ac: None,
        }
    }
}

impl InvocationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single attack with the entity's default conditionals enabled.
    pub fn defaults_for(entity: &ActionableEntity) -> Self {
        Self {
            conditionals: entity
                .conditionals
                .iter()
                .filter(|c| c.default)
                .map(|c| c.name.clone())
                .collect(),
            ..Self::default()
        }
    }

    pub fn full_attack(mut self) -> Self {
        self.full_attack = true;
        self
    }

    pub fn with_attack_bonus(mut self, formula: impl Into<String>) -> Self {
        self.attack_bonus = Some(formula.into());
        self
    }

    pub fn with_damage_bonus(mut self, formula: impl Into<String>) -> Self {
        self.damage_bonus = Some(formula.into());
        self
    }

    pub fn with_power_attack(mut self, amount: i64) -> Self {
        self.power_attack = Some(amount);
        self
    }

    pub fn with_two_weapon(mut self, mode: TwoWeaponMode) -> Self {
        self.two_weapon = mode;
        self
    }

    pub fn with_primary(mut self, primary: bool) -> Self {
        self.primary = Some(primary);
        self
    }

    pub fn with_ammunition(mut self, id: EntityId) -> Self {
        self.ammunition = Some(id);
        self
    }

    pub fn with_rapid_shot(mut self) -> Self {
        self.rapid_shot = true;
        self
    }

    pub fn with_flurry(mut self) -> Self {
        self.flurry = true;
        self
    }

    pub fn with_manyshot(mut self, count: u32) -> Self {
        self.manyshot = Some(count);
        self
    }

    pub fn with_greater_manyshot(mut self, count: u32) -> Self {
        self.greater_manyshot = Some(count);
        self
    }

    pub fn with_non_lethal(mut self, non_lethal: bool) -> Self {
        self.non_lethal = Some(non_lethal);
        self
    }

    pub fn with_situational(mut self, situational: Situational) -> Self {
        self.situational = situational;
        self
    }

    pub fn with_optional_source(mut self, selection: OptionalSelection) -> Self {
        self.optional_sources.push(selection);
        self
    }

    pub fn with_conditional(mut self, name: impl Into<String>) -> Self {
        self.conditionals.push(name.into());
        self
    }

    pub fn with_use_amount(mut self, amount: i64) -> Self {
        self.use_amount = amount;
        self
    }

    pub fn with_damage_ability_multiplier(mut self, mult: f64) -> Self {
        self.damage_ability_multiplier = Some(mult);
        self
    }

    pub fn with_target_ac(mut self, ac: i64) -> Self {
        self.target_ac = Some(ac);
        self
    }

    pub fn selection(&self, source: EntityId) -> Option<&OptionalSelection> {
        self.optional_sources.iter().find(|s| s.source == source)
    }

    pub fn conditional_enabled(&self, name: &str) -> bool {
        self.conditionals.iter().any(|c| c == name)
    }

    /// Manyshot arrow count; counts below 2 are no manyshot at all.
    pub fn manyshot_count(&self) -> u32 {
        self.manyshot.filter(|n| *n >= 2).unwrap_or(0)
    }

    pub fn greater_manyshot_count(&self) -> u32 {
        self.greater_manyshot.filter(|n| *n >= 1).unwrap_or(0)
    }
}

/// A choice offered to the prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub id: EntityId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<i64>,
}

/// What the prompt may offer for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionsRequest {
    pub entity: String,
    pub extra_attack_count: usize,
    pub power_attack_max: Option<i64>,
    pub manyshot_max: Option<i64>,
    pub greater_manyshot_max: Option<i64>,
    pub rapid_shot: bool,
    pub flurry: bool,
    pub use_amount_max: Option<i64>,
    pub ammunition: Vec<Choice>,
    pub optional_sources: Vec<Choice>,
    pub conditionals: Vec<(String, bool)>,
    pub defaults: InvocationOptions,
}

impl OptionsRequest {
    pub fn build(actor: &Actor, entity: &ActionableEntity) -> Self {
        let bab = actor.stats.bab;
        let can = |capability| actor.has_capability(capability);
        let ranged_weapon =
            entity.attack_kind == AttackKind::Weapon && entity.action.is_ranged() && entity.action.is_weapon_attack();
        let ammunition = if ranged_weapon {
            actor
                .entities
                .iter()
                .filter(|e| e.kind == EntityKind::Ammunition && e.quantity.unwrap_or(0) > 0)
                .map(|e| Choice {
                    id: e.id,
                    name: e.name.clone(),
                    remaining: e.quantity,
                })
                .collect()
        } else {
            Vec::new()
        };
        let optional_sources = modifiers::sources(actor, Some(entity.id))
            .filter(|source| source.has_optional_rules(entity))
            .map(|source| {
                let e = source.entity();
                Choice {
                    id: e.id,
                    name: e.name.clone(),
                    remaining: e.is_charged().then(|| e.uses.state.value),
                }
            })
            .collect();
        let cost = resources::cost(entity).max(1);
        let use_amount_max = match resources::available(actor, entity) {
            Availability::Unlimited => None,
            Availability::Limited(n) => Some(n / cost),
        };
        Self {
            entity: entity.name.clone(),
            extra_attack_count: entity.extra_attacks.len(),
            power_attack_max: can(Capability::PowerAttack).then_some(bab),
            manyshot_max: can(Capability::Manyshot).then(|| 2 + (bab - 6).div_euclid(5)),
            greater_manyshot_max: can(Capability::GreaterManyshot)
                .then(|| actor.ability_modifier(crate::entity::Ability::Wis)),
            rapid_shot: can(Capability::RapidShot),
            flurry: can(Capability::FlurryOfBlows),
            use_amount_max,
            ammunition,
            optional_sources,
            conditionals: entity
                .conditionals
                .iter()
                .map(|c| (c.name.clone(), c.default))
                .collect(),
            defaults: InvocationOptions::defaults_for(entity),
        }
    }
}
