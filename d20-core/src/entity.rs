//! Usable game entities: weapons, natural attacks, spells, feats, buffs
//! and equipment.
//!
//! An [`ActionableEntity`] is pure data. Everything that happens when it is
//! used lives in the engine; everything it contributes to other entities
//! (modifier rules, context notes, capabilities) is declared here and read
//! by the aggregator.

use crate::resources::ResourceState;
use crate::special::SpecialAction;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Weapon,
    Attack,
    Spell,
    Feat,
    Buff,
    Equipment,
    Consumable,
    Ammunition,
    Enhancement,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Weapon => "weapon",
            EntityKind::Attack => "attack",
            EntityKind::Spell => "spell",
            EntityKind::Feat => "feat",
            EntityKind::Buff => "buff",
            EntityKind::Equipment => "equipment",
            EntityKind::Consumable => "consumable",
            EntityKind::Ammunition => "ammunition",
            EntityKind::Enhancement => "enhancement",
        }
    }

    pub fn from_name(name: &str) -> Option<EntityKind> {
        match name.to_ascii_lowercase().as_str() {
            "weapon" => Some(EntityKind::Weapon),
            "attack" => Some(EntityKind::Attack),
            "spell" => Some(EntityKind::Spell),
            "feat" => Some(EntityKind::Feat),
            "buff" => Some(EntityKind::Buff),
            "equipment" => Some(EntityKind::Equipment),
            "consumable" | "loot" => Some(EntityKind::Consumable),
            "ammunition" | "ammo" => Some(EntityKind::Ammunition),
            "enhancement" => Some(EntityKind::Enhancement),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What using the entity does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    #[serde(alias = "mwak")]
    MeleeWeapon,
    #[serde(alias = "rwak")]
    RangedWeapon,
    #[serde(alias = "msak")]
    MeleeSpell,
    #[serde(alias = "rsak")]
    RangedSpell,
    #[serde(alias = "spellsave")]
    Save,
    Heal,
    Special,
    Other,
    #[default]
    None,
}

impl ActionClass {
    /// Short code used by modifier rules to restrict themselves to one class.
    pub fn code(&self) -> &'static str {
        match self {
            ActionClass::MeleeWeapon => "mwak",
            ActionClass::RangedWeapon => "rwak",
            ActionClass::MeleeSpell => "msak",
            ActionClass::RangedSpell => "rsak",
            ActionClass::Save => "spellsave",
            ActionClass::Heal => "heal",
            ActionClass::Special => "special",
            ActionClass::Other => "other",
            ActionClass::None => "",
        }
    }

    pub fn is_attack(&self) -> bool {
        matches!(
            self,
            ActionClass::MeleeWeapon
                | ActionClass::RangedWeapon
                | ActionClass::MeleeSpell
                | ActionClass::RangedSpell
        )
    }

    pub fn is_weapon_attack(&self) -> bool {
        matches!(self, ActionClass::MeleeWeapon | ActionClass::RangedWeapon)
    }

    pub fn is_spell(&self) -> bool {
        matches!(
            self,
            ActionClass::MeleeSpell | ActionClass::RangedSpell | ActionClass::Save | ActionClass::Heal
        )
    }

    pub fn is_melee(&self) -> bool {
        matches!(self, ActionClass::MeleeWeapon | ActionClass::MeleeSpell)
    }

    pub fn is_ranged(&self) -> bool {
        matches!(self, ActionClass::RangedWeapon | ActionClass::RangedSpell)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AttackKind {
    #[default]
    Weapon,
    Natural,
    Misc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ability {
    Str,
    Dex,
    Con,
    Int,
    Wis,
    Cha,
}

impl Ability {
    pub fn key(&self) -> &'static str {
        match self {
            Ability::Str => "str",
            Ability::Dex => "dex",
            Ability::Con => "con",
            Ability::Int => "int",
            Ability::Wis => "wis",
            Ability::Cha => "cha",
        }
    }

    pub fn all() -> [Ability; 6] {
        [
            Ability::Str,
            Ability::Dex,
            Ability::Con,
            Ability::Int,
            Ability::Wis,
            Ability::Cha,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DamagePart {
    pub formula: String,
    #[serde(default)]
    pub damage_type: String,
}

impl DamagePart {
    pub fn new(formula: impl Into<String>, damage_type: impl Into<String>) -> Self {
        Self {
            formula: formula.into(),
            damage_type: damage_type.into(),
        }
    }
}

/// An additional attack granted on a full attack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraAttack {
    pub bonus: String,
    pub label: String,
}

impl ExtraAttack {
    pub fn new(bonus: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            bonus: bonus.into(),
            label: label.into(),
        }
    }
}

/// Recharge period of an entity's limited uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UsesPer {
    #[default]
    Unlimited,
    Day,
    Week,
    Charges,
    Encounter,
    Single,
}

/// Limited-use bookkeeping for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Uses {
    #[serde(default)]
    pub per: UsesPer,
    #[serde(flatten)]
    pub state: ResourceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_formula: Option<String>,
    /// Charges consumed per use; 0 means 1.
    #[serde(default)]
    pub charges_per_use: i64,
    #[serde(default = "default_true")]
    pub auto_deduct: bool,
    /// Draw from another entity's pool instead of this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_pool: Option<EntityId>,
}

impl Default for Uses {
    fn default() -> Self {
        Self {
            per: UsesPer::Unlimited,
            state: ResourceState::default(),
            max_formula: None,
            charges_per_use: 0,
            auto_deduct: true,
            linked_pool: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalProfile {
    pub range: u32,
    pub multiplier: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm_bonus: Option<String>,
}

impl Default for CriticalProfile {
    fn default() -> Self {
        Self {
            range: 20,
            multiplier: 2,
            confirm_bonus: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AbilityLinkage {
    #[serde(default)]
    pub attack: Option<Ability>,
    #[serde(default)]
    pub damage: Option<Ability>,
    #[serde(default)]
    pub damage_mult: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpellData {
    pub spellbook: String,
    pub level: u8,
    #[serde(default)]
    pub at_will: bool,
    /// Remaining prepared casts (prepared casters).
    #[serde(default)]
    pub prepared: i64,
    #[serde(default)]
    pub max_prepared: i64,
    /// Power points per use (psionic spellbooks).
    #[serde(default)]
    pub power_point_cost: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Metamagic {
    #[serde(default)]
    pub maximized: bool,
    #[serde(default)]
    pub empowered: bool,
    #[serde(default)]
    pub intensified: bool,
}

/// Rule features that change how attacks are sequenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    TwoWeaponFighting,
    ImprovedTwoWeaponFighting,
    GreaterTwoWeaponFighting,
    MultiweaponFighting,
    Multiattack,
    RapidShot,
    Manyshot,
    GreaterManyshot,
    PowerAttack,
    FlurryOfBlows,
    Hasted,
}

impl Capability {
    /// Recognize a capability from a feat or buff name.
    pub fn from_name(name: &str) -> Option<Capability> {
        let key: String = name
            .chars()
            .filter(|c| c.is_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match key.as_str() {
            "twoweaponfighting" => Some(Capability::TwoWeaponFighting),
            "improvedtwoweaponfighting" => Some(Capability::ImprovedTwoWeaponFighting),
            "greatertwoweaponfighting" => Some(Capability::GreaterTwoWeaponFighting),
            "multiweaponfighting" => Some(Capability::MultiweaponFighting),
            "multiattack" => Some(Capability::Multiattack),
            "rapidshot" => Some(Capability::RapidShot),
            "manyshot" => Some(Capability::Manyshot),
            "greatermanyshot" => Some(Capability::GreaterManyshot),
            "powerattack" => Some(Capability::PowerAttack),
            "flurryofblows" => Some(Capability::FlurryOfBlows),
            "haste" | "hasted" => Some(Capability::Hasted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModifierMode {
    #[default]
    Add,
    Replace,
    Append,
}

/// A conditional bonus or override contributed to other entities' rolls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifierRule {
    /// Entity kind the rule applies to; `None` applies to all kinds.
    #[serde(default)]
    pub applies_to: Option<EntityKind>,
    /// Action class the rule applies to; `None` applies to any.
    #[serde(default)]
    pub action: Option<ActionClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Context path. A leading `$` means replace, `&` means append.
    pub target: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub mode: ModifierMode,
    /// Only applied when the user selects the source for an invocation.
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub special_actions: Vec<SpecialAction>,
}

impl ModifierRule {
    pub fn new(target: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            applies_to: None,
            action: None,
            condition: None,
            target: target.into(),
            value: value.into(),
            mode: ModifierMode::Add,
            optional: false,
            special_actions: Vec::new(),
        }
    }

    pub fn for_kind(mut self, kind: EntityKind) -> Self {
        self.applies_to = Some(kind);
        self
    }

    pub fn for_action(mut self, action: ActionClass) -> Self {
        self.action = Some(action);
        self
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_mode(mut self, mode: ModifierMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_special_action(mut self, action: SpecialAction) -> Self {
        self.special_actions.push(action);
        self
    }

    /// Effective mode and bare path, honoring legacy `$`/`&` prefixes.
    pub fn resolved_target(&self) -> (ModifierMode, &str) {
        if let Some(path) = self.target.strip_prefix('$') {
            (ModifierMode::Replace, path)
        } else if let Some(path) = self.target.strip_prefix('&') {
            (ModifierMode::Append, path)
        } else {
            (self.mode, self.target.as_str())
        }
    }
}

/// How selecting an optional modifier source is billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptionalCost {
    #[default]
    ChargesPerUse,
    /// The chosen range value is the number of charges spent.
    Range,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionalTarget {
    Attack,
    Damage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConditionalScope {
    #[default]
    All,
    /// Only the sub-attack at this sequence index.
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalModifier {
    pub target: ConditionalTarget,
    #[serde(default)]
    pub scope: ConditionalScope,
    pub formula: String,
    #[serde(default)]
    pub damage_type: String,
}

/// A named, user-toggled group of extra attack or damage parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conditional {
    pub name: String,
    #[serde(default)]
    pub default: bool,
    pub modifiers: Vec<ConditionalModifier>,
}

/// Text an entity contributes to its owner's rolls, keyed by category
/// (`attacks.attack`, `attacks.effect`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextNote {
    pub category: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AutoScale {
    #[default]
    Default,
    Always,
    Never,
}

/// A usable game entity owned by an actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionableEntity {
    pub id: EntityId,
    pub name: String,
    pub kind: EntityKind,
    /// Free-form grouping within a kind (`spell`, `temp`, `class`).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subtype: String,
    #[serde(default)]
    pub action: ActionClass,
    #[serde(default)]
    pub attack_kind: AttackKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attack_bonus: Option<String>,
    #[serde(default)]
    pub damage: Vec<DamagePart>,
    #[serde(default)]
    pub enhancement: i64,
    #[serde(default)]
    pub masterwork: bool,
    #[serde(default = "default_true")]
    pub proficient: bool,
    #[serde(default)]
    pub uses: Uses,
    /// Stack quantity; `None` for entities that do not stack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<i64>,
    #[serde(default)]
    pub extra_attacks: Vec<ExtraAttack>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attack_count: Option<String>,
    #[serde(default)]
    pub critical: CriticalProfile,
    #[serde(default)]
    pub ability: AbilityLinkage,
    #[serde(default)]
    pub effect_notes: Vec<String>,
    #[serde(default)]
    pub attack_notes: Vec<String>,
    #[serde(default)]
    pub context_notes: Vec<ContextNote>,
    #[serde(default)]
    pub special_actions: Vec<SpecialAction>,
    #[serde(default)]
    pub modifiers: Vec<ModifierRule>,
    #[serde(default)]
    pub optional_cost: OptionalCost,
    /// Run modifier special actions on the first sub-attack only.
    #[serde(default)]
    pub special_actions_once: bool,
    #[serde(default)]
    pub conditionals: Vec<Conditional>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spell: Option<SpellData>,
    #[serde(default)]
    pub metamagic: Metamagic,
    #[serde(default)]
    pub auto_scale: AutoScale,
    /// Natural attacks: primary (true) or secondary.
    #[serde(default = "default_true")]
    pub primary: bool,
    #[serde(default)]
    pub non_lethal: bool,
    #[serde(default)]
    pub returning: bool,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub equipped: bool,
    #[serde(default)]
    pub melded: bool,
    /// Free-form roll data merged into `@item`.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl ActionableEntity {
    pub fn new(name: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            id: EntityId::new(),
            name: name.into(),
            kind,
            subtype: String::new(),
            action: ActionClass::None,
            attack_kind: AttackKind::Weapon,
            attack_bonus: None,
            damage: Vec::new(),
            enhancement: 0,
            masterwork: false,
            proficient: true,
            uses: Uses::default(),
            quantity: None,
            extra_attacks: Vec::new(),
            attack_count: None,
            critical: CriticalProfile::default(),
            ability: AbilityLinkage::default(),
            effect_notes: Vec::new(),
            attack_notes: Vec::new(),
            context_notes: Vec::new(),
            special_actions: Vec::new(),
            modifiers: Vec::new(),
            optional_cost: OptionalCost::default(),
            special_actions_once: false,
            conditionals: Vec::new(),
            capabilities: Vec::new(),
            spell: None,
            metamagic: Metamagic::default(),
            auto_scale: AutoScale::Default,
            primary: true,
            non_lethal: false,
            returning: false,
            active: false,
            equipped: false,
            melded: false,
            extra: Map::new(),
        }
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = subtype.into();
        self
    }

    pub fn with_action(mut self, action: ActionClass) -> Self {
        self.action = action;
        self
    }

    pub fn with_attack_kind(mut self, kind: AttackKind) -> Self {
        self.attack_kind = kind;
        self
    }

    pub fn with_attack_bonus(mut self, formula: impl Into<String>) -> Self {
        self.attack_bonus = Some(formula.into());
        self
    }

    pub fn with_damage(mut self, formula: impl Into<String>, damage_type: impl Into<String>) -> Self {
        self.damage.push(DamagePart::new(formula, damage_type));
        self
    }

    pub fn with_abilities(mut self, attack: Option<Ability>, damage: Option<Ability>) -> Self {
        self.ability.attack = attack;
        self.ability.damage = damage;
        self
    }

    pub fn with_enhancement(mut self, enhancement: i64) -> Self {
        self.enhancement = enhancement;
        self
    }

    pub fn with_critical(mut self, range: u32, multiplier: u32) -> Self {
        self.critical.range = range;
        self.critical.multiplier = multiplier;
        self
    }

    pub fn with_uses(mut self, per: UsesPer, value: i64, max: i64) -> Self {
        self.uses.per = per;
        self.uses.state = ResourceState::new(value, max);
        self
    }

    pub fn with_charges_per_use(mut self, cost: i64) -> Self {
        self.uses.charges_per_use = cost;
        self
    }

    pub fn with_quantity(mut self, quantity: i64) -> Self {
        self.quantity = Some(quantity);
        self
    }

    pub fn with_extra_attack(mut self, bonus: impl Into<String>, label: impl Into<String>) -> Self {
        self.extra_attacks.push(ExtraAttack::new(bonus, label));
        self
    }

    pub fn with_modifier(mut self, rule: ModifierRule) -> Self {
        self.modifiers.push(rule);
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_spell(mut self, spell: SpellData) -> Self {
        self.spell = Some(spell);
        self
    }

    pub fn with_effect_note(mut self, note: impl Into<String>) -> Self {
        self.effect_notes.push(note.into());
        self
    }

    pub fn with_context_note(mut self, category: impl Into<String>, text: impl Into<String>) -> Self {
        self.context_notes.push(ContextNote {
            category: category.into(),
            text: text.into(),
        });
        self
    }

    pub fn with_special_action(mut self, action: SpecialAction) -> Self {
        self.special_actions.push(action);
        self
    }

    pub fn with_conditional(mut self, conditional: Conditional) -> Self {
        self.conditionals.push(conditional);
        self
    }

    pub fn active(mut self) -> Self {
        self.active = true;
        self
    }

    pub fn equipped(mut self) -> Self {
        self.equipped = true;
        self
    }

    pub fn has_attack(&self) -> bool {
        self.action.is_attack()
    }

    pub fn has_damage(&self) -> bool {
        !self.damage.is_empty()
    }

    pub fn has_action(&self) -> bool {
        self.action != ActionClass::None
    }

    pub fn has_effect(&self) -> bool {
        !self.effect_notes.is_empty()
    }

    pub fn is_single_use(&self) -> bool {
        self.uses.per == UsesPer::Single
    }

    /// Whether using the entity draws on a limited pool.
    pub fn is_charged(&self) -> bool {
        !matches!(self.uses.per, UsesPer::Unlimited) || self.uses.linked_pool.is_some()
    }

    pub fn is_natural(&self) -> bool {
        self.attack_kind == AttackKind::Natural
    }

    /// Whether this entity contributes modifier rules to its owner's rolls.
    pub fn is_modifier_source(&self) -> bool {
        match self.kind {
            EntityKind::Feat | EntityKind::Enhancement => true,
            EntityKind::Buff => self.active,
            EntityKind::Equipment => self.equipped && !self.melded,
            _ => false,
        }
    }

    pub fn grants(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability) || Capability::from_name(&self.name) == Some(capability)
    }

    /// The entity's view in a roll context (`@item` or `@self`).
    pub fn roll_data(&self) -> Value {
        let mut data = json!({
            "name": self.name,
            "type": self.kind.as_str(),
            "subType": self.subtype,
            "actionType": self.action.code(),
            "attackType": match self.attack_kind {
                AttackKind::Weapon => "weapon",
                AttackKind::Natural => "natural",
                AttackKind::Misc => "misc",
            },
            "enh": self.enhancement,
            "masterwork": self.masterwork,
            "proficient": self.proficient,
            "nonLethal": self.non_lethal,
            "uses": {
                "value": self.uses.state.value,
                "max": self.uses.state.max,
                "per": self.uses.per,
            },
            "quantity": self.quantity.unwrap_or(0),
            "ability": {
                "critRange": self.critical.range,
                "critMult": self.critical.multiplier,
            },
        });
        if let Some(spell) = &self.spell {
            data["level"] = json!(spell.level);
            data["spellbook"] = json!(spell.spellbook);
        }
        if let Value::Object(map) = &mut data {
            for (key, value) in &self.extra {
                map.insert(key.clone(), value.clone());
            }
        }
        data
    }
}
