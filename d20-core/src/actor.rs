//! Acting participants and the roll data they expose to formulas.

use crate::entity::{Ability, ActionableEntity, AttackKind, Capability, EntityId, EntityKind};
use crate::resources::ResourceState;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(pub Uuid);

impl ActorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ActorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The user on whose behalf an invocation runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub is_gm: bool,
}

impl User {
    pub fn player(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            is_gm: false,
        }
    }

    pub fn gm(name: impl Into<String>) -> Self {
        Self {
            is_gm: true,
            ..Self::player(name)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbilityScores {
    pub str: i32,
    pub dex: i32,
    pub con: i32,
    pub int: i32,
    pub wis: i32,
    pub cha: i32,
}

impl AbilityScores {
    pub fn new(str: i32, dex: i32, con: i32, int: i32, wis: i32, cha: i32) -> Self {
        Self {
            str,
            dex,
            con,
            int,
            wis,
            cha,
        }
    }

    pub fn get(&self, ability: Ability) -> i32 {
        match ability {
            Ability::Str => self.str,
            Ability::Dex => self.dex,
            Ability::Con => self.con,
            Ability::Int => self.int,
            Ability::Wis => self.wis,
            Ability::Cha => self.cha,
        }
    }

    pub fn modifier(&self, ability: Ability) -> i32 {
        (self.get(ability) - 10).div_euclid(2)
    }
}

impl Default for AbilityScores {
    fn default() -> Self {
        Self::new(10, 10, 10, 10, 10, 10)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Size {
    Fine,
    Diminutive,
    Tiny,
    Small,
    #[default]
    Medium,
    Large,
    Huge,
    Gargantuan,
    Colossal,
}

impl Size {
    /// Size modifier to attack rolls.
    pub fn attack_modifier(&self) -> i64 {
        match self {
            Size::Fine => 8,
            Size::Diminutive => 4,
            Size::Tiny => 2,
            Size::Small => 1,
            Size::Medium => 0,
            Size::Large => -1,
            Size::Huge => -2,
            Size::Gargantuan => -4,
            Size::Colossal => -8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AttackBonuses {
    #[serde(default)]
    pub general: i64,
    #[serde(default)]
    pub melee: i64,
    #[serde(default)]
    pub ranged: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DamageBonuses {
    #[serde(default)]
    pub general: i64,
    #[serde(default)]
    pub weapon: i64,
    #[serde(default)]
    pub spell: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Saves {
    #[serde(default)]
    pub fort: i64,
    #[serde(default)]
    pub reflex: i64,
    #[serde(default)]
    pub will: i64,
}

/// Hit point tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HitPoints {
    pub current: i64,
    pub maximum: i64,
    #[serde(default)]
    pub temporary: i64,
    #[serde(default)]
    pub nonlethal: i64,
}

impl HitPoints {
    pub fn new(maximum: i64) -> Self {
        Self {
            current: maximum,
            maximum,
            temporary: 0,
            nonlethal: 0,
        }
    }

    pub fn take_damage(&mut self, amount: i64) -> i64 {
        let mut remaining = amount.max(0);
        let absorbed = remaining.min(self.temporary);
        self.temporary -= absorbed;
        remaining -= absorbed;
        self.current -= remaining;
        amount.max(0)
    }

    pub fn heal(&mut self, amount: i64) -> i64 {
        let old = self.current;
        self.current = (self.current + amount.max(0)).min(self.maximum);
        self.current - old
    }
}

/// Statistics computed outside the engine and consumed as roll data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ActorStats {
    #[serde(default)]
    pub abilities: AbilityScores,
    #[serde(default)]
    pub bab: i64,
    #[serde(default)]
    pub size: Size,
    #[serde(default)]
    pub attack: AttackBonuses,
    #[serde(default)]
    pub damage: DamageBonuses,
    #[serde(default)]
    pub energy_drain: i64,
    #[serde(default)]
    pub saves: Saves,
    #[serde(default)]
    pub class_levels: BTreeMap<String, i64>,
    /// Free-form values merged into the roll data root.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpellbookKind {
    Prepared,
    Spontaneous,
    PowerPoints,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spellbook {
    pub kind: SpellbookKind,
    #[serde(default)]
    pub caster_level: i64,
    #[serde(default)]
    pub ability: Option<Ability>,
    /// Spontaneous casting slots by spell level.
    #[serde(default)]
    pub slots: BTreeMap<u8, ResourceState>,
    #[serde(default)]
    pub power_points: ResourceState,
}

impl Spellbook {
    fn empty(kind: SpellbookKind, caster_level: i64) -> Self {
        Self {
            kind,
            caster_level,
            ability: None,
            slots: BTreeMap::new(),
            power_points: ResourceState::default(),
        }
    }

    pub fn prepared(caster_level: i64) -> Self {
        Self::empty(SpellbookKind::Prepared, caster_level)
    }

    pub fn spontaneous(caster_level: i64) -> Self {
        Self::empty(SpellbookKind::Spontaneous, caster_level)
    }

    pub fn power_points(caster_level: i64, points: i64) -> Self {
        Self {
            power_points: ResourceState::full(points),
            ..Self::empty(SpellbookKind::PowerPoints, caster_level)
        }
    }

    pub fn with_slots(mut self, level: u8, count: i64) -> Self {
        self.slots.insert(level, ResourceState::full(count));
        self
    }

    pub fn with_ability(mut self, ability: Ability) -> Self {
        self.ability = Some(ability);
        self
    }
}

/// A participant that owns and uses entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub name: String,
    #[serde(default)]
    pub is_npc: bool,
    #[serde(default)]
    pub owners: Vec<Uuid>,
    #[serde(default)]
    pub stats: ActorStats,
    #[serde(default)]
    pub hit_points: HitPoints,
    #[serde(default)]
    pub entities: Vec<ActionableEntity>,
    #[serde(default)]
    pub spellbooks: BTreeMap<String, Spellbook>,
    #[serde(default)]
    pub conditions: BTreeMap<String, bool>,
}

impl Actor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ActorId::new(),
            name: name.into(),
            is_npc: false,
            owners: Vec::new(),
            stats: ActorStats::default(),
            hit_points: HitPoints::default(),
            entities: Vec::new(),
            spellbooks: BTreeMap::new(),
            conditions: BTreeMap::new(),
        }
    }

    pub fn with_owner(mut self, user: &User) -> Self {
        self.owners.push(user.id);
        self
    }

    pub fn with_abilities(mut self, abilities: AbilityScores) -> Self {
        self.stats.abilities = abilities;
        self
    }

    pub fn with_bab(mut self, bab: i64) -> Self {
        self.stats.bab = bab;
        self
    }

    pub fn with_hit_points(mut self, maximum: i64) -> Self {
        self.hit_points = HitPoints::new(maximum);
        self
    }

    pub fn with_class_level(mut self, class: impl Into<String>, level: i64) -> Self {
        self.stats.class_levels.insert(class.into().to_lowercase(), level);
        self
    }

    pub fn with_entity(mut self, entity: ActionableEntity) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn with_entities(mut self, entities: impl IntoIterator<Item = ActionableEntity>) -> Self {
        self.entities.extend(entities);
        self
    }

    pub fn with_spellbook(mut self, key: impl Into<String>, book: Spellbook) -> Self {
        self.spellbooks.insert(key.into(), book);
        self
    }

    pub fn npc(mut self) -> Self {
        self.is_npc = true;
        self
    }

    /// Game masters may act for anyone; players only for actors they own.
    pub fn can_edit(&self, user: &User) -> bool {
        user.is_gm || self.owners.contains(&user.id)
    }

    pub fn entity(&self, id: EntityId) -> Option<&ActionableEntity> {
        self.entities.iter().find(|e| e.id == id)
    }

    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut ActionableEntity> {
        self.entities.iter_mut().find(|e| e.id == id)
    }

    /// Case-insensitive lookup by name, optionally restricted to one kind.
    pub fn find_entity(&self, name: &str, kind: Option<EntityKind>) -> Option<&ActionableEntity> {
        self.entities
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name) && kind.map_or(true, |k| e.kind == k))
    }

    pub fn ability_modifier(&self, ability: Ability) -> i64 {
        i64::from(self.stats.abilities.modifier(ability))
    }

    pub fn class_level(&self, class: &str) -> i64 {
        self.stats
            .class_levels
            .get(&class.to_lowercase())
            .copied()
            .unwrap_or(0)
    }

    /// Whether a feat (or, for [`Capability::Hasted`], an active buff) grants `capability`.
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.entities.iter().any(|e| match e.kind {
            EntityKind::Feat => e.grants(capability),
            EntityKind::Buff => e.active && e.grants(capability),
            _ => false,
        })
    }

    pub fn natural_attack_count(&self) -> usize {
        self.entities
            .iter()
            .filter(|e| e.kind == EntityKind::Attack && e.attack_kind == AttackKind::Natural)
            .count()
    }

    pub fn condition(&self, name: &str) -> bool {
        self.conditions.get(name).copied().unwrap_or(false)
    }

    /// Notes of `category` contributed by active modifier sources.
    pub fn context_notes(&self, category: &str) -> Vec<String> {
        self.entities
            .iter()
            .filter(|e| e.is_modifier_source())
            .flat_map(|e| e.context_notes.iter())
            .filter(|n| n.category == category)
            .map(|n| n.text.clone())
            .collect()
    }

    /// The actor's roll data: the root of every roll context.
    pub fn roll_data(&self) -> Value {
        let stats = &self.stats;
        let mut abilities = Map::new();
        for ability in Ability::all() {
            abilities.insert(
                ability.key().to_string(),
                json!({
                    "total": stats.abilities.get(ability),
                    "mod": stats.abilities.modifier(ability),
                }),
            );
        }
        let classes: Map<String, Value> = stats
            .class_levels
            .iter()
            .map(|(name, level)| (name.clone(), json!({ "level": level })))
            .collect();
        let spells: Map<String, Value> = self
            .spellbooks
            .iter()
            .map(|(key, book)| (key.clone(), json!({ "cl": book.caster_level })))
            .collect();
        let mut data = json!({
            "name": self.name,
            "abilities": abilities,
            "bab": stats.bab,
            "sizeBonus": stats.size.attack_modifier(),
            "attributes": {
                "bab": { "total": stats.bab },
                "attack": {
                    "general": stats.attack.general,
                    "melee": stats.attack.melee,
                    "ranged": stats.attack.ranged,
                },
                "damage": {
                    "general": stats.damage.general,
                    "weapon": stats.damage.weapon,
                    "spell": stats.damage.spell,
                },
                "energyDrain": stats.energy_drain,
                "hp": { "value": self.hit_points.current, "max": self.hit_points.maximum },
                "savingThrows": {
                    "fort": { "total": stats.saves.fort },
                    "ref": { "total": stats.saves.reflex },
                    "will": { "total": stats.saves.will },
                },
            },
            "classes": classes,
            "spells": spells,
            "conditions": self.conditions,
            "isNpc": self.is_npc,
        });
        if let Value::Object(map) = &mut data {
            for (key, value) in &stats.extra {
                map.insert(key.clone(), value.clone());
            }
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::ActionableEntity;

    #[test]
    fn test_ability_modifiers() {
        let scores = AbilityScores::new(16, 9, 10, 11, 3, 20);
        assert_eq!(scores.modifier(Ability::Str), 3);
        assert_eq!(scores.modifier(Ability::Dex), -1);
        assert_eq!(scores.modifier(Ability::Con), 0);
        assert_eq!(scores.modifier(Ability::Int), 0);
        assert_eq!(scores.modifier(Ability::Wis), -4);
        assert_eq!(scores.modifier(Ability::Cha), 5);
    }

    #[test]
    fn test_can_edit() {
        let owner = User::player("alice");
        let stranger = User::player("bob");
        let gm = User::gm("dm");
        let actor = Actor::new("Valeros").with_owner(&owner);
        assert!(actor.can_edit(&owner));
        assert!(!actor.can_edit(&stranger));
        assert!(actor.can_edit(&gm));
    }

    #[test]
    fn test_capabilities_from_feats_and_buffs() {
        let actor = Actor::new("Ranger")
            .with_entity(ActionableEntity::new("Rapid Shot", EntityKind::Feat))
            .with_entity(ActionableEntity::new("Haste", EntityKind::Buff));
        assert!(actor.has_capability(Capability::RapidShot));
        assert!(!actor.has_capability(Capability::Hasted));
        assert!(!actor.has_capability(Capability::Manyshot));

        let hasted = actor.with_entity(ActionableEntity::new("Blur of Speed", EntityKind::Buff)
            .with_capability(Capability::Hasted)
            .active());
        assert!(hasted.has_capability(Capability::Hasted));
    }

    #[test]
    fn test_context_notes_only_from_sources() {
        let actor = Actor::new("Paladin")
            .with_entity(
                ActionableEntity::new("Smite", EntityKind::Buff)
                    .with_context_note("attacks.effect", "Smites evil")
                    .active(),
            )
            .with_entity(
                ActionableEntity::new("Bless", EntityKind::Buff)
                    .with_context_note("attacks.effect", "Blessed"),
            );
        assert_eq!(actor.context_notes("attacks.effect"), vec!["Smites evil".to_string()]);
        assert!(actor.context_notes("attacks.attack").is_empty());
    }

    #[test]
    fn test_roll_data_shape() {
        let actor = Actor::new("Valeros")
            .with_abilities(AbilityScores::new(16, 12, 14, 10, 10, 8))
            .with_bab(6)
            .with_class_level("Monk", 4);
        let data = actor.roll_data();
        assert_eq!(data["abilities"]["str"]["mod"], json!(3));
        assert_eq!(data["attributes"]["bab"]["total"], json!(6));
        assert_eq!(data["classes"]["monk"]["level"], json!(4));
        assert_eq!(data["sizeBonus"], json!(0));
    }

    #[test]
    fn test_hit_points() {
        let mut hp = HitPoints::new(10);
        hp.temporary = 3;
        hp.take_damage(5);
        assert_eq!((hp.current, hp.temporary), (8, 0));
        assert_eq!(hp.heal(10), 2);
    }
}
