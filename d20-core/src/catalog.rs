//! Standard entity table.
//!
//! Weapons, ammunition, feats, buffs, spells and consumables that special
//! actions (`Create`/`Give`) and the headless driver can reference by name.

use crate::entity::{
    Ability, ActionClass, ActionableEntity, Capability, EntityKind, ModifierRule, SpellData, UsesPer,
};

/// Look up a standard entity by name (case-insensitive).
pub fn find(name: &str) -> Option<&'static ActionableEntity> {
    CATALOG.iter().find(|e| e.name.eq_ignore_ascii_case(name))
}

/// A fresh copy of a standard entity with its own id.
pub fn instantiate(name: &str) -> Option<ActionableEntity> {
    find(name).map(|template| {
        let mut entity = template.clone();
        entity.id = crate::entity::EntityId::new();
        entity
    })
}

pub fn names() -> impl Iterator<Item = &'static str> {
    CATALOG.iter().map(|e| e.name.as_str())
}

pub fn of_kind(kind: EntityKind) -> impl Iterator<Item = &'static ActionableEntity> {
    CATALOG.iter().filter(move |e| e.kind == kind)
}

fn melee(name: &str, damage: &str, damage_type: &str, range: u32, mult: u32) -> ActionableEntity {
    ActionableEntity::new(name, EntityKind::Weapon)
        .with_action(ActionClass::MeleeWeapon)
        .with_abilities(Some(Ability::Str), Some(Ability::Str))
        .with_damage(damage, damage_type)
        .with_critical(range, mult)
}

fn two_handed(mut weapon: ActionableEntity) -> ActionableEntity {
    weapon.ability.damage_mult = Some(1.5);
    weapon
}

fn ranged(name: &str, damage: &str, range: u32, mult: u32) -> ActionableEntity {
    ActionableEntity::new(name, EntityKind::Weapon)
        .with_action(ActionClass::RangedWeapon)
        .with_abilities(Some(Ability::Dex), None)
        .with_damage(damage, "piercing")
        .with_critical(range, mult)
}

fn spell(name: &str, level: u8, action: ActionClass) -> ActionableEntity {
    ActionableEntity::new(name, EntityKind::Spell)
        .with_action(action)
        .with_spell(SpellData {
            spellbook: "primary".to_string(),
            level,
            at_will: false,
            prepared: 0,
            max_prepared: 0,
            power_point_cost: 0,
        })
}

lazy_static::lazy_static! {
    static ref CATALOG: Vec<ActionableEntity> = vec![
        // Weapons
        melee("Dagger", "1d4", "piercing", 19, 2),
        melee("Longsword", "1d8", "slashing", 19, 2),
        melee("Rapier", "1d6", "piercing", 18, 2),
        melee("Scimitar", "1d6", "slashing", 18, 2),
        melee("Handaxe", "1d6", "slashing", 20, 3),
        melee("Warhammer", "1d8", "bludgeoning", 20, 3),
        two_handed(melee("Greatsword", "2d6", "slashing", 19, 2)),
        two_handed(melee("Greataxe", "1d12", "slashing", 20, 3)),
        {
            let mut sap = melee("Sap", "1d6", "bludgeoning", 20, 2);
            sap.non_lethal = true;
            sap
        },
        ranged("Shortbow", "1d6", 20, 3),
        ranged("Longbow", "1d8", 20, 3),
        ranged("Light Crossbow", "1d8", 19, 2),

        // Ammunition
        ActionableEntity::new("Arrows", EntityKind::Ammunition).with_quantity(20),
        ActionableEntity::new("Bolts", EntityKind::Ammunition).with_quantity(10),
        ActionableEntity::new("Flaming Arrows", EntityKind::Ammunition)
            .with_quantity(10)
            .with_damage("1d6", "fire"),

        // Feats
        ActionableEntity::new("Power Attack", EntityKind::Feat),
        ActionableEntity::new("Rapid Shot", EntityKind::Feat),
        ActionableEntity::new("Manyshot", EntityKind::Feat),
        ActionableEntity::new("Two-Weapon Fighting", EntityKind::Feat),
        ActionableEntity::new("Improved Two-Weapon Fighting", EntityKind::Feat),
        ActionableEntity::new("Multiattack", EntityKind::Feat),
        ActionableEntity::new("Weapon Focus", EntityKind::Feat)
            .with_modifier(ModifierRule::new("featAttackBonus", "1").for_kind(EntityKind::Weapon)),
        ActionableEntity::new("Weapon Specialization", EntityKind::Feat)
            .with_modifier(ModifierRule::new("featDamageBonus", "2").for_kind(EntityKind::Weapon)),
        ActionableEntity::new("Improved Critical", EntityKind::Feat)
            .with_modifier(ModifierRule::new("isKeen", "1").for_kind(EntityKind::Weapon)),
        ActionableEntity::new("Smite Evil", EntityKind::Feat)
            .with_uses(UsesPer::Day, 1, 1)
            .with_modifier(
                ModifierRule::new("featAttackBonus", "@abilities.cha.mod")
                    .for_kind(EntityKind::Weapon)
                    .optional(),
            )
            .with_modifier(
                ModifierRule::new("featDamageBonus", "@classes.paladin.level")
                    .for_kind(EntityKind::Weapon)
                    .optional(),
            ),

        // Buffs
        ActionableEntity::new("Haste", EntityKind::Buff)
            .with_capability(Capability::Hasted)
            .with_modifier(ModifierRule::new("attributes.attack.general", "1")),
        ActionableEntity::new("Bless", EntityKind::Buff)
            .with_modifier(ModifierRule::new("attributes.attack.general", "1")),
        ActionableEntity::new("Divine Favor", EntityKind::Buff)
            .with_modifier(ModifierRule::new("attributes.attack.general", "max(1, min(3, floor(@classes.cleric.level / 3)))"))
            .with_modifier(ModifierRule::new("attributes.damage.weapon", "max(1, min(3, floor(@classes.cleric.level / 3)))")),
        ActionableEntity::new("Rage", EntityKind::Buff)
            .with_modifier(ModifierRule::new("attributes.attack.melee", "2"))
            .with_modifier(ModifierRule::new("attributes.damage.weapon", "3").for_action(ActionClass::MeleeWeapon)),
        ActionableEntity::new("Keen Edge", EntityKind::Buff)
            .with_modifier(ModifierRule::new("isKeen", "1").for_kind(EntityKind::Weapon)),
        ActionableEntity::new("Shaken", EntityKind::Buff)
            .with_modifier(ModifierRule::new("attributes.attack.general", "-2")),

        // Spells
        {
            let mut missile = spell("Magic Missile", 1, ActionClass::Other).with_damage("1d4 + 1", "force");
            missile.attack_count = Some("min(5, floor((@cl + 1) / 2))".to_string());
            missile
        },
        spell("Scorching Ray", 2, ActionClass::RangedSpell).with_damage("4d6", "fire"),
        spell("Shocking Grasp", 1, ActionClass::MeleeSpell).with_damage("(min(5, @cl))d6", "electricity"),
        spell("Fireball", 3, ActionClass::Save).with_damage("(min(10, @cl))d6", "fire"),
        spell("Cure Light Wounds", 1, ActionClass::Heal).with_damage("1d8 + min(5, @cl)", "healing"),
        spell("Sleep", 1, ActionClass::Save).with_effect_note("Puts 4 HD of creatures to sleep (Will negates)"),

        // Consumables
        ActionableEntity::new("Potion of Cure Light Wounds", EntityKind::Consumable)
            .with_action(ActionClass::Heal)
            .with_damage("1d8 + 1", "healing")
            .with_uses(UsesPer::Single, 0, 0)
            .with_quantity(1),
        ActionableEntity::new("Alchemist's Fire", EntityKind::Consumable)
            .with_action(ActionClass::RangedWeapon)
            .with_abilities(Some(Ability::Dex), None)
            .with_damage("1d6", "fire")
            .with_uses(UsesPer::Single, 0, 0)
            .with_quantity(1),
        ActionableEntity::new("Wand of Magic Missile", EntityKind::Equipment)
            .with_action(ActionClass::Other)
            .with_damage("1d4 + 1", "force")
            .with_uses(UsesPer::Charges, 50, 50),
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_is_case_insensitive() {
        let sword = find("longsword").unwrap();
        assert_eq!(sword.name, "Longsword");
        assert_eq!(sword.critical.range, 19);
        assert!(find("Vorpal Spoon").is_none());
    }

    #[test]
    fn test_instantiate_assigns_fresh_ids() {
        let a = instantiate("Arrows").unwrap();
        let b = instantiate("Arrows").unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.quantity, Some(20));
    }

    #[test]
    fn test_catalog_names_unique() {
        let mut seen = std::collections::HashSet::new();
        for name in names() {
            assert!(seen.insert(name.to_lowercase()), "duplicate catalog entry {name}");
        }
    }

    #[test]
    fn test_catalog_formulas_parse() {
        for entity in CATALOG.iter() {
            for part in &entity.damage {
                crate::formula::Formula::parse(&part.formula).unwrap();
            }
            for rule in &entity.modifiers {
                crate::formula::Formula::parse(&rule.value).unwrap();
            }
        }
    }

    #[test]
    fn test_kinds() {
        assert!(of_kind(EntityKind::Ammunition).all(|e| e.quantity.is_some()));
        assert!(find("Haste").unwrap().grants(Capability::Hasted));
        assert!(find("Greatsword").unwrap().ability.damage_mult == Some(1.5));
    }
}
