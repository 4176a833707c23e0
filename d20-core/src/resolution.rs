//! Resolution of a single sub-attack: attack roll, critical confirmation,
//! damage, effect notes and special actions.

use crate::actor::Actor;
use crate::config::EngineConfig;
use crate::context::RollContext;
use crate::dice::{DiceRoller, MaximizedRoller};
use crate::entity::{ActionClass, ActionableEntity, Capability, EntityKind};
use crate::formula::{Formula, FormulaError, Roll};
use crate::modifiers::QueuedAction;
use crate::options::InvocationOptions;
use crate::sequencer::{Sequence, SequenceMode, SubAttackDescriptor};
use crate::special::{self, ActionTarget, Clause, SpecialAction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackOutcome {
    pub label: String,
    pub face: u32,
    pub total: i64,
    pub is_critical: bool,
    pub is_fumble: bool,
    pub roll: Roll,
}

/// The confirmation roll of a critical threat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalOutcome {
    pub face: u32,
    pub total: i64,
    /// Natural 20 on the confirmation.
    pub is_critical: bool,
    pub confirmed: bool,
    pub roll: Roll,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DamageRoll {
    pub label: String,
    pub damage_type: String,
    pub roll: Roll,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DamageOutcome {
    pub parts: Vec<DamageRoll>,
    pub total: i64,
    pub critical: bool,
    pub healing: bool,
    pub non_lethal: bool,
}

/// A special action clause that passed its conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub source: String,
    pub action: String,
    pub clause: Clause,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAttackBundle {
    pub index: usize,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attack: Option<AttackOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<CriticalOutcome>,
    /// Normal damage, then critical damage, then extra arrows.
    #[serde(default)]
    pub damage: Vec<DamageOutcome>,
    #[serde(default)]
    pub effect_notes: Vec<String>,
    /// Clauses aimed at the target, left to the caller.
    #[serde(default)]
    pub deferred_actions: Vec<PendingAction>,
    /// Clauses applied to the acting actor at commit.
    #[serde(default)]
    pub self_actions: Vec<PendingAction>,
}

/// Damage added from outside the entity's own damage parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraDamage {
    pub formula: String,
    pub label: String,
    /// `None` takes the entity's base damage type.
    #[serde(default)]
    pub damage_type: Option<String>,
}

impl ExtraDamage {
    pub fn new(formula: impl Into<String>, label: impl Into<String>, damage_type: Option<String>) -> Self {
        Self {
            formula: formula.into(),
            label: label.into(),
            damage_type,
        }
    }
}

/// Parts contributed by the invocation itself rather than the sequencer.
#[derive(Debug, Clone, Default)]
pub struct InvocationParts {
    pub attack_parts: Vec<String>,
    /// Joined into the first damage part, unscaled.
    pub damage_bonus: Option<String>,
    pub damage_parts: Vec<ExtraDamage>,
    pub special_actions: Vec<QueuedAction>,
}

/// A numeric path that is nonzero, or a path holding formula text.
pub(crate) fn nonzero(ctx: &RollContext, path: &str) -> bool {
    match ctx.get(path) {
        Some(Value::String(text)) => !text.trim().is_empty() && text.trim() != "0",
        Some(_) => ctx.number(path) != 0.0,
        None => false,
    }
}

fn wrap(part: &str) -> String {
    let part = part.trim();
    let simple = part.starts_with('@') && part[1..].chars().all(|c| c.is_alphanumeric() || c == '.' || c == '_');
    if simple || part.parse::<f64>().is_ok_and(|n| n >= 0.0) {
        part.to_string()
    } else {
        format!("({part})")
    }
}

/// Resolves the sub-attacks of one invocation.
pub struct Resolver<'a> {
    pub actor: &'a Actor,
    pub entity: &'a ActionableEntity,
    pub options: &'a InvocationOptions,
    pub config: &'a EngineConfig,
    pub sequence: &'a Sequence,
    pub parts: &'a InvocationParts,
}

impl Resolver<'_> {
    pub fn resolve(
        &self,
        descriptor: &SubAttackDescriptor,
        ctx: &mut RollContext,
        roller: &mut dyn DiceRoller,
    ) -> Result<SubAttackBundle, FormulaError> {
        ctx.set("attackIndex", descriptor.index as i64);
        let mut bundle = SubAttackBundle {
            index: descriptor.index,
            label: descriptor.label.clone(),
            attack: None,
            confirmation: None,
            damage: Vec::new(),
            effect_notes: Vec::new(),
            deferred_actions: Vec::new(),
            self_actions: Vec::new(),
        };

        let mut critical = false;
        if self.sequence.mode == SequenceMode::Attack {
            let formula = self.attack_formula(descriptor, ctx)?;
            let roll = Formula::parse(&formula)?.roll(ctx, roller)?;
            let face = roll.d20_face().unwrap_or(0);
            let range = self.critical_range(ctx);
            let attack = AttackOutcome {
                label: descriptor.label.clone(),
                face,
                total: roll.total,
                is_critical: face > 0 && i64::from(face) >= range,
                is_fumble: face == 1,
                roll,
            };
            if attack.is_critical {
                let confirmation = self.confirm(&formula, ctx, roller)?;
                critical = confirmation.confirmed;
                bundle.confirmation = Some(confirmation);
            }
            bundle.attack = Some(attack);
        }

        if self.entity.has_damage() && matches!(self.sequence.mode, SequenceMode::Attack | SequenceMode::DamageOnly) {
            bundle.damage.push(self.damage(descriptor, false, ctx, roller)?);
            if critical {
                bundle.damage.push(self.damage(descriptor, true, ctx, roller)?);
            }
            for _ in 0..descriptor.extra_damage_rolls {
                bundle.damage.push(self.damage(descriptor, false, ctx, roller)?);
            }
        }

        if self.sequence.mode != SequenceMode::Special {
            bundle.effect_notes = self.effect_notes(ctx);
        }
        self.route_special_actions(descriptor, ctx, &mut bundle);

        debug!(
            entity = %self.entity.name,
            index = descriptor.index,
            label = %descriptor.label,
            attack = ?bundle.attack.as_ref().map(|a| a.total),
            damage = ?bundle.damage.iter().map(|d| d.total).collect::<Vec<_>>(),
            "sub-attack resolved"
        );
        Ok(bundle)
    }

    /// The full attack formula for `descriptor`, with helper values written
    /// into `ctx`.
    pub fn attack_formula(&self, descriptor: &SubAttackDescriptor, ctx: &mut RollContext) -> Result<String, FormulaError> {
        let entity = self.entity;
        let mut parts = vec!["1d20".to_string()];

        if let Some(ability) = entity.ability.attack {
            if self.actor.ability_modifier(ability) != 0 {
                parts.push(format!("@abilities.{}.mod", ability.key()));
            }
        }
        if nonzero(ctx, "sizeBonus") {
            parts.push("@sizeBonus".to_string());
        }
        if nonzero(ctx, "featAttackBonus") {
            parts.push("@featAttackBonus".to_string());
        }
        if let Some(bonus) = entity.attack_bonus.as_deref().filter(|b| !b.trim().is_empty()) {
            let value = Formula::parse(bonus)?.compute(ctx)?;
            ctx.set("item.attackBonus", value);
            parts.push("@item.attackBonus".to_string());
        }
        if nonzero(ctx, "attributes.attack.general") {
            parts.push("@attributes.attack.general".to_string());
        }
        if entity.action.is_melee() && nonzero(ctx, "attributes.attack.melee") {
            parts.push("@attributes.attack.melee".to_string());
        } else if entity.action.is_ranged() && nonzero(ctx, "attributes.attack.ranged") {
            parts.push("@attributes.attack.ranged".to_string());
        }
        if nonzero(ctx, "attributes.bab.total") {
            parts.push("@attributes.bab.total".to_string());
        }
        if nonzero(ctx, "item.enh") {
            parts.push("@item.enh".to_string());
        }
        if nonzero(ctx, "attributes.energyDrain") {
            parts.push("-max(0, abs(@attributes.energyDrain))".to_string());
        }
        let armed = matches!(entity.kind, EntityKind::Weapon | EntityKind::Attack);
        if armed && !entity.proficient {
            ctx.set("item.proficiencyPenalty", -4);
            parts.push("@item.proficiencyPenalty".to_string());
        }
        if armed && entity.masterwork && ctx.int("item.enh") < 1 {
            ctx.set("item.masterworkBonus", 1);
            parts.push("@item.masterworkBonus".to_string());
        }
        if !descriptor.primary {
            let penalty = if self.actor.has_capability(Capability::Multiattack) {
                self.config.multiattack_secondary_penalty
            } else {
                self.config.secondary_attack_penalty
            };
            parts.push(penalty.to_string());
        }
        if descriptor.bonus_delta(ctx)? != 0 {
            ctx.set("bonus", descriptor.bonus.clone());
            parts.push("@bonus".to_string());
        }
        parts.extend(self.parts.attack_parts.iter().map(|p| wrap(p)));
        parts.extend(self.sequence.attack_parts.iter().map(|p| wrap(p)));
        parts.extend(descriptor.attack_parts.iter().map(|p| wrap(p)));
        Ok(parts.join(" + "))
    }

    /// Threat range after replace modifiers and keen. Never below 2, so a
    /// natural 1 is only ever a fumble.
    pub fn critical_range(&self, ctx: &RollContext) -> i64 {
        let base = match ctx.int("item.ability.critRange") {
            0 => i64::from(self.entity.critical.range),
            range => range,
        };
        let range = if ctx.flag("isKeen") && !ctx.flag("item.threatRangeExtended") {
            21 - 2 * (21 - base)
        } else {
            base
        };
        range.max(2)
    }

    fn confirm(
        &self,
        attack_formula: &str,
        ctx: &RollContext,
        roller: &mut dyn DiceRoller,
    ) -> Result<CriticalOutcome, FormulaError> {
        let mut formula = attack_formula.to_string();
        if let Some(bonus) = self.entity.critical.confirm_bonus.as_deref().filter(|b| !b.trim().is_empty()) {
            formula.push_str(&format!(" + {}", wrap(bonus)));
        }
        if ctx.number("critConfirmBonus") != 0.0 {
            formula.push_str(" + @critConfirmBonus");
        }
        let roll = Formula::parse(&formula)?.roll(ctx, roller)?;
        let face = roll.d20_face().unwrap_or(0);
        let confirmed = match self.options.target_ac {
            None => true,
            Some(_) if face == 20 => true,
            Some(_) if face == 1 => false,
            Some(ac) => roll.total >= ac,
        };
        Ok(CriticalOutcome {
            face,
            total: roll.total,
            is_critical: face == 20,
            confirmed,
            roll,
        })
    }

    /// Ability damage multiplier for this sub-attack.
    pub fn ability_multiplier(&self, descriptor: &SubAttackDescriptor) -> f64 {
        let mut mult = self
            .options
            .damage_ability_multiplier
            .or(self.entity.ability.damage_mult)
            .unwrap_or(1.0);
        if !descriptor.primary && mult > 0.0 {
            mult = 0.5;
        }
        if self.entity.is_natural() && descriptor.primary && self.actor.natural_attack_count() == 1 {
            mult = self.config.sole_natural_attack_multiplier;
        }
        mult
    }

    fn damage(
        &self,
        descriptor: &SubAttackDescriptor,
        critical: bool,
        ctx: &mut RollContext,
        roller: &mut dyn DiceRoller,
    ) -> Result<DamageOutcome, FormulaError> {
        let entity = self.entity;
        let mult = if critical { entity.critical.multiplier.max(1) } else { 1 };
        let scaled = mult != 1;
        ctx.set("critMult", i64::from(mult));
        let abl_mult = self.ability_multiplier(descriptor);
        ctx.set_number("ablMult", abl_mult);

        let base_type = entity.damage.first().map(|p| p.damage_type.clone()).unwrap_or_default();
        let mut parts: Vec<(String, String, String)> = Vec::new();

        if let Some(first) = entity.damage.first() {
            let mut formula = Formula::parse(&first.formula)?.scaled_for_critical(mult).source().to_string();
            if let Some(bonus) = self.parts.damage_bonus.as_deref().filter(|b| !b.trim().is_empty()) {
                formula = format!("{} + {}", wrap(&formula), wrap(bonus));
            }
            parts.push((formula, first.damage_type.clone(), first.damage_type.clone()));
        }

        if let Some(ability) = entity.ability.damage {
            let modifier = self.actor.ability_modifier(ability);
            let damage = if modifier < 0 {
                modifier
            } else {
                (modifier as f64 * abl_mult).floor() as i64
            };
            ctx.set("ablDamage", damage);
            if damage < 0 {
                parts.push(("@ablDamage".to_string(), "Ability".to_string(), base_type.clone()));
            } else if damage != 0 {
                let formula = if scaled { "@ablDamage * @critMult" } else { "@ablDamage" };
                parts.push((formula.to_string(), "Ability".to_string(), base_type.clone()));
            }
        }
        let bonus_part = |path: &str, label: &str, parts: &mut Vec<(String, String, String)>| {
            if nonzero(ctx, path) {
                let formula = if scaled { format!("@{path} * @critMult") } else { format!("@{path}") };
                parts.push((formula, label.to_string(), base_type.clone()));
            }
        };
        bonus_part("item.enh", "Enhancement", &mut parts);
        bonus_part("attributes.damage.general", "General", &mut parts);
        if entity.action.is_weapon_attack() {
            bonus_part("attributes.damage.weapon", "Weapon", &mut parts);
        } else if matches!(
            entity.action,
            ActionClass::MeleeSpell | ActionClass::RangedSpell | ActionClass::Save
        ) {
            bonus_part("attributes.damage.spell", "Spell", &mut parts);
        }

        for part in entity.damage.iter().skip(1) {
            parts.push((part.formula.clone(), part.damage_type.clone(), part.damage_type.clone()));
        }
        for extra in &self.parts.damage_parts {
            let damage_type = extra.damage_type.clone().unwrap_or_else(|| base_type.clone());
            parts.push((extra.formula.clone(), extra.label.clone(), damage_type));
        }
        for part in self.sequence.damage_parts.iter().chain(&descriptor.damage_parts) {
            parts.push((part.formula.clone(), part.damage_type.clone(), part.damage_type.clone()));
        }

        let metamagic = entity.metamagic;
        let maximize = metamagic.maximized || metamagic.intensified;
        let multiplier = if metamagic.intensified {
            Some(2.0)
        } else if metamagic.empowered {
            Some(1.5)
        } else {
            None
        };

        let mut rolls = Vec::with_capacity(parts.len());
        for (source, label, damage_type) in parts {
            let mut formula = Formula::parse(&source)?;
            if let Some(factor) = multiplier {
                formula = formula.multiplied(factor);
            }
            let roll = if maximize {
                formula.roll(ctx, &mut MaximizedRoller)?
            } else {
                formula.roll(ctx, roller)?
            };
            rolls.push(DamageRoll {
                label,
                damage_type,
                roll,
            });
        }
        ctx.set("critMult", 1);
        Ok(DamageOutcome {
            total: rolls.iter().map(|r| r.roll.total).sum(),
            parts: rolls,
            critical,
            healing: entity.action == ActionClass::Heal,
            non_lethal: self.options.non_lethal.unwrap_or(entity.non_lethal),
        })
    }

    fn effect_notes(&self, ctx: &RollContext) -> Vec<String> {
        self.actor
            .context_notes("attacks.effect")
            .iter()
            .chain(&self.entity.effect_notes)
            .flat_map(|note| note.lines().map(str::to_string).collect::<Vec<_>>())
            .filter(|line| !line.trim().is_empty())
            .map(|line| ctx.fill_template(&line))
            .collect()
    }

    fn route_special_actions(&self, descriptor: &SubAttackDescriptor, ctx: &RollContext, bundle: &mut SubAttackBundle) {
        let own = self.entity.special_actions.iter().map(|a| (self.entity.name.as_str(), a));
        let queued = self
            .parts
            .special_actions
            .iter()
            .filter(|q| !q.once || descriptor.index == 0)
            .map(|q| (q.source.as_str(), &q.action));
        for (source, action) in own.chain(queued) {
            route(source, action, ctx, bundle);
        }
    }
}

fn route(source: &str, action: &SpecialAction, ctx: &RollContext, bundle: &mut SubAttackBundle) {
    if !special::condition_holds(action.condition.as_deref(), ctx) {
        return;
    }
    for clause in &action.clauses {
        if !special::condition_holds(clause.condition.as_deref(), ctx) {
            continue;
        }
        let pending = PendingAction {
            source: source.to_string(),
            action: action.name.clone(),
            clause: clause.clone(),
        };
        match clause.target {
            ActionTarget::SelfActor => bundle.self_actions.push(pending),
            ActionTarget::Target => bundle.deferred_actions.push(pending),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::AbilityScores;
    use crate::entity::{Ability, AttackKind, Metamagic};
    use crate::sequencer;
    use crate::testing::ScriptedRoller;

    fn context(actor: &Actor, entity: &ActionableEntity) -> RollContext {
        let mut ctx = RollContext::from(actor.roll_data());
        ctx.set("item", entity.roll_data());
        ctx
    }

    fn resolve_all(
        actor: &Actor,
        entity: &ActionableEntity,
        options: &InvocationOptions,
        parts: &InvocationParts,
        faces: Vec<u32>,
    ) -> Vec<SubAttackBundle> {
        let config = EngineConfig::default();
        let mut ctx = context(actor, entity);
        let seq = sequencer::sequence(actor, entity, options, &config, &mut ctx).unwrap();
        let resolver = Resolver {
            actor,
            entity,
            options,
            config: &config,
            sequence: &seq,
            parts,
        };
        let mut roller = ScriptedRoller::new(faces);
        seq.descriptors
            .iter()
            .map(|d| resolver.resolve(d, &mut ctx, &mut roller).unwrap())
            .collect()
    }

    fn strong_fighter() -> Actor {
        Actor::new("Fighter")
            .with_abilities(AbilityScores::new(16, 10, 10, 10, 10, 10))
            .with_bab(6)
    }

    // ========================================================================
    // Attack rolls
    // ========================================================================

    #[test]
    fn test_attack_formula_parts() {
        let actor = strong_fighter();
        let sword = ActionableEntity::new("Longsword", EntityKind::Weapon)
            .with_action(ActionClass::MeleeWeapon)
            .with_abilities(Some(Ability::Str), Some(Ability::Str))
            .with_enhancement(1)
            .with_damage("1d8", "slashing");
        let bundles = resolve_all(&actor, &sword, &InvocationOptions::new(), &InvocationParts::default(), vec![12, 5]);
        let attack = bundles[0].attack.as_ref().unwrap();
        assert_eq!(attack.roll.formula, "1d20 + @abilities.str.mod + @attributes.bab.total + @item.enh");
        assert_eq!(attack.total, 12 + 3 + 6 + 1);
        assert!(!attack.is_critical && !attack.is_fumble);
        assert!(bundles[0].confirmation.is_none());
        assert_eq!(bundles[0].damage.len(), 1);
        assert_eq!(bundles[0].damage[0].total, 5 + 3 + 1);
    }

    #[test]
    fn test_non_proficient_masterwork_and_secondary() {
        let actor = Actor::new("Wolf");
        let mut bite = ActionableEntity::new("Bite", EntityKind::Attack)
            .with_action(ActionClass::MeleeWeapon)
            .with_attack_kind(AttackKind::Natural);
        bite.proficient = false;
        bite.masterwork = true;
        let options = InvocationOptions::new().with_primary(false);
        let bundles = resolve_all(&actor, &bite, &options, &InvocationParts::default(), vec![10]);
        let attack = bundles[0].attack.as_ref().unwrap();
        assert_eq!(attack.total, 10 - 4 + 1 - 5);

        let multiattacker = actor.with_entity(ActionableEntity::new("Multiattack", EntityKind::Feat));
        let bundles = resolve_all(&multiattacker, &bite, &options, &InvocationParts::default(), vec![10]);
        assert_eq!(bundles[0].attack.as_ref().unwrap().total, 10 - 4 + 1 - 2);
    }

    #[test]
    fn test_fumble() {
        let actor = strong_fighter();
        let sword = ActionableEntity::new("Longsword", EntityKind::Weapon).with_action(ActionClass::MeleeWeapon);
        let bundles = resolve_all(&actor, &sword, &InvocationOptions::new(), &InvocationParts::default(), vec![1]);
        let attack = bundles[0].attack.as_ref().unwrap();
        assert!(attack.is_fumble && !attack.is_critical);
    }

    // ========================================================================
    // Criticals
    // ========================================================================

    #[test]
    fn test_critical_doubles_weapon_terms() {
        let actor = strong_fighter();
        let sword = ActionableEntity::new("Longsword", EntityKind::Weapon)
            .with_action(ActionClass::MeleeWeapon)
            .with_damage("1d8 + @abilities.str.mod", "slashing")
            .with_damage("1d6", "fire");
        // attack 20, confirm 9, normal 4 + fire 2, critical 3 + 5 + fire 6
        let bundles = resolve_all(
            &actor,
            &sword,
            &InvocationOptions::new(),
            &InvocationParts::default(),
            vec![20, 9, 4, 2, 3, 5, 6],
        );
        let bundle = &bundles[0];
        assert!(bundle.attack.as_ref().unwrap().is_critical);
        let confirmation = bundle.confirmation.as_ref().unwrap();
        assert!(confirmation.confirmed && !confirmation.is_critical);
        assert_eq!(bundle.damage.len(), 2);
        assert_eq!(bundle.damage[0].total, 4 + 3 + 2);
        let crit = &bundle.damage[1];
        assert!(crit.critical);
        assert_eq!(crit.parts[0].roll.formula, "2d8 + @abilities.str.mod * 2");
        assert_eq!(crit.parts[0].roll.total, 3 + 5 + 6);
        assert_eq!(crit.parts[1].roll.formula, "1d6");
        assert_eq!(crit.total, 3 + 5 + 6 + 6);
    }

    #[test]
    fn test_confirmation_against_target_ac() {
        let actor = strong_fighter();
        let sword = ActionableEntity::new("Scimitar", EntityKind::Weapon)
            .with_action(ActionClass::MeleeWeapon)
            .with_critical(18, 2)
            .with_damage("1d6", "slashing");
        let options = InvocationOptions::new().with_target_ac(30);
        let bundles = resolve_all(&actor, &sword, &options, &InvocationParts::default(), vec![18, 15, 4]);
        let confirmation = bundles[0].confirmation.as_ref().unwrap();
        assert_eq!(confirmation.total, 15 + 6);
        assert!(!confirmation.confirmed);
        assert_eq!(bundles[0].damage.len(), 1);

        let bundles = resolve_all(&actor, &sword, &options, &InvocationParts::default(), vec![19, 20, 4, 2, 2]);
        let confirmation = bundles[0].confirmation.as_ref().unwrap();
        assert!(confirmation.confirmed && confirmation.is_critical);
        assert_eq!(bundles[0].damage[1].total, 4);
    }

    #[test]
    fn test_keen_and_replaced_range() {
        let actor = strong_fighter();
        let rapier = ActionableEntity::new("Rapier", EntityKind::Weapon)
            .with_action(ActionClass::MeleeWeapon)
            .with_critical(18, 2);
        let config = EngineConfig::default();
        let seq = sequencer::sequence(
            &actor,
            &rapier,
            &InvocationOptions::new(),
            &config,
            &mut RollContext::new(),
        )
        .unwrap();
        let options = InvocationOptions::new();
        let parts = InvocationParts::default();
        let resolver = Resolver {
            actor: &actor,
            entity: &rapier,
            options: &options,
            config: &config,
            sequence: &seq,
            parts: &parts,
        };
        let mut ctx = context(&actor, &rapier);
        assert_eq!(resolver.critical_range(&ctx), 18);
        ctx.set("isKeen", true);
        assert_eq!(resolver.critical_range(&ctx), 15);
        ctx.set("item.threatRangeExtended", true);
        assert_eq!(resolver.critical_range(&ctx), 18);
        ctx.set("item.ability.critRange", 19);
        assert_eq!(resolver.critical_range(&ctx), 19);

        // keen on a very wide range stops at 2
        ctx.set("item.threatRangeExtended", false);
        ctx.set("item.ability.critRange", 10);
        assert_eq!(resolver.critical_range(&ctx), 2);
        ctx.set("item.ability.critRange", 1);
        ctx.set("isKeen", false);
        assert_eq!(resolver.critical_range(&ctx), 2);
    }

    // ========================================================================
    // Damage
    // ========================================================================

    #[test]
    fn test_ability_multipliers() {
        let actor = strong_fighter();
        let greatsword = ActionableEntity::new("Greatsword", EntityKind::Weapon)
            .with_action(ActionClass::MeleeWeapon)
            .with_abilities(None, Some(Ability::Str))
            .with_damage("2d6", "slashing");
        let options = InvocationOptions::new().with_damage_ability_multiplier(1.5);
        let bundles = resolve_all(&actor, &greatsword, &options, &InvocationParts::default(), vec![10, 3, 3]);
        assert_eq!(bundles[0].damage[0].total, 6 + 4);

        let weak = Actor::new("Kobold").with_abilities(AbilityScores::new(7, 10, 10, 10, 10, 10));
        let bundles = resolve_all(&weak, &greatsword, &options, &InvocationParts::default(), vec![10, 3, 3]);
        assert_eq!(bundles[0].damage[0].total, 6 - 2);

        let bite = ActionableEntity::new("Bite", EntityKind::Attack)
            .with_action(ActionClass::MeleeWeapon)
            .with_attack_kind(AttackKind::Natural)
            .with_abilities(None, Some(Ability::Str))
            .with_damage("1d6", "piercing");
        let wolf = strong_fighter().with_entity(bite.clone());
        let bundles = resolve_all(&wolf, &bite, &InvocationOptions::new(), &InvocationParts::default(), vec![10, 2]);
        assert_eq!(bundles[0].damage[0].total, 2 + 4);
        let bundles = resolve_all(
            &wolf,
            &bite,
            &InvocationOptions::new().with_primary(false),
            &InvocationParts::default(),
            vec![10, 2],
        );
        assert_eq!(bundles[0].damage[0].total, 2 + 1);
    }

    #[test]
    fn test_extra_parts_and_manyshot_rolls() {
        let actor = strong_fighter();
        let bow = ActionableEntity::new("Longbow", EntityKind::Weapon)
            .with_action(ActionClass::RangedWeapon)
            .with_damage("1d8", "piercing");
        let parts = InvocationParts {
            attack_parts: vec!["@powerAttackPenalty".into()],
            damage_bonus: Some("2".into()),
            damage_parts: vec![ExtraDamage::new("1d6", "Precision", Some("precision".into()))],
            special_actions: Vec::new(),
        };
        let options = InvocationOptions::new().with_manyshot(2);
        let config = EngineConfig::default();
        let mut ctx = context(&actor, &bow);
        ctx.set("powerAttackPenalty", -1);
        let seq = sequencer::sequence(&actor, &bow, &options, &config, &mut ctx).unwrap();
        let resolver = Resolver {
            actor: &actor,
            entity: &bow,
            options: &options,
            config: &config,
            sequence: &seq,
            parts: &parts,
        };
        let mut roller = ScriptedRoller::new(vec![10, 5, 3, 6, 1]);
        let bundle = resolver.resolve(&seq.descriptors[0], &mut ctx, &mut roller).unwrap();
        assert_eq!(bundle.attack.unwrap().total, 10 + 6 - 1 - 4);
        assert_eq!(bundle.damage.len(), 2);
        assert_eq!(bundle.damage[0].parts[0].roll.total, 5 + 2);
        assert_eq!(bundle.damage[0].parts[1].damage_type, "precision");
        assert_eq!(bundle.damage[0].total, 5 + 2 + 3);
        assert_eq!(bundle.damage[1].total, 6 + 2 + 1);
    }

    #[test]
    fn test_metamagic() {
        let actor = Actor::new("Wizard");
        let mut fireball = ActionableEntity::new("Fireball", EntityKind::Spell)
            .with_action(ActionClass::Save)
            .with_damage("5d6", "fire");
        fireball.metamagic = Metamagic {
            maximized: true,
            ..Metamagic::default()
        };
        let bundles = resolve_all(&actor, &fireball, &InvocationOptions::new(), &InvocationParts::default(), vec![]);
        assert_eq!(bundles[0].damage[0].total, 30);

        fireball.metamagic = Metamagic {
            empowered: true,
            ..Metamagic::default()
        };
        let bundles = resolve_all(&actor, &fireball, &InvocationOptions::new(), &InvocationParts::default(), vec![1, 2, 3, 4, 5]);
        assert_eq!(bundles[0].damage[0].total, 22);

        fireball.metamagic = Metamagic {
            intensified: true,
            ..Metamagic::default()
        };
        let bundles = resolve_all(&actor, &fireball, &InvocationOptions::new(), &InvocationParts::default(), vec![]);
        assert_eq!(bundles[0].damage[0].total, 60);
        assert!(bundles[0].attack.is_none());
    }

    #[test]
    fn test_healing_and_non_lethal_flags() {
        let actor = Actor::new("Cleric");
        let cure = ActionableEntity::new("Cure Light Wounds", EntityKind::Spell)
            .with_action(ActionClass::Heal)
            .with_damage("1d8 + 1", "healing");
        let bundles = resolve_all(&actor, &cure, &InvocationOptions::new(), &InvocationParts::default(), vec![6]);
        assert!(bundles[0].damage[0].healing);
        assert_eq!(bundles[0].damage[0].total, 7);

        let sap = ActionableEntity::new("Sap", EntityKind::Weapon)
            .with_action(ActionClass::MeleeWeapon)
            .with_damage("1d6", "bludgeoning");
        let options = InvocationOptions::new().with_non_lethal(true);
        let bundles = resolve_all(&actor, &sap, &options, &InvocationParts::default(), vec![10, 3]);
        assert!(bundles[0].damage[0].non_lethal);
    }

    // ========================================================================
    // Notes and special actions
    // ========================================================================

    #[test]
    fn test_effect_notes_templated() {
        let actor = Actor::new("Paladin").with_bab(5).with_entity(
            ActionableEntity::new("Aura", EntityKind::Buff)
                .with_context_note("attacks.effect", "Glows at BAB ${attributes.bab.total}")
                .active(),
        );
        let wand = ActionableEntity::new("Wand of Light", EntityKind::Equipment)
            .with_effect_note("Light for ${item.uses.value} rounds\nBlinding");
        let bundles = resolve_all(&actor, &wand, &InvocationOptions::new(), &InvocationParts::default(), vec![]);
        assert_eq!(
            bundles[0].effect_notes,
            vec!["Glows at BAB 5".to_string(), "Light for 0 rounds".to_string(), "Blinding".to_string()]
        );
    }

    #[test]
    fn test_special_actions_routed() {
        let actor = strong_fighter();
        let sword = ActionableEntity::new("Vicious Sword", EntityKind::Weapon)
            .with_action(ActionClass::MeleeWeapon)
            .with_extra_attack("-5", "Attack 2")
            .with_special_action(
                SpecialAction::parse("Damage 1d6 on self; Condition set shaken to true on target if @attackIndex > 0")
                    .unwrap(),
            );
        let parts = InvocationParts {
            special_actions: vec![QueuedAction {
                source: "Cleave".into(),
                action: SpecialAction::parse("Roll 1d20 on self").unwrap(),
                once: true,
            }],
            ..InvocationParts::default()
        };
        let bundles = resolve_all(&actor, &sword, &InvocationOptions::new().full_attack(), &parts, vec![10, 10]);
        assert_eq!(bundles[0].self_actions.len(), 2);
        assert!(bundles[0].deferred_actions.is_empty());
        assert_eq!(bundles[1].self_actions.len(), 1);
        assert_eq!(bundles[1].deferred_actions.len(), 1);
        assert_eq!(bundles[1].deferred_actions[0].source, "Vicious Sword");
    }
}
