//! Discovery and stacking of modifier rules contributed by an actor's
//! feats, active buffs and equipped gear.
//!
//! Every matching rule is evaluated once per invocation against a copy of
//! the roll context in which `@self` is the contributing entity and
//! `@range`/`@range1..3` are the user's selections. Only then are the
//! resulting [`ModifierTerm`]s applied to the real context, in source
//! order.

use crate::actor::Actor;
use crate::context::{format_number, number_value, RollContext};
use crate::entity::{ActionClass, ActionableEntity, EntityId, EntityKind, ModifierMode, ModifierRule, OptionalCost};
use crate::formula::{Formula, FormulaError};
use crate::options::{InvocationOptions, OptionalSelection};
use crate::resources::{self, Availability, ResourceTarget};
use crate::special::SpecialAction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// A rule's evaluated contribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TermValue {
    Number(f64),
    Text(String),
}

impl TermValue {
    fn text(&self) -> String {
        match self {
            TermValue::Number(n) => format_number(*n),
            TermValue::Text(text) => text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifierTerm {
    pub source: EntityId,
    pub source_name: String,
    pub target: String,
    pub value: TermValue,
    pub mode: ModifierMode,
}

/// Two sources replaced the same path; the later one was kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaceConflict {
    pub path: String,
    pub overridden: String,
    pub kept: String,
}

/// A special action carried by a matching rule.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedAction {
    pub source: String,
    pub action: SpecialAction,
    /// Run on the first sub-attack only.
    pub once: bool,
}

/// Charges billed for a selected optional source.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionalCharge {
    pub source: EntityId,
    pub name: String,
    pub target: ResourceTarget,
    pub amount: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    pub terms: Vec<ModifierTerm>,
    /// Names of contributing sources, for display.
    pub labels: Vec<String>,
    pub replace_conflicts: Vec<ReplaceConflict>,
    pub special_actions: Vec<QueuedAction>,
    pub charges: Vec<OptionalCharge>,
}

/// What the invoking entity looks like to a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scope {
    pub kind: EntityKind,
    pub action: ActionClass,
    /// Consider optional rules instead of always-on ones.
    pub optional: bool,
}

impl Scope {
    pub fn of(entity: &ActionableEntity) -> Self {
        Self {
            kind: entity.kind,
            action: entity.action,
            optional: false,
        }
    }

    pub fn optional(self) -> Self {
        Self {
            optional: true,
            ..self
        }
    }

    fn admits(&self, rule: &ModifierRule) -> bool {
        rule.optional == self.optional
            && rule.applies_to.map_or(true, |k| k == self.kind)
            && rule.action.map_or(true, |a| a == self.action)
    }
}

/// Something that contributes modifier terms to other entities' rolls.
pub trait ModifierSource {
    fn matches(&self, scope: Scope, ctx: &RollContext) -> bool;
    fn contributions(&self, scope: Scope, ctx: &RollContext) -> Result<Vec<ModifierTerm>, FormulaError>;
}

/// An entity acting as a modifier source.
#[derive(Debug, Clone, Copy)]
pub enum SourceRef<'a> {
    Feat(&'a ActionableEntity),
    Buff(&'a ActionableEntity),
    /// Enhancement entities and equipped, unmelded equipment.
    Enhancement(&'a ActionableEntity),
}

impl<'a> SourceRef<'a> {
    pub fn classify(entity: &'a ActionableEntity) -> Option<Self> {
        if !entity.is_modifier_source() {
            return None;
        }
        match entity.kind {
            EntityKind::Feat => Some(SourceRef::Feat(entity)),
            EntityKind::Buff => Some(SourceRef::Buff(entity)),
            EntityKind::Equipment | EntityKind::Enhancement => Some(SourceRef::Enhancement(entity)),
            _ => None,
        }
    }

    pub fn entity(&self) -> &'a ActionableEntity {
        match self {
            SourceRef::Feat(e) | SourceRef::Buff(e) | SourceRef::Enhancement(e) => e,
        }
    }

    /// Whether the source offers optional rules to `target`, ignoring
    /// conditions.
    pub fn has_optional_rules(&self, target: &ActionableEntity) -> bool {
        let scope = Scope::of(target).optional();
        self.entity().modifiers.iter().any(|rule| scope.admits(rule))
    }

    fn applicable(&self, scope: Scope, ctx: &RollContext) -> Vec<&'a ModifierRule> {
        let entity = self.entity();
        entity
            .modifiers
            .iter()
            .filter(|rule| scope.admits(rule))
            .filter(|rule| match rule.condition.as_deref().map(str::trim) {
                None | Some("") => true,
                Some(condition) => Formula::parse(condition)
                    .and_then(|f| f.evaluate_condition(ctx))
                    .unwrap_or_else(|err| {
                        warn!(source = %entity.name, condition, error = %err, "modifier condition failed");
                        false
                    }),
            })
            .collect()
    }

    fn evaluate(&self, rule: &ModifierRule, ctx: &RollContext) -> Result<ModifierTerm, FormulaError> {
        let entity = self.entity();
        let (mode, path) = rule.resolved_target();
        let text = substitute_ranges(&rule.value, ctx);
        let value = match mode {
            ModifierMode::Add if text.trim().is_empty() => {
                warn!(source = %entity.name, target = path, "empty modifier value");
                TermValue::Number(0.0)
            }
            ModifierMode::Add => TermValue::Number(Formula::parse(&text)?.compute_exact(ctx)?),
            ModifierMode::Replace => {
                let filled = ctx.fill_template(&text);
                match Formula::parse(&filled).and_then(|f| f.compute_exact(ctx)) {
                    Ok(n) => TermValue::Number(n),
                    Err(_) => TermValue::Text(filled),
                }
            }
            ModifierMode::Append => TermValue::Text(ctx.fill_template(&text)),
        };
        Ok(ModifierTerm {
            source: entity.id,
            source_name: entity.name.clone(),
            target: path.to_string(),
            value,
            mode,
        })
    }
}

impl ModifierSource for SourceRef<'_> {
    fn matches(&self, scope: Scope, ctx: &RollContext) -> bool {
        !self.applicable(scope, ctx).is_empty()
    }

    fn contributions(&self, scope: Scope, ctx: &RollContext) -> Result<Vec<ModifierTerm>, FormulaError> {
        self.applicable(scope, ctx)
            .into_iter()
            .map(|rule| self.evaluate(rule, ctx))
            .collect()
    }
}

/// Candidate sources in the actor's entity order, skipping `exclude`.
pub fn sources(actor: &Actor, exclude: Option<EntityId>) -> impl Iterator<Item = SourceRef<'_>> {
    actor
        .entities
        .iter()
        .filter(move |e| Some(e.id) != exclude)
        .filter_map(SourceRef::classify)
}

/// Replace `@range1..3` and `@range` with the chosen values, longest first.
fn substitute_ranges(text: &str, ctx: &RollContext) -> String {
    let mut out = text.to_string();
    for key in ["range1", "range2", "range3", "range"] {
        let needle = format!("@{key}");
        if out.contains(&needle) {
            out = out.replace(&needle, &ctx.int(key).to_string());
        }
    }
    out
}

fn scoped_context(ctx: &RollContext, source: &ActionableEntity, selection: Option<&OptionalSelection>) -> RollContext {
    let mut scoped = ctx.clone();
    scoped.set("self", source.roll_data());
    let ranges = selection.map(|s| s.ranges.as_slice()).unwrap_or(&[]);
    for (i, key) in ["range", "range1", "range2", "range3"].iter().enumerate() {
        scoped.set(key, ranges.get(i).copied().unwrap_or(0));
    }
    scoped
}

/// Discover, evaluate and apply every modifier rule that applies to
/// `entity`, writing the results into `ctx`.
pub fn aggregate(
    actor: &Actor,
    entity: &ActionableEntity,
    options: &InvocationOptions,
    ctx: &mut RollContext,
) -> Result<Aggregation, FormulaError> {
    let mut out = Aggregation::default();
    let scope = Scope::of(entity);

    for source in sources(actor, Some(entity.id)) {
        let source_entity = source.entity();
        let scoped = scoped_context(ctx, source_entity, None);
        let always = source.contributions(scope, &scoped)?;
        let mut rules = source.applicable(scope, &scoped);
        let mut label = (!rules.is_empty()).then(|| source_entity.name.clone());
        out.terms.extend(always);

        if let Some(selection) = options.selection(source_entity.id) {
            let exhausted = source_entity.is_charged()
                && resources::available(actor, source_entity) == Availability::Limited(0);
            if exhausted {
                debug!(source = %source_entity.name, "optional source has no charges");
            } else {
                let scoped = scoped_context(ctx, source_entity, Some(selection));
                let optional_rules = source.applicable(scope.optional(), &scoped);
                if !optional_rules.is_empty() {
                    out.terms.extend(source.contributions(scope.optional(), &scoped)?);
                    if source_entity.is_charged() {
                        let amount = match source_entity.optional_cost {
                            OptionalCost::ChargesPerUse => source_entity.uses.charges_per_use.max(1),
                            OptionalCost::Range => selection.base(),
                        };
                        out.charges.push(OptionalCharge {
                            source: source_entity.id,
                            name: source_entity.name.clone(),
                            target: resources::target(actor, source_entity),
                            amount,
                        });
                    }
                    label = Some(if selection.ranges.is_empty() {
                        source_entity.name.clone()
                    } else {
                        let ranges: Vec<String> = selection.ranges.iter().map(i64::to_string).collect();
                        format!("{} ({})", source_entity.name, ranges.join(", "))
                    });
                    rules.extend(optional_rules);
                }
            }
        }

        for rule in rules {
            for action in &rule.special_actions {
                out.special_actions.push(QueuedAction {
                    source: source_entity.name.clone(),
                    action: action.clone(),
                    once: source_entity.special_actions_once,
                });
            }
        }
        out.labels.extend(label);
    }

    let mut replaced: HashMap<String, String> = HashMap::new();
    for term in &out.terms {
        match (&term.mode, &term.value) {
            (ModifierMode::Add, TermValue::Number(n)) => ctx.add(&term.target, *n),
            (ModifierMode::Add, TermValue::Text(text)) => ctx.append(&term.target, text),
            (ModifierMode::Replace, value) => {
                if let Some(previous) = replaced.insert(term.target.clone(), term.source_name.clone()) {
                    warn!(
                        path = %term.target,
                        overridden = %previous,
                        kept = %term.source_name,
                        "conflicting replace modifiers"
                    );
                    out.replace_conflicts.push(ReplaceConflict {
                        path: term.target.clone(),
                        overridden: previous,
                        kept: term.source_name.clone(),
                    });
                }
                match value {
                    TermValue::Number(n) => ctx.set(&term.target, number_value(*n)),
                    TermValue::Text(text) => ctx.set(&term.target, text.clone()),
                }
            }
            (ModifierMode::Append, value) => ctx.append(&term.target, &value.text()),
        }
    }
    debug!(
        entity = %entity.name,
        terms = out.terms.len(),
        sources = ?out.labels,
        "modifiers aggregated"
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::UsesPer;
    use crate::formula;

    fn weapon() -> ActionableEntity {
        ActionableEntity::new("Longsword", EntityKind::Weapon).with_action(ActionClass::MeleeWeapon)
    }

    fn base_ctx(actor: &Actor, entity: &ActionableEntity) -> RollContext {
        let mut ctx = RollContext::from(actor.roll_data());
        ctx.set("item", entity.roll_data());
        ctx
    }

    // ========================================================================
    // Applicability
    // ========================================================================

    #[test]
    fn test_additive_terms_stack() {
        let sword = weapon();
        let actor = Actor::new("Fighter")
            .with_entity(sword.clone())
            .with_entity(
                ActionableEntity::new("Weapon Focus", EntityKind::Feat)
                    .with_modifier(ModifierRule::new("featAttackBonus", "1")),
            )
            .with_entity(
                ActionableEntity::new("Bless", EntityKind::Buff)
                    .with_modifier(ModifierRule::new("featAttackBonus", "1"))
                    .active(),
            )
            .with_entity(
                ActionableEntity::new("Prayer", EntityKind::Buff)
                    .with_modifier(ModifierRule::new("featAttackBonus", "1")),
            );
        let mut ctx = base_ctx(&actor, &sword);
        let agg = aggregate(&actor, &sword, &InvocationOptions::new(), &mut ctx).unwrap();
        assert_eq!(ctx.int("featAttackBonus"), 2);
        assert_eq!(agg.labels, vec!["Weapon Focus".to_string(), "Bless".to_string()]);
        assert_eq!(agg.terms.len(), 2);
    }

    #[test]
    fn test_kind_action_and_condition_filters() {
        let sword = weapon();
        let actor = Actor::new("Fighter")
            .with_bab(6)
            .with_entity(sword.clone())
            .with_entity(
                ActionableEntity::new("Point Blank Shot", EntityKind::Feat).with_modifier(
                    ModifierRule::new("featAttackBonus", "1").for_action(ActionClass::RangedWeapon),
                ),
            )
            .with_entity(
                ActionableEntity::new("Spell Focus", EntityKind::Feat)
                    .with_modifier(ModifierRule::new("featAttackBonus", "1").for_kind(EntityKind::Spell)),
            )
            .with_entity(
                ActionableEntity::new("Veteran", EntityKind::Feat)
                    .with_modifier(ModifierRule::new("featDamageBonus", "@self.enh + 2").when("@bab >= 6")),
            )
            .with_entity(
                ActionableEntity::new("Broken", EntityKind::Feat)
                    .with_modifier(ModifierRule::new("featDamageBonus", "100").when("@bab >=")),
            );
        let mut ctx = base_ctx(&actor, &sword);
        let agg = aggregate(&actor, &sword, &InvocationOptions::new(), &mut ctx).unwrap();
        assert_eq!(ctx.int("featAttackBonus"), 0);
        assert_eq!(ctx.int("featDamageBonus"), 2);
        assert_eq!(agg.labels, vec!["Veteran".to_string()]);
    }

    #[test]
    fn test_malformed_value_is_an_error() {
        let sword = weapon();
        let actor = Actor::new("Fighter").with_entity(sword.clone()).with_entity(
            ActionableEntity::new("Typo", EntityKind::Feat).with_modifier(ModifierRule::new("featAttackBonus", "1 +")),
        );
        let mut ctx = base_ctx(&actor, &sword);
        assert!(aggregate(&actor, &sword, &InvocationOptions::new(), &mut ctx).is_err());
    }

    // ========================================================================
    // Modes
    // ========================================================================

    #[test]
    fn test_replace_conflict_last_wins() {
        let sword = weapon();
        let actor = Actor::new("Fighter")
            .with_entity(sword.clone())
            .with_entity(
                ActionableEntity::new("Improved Critical", EntityKind::Feat)
                    .with_modifier(ModifierRule::new("$item.ability.critRange", "19")),
            )
            .with_entity(
                ActionableEntity::new("Keen Edge", EntityKind::Buff)
                    .with_modifier(ModifierRule::new("$item.ability.critRange", "17"))
                    .active(),
            );
        let mut ctx = base_ctx(&actor, &sword);
        let agg = aggregate(&actor, &sword, &InvocationOptions::new(), &mut ctx).unwrap();
        assert_eq!(ctx.int("item.ability.critRange"), 17);
        assert_eq!(
            agg.replace_conflicts,
            vec![ReplaceConflict {
                path: "item.ability.critRange".into(),
                overridden: "Improved Critical".into(),
                kept: "Keen Edge".into(),
            }]
        );
    }

    #[test]
    fn test_replace_text_and_append() {
        let sword = weapon();
        let actor = Actor::new("Fighter")
            .with_entity(sword.clone())
            .with_entity(
                ActionableEntity::new("Flaming", EntityKind::Enhancement)
                    .with_modifier(ModifierRule::new("&featDamage.fire", "1d6")),
            )
            .with_entity(
                ActionableEntity::new("Flaming Burst", EntityKind::Enhancement)
                    .with_modifier(ModifierRule::new("featDamage.fire", "1d10").with_mode(ModifierMode::Append)),
            )
            .with_entity(
                ActionableEntity::new("Named", EntityKind::Feat)
                    .with_modifier(ModifierRule::new("$weaponTitle", "${item.name} of Doom")),
            );
        let mut ctx = base_ctx(&actor, &sword);
        aggregate(&actor, &sword, &InvocationOptions::new(), &mut ctx).unwrap();
        assert_eq!(ctx.text("featDamage.fire"), Some("1d6 + (1d10)"));
        assert_eq!(ctx.text("weaponTitle"), Some("Longsword of Doom"));
        let mut roller = crate::testing::ScriptedRoller::new(vec![4, 7]);
        assert_eq!(formula::roll("@featDamage.fire", &ctx, &mut roller).unwrap().total, 11);
    }

    // ========================================================================
    // Optional sources
    // ========================================================================

    #[test]
    fn test_optional_source_requires_selection() {
        let sword = weapon();
        let smite = ActionableEntity::new("Smite Evil", EntityKind::Feat)
            .with_uses(UsesPer::Day, 2, 3)
            .with_modifier(ModifierRule::new("featAttackBonus", "@abilities.cha.mod + @range").optional());
        let actor = Actor::new("Paladin")
            .with_abilities(crate::actor::AbilityScores::new(14, 10, 12, 10, 10, 16))
            .with_entity(sword.clone())
            .with_entity(smite.clone());

        let mut ctx = base_ctx(&actor, &sword);
        let agg = aggregate(&actor, &sword, &InvocationOptions::new(), &mut ctx).unwrap();
        assert!(agg.terms.is_empty() && agg.charges.is_empty());

        let options = InvocationOptions::new().with_optional_source(OptionalSelection::new(smite.id).with_range(2));
        let mut ctx = base_ctx(&actor, &sword);
        let agg = aggregate(&actor, &sword, &options, &mut ctx).unwrap();
        assert_eq!(ctx.int("featAttackBonus"), 5);
        assert_eq!(agg.labels, vec!["Smite Evil (2)".to_string()]);
        assert_eq!(agg.charges.len(), 1);
        assert_eq!(agg.charges[0].amount, 1);
        assert_eq!(agg.charges[0].target, ResourceTarget::Charges { entity: smite.id });
    }

    #[test]
    fn test_optional_range_cost_and_exhausted_source() {
        let sword = weapon();
        let mut channel = ActionableEntity::new("Divine Power", EntityKind::Feat)
            .with_uses(UsesPer::Day, 3, 3)
            .with_modifier(ModifierRule::new("featDamageBonus", "@range * 2").optional());
        channel.optional_cost = OptionalCost::Range;
        let actor = Actor::new("Cleric").with_entity(sword.clone()).with_entity(channel.clone());
        let options =
            InvocationOptions::new().with_optional_source(OptionalSelection::new(channel.id).with_range(3));
        let mut ctx = base_ctx(&actor, &sword);
        let agg = aggregate(&actor, &sword, &options, &mut ctx).unwrap();
        assert_eq!(ctx.int("featDamageBonus"), 6);
        assert_eq!(agg.charges[0].amount, 3);

        let mut drained = actor.clone();
        drained.entity_mut(channel.id).unwrap().uses.state.value = 0;
        let mut ctx = base_ctx(&drained, &sword);
        let agg = aggregate(&drained, &sword, &options, &mut ctx).unwrap();
        assert!(agg.terms.is_empty());
        assert!(agg.charges.is_empty());
    }

    #[test]
    fn test_special_actions_queued() {
        let sword = weapon();
        let mut rage = ActionableEntity::new("Frenzy", EntityKind::Buff)
            .with_modifier(
                ModifierRule::new("featDamageBonus", "2")
                    .with_special_action(SpecialAction::parse("Condition set fatigued to true on self").unwrap()),
            )
            .active();
        rage.special_actions_once = true;
        let actor = Actor::new("Barbarian").with_entity(sword.clone()).with_entity(rage);
        let mut ctx = base_ctx(&actor, &sword);
        let agg = aggregate(&actor, &sword, &InvocationOptions::new(), &mut ctx).unwrap();
        assert_eq!(agg.special_actions.len(), 1);
        assert!(agg.special_actions[0].once);
        assert_eq!(agg.special_actions[0].source, "Frenzy");
    }
}
