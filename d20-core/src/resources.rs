//! Consumable state: charges, stack quantity, spell slots and power points.
//!
//! Every pool obeys `0 <= value <= max` after every operation. Spending
//! more than is available clamps at zero instead of failing; callers that
//! care check [`can_afford`] first, and the engine re-checks the whole
//! [`ResourceCommit`] before applying it.

use crate::actor::{Actor, SpellbookKind};
use crate::context::RollContext;
use crate::entity::{ActionableEntity, EntityId, UsesPer};
use crate::formula::{Formula, FormulaError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Current value and maximum of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceState {
    #[serde(default)]
    pub value: i64,
    #[serde(default)]
    pub max: i64,
}

impl ResourceState {
    pub fn new(value: i64, max: i64) -> Self {
        let max = max.max(0);
        Self {
            value: value.clamp(0, max),
            max,
        }
    }

    pub fn full(max: i64) -> Self {
        Self::new(max, max)
    }

    /// Remove up to `amount`, returning how much was actually removed.
    pub fn spend(&mut self, amount: i64) -> i64 {
        let spent = amount.clamp(0, self.value.max(0));
        self.value -= spent;
        spent
    }

    /// Add up to `amount` without exceeding the maximum.
    pub fn restore(&mut self, amount: i64) -> i64 {
        let room = (self.max - self.value).max(0);
        let gained = amount.clamp(0, room);
        self.value += gained;
        gained
    }

    /// Signed change: negative spends, positive restores.
    pub fn apply(&mut self, delta: i64) -> i64 {
        if delta < 0 {
            -self.spend(-delta)
        } else {
            self.restore(delta)
        }
    }

    pub fn refill(&mut self) {
        self.value = self.max.max(0);
    }

    pub fn set_max(&mut self, max: i64) {
        self.max = max.max(0);
        self.value = self.value.clamp(0, self.max);
    }

    pub fn is_empty(&self) -> bool {
        self.value <= 0
    }
}

/// How much of a pool is left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Unlimited,
    Limited(i64),
}

impl Availability {
    pub fn covers(&self, amount: i64) -> bool {
        match self {
            Availability::Unlimited => true,
            Availability::Limited(value) => *value >= amount,
        }
    }
}

/// The concrete pool an entity draws from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "pool", rename_all = "snake_case")]
pub enum ResourceTarget {
    Unlimited,
    Charges { entity: EntityId },
    Quantity { entity: EntityId },
    Prepared { entity: EntityId },
    SpellSlot { spellbook: String, level: u8 },
    PowerPoints { spellbook: String },
}

/// Rest periods that restore pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestPeriod {
    Encounter,
    Day,
    Week,
}

impl RestPeriod {
    fn restores(&self, per: UsesPer) -> bool {
        match self {
            RestPeriod::Encounter => per == UsesPer::Encounter,
            RestPeriod::Day => matches!(per, UsesPer::Encounter | UsesPer::Day),
            RestPeriod::Week => matches!(per, UsesPer::Encounter | UsesPer::Day | UsesPer::Week),
        }
    }
}

const MAX_LINK_DEPTH: usize = 4;

/// Follow linked pools to the entity whose state is actually consumed.
fn pool_owner<'a>(actor: &'a Actor, entity: &'a ActionableEntity) -> &'a ActionableEntity {
    let mut current = entity;
    for _ in 0..MAX_LINK_DEPTH {
        match current.uses.linked_pool.and_then(|id| actor.entity(id)) {
            Some(linked) if linked.id != current.id => current = linked,
            _ => break,
        }
    }
    current
}

/// Resolve which pool `entity` draws from.
pub fn target(actor: &Actor, entity: &ActionableEntity) -> ResourceTarget {
    let owner = pool_owner(actor, entity);
    if let Some(spell) = &owner.spell {
        if spell.at_will {
            return ResourceTarget::Unlimited;
        }
        if let Some(book) = actor.spellbooks.get(&spell.spellbook) {
            return match book.kind {
                SpellbookKind::Prepared => ResourceTarget::Prepared { entity: owner.id },
                SpellbookKind::Spontaneous => ResourceTarget::SpellSlot {
                    spellbook: spell.spellbook.clone(),
                    level: spell.level,
                },
                SpellbookKind::PowerPoints => ResourceTarget::PowerPoints {
                    spellbook: spell.spellbook.clone(),
                },
            };
        }
    }
    match owner.uses.per {
        UsesPer::Unlimited => ResourceTarget::Unlimited,
        UsesPer::Single => ResourceTarget::Quantity { entity: owner.id },
        _ => ResourceTarget::Charges { entity: owner.id },
    }
}

/// Units consumed by one use of `entity`.
pub fn cost(entity: &ActionableEntity) -> i64 {
    if entity.is_single_use() {
        return 1;
    }
    if let Some(spell) = &entity.spell {
        return if spell.power_point_cost > 0 {
            spell.power_point_cost
        } else {
            1
        };
    }
    entity.uses.charges_per_use.max(1)
}

pub fn available_at(actor: &Actor, target: &ResourceTarget) -> Availability {
    let limited = |value: Option<i64>| Availability::Limited(value.unwrap_or(0).max(0));
    match target {
        ResourceTarget::Unlimited => Availability::Unlimited,
        ResourceTarget::Charges { entity } => {
            limited(actor.entity(*entity).map(|e| e.uses.state.value))
        }
        ResourceTarget::Quantity { entity } => {
            limited(actor.entity(*entity).and_then(|e| e.quantity))
        }
        ResourceTarget::Prepared { entity } => {
            limited(actor.entity(*entity).and_then(|e| e.spell.as_ref()).map(|s| s.prepared))
        }
        ResourceTarget::SpellSlot { spellbook, level } => limited(
            actor
                .spellbooks
                .get(spellbook)
                .and_then(|b| b.slots.get(level))
                .map(|s| s.value),
        ),
        ResourceTarget::PowerPoints { spellbook } => {
            limited(actor.spellbooks.get(spellbook).map(|b| b.power_points.value))
        }
    }
}

pub fn available(actor: &Actor, entity: &ActionableEntity) -> Availability {
    available_at(actor, &target(actor, entity))
}

/// Whether `multiplier` uses of `entity` can be paid for.
pub fn can_afford(actor: &Actor, entity: &ActionableEntity, multiplier: i64) -> bool {
    available(actor, entity).covers(cost(entity) * multiplier.max(0))
}

/// Apply a signed change to a pool, clamped to its bounds. Returns the
/// change actually applied.
pub fn apply_delta(actor: &mut Actor, target: &ResourceTarget, delta: i64) -> i64 {
    let applied = match target {
        ResourceTarget::Unlimited => 0,
        ResourceTarget::Charges { entity } => actor
            .entity_mut(*entity)
            .map_or(0, |e| e.uses.state.apply(delta)),
        ResourceTarget::Quantity { entity } => actor.entity_mut(*entity).map_or(0, |e| {
            let current = e.quantity.unwrap_or(0);
            let next = (current + delta).max(0);
            e.quantity = Some(next);
            next - current
        }),
        ResourceTarget::Prepared { entity } => actor
            .entity_mut(*entity)
            .and_then(|e| e.spell.as_mut())
            .map_or(0, |spell| {
                let current = spell.prepared;
                let ceiling = spell.max_prepared.max(current);
                spell.prepared = (current + delta).clamp(0, ceiling);
                spell.prepared - current
            }),
        ResourceTarget::SpellSlot { spellbook, level } => actor
            .spellbooks
            .get_mut(spellbook)
            .and_then(|b| b.slots.get_mut(level))
            .map_or(0, |slot| slot.apply(delta)),
        ResourceTarget::PowerPoints { spellbook } => actor
            .spellbooks
            .get_mut(spellbook)
            .map_or(0, |b| b.power_points.apply(delta)),
    };
    if applied != delta && *target != ResourceTarget::Unlimited {
        debug!(?target, requested = delta, applied, "resource change clamped");
    }
    applied
}

/// Consume `multiplier` uses of the entity. Returns the units removed.
pub fn spend(actor: &mut Actor, entity_id: EntityId, multiplier: i64) -> i64 {
    let Some(entity) = actor.entity(entity_id) else {
        warn!(%entity_id, "spend on unknown entity");
        return 0;
    };
    let pool = target(actor, entity);
    let amount = cost(entity) * multiplier.max(0);
    -apply_delta(actor, &pool, -amount)
}

/// Return `delta` units to the entity's pool. Returns the units restored.
pub fn recharge(actor: &mut Actor, entity_id: EntityId, delta: i64) -> i64 {
    let Some(entity) = actor.entity(entity_id) else {
        warn!(%entity_id, "recharge on unknown entity");
        return 0;
    };
    let pool = target(actor, entity);
    apply_delta(actor, &pool, delta.max(0))
}

/// Restore every pool that recharges within `period`. Returns the number
/// of pools touched.
pub fn refresh(actor: &mut Actor, period: RestPeriod) -> usize {
    let mut restored = 0;
    for entity in &mut actor.entities {
        if period.restores(entity.uses.per) && entity.uses.state.value < entity.uses.state.max {
            entity.uses.state.refill();
            restored += 1;
        }
        if period != RestPeriod::Encounter {
            if let Some(spell) = entity.spell.as_mut() {
                if spell.prepared < spell.max_prepared {
                    spell.prepared = spell.max_prepared;
                    restored += 1;
                }
            }
        }
    }
    if period != RestPeriod::Encounter {
        for book in actor.spellbooks.values_mut() {
            for slot in book.slots.values_mut() {
                slot.refill();
            }
            book.power_points.refill();
            restored += 1;
        }
    }
    debug!(actor = %actor.name, ?period, restored, "pools refreshed");
    restored
}

/// Recompute an entity's maximum from its max formula, clamping its value.
pub fn update_max(
    actor: &mut Actor,
    entity_id: EntityId,
    ctx: &RollContext,
) -> Result<Option<ResourceState>, FormulaError> {
    let Some(source) = actor
        .entity(entity_id)
        .and_then(|e| e.uses.max_formula.clone())
    else {
        return Ok(None);
    };
    let max = Formula::parse(&source)?.compute(ctx)?;
    Ok(actor.entity_mut(entity_id).map(|e| {
        e.uses.state.set_max(max);
        e.uses.state
    }))
}

/// One pending change in an invocation's commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDelta {
    pub target: ResourceTarget,
    /// Requested change; negative values spend.
    pub amount: i64,
    /// Change actually applied, filled in by [`ResourceCommit::apply`].
    #[serde(default)]
    pub applied: i64,
    pub reason: String,
}

/// All resource changes of one invocation, applied together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceCommit {
    pub deltas: Vec<ResourceDelta>,
}

impl ResourceCommit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, target: ResourceTarget, amount: i64, reason: impl Into<String>) {
        if amount == 0 || target == ResourceTarget::Unlimited {
            return;
        }
        self.deltas.push(ResourceDelta {
            target,
            amount,
            applied: 0,
            reason: reason.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Verify every pool can cover its total spend. Returns the first pool
    /// that cannot.
    pub fn check(&self, actor: &Actor) -> Result<(), ResourceTarget> {
        let mut totals: HashMap<&ResourceTarget, i64> = HashMap::new();
        for delta in self.deltas.iter().filter(|d| d.amount < 0) {
            *totals.entry(&delta.target).or_default() += -delta.amount;
        }
        for delta in &self.deltas {
            if let Some(total) = totals.remove(&delta.target) {
                if !available_at(actor, &delta.target).covers(total) {
                    return Err(delta.target.clone());
                }
            }
        }
        Ok(())
    }

    /// Apply all deltas in order, recording what each one actually changed.
    pub fn apply(&mut self, actor: &mut Actor) {
        for delta in &mut self.deltas {
            delta.applied = apply_delta(actor, &delta.target, delta.amount);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::Spellbook;
    use crate::entity::{EntityKind, SpellData};

    fn wand() -> ActionableEntity {
        ActionableEntity::new("Wand of Magic Missile", EntityKind::Equipment)
            .with_uses(UsesPer::Charges, 5, 50)
    }

    #[test]
    fn test_state_clamps() {
        let mut state = ResourceState::new(1, 5);
        assert_eq!(state.spend(3), 1);
        assert_eq!(state.value, 0);
        assert_eq!(state.spend(1), 0);
        assert_eq!(state.restore(10), 5);
        assert_eq!(state.value, 5);
        assert_eq!(ResourceState::new(9, 5).value, 5);
    }

    #[test]
    fn test_single_use_draws_quantity() {
        let potion = ActionableEntity::new("Potion", EntityKind::Consumable)
            .with_uses(UsesPer::Single, 0, 0)
            .with_quantity(3);
        let id = potion.id;
        let mut actor = Actor::new("Tester").with_entity(potion);
        assert!(can_afford(&actor, actor.entity(id).unwrap(), 3));
        assert!(!can_afford(&actor, actor.entity(id).unwrap(), 4));
        assert_eq!(spend(&mut actor, id, 2), 2);
        assert_eq!(actor.entity(id).unwrap().quantity, Some(1));
        assert_eq!(spend(&mut actor, id, 5), 1);
        assert_eq!(actor.entity(id).unwrap().quantity, Some(0));
    }

    #[test]
    fn test_charges_per_use() {
        let item = wand().with_charges_per_use(2);
        let id = item.id;
        let mut actor = Actor::new("Tester").with_entity(item);
        assert_eq!(cost(actor.entity(id).unwrap()), 2);
        assert!(can_afford(&actor, actor.entity(id).unwrap(), 2));
        assert!(!can_afford(&actor, actor.entity(id).unwrap(), 3));
        assert_eq!(spend(&mut actor, id, 1), 2);
        assert_eq!(actor.entity(id).unwrap().uses.state.value, 3);
        assert_eq!(recharge(&mut actor, id, 100), 47);
    }

    #[test]
    fn test_linked_pool() {
        let pool = wand();
        let pool_id = pool.id;
        let mut user = ActionableEntity::new("Missile", EntityKind::Attack);
        user.uses.linked_pool = Some(pool_id);
        let user_id = user.id;
        let mut actor = Actor::new("Tester").with_entity(pool).with_entity(user);
        assert_eq!(
            target(&actor, actor.entity(user_id).unwrap()),
            ResourceTarget::Charges { entity: pool_id }
        );
        spend(&mut actor, user_id, 1);
        assert_eq!(actor.entity(pool_id).unwrap().uses.state.value, 4);
    }

    #[test]
    fn test_spell_pools() {
        let mut actor = Actor::new("Caster")
            .with_spellbook("arcane", Spellbook::spontaneous(5).with_slots(1, 4))
            .with_spellbook("psionic", Spellbook::power_points(5, 10));
        let sorcerer_spell = ActionableEntity::new("Magic Missile", EntityKind::Spell).with_spell(SpellData {
            spellbook: "arcane".into(),
            level: 1,
            at_will: false,
            prepared: 0,
            max_prepared: 0,
            power_point_cost: 0,
        });
        let power = ActionableEntity::new("Energy Ray", EntityKind::Spell).with_spell(SpellData {
            spellbook: "psionic".into(),
            level: 1,
            at_will: false,
            prepared: 0,
            max_prepared: 0,
            power_point_cost: 3,
        });
        let (spell_id, power_id) = (sorcerer_spell.id, power.id);
        actor.entities.push(sorcerer_spell);
        actor.entities.push(power);

        assert_eq!(available(&actor, actor.entity(spell_id).unwrap()), Availability::Limited(4));
        spend(&mut actor, spell_id, 1);
        assert_eq!(actor.spellbooks["arcane"].slots[&1].value, 3);

        assert!(can_afford(&actor, actor.entity(power_id).unwrap(), 3));
        assert!(!can_afford(&actor, actor.entity(power_id).unwrap(), 4));
        assert_eq!(spend(&mut actor, power_id, 4), 10);
        assert_eq!(actor.spellbooks["psionic"].power_points.value, 0);
    }

    #[test]
    fn test_refresh_periods() {
        let daily = ActionableEntity::new("Rage", EntityKind::Feat).with_uses(UsesPer::Day, 0, 3);
        let weekly = ActionableEntity::new("Wish Ring", EntityKind::Equipment).with_uses(UsesPer::Week, 0, 1);
        let (daily_id, weekly_id) = (daily.id, weekly.id);
        let mut actor = Actor::new("Tester").with_entity(daily).with_entity(weekly);

        refresh(&mut actor, RestPeriod::Encounter);
        assert_eq!(actor.entity(daily_id).unwrap().uses.state.value, 0);
        refresh(&mut actor, RestPeriod::Day);
        assert_eq!(actor.entity(daily_id).unwrap().uses.state.value, 3);
        assert_eq!(actor.entity(weekly_id).unwrap().uses.state.value, 0);
        refresh(&mut actor, RestPeriod::Week);
        assert_eq!(actor.entity(weekly_id).unwrap().uses.state.value, 1);
    }

    #[test]
    fn test_update_max_from_formula() {
        let mut item = wand();
        item.uses.max_formula = Some("3 + floor(@level / 2)".to_string());
        let id = item.id;
        let mut actor = Actor::new("Tester").with_entity(item);
        let mut ctx = RollContext::new();
        ctx.set("level", 4);
        let state = update_max(&mut actor, id, &ctx).unwrap().unwrap();
        assert_eq!(state, ResourceState::new(5, 5));
    }

    #[test]
    fn test_commit_check_sums_targets() {
        let item = wand();
        let id = item.id;
        let actor = Actor::new("Tester").with_entity(item);
        let mut commit = ResourceCommit::new();
        commit.push(ResourceTarget::Charges { entity: id }, -3, "use");
        commit.push(ResourceTarget::Charges { entity: id }, -2, "optional");
        assert!(commit.check(&actor).is_ok());
        commit.push(ResourceTarget::Charges { entity: id }, -1, "extra");
        assert_eq!(commit.check(&actor), Err(ResourceTarget::Charges { entity: id }));
        commit.push(ResourceTarget::Unlimited, -10, "ignored");
        assert_eq!(commit.deltas.len(), 3);
    }
}
