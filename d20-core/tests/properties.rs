//! Property tests for pool bounds, critical scaling and formula evaluation.

use d20_core::context::RollContext;
use d20_core::dice::{MaximizedRoller, SeededRoller};
use d20_core::entity::{ActionClass, EntityKind, UsesPer};
use d20_core::resources::{self, ResourceState};
use d20_core::{ActionableEntity, Actor, Formula};
use proptest::prelude::*;

fn flat(sign_and_value: i64) -> String {
    if sign_and_value < 0 {
        format!(" - {}", -sign_and_value)
    } else {
        format!(" + {sign_and_value}")
    }
}

proptest! {
    #[test]
    fn prop_pool_stays_in_bounds(max in 0i64..50, start in -10i64..60, ops in prop::collection::vec(-60i64..60, 0..20)) {
        let mut state = ResourceState::new(start, max);
        for delta in ops {
            let before = state.value;
            let applied = state.apply(delta);
            prop_assert!(state.value >= 0 && state.value <= state.max);
            prop_assert_eq!(state.value, before + applied);
            prop_assert!(applied.abs() <= delta.abs());
        }
    }

    #[test]
    fn prop_spend_and_recharge_on_actor(max in 1i64..30, ops in prop::collection::vec((any::<bool>(), 0i64..10), 0..25)) {
        let wand = ActionableEntity::new("Wand", EntityKind::Equipment)
            .with_action(ActionClass::Other)
            .with_uses(UsesPer::Charges, max, max);
        let id = wand.id;
        let mut actor = Actor::new("Caster").with_entity(wand);
        for (spend, amount) in ops {
            let before = actor.entity(id).map(|e| e.uses.state.value).unwrap_or_default();
            if spend {
                let removed = resources::spend(&mut actor, id, amount);
                prop_assert!(removed <= before);
            } else {
                resources::recharge(&mut actor, id, amount);
            }
            let state = actor.entity(id).map(|e| e.uses.state).unwrap_or_default();
            prop_assert!(state.value >= 0 && state.value <= max);
        }
    }

    #[test]
    fn prop_single_use_spends_quantity(quantity in 0i64..10, n in 0i64..12) {
        let potion = ActionableEntity::new("Potion", EntityKind::Consumable)
            .with_action(ActionClass::Heal)
            .with_uses(UsesPer::Single, 0, 0)
            .with_quantity(quantity);
        let id = potion.id;
        let mut actor = Actor::new("Drinker").with_entity(potion);

        let affordable = actor.entity(id).map(|e| resources::can_afford(&actor, e, n)).unwrap_or(false);
        prop_assert_eq!(affordable, quantity >= n);

        let removed = resources::spend(&mut actor, id, n);
        let left = actor.entity(id).and_then(|e| e.quantity).unwrap_or(-1);
        prop_assert_eq!(removed, n.min(quantity));
        prop_assert_eq!(left, (quantity - n).max(0));
    }

    #[test]
    fn prop_critical_scales_maximum_linearly(
        count in 1u32..6,
        sides in prop::sample::select(vec![4u32, 6, 8, 10, 12]),
        bonus in -5i64..8,
        mult in 2u32..5,
    ) {
        let mut ctx = RollContext::new();
        ctx.set("abilities.str.mod", 3);
        let formula = Formula::parse(&format!("{count}d{sides}{} + @abilities.str.mod", flat(bonus))).unwrap();
        let normal = formula.roll(&ctx, &mut MaximizedRoller).unwrap().total;
        let critical = formula.scaled_for_critical(mult).roll(&ctx, &mut MaximizedRoller).unwrap().total;
        prop_assert_eq!(critical, i64::from(mult) * normal);
        let unscaled = formula.scaled_for_critical(1);
        prop_assert_eq!(unscaled.source(), formula.source());
    }

    #[test]
    fn prop_compute_is_repeatable(a in -50i64..50, b in 1i64..20, c in -10i64..10) {
        let mut ctx = RollContext::new();
        ctx.set("a", a);
        ctx.set("nested.b", b);
        let formula = Formula::parse(&format!("floor(@a / @nested.b) + max({c}, @a) * 2")).unwrap();
        let first = formula.compute(&ctx).unwrap();
        prop_assert_eq!(formula.compute(&ctx).unwrap(), first);
        prop_assert_eq!(first, a.div_euclid(b) + c.max(a) * 2);
    }

    #[test]
    fn prop_replay_reuses_stored_faces(seed in any::<u64>(), count in 1u32..5, bonus in 0i64..10) {
        let mut ctx = RollContext::new();
        ctx.set("bonus", bonus);
        let formula = Formula::parse(&format!("{count}d6 + @bonus")).unwrap();
        let roll = formula.roll(&ctx, &mut SeededRoller::new(seed)).unwrap();
        let replayed = roll.replay(&ctx).unwrap();
        prop_assert_eq!(replayed.total, roll.total);
        prop_assert_eq!(&replayed.dice, &roll.dice);

        ctx.set("bonus", bonus + 1);
        prop_assert_eq!(roll.replay(&ctx).unwrap().total, roll.total + 1);
    }
}
