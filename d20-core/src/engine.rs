//! Top-level orchestration of one entity invocation.
//!
//! An invocation runs through a fixed set of phases:
//!
//! ```text
//! Idle -> Validating -> (Aborted | ContextBuilt) -> Sequenced
//!      -> Resolving(n) -> Consuming -> Done
//! ```
//!
//! Nothing is rolled before the options prompt answers, and nothing is
//! written to the store until every sub-attack has resolved. The commit
//! re-reads the authoritative actor under the store's write lock.

use crate::actor::{Actor, ActorId, User};
use crate::config::EngineConfig;
use crate::context::RollContext;
use crate::dice::{DiceRoller, ThreadRoller};
use crate::entity::{ActionClass, ActionableEntity, AttackKind, EntityId, EntityKind};
use crate::formula::FormulaError;
use crate::modifiers::{self, ReplaceConflict};
use crate::options::{InvocationOptions, OptionsRequest, TwoWeaponMode};
use crate::resolution::{nonzero, ExtraDamage, InvocationParts, PendingAction, Resolver, SubAttackBundle};
use crate::resources::{self, ResourceCommit, ResourceDelta, ResourceTarget};
use crate::sequencer;
use crate::special::AppliedAction;
use crate::store::{ActorStore, StoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{user} may not act for {actor}")]
    PermissionDenied { user: String, actor: String },

    #[error("{entity} cannot be used: {pool:?} is exhausted")]
    ResourceExhausted { entity: String, pool: ResourceTarget },

    /// Sub-attacks resolved before the failure are returned untouched.
    #[error("Formula error: {error}")]
    Formula {
        #[source]
        error: FormulaError,
        completed: Vec<SubAttackBundle>,
    },

    #[error("Cancelled")]
    UserCancelled,

    #[error("Unknown actor: {0}")]
    ActorNotFound(ActorId),

    #[error("Unknown entity: {0}")]
    EntityNotFound(EntityId),

    #[error("No usable ammunition for {0}")]
    AmmunitionNotFound(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnknownActor(id) => EngineError::ActorNotFound(id),
        }
    }
}

impl EngineError {
    fn formula(error: FormulaError) -> Self {
        EngineError::Formula {
            error,
            completed: Vec::new(),
        }
    }
}

/// Asks whoever is driving the invocation for its transient selections.
/// `None` cancels the invocation.
#[async_trait]
pub trait OptionsPrompt: Send + Sync {
    async fn choose(&self, request: &OptionsRequest) -> Option<InvocationOptions>;
}

/// A fixed set of options answers every prompt.
#[async_trait]
impl OptionsPrompt for InvocationOptions {
    async fn choose(&self, _request: &OptionsRequest) -> Option<InvocationOptions> {
        Some(self.clone())
    }
}

/// Takes whatever the request offers as defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptDefaults;

#[async_trait]
impl OptionsPrompt for AcceptDefaults {
    async fn choose(&self, request: &OptionsRequest) -> Option<InvocationOptions> {
        Some(request.defaults.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Validating,
    Aborted,
    ContextBuilt,
    Sequenced,
    Resolving(usize),
    Consuming,
    Done,
}

struct PhaseLog<'a> {
    entity: &'a str,
    phase: Phase,
}

impl<'a> PhaseLog<'a> {
    fn new(entity: &'a str) -> Self {
        Self {
            entity,
            phase: Phase::Idle,
        }
    }

    fn advance(&mut self, next: Phase) {
        debug!(entity = %self.entity, from = ?self.phase, to = ?next, "invocation phase");
        self.phase = next;
    }

    fn abort(&mut self, err: EngineError) -> EngineError {
        self.advance(Phase::Aborted);
        err
    }
}

/// Everything one invocation produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionBundle {
    pub actor: String,
    pub entity: String,
    pub entity_id: EntityId,
    pub full_attack: bool,
    pub sub_attacks: Vec<SubAttackBundle>,
    #[serde(default)]
    pub attack_notes: Vec<String>,
    /// Sources and toggles that shaped the rolls.
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub replace_conflicts: Vec<ReplaceConflict>,
    /// Results of `self` special actions, in sub-attack order.
    #[serde(default)]
    pub applied_actions: Vec<AppliedAction>,
    #[serde(default)]
    pub deltas: Vec<ResourceDelta>,
}

impl ResolutionBundle {
    /// `target` special actions left for the caller, in sub-attack order.
    pub fn deferred_actions(&self) -> impl Iterator<Item = &PendingAction> {
        self.sub_attacks.iter().flat_map(|b| b.deferred_actions.iter())
    }

    pub fn total_damage(&self) -> i64 {
        self.sub_attacks
            .iter()
            .flat_map(|b| b.damage.iter())
            .map(|d| d.total)
            .sum()
    }
}

pub struct Engine {
    store: ActorStore,
    config: EngineConfig,
    roller: Mutex<Box<dyn DiceRoller>>,
}

impl Engine {
    pub fn new(store: ActorStore, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            roller: Mutex::new(Box::new(ThreadRoller)),
        }
    }

    pub fn with_roller(mut self, roller: impl DiceRoller + 'static) -> Self {
        self.roller = Mutex::new(Box::new(roller));
        self
    }

    pub fn store(&self) -> &ActorStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Invoke `entity_id` on behalf of `user`.
    pub async fn invoke(
        &self,
        user: &User,
        actor_id: ActorId,
        entity_id: EntityId,
        prompt: &dyn OptionsPrompt,
    ) -> Result<ResolutionBundle, EngineError> {
        let snapshot = self.store.get(actor_id).await?;
        let entity = snapshot
            .entity(entity_id)
            .cloned()
            .ok_or(EngineError::EntityNotFound(entity_id))?;
        let mut phase = PhaseLog::new(&entity.name);

        phase.advance(Phase::Validating);
        validate(user, &snapshot, &entity).map_err(|e| phase.abort(e))?;

        let request = OptionsRequest::build(&snapshot, &entity);
        let Some(mut options) = prompt.choose(&request).await else {
            debug!(entity = %entity.name, "invocation cancelled at prompt");
            return Err(phase.abort(EngineError::UserCancelled));
        };
        options.use_amount = options.use_amount.max(1);
        let ammo = check_options(&snapshot, &entity, &options, &self.config)
            .map_err(|e| phase.abort(e))?
            .cloned();

        let mut ctx = RollContext::from(snapshot.roll_data()).with_max_depth(self.config.max_formula_depth);
        ctx.set("item", entity.roll_data());
        if let Some(book) = entity.spell.as_ref().and_then(|s| snapshot.spellbooks.get(&s.spellbook)) {
            ctx.set("cl", book.caster_level);
        }
        ctx.set("useAmount", options.use_amount);
        ctx.set(
            "weaponHands",
            if options.two_weapon == TwoWeaponMode::TwoHanded { 2 } else { 1 },
        );
        let (mut parts, transient_labels) = transient_parts(&entity, &options, ammo.as_ref(), &mut ctx);

        let aggregation = modifiers::aggregate(&snapshot, &entity, &options, &mut ctx)
            .map_err(|e| phase.abort(EngineError::formula(e)))?;
        feat_damage(&entity, &ctx, &mut parts);
        parts.special_actions = aggregation.special_actions.clone();
        phase.advance(Phase::ContextBuilt);

        let sequence = sequencer::sequence(&snapshot, &entity, &options, &self.config, &mut ctx)
            .map_err(|e| phase.abort(EngineError::formula(e)))?;
        phase.advance(Phase::Sequenced);

        let mut roller = self.roller.lock().await;
        let resolver = Resolver {
            actor: &snapshot,
            entity: &entity,
            options: &options,
            config: &self.config,
            sequence: &sequence,
            parts: &parts,
        };
        let mut sub_attacks = Vec::with_capacity(sequence.descriptors.len());
        for descriptor in &sequence.descriptors {
            phase.advance(Phase::Resolving(descriptor.index));
            match resolver.resolve(descriptor, &mut ctx, &mut **roller) {
                Ok(bundle) => sub_attacks.push(bundle),
                Err(error) => {
                    warn!(entity = %entity.name, index = descriptor.index, %error, "sub-attack failed");
                    return Err(phase.abort(EngineError::Formula {
                        error,
                        completed: sub_attacks,
                    }));
                }
            }
        }

        phase.advance(Phase::Consuming);
        let attack_rolls = sub_attacks.iter().filter(|b| b.attack.is_some()).count() as i64;
        let arrows = i64::from(options.manyshot_count().max(1));
        let self_actions: Vec<PendingAction> = sub_attacks
            .iter()
            .flat_map(|b| b.self_actions.iter().cloned())
            .collect();
        let use_amount = options.use_amount;
        let committed = self
            .store
            .transaction(actor_id, |current| {
                let entity_now = current
                    .entity(entity_id)
                    .ok_or(EngineError::EntityNotFound(entity_id))?;
                let name = entity_now.name.clone();
                let mut commit = ResourceCommit::new();
                if entity_now.uses.auto_deduct || !entity_now.has_action() {
                    commit.push(
                        resources::target(current, entity_now),
                        -resources::cost(entity_now) * use_amount,
                        name.clone(),
                    );
                }
                if let Some(ammo) = ammo.as_ref().filter(|_| !entity_now.returning) {
                    commit.push(
                        ResourceTarget::Quantity { entity: ammo.id },
                        -attack_rolls * arrows,
                        ammo.name.clone(),
                    );
                }
                for charge in &aggregation.charges {
                    commit.push(charge.target.clone(), -charge.amount, charge.name.clone());
                }
                if let Err(pool) = commit.check(current) {
                    return Err(EngineError::ResourceExhausted { entity: name, pool });
                }
                commit.apply(current);

                let mut applied = Vec::with_capacity(self_actions.len());
                for pending in &self_actions {
                    let mut working = current.clone();
                    match pending.clause.directive.apply(&mut working, &ctx, &mut **roller) {
                        Ok(result) => {
                            *current = working;
                            applied.push(result);
                        }
                        Err(err) => {
                            warn!(source = %pending.source, action = %pending.action, error = %err, "special action failed");
                            applied.push(AppliedAction::Skipped {
                                reason: err.to_string(),
                            });
                        }
                    }
                }
                Ok((commit.deltas, applied))
            })
            .await;
        let (deltas, applied_actions) = committed.map_err(|e| phase.abort(e))?;
        if !deltas.is_empty() {
            info!(
                actor = %snapshot.name,
                entity = %entity.name,
                deltas = ?deltas.iter().map(|d| (d.reason.as_str(), d.applied)).collect::<Vec<_>>(),
                "resources committed"
            );
        }
        phase.advance(Phase::Done);

        let attack_notes = entity
            .attack_notes
            .iter()
            .cloned()
            .chain(snapshot.context_notes("attacks.attack"))
            .chain(ammo.iter().flat_map(|a| a.attack_notes.iter().cloned()))
            .flat_map(|note| note.lines().map(str::to_string).collect::<Vec<_>>())
            .filter(|line| !line.trim().is_empty())
            .map(|line| ctx.fill_template(&line))
            .collect();
        let mut labels = aggregation.labels;
        labels.extend(transient_labels);
        labels.extend(sequence.labels);

        Ok(ResolutionBundle {
            actor: snapshot.name.clone(),
            entity: entity.name.clone(),
            entity_id,
            full_attack: options.full_attack,
            sub_attacks,
            attack_notes,
            labels,
            replace_conflicts: aggregation.replace_conflicts,
            applied_actions,
            deltas,
        })
    }
}

fn validate(user: &User, actor: &Actor, entity: &ActionableEntity) -> Result<(), EngineError> {
    if !actor.can_edit(user) {
        return Err(EngineError::PermissionDenied {
            user: user.name.clone(),
            actor: actor.name.clone(),
        });
    }
    if entity.quantity.is_some_and(|q| q <= 0) {
        return Err(EngineError::ResourceExhausted {
            entity: entity.name.clone(),
            pool: ResourceTarget::Quantity { entity: entity.id },
        });
    }
    if !resources::can_afford(actor, entity, 1) {
        return Err(EngineError::ResourceExhausted {
            entity: entity.name.clone(),
            pool: resources::target(actor, entity),
        });
    }
    Ok(())
}

fn needs_ammunition(entity: &ActionableEntity) -> bool {
    entity.kind == EntityKind::Weapon
        && entity.attack_kind == AttackKind::Weapon
        && entity.action == ActionClass::RangedWeapon
        && !entity.returning
}

fn check_options<'a>(
    actor: &'a Actor,
    entity: &ActionableEntity,
    options: &InvocationOptions,
    config: &EngineConfig,
) -> Result<Option<&'a ActionableEntity>, EngineError> {
    if options.use_amount > 1 && !resources::can_afford(actor, entity, options.use_amount) {
        return Err(EngineError::ResourceExhausted {
            entity: entity.name.clone(),
            pool: resources::target(actor, entity),
        });
    }
    match options.ammunition {
        Some(id) => actor
            .entity(id)
            .filter(|a| a.kind == EntityKind::Ammunition && a.quantity.unwrap_or(0) > 0)
            .map(Some)
            .ok_or_else(|| EngineError::AmmunitionNotFound(entity.name.clone())),
        None if needs_ammunition(entity) && !config.allow_no_ammo => {
            Err(EngineError::AmmunitionNotFound(entity.name.clone()))
        }
        None => Ok(None),
    }
}

/// Attack and damage parts chosen for this invocation alone.
fn transient_parts(
    entity: &ActionableEntity,
    options: &InvocationOptions,
    ammo: Option<&ActionableEntity>,
    ctx: &mut RollContext,
) -> (InvocationParts, Vec<String>) {
    let mut parts = InvocationParts::default();
    let mut labels = Vec::new();
    let filled = |s: &Option<String>| s.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);

    if let Some(bonus) = filled(&options.attack_bonus) {
        parts.attack_parts.push(bonus);
    }
    parts.damage_bonus = filled(&options.damage_bonus);

    if entity.has_attack() {
        if let Some(amount) = options.power_attack.filter(|n| *n > 0) {
            ctx.set("powerAttackBonus", amount);
            ctx.set("powerAttackPenalty", -amount);
            parts.attack_parts.push("@powerAttackPenalty".to_string());
            if entity.has_damage() {
                parts.damage_parts.push(ExtraDamage::new(
                    "floor(@powerAttackBonus * @weaponHands) * @critMult",
                    "Power Attack",
                    None,
                ));
            }
            labels.push(format!("Power Attack {amount}"));
        }
        for (key, bonus, label) in options.situational.active() {
            ctx.set(key, bonus);
            parts.attack_parts.push(format!("@{key}"));
            labels.push(label.to_string());
        }
        if options.non_lethal.is_some_and(|n| n != entity.non_lethal) {
            ctx.set("nonLethalPenalty", -4);
            parts.attack_parts.push("@nonLethalPenalty".to_string());
            labels.push("Non-lethal".to_string());
        }
    }

    if let Some(ammo) = ammo {
        if let Some(bonus) = filled(&ammo.attack_bonus) {
            parts.attack_parts.push(bonus);
        }
        for part in &ammo.damage {
            parts.damage_parts.push(ExtraDamage::new(
                part.formula.clone(),
                ammo.name.clone(),
                Some(part.damage_type.clone()),
            ));
        }
        labels.push(ammo.name.clone());
    }
    (parts, labels)
}

/// Damage parts derived from aggregated feat variables.
fn feat_damage(entity: &ActionableEntity, ctx: &RollContext, parts: &mut InvocationParts) {
    if !entity.has_damage() {
        return;
    }
    if nonzero(ctx, "featDamageBonus") {
        parts
            .damage_parts
            .push(ExtraDamage::new("@critMult * (@featDamageBonus)", "Feats", None));
    }
    if nonzero(ctx, "featDamagePrecision") {
        parts.damage_parts.push(ExtraDamage::new(
            "@featDamagePrecision",
            "Precision",
            Some("precision".to_string()),
        ));
    }
    if let Some(Value::Object(typed)) = ctx.get("featDamage") {
        for damage_type in typed.keys() {
            let path = format!("featDamage.{damage_type}");
            if nonzero(ctx, &path) {
                parts.damage_parts.push(ExtraDamage::new(
                    format!("@{path}"),
                    damage_type.clone(),
                    Some(damage_type.clone()),
                ));
            }
        }
    }
}
