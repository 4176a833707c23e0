//! Shared, lock-guarded actor state.
//!
//! Invocations read snapshots and write back through [`ActorStore::transaction`],
//! which works on a copy of the authoritative actor and only replaces it when
//! the closure succeeds.

use crate::actor::{Actor, ActorId};
use crate::entity::EntityId;
use crate::resources::{self, RestPeriod};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("Unknown actor: {0}")]
    UnknownActor(ActorId),
}

#[derive(Debug, Clone, Default)]
pub struct ActorStore {
    actors: Arc<RwLock<HashMap<ActorId, Actor>>>,
}

impl ActorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_actors(actors: impl IntoIterator<Item = Actor>) -> Self {
        Self {
            actors: Arc::new(RwLock::new(actors.into_iter().map(|a| (a.id, a)).collect())),
        }
    }

    pub async fn insert(&self, actor: Actor) -> ActorId {
        let id = actor.id;
        self.actors.write().await.insert(id, actor);
        id
    }

    pub async fn remove(&self, id: ActorId) -> Option<Actor> {
        self.actors.write().await.remove(&id)
    }

    /// A snapshot of the actor as it is now.
    pub async fn get(&self, id: ActorId) -> Result<Actor, StoreError> {
        self.actors
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::UnknownActor(id))
    }

    pub async fn find_by_name(&self, name: &str) -> Option<ActorId> {
        self.actors
            .read()
            .await
            .values()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .map(|a| a.id)
    }

    /// Every actor, ordered by name.
    pub async fn roster(&self) -> Vec<Actor> {
        let mut actors: Vec<Actor> = self.actors.read().await.values().cloned().collect();
        actors.sort_by(|a, b| a.name.cmp(&b.name));
        actors
    }

    pub async fn replace_all(&self, actors: Vec<Actor>) {
        let mut guard = self.actors.write().await;
        guard.clear();
        guard.extend(actors.into_iter().map(|a| (a.id, a)));
    }

    pub async fn len(&self) -> usize {
        self.actors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.actors.read().await.is_empty()
    }

    /// Run `f` against the authoritative actor under the write lock.
    ///
    /// `f` sees a working copy; the stored actor is replaced only when `f`
    /// returns `Ok`, so a failed transaction leaves no trace.
    pub async fn transaction<T, E>(&self, id: ActorId, f: impl FnOnce(&mut Actor) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut guard = self.actors.write().await;
        let stored = guard.get_mut(&id).ok_or(StoreError::UnknownActor(id))?;
        let mut working = stored.clone();
        let value = f(&mut working)?;
        *stored = working;
        Ok(value)
    }

    /// Return `delta` uses to an entity's pool. Returns the units restored.
    pub async fn recharge(&self, id: ActorId, entity: EntityId, delta: i64) -> Result<i64, StoreError> {
        self.transaction(id, |actor| Ok(resources::recharge(actor, entity, delta)))
            .await
    }

    /// Refill every pool that resets within `period`.
    pub async fn rest(&self, id: ActorId, period: RestPeriod) -> Result<usize, StoreError> {
        self.transaction(id, |actor| Ok(resources::refresh(actor, period)))
            .await
    }
}
