//! d20 action-resolution engine.
//!
//! This crate provides:
//! - A formula evaluator for dice expressions with `@variable` references
//! - Resource pools (charges, stacks, prepared spells, spell slots, power points)
//! - Modifier aggregation from feats, buffs and equipment
//! - Multi-attack sequencing and per-attack resolution with criticals
//! - An engine that validates, resolves and commits one invocation at a time
//!
//! # Quick Start
//!
//! ```ignore
//! use d20_core::{ActorStore, Engine, EngineConfig, InvocationOptions, User};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gm = User::gm("GM");
//!     let fighter = d20_core::testing::sample_fighter("Val");
//!     let (actor, sword) = (fighter.id, fighter.entities[0].id);
//!
//!     let engine = Engine::new(ActorStore::from_actors([fighter]), EngineConfig::default());
//!     let bundle = engine
//!         .invoke(&gm, actor, sword, &InvocationOptions::new().full_attack())
//!         .await?;
//!     println!("{}", serde_json::to_string_pretty(&bundle)?);
//!     Ok(())
//! }
//! ```

pub mod actor;
pub mod catalog;
pub mod config;
pub mod context;
pub mod dice;
pub mod engine;
pub mod entity;
pub mod formula;
pub mod modifiers;
pub mod options;
pub mod persist;
pub mod resolution;
pub mod resources;
pub mod sequencer;
pub mod special;
pub mod store;
pub mod testing;

// Primary public API
pub use actor::{Actor, ActorId, User};
pub use config::{ConfigError, EngineConfig};
pub use context::RollContext;
pub use dice::{DiceRoller, SeededRoller, ThreadRoller};
pub use engine::{AcceptDefaults, Engine, EngineError, OptionsPrompt, ResolutionBundle};
pub use entity::{ActionClass, ActionableEntity, EntityId, EntityKind};
pub use formula::{Formula, FormulaError, Roll};
pub use options::{InvocationOptions, OptionsRequest};
pub use persist::{PersistError, SavedRoster};
pub use resources::{ResourceCommit, RestPeriod};
pub use store::{ActorStore, StoreError};
pub use testing::{ScriptedRoller, TestHarness};
