//! Roster persistence for save/load functionality.
//!
//! Saves every actor in a store, with their entities and pool states, as
//! human-readable JSON.

use crate::actor::Actor;
use crate::store::ActorStore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

/// Current save file version.
const SAVE_VERSION: u32 = 1;

/// A saved roster of actors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedRoster {
    /// Save format version for compatibility checking.
    pub version: u32,

    /// When the save was created (seconds since the epoch).
    pub saved_at: String,

    pub actors: Vec<Actor>,

    pub metadata: RosterMetadata,
}

/// Summary readable without loading the actors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterMetadata {
    pub name: String,
    pub actor_names: Vec<String>,
    pub entity_count: usize,
}

impl SavedRoster {
    pub fn new(name: impl Into<String>, actors: Vec<Actor>) -> Self {
        let metadata = RosterMetadata {
            name: name.into(),
            actor_names: actors.iter().map(|a| a.name.clone()).collect(),
            entity_count: actors.iter().map(|a| a.entities.len()).sum(),
        };
        Self {
            version: SAVE_VERSION,
            saved_at: chrono_now(),
            actors,
            metadata,
        }
    }

    /// Snapshot every actor in `store`.
    pub async fn from_store(name: impl Into<String>, store: &ActorStore) -> Self {
        Self::new(name, store.roster().await)
    }

    /// Replace the contents of `store` with this roster.
    pub async fn restore(self, store: &ActorStore) {
        store.replace_all(self.actors).await;
    }

    /// Save to a JSON file.
    pub async fn save_json(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Load from a JSON file.
    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let content = fs::read_to_string(path).await?;
        let saved: Self = serde_json::from_str(&content)?;

        if saved.version != SAVE_VERSION {
            return Err(PersistError::VersionMismatch {
                expected: SAVE_VERSION,
                found: saved.version,
            });
        }

        Ok(saved)
    }

    /// Read a save's metadata without deserializing its actors.
    pub async fn peek_metadata(path: impl AsRef<Path>) -> Result<RosterMetadata, PersistError> {
        let content = fs::read_to_string(path).await?;

        #[derive(Deserialize)]
        struct Partial {
            version: u32,
            metadata: RosterMetadata,
        }

        let partial: Partial = serde_json::from_str(&content)?;

        if partial.version != SAVE_VERSION {
            return Err(PersistError::VersionMismatch {
                expected: SAVE_VERSION,
                found: partial.version,
            });
        }

        Ok(partial.metadata)
    }
}

/// Information about a save file.
#[derive(Debug, Clone)]
pub struct SaveInfo {
    pub path: PathBuf,
    pub metadata: RosterMetadata,
}

/// List readable roster saves in a directory, sorted by roster name.
pub async fn list_saves(dir: impl AsRef<Path>) -> Result<Vec<SaveInfo>, PersistError> {
    let mut saves = Vec::new();
    let mut entries = fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "json") {
            if let Ok(metadata) = SavedRoster::peek_metadata(&path).await {
                saves.push(SaveInfo { path, metadata });
            }
        }
    }

    saves.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
    Ok(saves)
}

/// Save path for a roster name, with unsafe characters replaced.
pub fn roster_save_path(dir: impl AsRef<Path>, name: &str) -> PathBuf {
    let sanitized = name
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>();
    dir.as_ref().join(format!("{sanitized}.json"))
}

fn chrono_now() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", now.as_secs())
}
