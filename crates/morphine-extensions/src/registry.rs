//! Extension registry.
//!
//! The authoritative table of loaded extensions and their lifecycle states.
//! Reads are lock-free; writers for one id serialize on a per-id async lock
//! obtained through [`ExtensionRegistry::lock`].

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{ExtensionError, ExtensionResult};
use crate::extension::{ExtensionId, ExtensionState, ExtensionSummary, LoadedExtension};

/// Table of loaded extensions keyed by id.
#[derive(Default)]
pub struct ExtensionRegistry {
    entries: DashMap<ExtensionId, Arc<LoadedExtension>>,
    states: DashMap<ExtensionId, ExtensionState>,
    locks: DashMap<ExtensionId, Arc<Mutex<()>>>,
}

impl ExtensionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the write lock for `id`. Load, unload and reload of the same
    /// id never interleave while it is held.
    pub async fn lock(&self, id: &ExtensionId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(
            self.locks
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        lock.lock_owned().await
    }

    /// Current state of `id`, if it has ever been seen.
    #[must_use]
    pub fn state(&self, id: &ExtensionId) -> Option<ExtensionState> {
        self.states.get(id).map(|s| s.value().clone())
    }

    /// Move `id` to `next`.
    ///
    /// An id with no recorded state may only enter `Discovered`.
    ///
    /// # Errors
    ///
    /// [`ExtensionError::InvalidTransition`] if the state machine forbids it.
    pub fn transition(&self, id: &ExtensionId, next: ExtensionState) -> ExtensionResult<()> {
        let invalid = |from: &str| ExtensionError::InvalidTransition {
            id: id.clone(),
            from: from.to_owned(),
            to: next.to_string(),
        };
        match self.states.entry(id.clone()) {
            Entry::Vacant(vacant) => {
                if next != ExtensionState::Discovered {
                    return Err(invalid("unknown"));
                }
                debug!(extension_id = %id, to = %next, "State transition");
                vacant.insert(next);
            },
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if !current.can_transition_to(&next) {
                    return Err(invalid(&current.to_string()));
                }
                debug!(extension_id = %id, from = %current, to = %next, "State transition");
                occupied.insert(next);
            },
        }
        Ok(())
    }

    /// Record a successfully initialized extension.
    pub(crate) fn insert(&self, extension: Arc<LoadedExtension>) {
        self.entries.insert(extension.id().clone(), extension);
    }

    /// Drop the entry for `id`, returning it.
    pub(crate) fn remove(&self, id: &ExtensionId) -> Option<Arc<LoadedExtension>> {
        self.entries.remove(id).map(|(_, extension)| extension)
    }

    /// The loaded extension for `id`.
    #[must_use]
    pub fn get(&self, id: &ExtensionId) -> Option<Arc<LoadedExtension>> {
        self.entries.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Whether `id` is loaded and serving requests.
    #[must_use]
    pub fn is_active(&self, id: &ExtensionId) -> bool {
        self.entries.get(id).is_some_and(|e| e.is_active())
            && matches!(self.state(id), Some(ExtensionState::Active))
    }

    /// Whether `id` has a registry entry.
    #[must_use]
    pub fn contains(&self, id: &ExtensionId) -> bool {
        self.entries.contains_key(id)
    }

    /// Ids of loaded extensions, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<ExtensionId> {
        let mut ids: Vec<ExtensionId> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Every known extension, loaded or not, sorted by id.
    #[must_use]
    pub fn list(&self) -> Vec<ExtensionSummary> {
        let mut summaries: Vec<ExtensionSummary> = self
            .states
            .iter()
            .map(|entry| {
                let id = entry.key();
                match self.entries.get(id) {
                    Some(loaded) => {
                        let mut summary = loaded.summary();
                        summary.state = entry.value().clone();
                        summary
                    },
                    None => ExtensionSummary {
                        id: id.clone(),
                        state: entry.value().clone(),
                        name: None,
                        version: None,
                        author: None,
                        prefix: None,
                        routes: 0,
                        loaded_at: None,
                    },
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Number of loaded extensions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no extension is loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("loaded", &self.entries.len())
            .field("known", &self.states.len())
            .finish()
    }
}
