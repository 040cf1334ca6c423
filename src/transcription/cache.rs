//! # Model Cache
//!
//! Process-wide cache of loaded models keyed by model name and compute device.
//!
//! ## Guarantees:
//! - A key is loaded at most once, even when many jobs ask for it concurrently
//! - Different keys load in parallel; only same-key callers wait on each other
//! - Entries live for the life of the process (no eviction)
//!
//! Loads are blocking, so callers are expected to run on a blocking thread.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Identity of a cached model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ModelKey {
    pub model: String,
    pub device: String,
}

impl ModelKey {
    pub fn new(model: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            device: device.into(),
        }
    }
}

/// A loaded model; decoding needs `&mut`, so access is serialized per model.
pub type SharedModel<M> = Arc<Mutex<M>>;

type Slot<M> = Arc<Mutex<Option<SharedModel<M>>>>;

pub struct ModelCache<M> {
    slots: RwLock<HashMap<ModelKey, Slot<M>>>,
}

impl<M> Default for ModelCache<M> {
    fn default() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }
}

impl<M> ModelCache<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached model for `key`, running `load` if it is absent.
    ///
    /// ## Concurrency:
    /// The outer map lock is held only long enough to find or create the slot.
    /// The slot's own mutex is held across `load`, so a second caller for the same
    /// key blocks and then sees the loaded model instead of loading it again.
    /// A failed load leaves the slot empty and the next caller retries.
    pub fn get_or_load<E, F>(&self, key: &ModelKey, load: F) -> Result<SharedModel<M>, E>
    where
        F: FnOnce() -> Result<M, E>,
    {
        let slot = self.slot(key);
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(model) = guard.as_ref() {
            return Ok(model.clone());
        }

        tracing::info!(model = %key.model, device = %key.device, "Loading model into cache");
        let model = Arc::new(Mutex::new(load()?));
        *guard = Some(model.clone());
        Ok(model)
    }

    fn slot(&self, key: &ModelKey) -> Slot<M> {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return slot.clone();
        }

        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Whether `key` holds a loaded model. A load in progress counts as not loaded.
    pub fn is_loaded(&self, key: &ModelKey) -> bool {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots
            .get(key)
            .and_then(|slot| slot.try_lock().ok().map(|guard| guard.is_some()))
            .unwrap_or(false)
    }

    /// Keys with a loaded model.
    pub fn loaded_keys(&self) -> Vec<ModelKey> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots
            .iter()
            .filter(|(_, slot)| {
                slot.try_lock()
                    .map(|guard| guard.is_some())
                    .unwrap_or(false)
            })
            .map(|(key, _)| key.clone())
            .collect()
    }
}
