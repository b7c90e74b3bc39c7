use std::collections::BTreeMap;

use crate::{CancelSlot, LifecycleError, Stream, Teardown};

/// Registry entry of one live stream binding.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub id: String,
    /// Distinguishes successive instances registered under the same id.
    pub generation: u64,
    /// The stream as the user bound it.
    pub source: Stream,
    /// The gated, multicast wrapper that is actually running.
    pub live: Stream,
    pub cancel: CancelSlot,
    pub teardown: Teardown,
}

/// Table of live stream bindings. Holds at most one entry per id.
///
/// Every method is a single synchronous operation; callers never keep a
/// borrow of the registry across a call into a stream or sink.
#[derive(Debug, Default)]
pub struct Registry {
    entries: BTreeMap<String, RegistryEntry>,
    next_generation: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub fn insert(&mut self, entry: RegistryEntry) -> Result<(), LifecycleError> {
        if self.entries.contains_key(&entry.id) {
            return Err(LifecycleError::AlreadyActive(entry.id));
        }
        self.entries.insert(entry.id.clone(), entry);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&RegistryEntry> {
        self.entries.get(id)
    }

    /// Removes the entry for `id` only if it is still the given instance.
    pub fn remove_if_current(&mut self, id: &str, generation: u64) -> Option<RegistryEntry> {
        match self.entries.get(id) {
            Some(entry) if entry.generation == generation => self.entries.remove(id),
            _ => None,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Id under which `stream` is running, matching either the bound stream
    /// or its live wrapper.
    pub fn find(&self, stream: &Stream) -> Option<&str> {
        self.entries
            .values()
            .find(|entry| entry.source.same(stream) || entry.live.same(stream))
            .map(|entry| entry.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
