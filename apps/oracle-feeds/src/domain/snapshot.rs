//! Last-Known-Good Snapshot
//!
//! Per-id map of the freshest resolved value seen so far. Errors never
//! overwrite a value and older timestamps never replace newer ones.

use std::collections::HashMap;
use std::hash::Hash;

use super::response::{PriceResult, Response};

/// Counts produced by one [`Snapshot::apply`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Entries inserted or replaced.
    pub updated: usize,
    /// Resolved results dropped because the stored entry was as new or newer.
    pub stale: usize,
    /// Unresolved ids in the response (never applied).
    pub errors: usize,
}

/// Freshest value per id.
#[derive(Debug, Clone)]
pub struct Snapshot<K, V> {
    entries: HashMap<K, PriceResult<V>>,
}

impl<K, V> Default for Snapshot<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K, V> Snapshot<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    /// Create an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one response.
    pub fn apply(&mut self, response: Response<K, V>) -> MergeOutcome {
        let (resolved, unresolved) = response.into_parts();
        let mut outcome = MergeOutcome {
            errors: unresolved.len(),
            ..MergeOutcome::default()
        };

        for (id, incoming) in resolved {
            if self.offer(id, incoming) {
                outcome.updated += 1;
            } else {
                outcome.stale += 1;
            }
        }

        outcome
    }

    /// Store `incoming` if the id is unknown or `incoming` is strictly newer.
    pub fn offer(&mut self, id: K, incoming: PriceResult<V>) -> bool {
        match self.entries.get(&id) {
            Some(current) if !incoming.is_newer_than(current) => false,
            _ => {
                self.entries.insert(id, incoming);
                true
            }
        }
    }

    /// Drop entries whose id is not in `ids`.
    pub fn retain_ids(&mut self, ids: &[K]) {
        self.entries.retain(|id, _| ids.contains(id));
    }

    /// Entry for one id.
    #[must_use]
    pub fn get(&self, id: &K) -> Option<&PriceResult<V>> {
        self.entries.get(id)
    }

    /// Borrow all entries.
    #[must_use]
    pub const fn entries(&self) -> &HashMap<K, PriceResult<V>> {
        &self.entries
    }

    /// Number of ids with a value.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no id has a value yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
