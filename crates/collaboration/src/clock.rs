/// Logical clocks for ordering and causality of document operations
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::UserId;

/// Lamport timestamp for causality tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LamportClock(pub u64);

impl LamportClock {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn tick(&mut self) -> Self {
        self.0 += 1;
        *self
    }

    pub fn update(&mut self, other: LamportClock) -> Self {
        self.0 = self.0.max(other.0) + 1;
        *self
    }
}

impl Default for LamportClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-author count of operations applied to a document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    clocks: HashMap<UserId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, user_id: UserId) {
        *self.clocks.entry(user_id).or_insert(0) += 1;
    }

    pub fn get(&self, user_id: UserId) -> u64 {
        self.clocks.get(&user_id).copied().unwrap_or(0)
    }

    /// Pointwise maximum
    pub fn merge(&mut self, other: &VectorClock) {
        for (user_id, &count) in &other.clocks {
            let current = self.clocks.entry(*user_id).or_insert(0);
            *current = (*current).max(count);
        }
    }

    /// Sum over all authors
    pub fn total(&self) -> u64 {
        self.clocks.values().sum()
    }

    pub fn happened_before(&self, other: &VectorClock) -> bool {
        let (less, greater) = self.compare(other);
        less && !greater
    }

    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        let (less, greater) = self.compare(other);
        less && greater
    }

    /// (some entry is smaller, some entry is larger) than in `other`
    fn compare(&self, other: &VectorClock) -> (bool, bool) {
        let users: HashSet<_> = self.clocks.keys().chain(other.clocks.keys()).collect();

        let mut less = false;
        let mut greater = false;
        for user_id in users {
            let mine = self.get(*user_id);
            let theirs = other.get(*user_id);
            less |= mine < theirs;
            greater |= mine > theirs;
        }
        (less, greater)
    }
}
