//! Per-run set of routers that already have a job in flight.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use crate::identity::RouterIdentity;

/// Concurrency-safe set of identities seen during one run.
///
/// Built fresh for every run and shared by reference with all jobs.
#[derive(Debug, Default)]
pub struct DedupRegistry {
    seen: Mutex<HashSet<RouterIdentity>>,
}

impl DedupRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `identity` and reports whether it was already marked.
    ///
    /// Test and set happen under one lock acquisition, so exactly one caller
    /// per identity ever sees `false`.
    #[must_use]
    pub fn check_and_mark(&self, identity: &RouterIdentity) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        !seen.insert(identity.clone())
    }

    /// Number of distinct identities marked so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` when nothing has been marked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
