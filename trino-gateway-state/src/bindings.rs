//! The query-id → backend map that makes follow-up pinning work.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use dashmap::{mapref::entry::Entry, DashMap};
use tracing::{debug, instrument, warn};
use trino_gateway_core::{BackendName, TrinoQueryId};

/// Sharded concurrent map from Trino query id to the backend that runs the
/// query. Bindings are write-once: a conflicting `bind` keeps the existing
/// entry. Lookups refresh the idle clock; a terminal response arms a grace
/// deadline after which the sweeper removes the entry.
pub struct QueryBindings {
    bindings: DashMap<TrinoQueryId, Binding>,
    ttl: Duration,
    terminal_grace: Duration,
}

struct Binding {
    backend: BackendName,

    /// Millis since the epoch of the last resolve (or the bind itself).
    last_accessed: AtomicU64,

    /// Millis since the epoch after which the entry may be swept regardless
    /// of activity. Zero while the query has not reached a terminal state.
    evict_after: AtomicU64,
}

#[derive(Debug, Eq, PartialEq)]
pub enum BindOutcome {
    Bound,
    /// The identical mapping already existed; `bind` is idempotent.
    AlreadyBound,
    /// A different backend was already bound. The existing binding wins.
    Conflicting { existing: BackendName },
}

impl QueryBindings {
    pub fn new(ttl: Duration, terminal_grace: Duration) -> Self {
        Self {
            bindings: DashMap::new(),
            ttl,
            terminal_grace,
        }
    }

    /// Insert-if-absent. A bind for an id that is already bound to a
    /// *different* backend indicates a bug elsewhere; it is logged and the
    /// existing binding is kept.
    #[instrument(skip(self))]
    pub fn bind(&self, query_id: &str, backend: &str) -> BindOutcome {
        match self.bindings.entry(query_id.to_string()) {
            Entry::Vacant(entry) => {
                let now = epoch_millis(SystemTime::now());
                entry.insert(Binding {
                    backend: backend.to_string(),
                    last_accessed: AtomicU64::new(now),
                    evict_after: AtomicU64::new(0),
                });
                BindOutcome::Bound
            }
            Entry::Occupied(entry) => {
                let existing = &entry.get().backend;
                if existing == backend {
                    BindOutcome::AlreadyBound
                } else {
                    warn!(
                        query_id,
                        existing,
                        requested = backend,
                        "Refusing to re-bind query to a different backend"
                    );
                    BindOutcome::Conflicting {
                        existing: existing.clone(),
                    }
                }
            }
        }
    }

    /// Looks the binding up and refreshes its idle clock.
    #[instrument(skip(self))]
    pub fn resolve(&self, query_id: &str) -> Option<BackendName> {
        let binding = self.bindings.get(query_id)?;
        binding
            .last_accessed
            .store(epoch_millis(SystemTime::now()), Ordering::Relaxed);
        Some(binding.backend.clone())
    }

    #[instrument(skip(self))]
    pub fn evict(&self, query_id: &str) -> bool {
        self.bindings.remove(query_id).is_some()
    }

    /// Arms the grace deadline once the query reported a terminal state, so
    /// clients can still fetch final results before the entry goes away.
    #[instrument(skip(self))]
    pub fn mark_terminal(&self, query_id: &str) {
        if let Some(binding) = self.bindings.get(query_id) {
            let deadline = epoch_millis(SystemTime::now() + self.terminal_grace);
            binding.evict_after.store(deadline, Ordering::Relaxed);
            debug!(query_id, "Query reached terminal state, binding eviction armed");
        }
    }

    /// Removes idle and grace-expired bindings. `retain` locks one shard at a
    /// time, so routing traffic on other shards is never blocked. Returns the
    /// number of removed bindings.
    #[instrument(skip(self))]
    pub fn sweep(&self, now: SystemTime) -> u64 {
        let now = epoch_millis(now);
        // Safety: a TTL measured in millis always fits an u64
        let ttl = self.ttl.as_millis() as u64;

        let mut removed = 0;
        self.bindings.retain(|_, binding| {
            let evict_after = binding.evict_after.load(Ordering::Relaxed);
            let grace_expired = evict_after != 0 && evict_after <= now;
            let idle = binding
                .last_accessed
                .load(Ordering::Relaxed)
                .saturating_add(ttl)
                <= now;

            if grace_expired || idle {
                removed += 1;
                false
            } else {
                true
            }
        });

        removed
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUERY_ID: &str = "20240101_000000_00001_abcde";

    fn bindings() -> QueryBindings {
        QueryBindings::new(Duration::from_secs(3600), Duration::from_secs(15))
    }

    #[test]
    fn test_bind_and_resolve() {
        let bindings = bindings();

        assert_eq!(bindings.resolve(QUERY_ID), None);
        assert_eq!(bindings.bind(QUERY_ID, "trino-1"), BindOutcome::Bound);
        assert_eq!(bindings.resolve(QUERY_ID).as_deref(), Some("trino-1"));
    }

    #[test]
    fn test_bind_is_write_once() {
        let bindings = bindings();

        assert_eq!(bindings.bind(QUERY_ID, "trino-1"), BindOutcome::Bound);
        assert_eq!(bindings.bind(QUERY_ID, "trino-1"), BindOutcome::AlreadyBound);
        assert_eq!(
            bindings.bind(QUERY_ID, "trino-2"),
            BindOutcome::Conflicting {
                existing: "trino-1".to_string()
            }
        );

        // The original binding survives the conflicting attempt.
        assert_eq!(bindings.resolve(QUERY_ID).as_deref(), Some("trino-1"));
    }

    #[test]
    fn test_evict() {
        let bindings = bindings();
        bindings.bind(QUERY_ID, "trino-1");

        assert!(bindings.evict(QUERY_ID));
        assert!(!bindings.evict(QUERY_ID));
        assert_eq!(bindings.resolve(QUERY_ID), None);
    }

    #[test]
    fn test_sweep_removes_idle_bindings() {
        let bindings = bindings();
        bindings.bind(QUERY_ID, "trino-1");

        assert_eq!(bindings.sweep(SystemTime::now()), 0);
        assert_eq!(
            bindings.sweep(SystemTime::now() + Duration::from_secs(3601)),
            1
        );
        assert!(bindings.is_empty());
    }

    #[test]
    fn test_sweep_respects_terminal_grace() {
        let bindings = bindings();
        bindings.bind(QUERY_ID, "trino-1");
        bindings.mark_terminal(QUERY_ID);

        // Within the grace window the binding stays resolvable.
        assert_eq!(bindings.sweep(SystemTime::now()), 0);
        assert_eq!(bindings.resolve(QUERY_ID).as_deref(), Some("trino-1"));

        // Once the grace window passed the binding goes away, long before the
        // idle TTL would have hit.
        assert_eq!(
            bindings.sweep(SystemTime::now() + Duration::from_secs(16)),
            1
        );
        assert_eq!(bindings.resolve(QUERY_ID), None);
    }

    #[test]
    fn test_sweep_only_removes_expired() {
        let bindings = bindings();
        bindings.bind(QUERY_ID, "trino-1");
        bindings.bind("20240101_000000_00002_fghij", "trino-2");
        bindings.mark_terminal(QUERY_ID);

        assert_eq!(
            bindings.sweep(SystemTime::now() + Duration::from_secs(16)),
            1
        );
        assert_eq!(
            bindings
                .resolve("20240101_000000_00002_fghij")
                .as_deref(),
            Some("trino-2")
        );
    }
}
