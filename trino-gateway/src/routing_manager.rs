//! Turns a routing-group selection into a concrete backend and owns the
//! query-id → backend pinning contract.

use std::sync::Arc;

use snafu::{OptionExt, Snafu};
use tracing::{debug, instrument};
use trino_gateway_core::{RoutingGroupName, TrinoQueryId, NO_MATCH_ROUTING_GROUP};
use trino_gateway_state::QueryBindings;

use crate::backend_manager::{Backend, BackendManager};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display(
        "No routable backend available, neither in routing group {group:?} nor in the \
         default group {default_group:?}"
    ))]
    NoBackendAvailable {
        group: RoutingGroupName,
        default_group: RoutingGroupName,
    },

    #[snafu(display("Query {query_id:?} not found"))]
    UnknownQuery { query_id: TrinoQueryId },
}

pub struct RoutingManager {
    backends: Arc<BackendManager>,
    bindings: Arc<QueryBindings>,
    default_group: RoutingGroupName,
}

impl RoutingManager {
    pub fn new(
        backends: Arc<BackendManager>,
        bindings: Arc<QueryBindings>,
        default_group: RoutingGroupName,
    ) -> Self {
        Self {
            backends,
            bindings,
            default_group,
        }
    }

    /// The backend a new query goes to: the first routable backend of the
    /// selected group. An unknown, empty or `no-match` selection falls back
    /// to the default group; an empty default group fails.
    #[instrument(skip(self))]
    pub fn pick(&self, group: Option<&str>) -> Result<Arc<Backend>, Error> {
        let requested = group.filter(|group| !group.is_empty() && *group != NO_MATCH_ROUTING_GROUP);

        if let Some(requested) = requested {
            if let Some(backend) = self.backends.list_by_group(requested).into_iter().next() {
                return Ok(backend);
            }
            debug!(
                group = requested,
                "Routing group unknown or without routable backend, falling back to the \
                 default group"
            );
        }

        self.backends
            .list_by_group(&self.default_group)
            .into_iter()
            .next()
            .context(NoBackendAvailableSnafu {
                group: requested.unwrap_or(&self.default_group),
                default_group: &self.default_group,
            })
    }

    /// The backend a follow-up request must go to. Health is deliberately not
    /// consulted: forwarding to an unhealthy backend lets the client observe
    /// the true Trino error.
    #[instrument(skip(self))]
    pub fn resolve(&self, query_id: &str) -> Result<Arc<Backend>, Error> {
        let backend_name = self
            .bindings
            .resolve(query_id)
            .context(UnknownQuerySnafu { query_id })?;

        // The backend may have been removed from the pool since the query was
        // bound; the query is gone with it.
        self.backends
            .get(&backend_name)
            .context(UnknownQuerySnafu { query_id })
    }

    /// Records which backend answered the initial statement POST. Conflicts
    /// keep the existing binding (logged by the binding store).
    #[instrument(skip(self))]
    pub fn bind(&self, query_id: &str, backend_name: &str) {
        self.bindings.bind(query_id, backend_name);
    }

    /// The query reported a terminal state; the binding survives a grace
    /// window and is then swept.
    #[instrument(skip(self))]
    pub fn mark_terminal(&self, query_id: &str) {
        self.bindings.mark_terminal(query_id);
    }

    pub fn default_group(&self) -> &str {
        &self.default_group
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend_manager::tests::{backend_config, reachable};

    fn routing_manager(manager: BackendManager) -> RoutingManager {
        RoutingManager::new(
            Arc::new(manager),
            Arc::new(QueryBindings::new(
                Duration::from_secs(3600),
                Duration::from_secs(15),
            )),
            "adhoc".to_string(),
        )
    }

    fn two_group_manager() -> BackendManager {
        let manager = BackendManager::new(&[
            backend_config("trino-1", "adhoc"),
            backend_config("trino-2", "etl"),
        ]);
        manager.get("trino-1").unwrap().record_probe(reachable(0));
        manager.get("trino-2").unwrap().record_probe(reachable(0));
        manager
    }

    const QUERY_ID: &str = "20240101_000000_00001_abcde";

    #[test]
    fn test_pick_selected_group() {
        let routing = routing_manager(two_group_manager());
        assert_eq!(routing.pick(Some("etl")).unwrap().name, "trino-2");
    }

    #[test]
    fn test_pick_falls_back_to_default_group() {
        let routing = routing_manager(two_group_manager());

        // None, empty, no-match and unknown group all land in "adhoc".
        assert_eq!(routing.pick(None).unwrap().name, "trino-1");
        assert_eq!(routing.pick(Some("")).unwrap().name, "trino-1");
        assert_eq!(routing.pick(Some("no-match")).unwrap().name, "trino-1");
        assert_eq!(routing.pick(Some("does-not-exist")).unwrap().name, "trino-1");
    }

    #[test]
    fn test_pick_fails_when_default_group_is_empty() {
        let manager = BackendManager::new(&[backend_config("trino-2", "etl")]);
        manager.get("trino-2").unwrap().record_probe(reachable(0));
        let routing = routing_manager(manager);

        assert!(matches!(
            routing.pick(Some("does-not-exist")),
            Err(Error::NoBackendAvailable { .. })
        ));
        assert!(matches!(
            routing.pick(None),
            Err(Error::NoBackendAvailable { .. })
        ));
    }

    #[test]
    fn test_pick_prefers_emptiest_backend() {
        let manager = BackendManager::new(&[
            backend_config("trino-1", "adhoc"),
            backend_config("trino-2", "adhoc"),
        ]);
        manager.get("trino-1").unwrap().record_probe(reachable(7));
        manager.get("trino-2").unwrap().record_probe(reachable(1));
        let routing = routing_manager(manager);

        assert_eq!(routing.pick(None).unwrap().name, "trino-2");
    }

    #[test]
    fn test_resolve_requires_binding() {
        let routing = routing_manager(two_group_manager());

        assert!(matches!(
            routing.resolve(QUERY_ID),
            Err(Error::UnknownQuery { .. })
        ));

        routing.bind(QUERY_ID, "trino-1");
        assert_eq!(routing.resolve(QUERY_ID).unwrap().name, "trino-1");
    }

    #[test]
    fn test_resolve_ignores_health() {
        let manager = two_group_manager();
        let unreachable = crate::backend_manager::HealthSnapshot {
            reachable: false,
            queued_queries: 0,
            probed_at: std::time::SystemTime::now(),
        };
        let routing = routing_manager(manager);

        routing.bind(QUERY_ID, "trino-1");
        routing
            .backends
            .get("trino-1")
            .unwrap()
            .record_probe(unreachable);

        // The binding still resolves so the client sees the real Trino error.
        assert_eq!(routing.resolve(QUERY_ID).unwrap().name, "trino-1");
    }

    #[test]
    fn test_resolve_fails_for_removed_backend() {
        let routing = routing_manager(two_group_manager());

        routing.bind(QUERY_ID, "trino-1");
        routing.backends.remove("trino-1").unwrap();

        assert!(matches!(
            routing.resolve(QUERY_ID),
            Err(Error::UnknownQuery { .. })
        ));
    }

    #[test]
    fn test_binding_is_pinned_despite_conflicting_bind() {
        let routing = routing_manager(two_group_manager());

        routing.bind(QUERY_ID, "trino-1");
        routing.bind(QUERY_ID, "trino-2");

        assert_eq!(routing.resolve(QUERY_ID).unwrap().name, "trino-1");
    }
}
