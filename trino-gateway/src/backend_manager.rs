use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use arc_swap::ArcSwap;
use snafu::{OptionExt, Snafu};
use tracing::{info, instrument};
use trino_gateway_core::{config::BackendConfig, BackendName, RoutingGroupName};
use url::Url;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Unknown backend {backend_name:?}"))]
    BackendNotFound { backend_name: BackendName },
}

/// A Trino coordinator the gateway can route to. The config-shaped fields are
/// immutable; activation and health change at runtime without replacing the
/// entry.
#[derive(Debug)]
pub struct Backend {
    pub name: BackendName,

    /// The URL the backend advertises to clients; response URIs carrying this
    /// prefix get rewritten to the gateway address.
    pub external_url: Url,

    /// The URL the gateway dials.
    pub proxy_url: Url,

    pub group: RoutingGroupName,

    active: AtomicBool,
    health: ArcSwap<HealthSnapshot>,
}

#[derive(Clone, Debug)]
pub struct HealthSnapshot {
    pub reachable: bool,
    pub queued_queries: u64,
    pub probed_at: SystemTime,
}

impl Default for HealthSnapshot {
    /// Before the first probe a backend counts as unreachable; the health
    /// monitor runs its first round immediately on startup.
    fn default() -> Self {
        Self {
            reachable: false,
            queued_queries: 0,
            probed_at: UNIX_EPOCH,
        }
    }
}

impl Backend {
    fn from_config(config: &BackendConfig) -> Self {
        Self {
            name: config.name.clone(),
            external_url: config.external_url.clone(),
            proxy_url: config.proxy_url().clone(),
            group: config.routing_group.clone(),
            active: AtomicBool::new(config.active),
            health: ArcSwap::from_pointee(HealthSnapshot::default()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    /// A backend only receives new queries while it is both administratively
    /// active and known reachable. Existing bindings ignore this.
    pub fn is_routable(&self) -> bool {
        self.is_active() && self.health.load().reachable
    }

    pub fn health(&self) -> Arc<HealthSnapshot> {
        self.health.load_full()
    }

    pub fn record_probe(&self, snapshot: HealthSnapshot) {
        self.health.store(Arc::new(snapshot));
    }
}

/// The authoritative in-memory backend pool. The list is copy-on-write so
/// that every routing decision reads a consistent snapshot without locking;
/// admin mutations swap in a new list.
pub struct BackendManager {
    backends: ArcSwap<Vec<Arc<Backend>>>,
}

impl BackendManager {
    #[instrument(skip_all, fields(backend_count = configs.len()))]
    pub fn new(configs: &[BackendConfig]) -> Self {
        let backends = configs
            .iter()
            .map(|config| Arc::new(Backend::from_config(config)))
            .collect::<Vec<_>>();

        Self {
            backends: ArcSwap::from_pointee(backends),
        }
    }

    /// Every configured backend with its current snapshot, for admin tooling.
    pub fn all(&self) -> Vec<Arc<Backend>> {
        self.backends.load().as_ref().clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Backend>> {
        self.backends
            .load()
            .iter()
            .find(|backend| backend.name == name)
            .cloned()
    }

    /// The routable backends of `group`, emptiest first, ties broken by name
    /// so the order is stable.
    pub fn list_by_group(&self, group: &str) -> Vec<Arc<Backend>> {
        let mut backends = self
            .backends
            .load()
            .iter()
            .filter(|backend| backend.group == group && backend.is_routable())
            .cloned()
            .collect::<Vec<_>>();

        backends.sort_by(|a, b| {
            (a.health().queued_queries, &a.name).cmp(&(b.health().queued_queries, &b.name))
        });

        backends
    }

    /// Adds the backend, or replaces the entry of the same name (keeping its
    /// health unknown until the next probe round).
    #[instrument(skip(self, config), fields(backend_name = config.name))]
    pub fn register(&self, config: &BackendConfig) {
        let backend = Arc::new(Backend::from_config(config));

        self.backends.rcu(|current| {
            let mut backends = current
                .iter()
                .filter(|existing| existing.name != backend.name)
                .cloned()
                .collect::<Vec<_>>();
            backends.push(Arc::clone(&backend));
            backends
        });

        info!(backend_name = backend.name, "Registered backend");
    }

    #[instrument(skip(self))]
    pub fn remove(&self, name: &str) -> Result<(), Error> {
        let mut removed = false;
        self.backends.rcu(|current| {
            let backends = current
                .iter()
                .filter(|backend| backend.name != name)
                .cloned()
                .collect::<Vec<_>>();
            removed = backends.len() != current.len();
            backends
        });

        if removed {
            info!(backend_name = name, "Removed backend");
            Ok(())
        } else {
            BackendNotFoundSnafu { backend_name: name }.fail()
        }
    }

    #[instrument(skip(self))]
    pub fn set_active(&self, name: &str, active: bool) -> Result<(), Error> {
        let backend = self
            .get(name)
            .context(BackendNotFoundSnafu { backend_name: name })?;
        backend.set_active(active);

        info!(backend_name = name, active, "Changed backend activation");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn backend_config(name: &str, group: &str) -> BackendConfig {
        serde_yaml::from_str(&format!(
            "{{name: {name}, externalUrl: \"http://{name}:8080\", routingGroup: {group}}}"
        ))
        .expect("Failed to parse test backend config")
    }

    pub(crate) fn reachable(queued_queries: u64) -> HealthSnapshot {
        HealthSnapshot {
            reachable: true,
            queued_queries,
            probed_at: SystemTime::now(),
        }
    }

    #[test]
    fn test_unprobed_backend_is_not_routable() {
        let manager = BackendManager::new(&[backend_config("trino-1", "adhoc")]);
        assert!(manager.list_by_group("adhoc").is_empty());
    }

    #[test]
    fn test_list_by_group_orders_by_queue_depth() {
        let manager = BackendManager::new(&[
            backend_config("trino-1", "adhoc"),
            backend_config("trino-2", "adhoc"),
            backend_config("trino-3", "etl"),
        ]);
        manager.get("trino-1").unwrap().record_probe(reachable(5));
        manager.get("trino-2").unwrap().record_probe(reachable(2));
        manager.get("trino-3").unwrap().record_probe(reachable(0));

        let adhoc = manager.list_by_group("adhoc");
        assert_eq!(
            adhoc.iter().map(|b| b.name.as_str()).collect::<Vec<_>>(),
            vec!["trino-2", "trino-1"]
        );
    }

    #[test]
    fn test_list_by_group_breaks_ties_by_name() {
        let manager = BackendManager::new(&[
            backend_config("trino-b", "adhoc"),
            backend_config("trino-a", "adhoc"),
        ]);
        manager.get("trino-a").unwrap().record_probe(reachable(1));
        manager.get("trino-b").unwrap().record_probe(reachable(1));

        let adhoc = manager.list_by_group("adhoc");
        assert_eq!(
            adhoc.iter().map(|b| b.name.as_str()).collect::<Vec<_>>(),
            vec!["trino-a", "trino-b"]
        );
    }

    #[test]
    fn test_unreachable_and_inactive_backends_are_excluded() {
        let manager = BackendManager::new(&[
            backend_config("trino-1", "adhoc"),
            backend_config("trino-2", "adhoc"),
        ]);
        manager.get("trino-1").unwrap().record_probe(reachable(0));
        manager.get("trino-2").unwrap().record_probe(reachable(0));

        manager.set_active("trino-2", false).unwrap();
        let adhoc = manager.list_by_group("adhoc");
        assert_eq!(adhoc.len(), 1);
        assert_eq!(adhoc[0].name, "trino-1");

        manager.get("trino-1").unwrap().record_probe(HealthSnapshot {
            reachable: false,
            queued_queries: 0,
            probed_at: SystemTime::now(),
        });
        assert!(manager.list_by_group("adhoc").is_empty());
    }

    #[test]
    fn test_register_and_remove() {
        let manager = BackendManager::new(&[backend_config("trino-1", "adhoc")]);

        manager.register(&backend_config("trino-2", "adhoc"));
        assert!(manager.get("trino-2").is_some());

        // Registering the same name replaces the entry.
        manager.register(&backend_config("trino-2", "etl"));
        assert_eq!(manager.get("trino-2").unwrap().group, "etl");
        assert_eq!(manager.all().len(), 2);

        manager.remove("trino-2").unwrap();
        assert!(manager.get("trino-2").is_none());
        assert!(matches!(
            manager.remove("trino-2"),
            Err(Error::BackendNotFound { .. })
        ));
    }
}
