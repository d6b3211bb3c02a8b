use std::sync::Arc;

use opentelemetry::{
    metrics::{Counter, MetricsError, Unit},
    KeyValue,
};
use prometheus::Registry;
use snafu::{ResultExt, Snafu};

use crate::backend_manager::BackendManager;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Failed to register metrics callback"))]
    RegisterMetricsCallback { source: MetricsError },
}

pub struct Metrics {
    pub registry: Registry,
    pub http_counter: Counter<u64>,
    pub queries_routed: Counter<u64>,
}

impl Metrics {
    pub fn new(registry: Registry, backends: Arc<BackendManager>) -> Result<Self, Error> {
        let meter = opentelemetry::global::meter("trino-gateway");

        let http_counter = meter
            .u64_counter("http_requests_total")
            .with_unit(Unit::new("requests"))
            .with_description("Total number of HTTP requests made.")
            .init();

        let queries_routed = meter
            .u64_counter("queries_routed_total")
            .with_unit(Unit::new("queries"))
            .with_description("Queries handed over to a backend, by routing group.")
            .init();

        let routable_backends = meter
            .u64_observable_gauge("routable_backends")
            .with_unit(Unit::new("backends"))
            .with_description("Whether a backend is currently able to receive new queries.")
            .init();

        // The backend list is lock-free to read, so the gauge callback can
        // observe it directly.
        meter
            .register_callback(&[routable_backends.as_any()], move |observer| {
                for backend in backends.all() {
                    observer.observe_u64(
                        &routable_backends,
                        backend.is_routable() as u64,
                        [
                            KeyValue::new("backend", backend.name.clone()),
                            KeyValue::new("group", backend.group.clone()),
                        ]
                        .as_ref(),
                    );
                }
            })
            .context(RegisterMetricsCallbackSnafu)?;

        Ok(Self {
            registry,
            http_counter,
            queries_routed,
        })
    }
}
