use std::sync::Arc;

use clap::Parser;
use main_error::MainError;
use opentelemetry::global::shutdown_tracer_provider;
use snafu::{ResultExt, Snafu};
use trino_gateway_core::config::{self, Config};
use trino_gateway_state::{InMemoryQueryHistory, QueryBindings, QueryHistoryImplementation};

use crate::{
    args::Args,
    backend_manager::BackendManager,
    http_server::{proxy::ProxyClient, start_http_server, AppState},
    maintenance::{
        binding_sweeper::BindingSweeper,
        health_monitor::{self, HealthMonitor},
    },
    metrics::Metrics,
    routing::rules::spawn_reload_on_sighup,
    routing_manager::RoutingManager,
};

mod args;
mod backend_manager;
mod error_formatting;
mod http_server;
mod maintenance;
mod metrics;
mod routing;
mod routing_manager;
mod tracing;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Failed to set up tracing"))]
    SetUpTracing { source: tracing::Error },

    #[snafu(display("Failed to read configuration"))]
    ReadConfig { source: config::Error },

    #[snafu(display("Failed to create routing group selector"))]
    CreateSelector { source: routing::Error },

    #[snafu(display("Failed to create health monitor"))]
    CreateHealthMonitor { source: health_monitor::Error },

    #[snafu(display("Failed to create proxy client"))]
    CreateProxyClient { source: http_server::proxy::Error },

    #[snafu(display("Failed to set up metrics"))]
    SetUpMetrics { source: metrics::Error },

    #[snafu(display("Failed to start HTTP server"))]
    StartHttpServer { source: http_server::Error },
}

#[tokio::main]
async fn main() -> Result<(), MainError> {
    let args = Args::parse();

    let config = Config::read_from_file(&args.config_file)
        .await
        .context(ReadConfigSnafu)?;

    let registry = tracing::init(config.gateway.tracing.as_ref()).context(SetUpTracingSnafu)?;

    let backend_manager = Arc::new(BackendManager::new(&config.backends));
    let metrics = Arc::new(
        Metrics::new(registry, Arc::clone(&backend_manager)).context(SetUpMetricsSnafu)?,
    );

    let bindings = Arc::new(QueryBindings::new(
        config.routing.binding_ttl,
        config.routing.terminal_grace,
    ));
    let routing_manager = Arc::new(RoutingManager::new(
        Arc::clone(&backend_manager),
        Arc::clone(&bindings),
        config.routing.default_group.clone(),
    ));

    let (selector, rules_engine) =
        routing::selector_from_config(&config.routing_rules).context(CreateSelectorSnafu)?;
    if let Some(rules_engine) = rules_engine {
        spawn_reload_on_sighup(rules_engine);
    }

    HealthMonitor::new(Arc::clone(&backend_manager), &config.monitor)
        .context(CreateHealthMonitorSnafu)?
        .start_loop();
    BindingSweeper::new(Arc::clone(&bindings)).start_loop();

    let history: Arc<QueryHistoryImplementation> =
        Arc::new(InMemoryQueryHistory::default().into());

    let proxy =
        ProxyClient::new(config.gateway.request_router.ssl).context(CreateProxyClientSnafu)?;

    start_http_server(AppState {
        config,
        backend_manager,
        routing_manager,
        selector,
        proxy,
        history,
        metrics,
    })
    .await
    .context(StartHttpServerSnafu)?;

    shutdown_tracer_provider();

    Ok(())
}
