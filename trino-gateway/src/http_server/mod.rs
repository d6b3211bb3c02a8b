use std::{
    net::{Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use axum::{
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use axum_server::{tls_rustls::RustlsConfig, Handle};
use futures::FutureExt;
use http::StatusCode;
use serde_json::json;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::time::sleep;
use tracing::{info, warn};
use trino_gateway_core::config::Config;
use trino_gateway_state::QueryHistoryImplementation;

use crate::{
    backend_manager::BackendManager,
    error_formatting::snafu_error_to_string,
    http_server::proxy::ProxyClient,
    metrics::Metrics,
    routing::RoutingGroupSelectorImplementation,
    routing_manager::{self, RoutingManager},
};

pub mod metrics;
pub mod proxy;
pub mod ui;
pub mod v1;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Failed configure HTTP server"))]
    ConfigureHttpServer { source: std::io::Error },

    #[snafu(display("Failed start HTTP server"))]
    StartHttpServer { source: std::io::Error },

    #[snafu(display(
        "In case https is used the `requestRouter.certPemFile` and `requestRouter.keyPemFile` \
         options must be set"
    ))]
    CertsMissing {},
}

pub struct AppState {
    pub config: Config,
    pub backend_manager: Arc<BackendManager>,
    pub routing_manager: Arc<RoutingManager>,
    pub selector: RoutingGroupSelectorImplementation,
    pub proxy: ProxyClient,
    pub history: Arc<QueryHistoryImplementation>,
    pub metrics: Arc<Metrics>,
}

/// The per-exchange failures that surface to clients. Everything else is
/// recovered (or logged) before it gets here; no error unwinds past a
/// handler.
#[derive(Snafu, Debug)]
pub enum ExchangeError {
    #[snafu(display("Failed to pick a backend"))]
    PickBackend { source: routing_manager::Error },

    #[snafu(display("Failed to resolve query"))]
    ResolveQuery { source: routing_manager::Error },

    #[snafu(display("Failed to forward request"))]
    Forward { source: proxy::Error },
}

impl IntoResponse for ExchangeError {
    fn into_response(self) -> Response {
        warn!(error = ?self, "Error while processing request");

        match &self {
            ExchangeError::PickBackend { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                [("retry-after", "1")],
                snafu_error_to_string(&self),
            )
                .into_response(),
            ExchangeError::ResolveQuery { .. } => (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "Query not found"})),
            )
                .into_response(),
            ExchangeError::Forward {
                source: proxy::Error::ResponseHeaderTimeout { .. },
            } => (StatusCode::GATEWAY_TIMEOUT, snafu_error_to_string(&self)).into_response(),
            ExchangeError::Forward {
                source:
                    proxy::Error::ContactBackend { backend_name, .. }
                    | proxy::Error::ReadResponseBody { backend_name, .. },
            } => (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": "backend unavailable", "backend": backend_name})),
            )
                .into_response(),
            ExchangeError::Forward { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, snafu_error_to_string(&self)).into_response()
            }
        }
    }
}

pub async fn start_http_server(app_state: AppState) -> Result<(), Error> {
    let router_config = app_state.config.gateway.request_router.clone();
    let app_state = Arc::new(app_state);

    // Start Prometheus metrics exporter
    let app = Router::new()
        .route("/", get(|| async { Redirect::permanent("/metrics") }))
        .route("/metrics", get(metrics::get))
        .with_state(Arc::clone(&app_state));
    let listen_addr = SocketAddr::from(([0, 0, 0, 0], 9090));
    info!(addr = %listen_addr, "Starting metrics exporter");

    let handle = Handle::new();
    tokio::spawn(graceful_shutdown(handle.clone()));

    let handle_clone = handle.clone();
    tokio::spawn(async move {
        axum_server::bind(listen_addr)
            .handle(handle_clone)
            .serve(app.into_make_service())
            .await
    });

    let app = Router::new()
        .route(
            "/v1/statement",
            axum::routing::post(v1::statement::post_statement),
        )
        .route(
            "/v1/statement/queued/:query_id/:slug/:token",
            get(v1::statement::get_queued_statement)
                .delete(v1::statement::delete_queued_statement),
        )
        .route(
            "/v1/statement/executing/:query_id/:slug/:token",
            get(v1::statement::get_executing_statement)
                .delete(v1::statement::delete_executing_statement),
        )
        .route("/ui/api/query/:query_id", get(v1::statement::get_ui_api_query))
        .fallback(ui::proxy_passthrough)
        .with_state(app_state);

    let listen_addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, router_config.port));
    info!(addr = %listen_addr, "Starting request router");

    if router_config.ssl {
        let tls_config = RustlsConfig::from_pem_file(
            router_config.cert_pem_file.context(CertsMissingSnafu)?,
            router_config.key_pem_file.context(CertsMissingSnafu)?,
        )
        .await
        .context(ConfigureHttpServerSnafu)?;

        axum_server::bind_rustls(listen_addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context(StartHttpServerSnafu)?;
    } else {
        axum_server::bind(listen_addr)
            .handle(handle)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context(StartHttpServerSnafu)?;
    }

    Ok(())
}

async fn graceful_shutdown(handle: Handle) {
    wait_for_shutdown_signal().await;

    info!("Sending graceful shutdown signal");

    // Signal the server to shutdown using Handle.
    handle.graceful_shutdown(Some(Duration::from_secs(5)));
    loop {
        info!(connection = handle.connection_count(), "Alive connections");
        sleep(Duration::from_secs(1)).await;
    }
}

async fn wait_for_shutdown_signal() {
    futures::future::select(
        tokio::signal::ctrl_c().map(|_| ()).boxed(),
        #[cfg(unix)]
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .map(|_| ())
            .boxed(),
        // Assume that ctrl_c is enough on non-Unix platforms (such as Windows)
        #[cfg(not(unix))]
        futures::future::pending::<()>(),
    )
    .await;
}
