//! Passthrough for everything that is not a statement endpoint: the web UI,
//! `/v1/info`, `/v1/node` and whatever else clients throw at the gateway.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    response::Response,
};
use http::{HeaderMap, Method, Uri};
use opentelemetry::KeyValue;
use snafu::ResultExt;
use tracing::instrument;
use trino_gateway_core::query_id_from_path;

use crate::http_server::{AppState, ExchangeError, ForwardSnafu, PickBackendSnafu, ResolveQuerySnafu};

/// Fallback handler. Requests whose path carries a query id stay pinned to
/// that query's backend; everything else goes to the UI backend, which is the
/// first routable backend of the default group. Bodies stream in both
/// directions.
#[instrument(name = "passthrough", skip(state, headers, body))]
pub async fn proxy_passthrough(
    State(state): State<Arc<AppState>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ExchangeError> {
    state
        .metrics
        .http_counter
        .add(1, &[KeyValue::new("resource", "passthrough")]);

    let backend = match query_id_from_path(uri.path()) {
        Some(query_id) => state
            .routing_manager
            .resolve(query_id)
            .context(ResolveQuerySnafu)?,
        None => state
            .routing_manager
            .pick(None)
            .context(PickBackendSnafu)?,
    };

    let path_and_query = uri
        .path_and_query()
        .map(|path_and_query| path_and_query.as_str())
        .unwrap_or_else(|| uri.path());

    state
        .proxy
        .forward_streaming(
            method,
            &backend,
            path_and_query,
            &headers,
            Some(client_addr),
            body,
        )
        .await
        .context(ForwardSnafu)
}
