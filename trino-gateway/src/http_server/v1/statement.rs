//! The statement endpoints: routing of new queries and pinning of follow-ups.

use std::{net::SocketAddr, sync::Arc, time::SystemTime};

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, State},
    response::{IntoResponse, Response},
};
use http::{HeaderMap, Method, StatusCode, Uri};
use opentelemetry::KeyValue;
use snafu::ResultExt;
use tracing::{debug, info, instrument, warn};
use trino_gateway_core::{
    attributes::RequestAttributes,
    trino_api::{rewrite_response_uris, StatementApiResponse},
    BackendName, TrinoQueryId,
};
use trino_gateway_state::{QueryHistory, QueryHistoryEntry};

use crate::{
    backend_manager::Backend,
    http_server::{
        proxy::BufferedResponse, AppState, ExchangeError, ForwardSnafu, PickBackendSnafu,
        ResolveQuerySnafu,
    },
    routing::RoutingGroupSelector,
};

/// A new query comes in: extract its attributes, select a routing group, pick
/// a backend and hand the query over. The query id Trino assigns in the
/// response is bound to the backend so every follow-up lands on the same
/// coordinator.
#[instrument(name = "POST /v1/statement", skip(state, headers, query))]
pub async fn post_statement(
    State(state): State<Arc<AppState>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    query: String,
) -> Result<Response, ExchangeError> {
    state
        .metrics
        .http_counter
        .add(1, &[KeyValue::new("resource", "post_statement")]);

    let attributes = RequestAttributes::from_statement(&headers, &query);
    let routing_group = state.selector.select(&headers, &attributes);
    debug!(?routing_group, "Selected routing group");

    let backend = state
        .routing_manager
        .pick(routing_group.as_deref())
        .context(PickBackendSnafu)?;

    let response = state
        .proxy
        .forward_buffered(
            Method::POST,
            &backend,
            "/v1/statement",
            &headers,
            Some(client_addr),
            Bytes::from(query),
        )
        .await
        .context(ForwardSnafu)?;

    if response.status == StatusCode::OK {
        match StatementApiResponse::from_bytes(&response.body) {
            Ok(statement) => {
                state.routing_manager.bind(&statement.id, &backend.name);
                if statement.is_terminal() {
                    state.routing_manager.mark_terminal(&statement.id);
                }

                state.metrics.queries_routed.add(
                    1,
                    &[
                        KeyValue::new("routing_group", backend.group.clone()),
                        KeyValue::new("backend", backend.name.clone()),
                    ],
                );

                info!(
                    query_id = statement.id,
                    backend_name = backend.name,
                    "Handed query over to backend"
                );

                record_history(&state, statement.id, &attributes, backend.name.clone());
            }
            Err(error) => debug!(
                ?error,
                "Backend answered without a statement API payload, skipping query id capture"
            ),
        }
    }

    Ok(rewritten_response(&state, &backend, response))
}

#[instrument(
    name = "GET /v1/statement/queued/{queryId}/{slug}/{token}",
    skip(state, headers, uri)
)]
pub async fn get_queued_statement(
    State(state): State<Arc<AppState>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    Path((query_id, _slug, _token)): Path<(TrinoQueryId, String, u64)>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, ExchangeError> {
    state
        .metrics
        .http_counter
        .add(1, &[KeyValue::new("resource", "get_queued_statement")]);

    follow_up(&state, Method::GET, &query_id, &uri, &headers, client_addr).await
}

#[instrument(
    name = "GET /v1/statement/executing/{queryId}/{slug}/{token}",
    skip(state, headers, uri)
)]
pub async fn get_executing_statement(
    State(state): State<Arc<AppState>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    Path((query_id, _slug, _token)): Path<(TrinoQueryId, String, u64)>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, ExchangeError> {
    state
        .metrics
        .http_counter
        .add(1, &[KeyValue::new("resource", "get_executing_statement")]);

    follow_up(&state, Method::GET, &query_id, &uri, &headers, client_addr).await
}

/// Cancel of a query still queued on the coordinator.
#[instrument(
    name = "DELETE /v1/statement/queued/{queryId}/{slug}/{token}",
    skip(state, headers, uri)
)]
pub async fn delete_queued_statement(
    State(state): State<Arc<AppState>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    Path((query_id, _slug, _token)): Path<(TrinoQueryId, String, u64)>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, ExchangeError> {
    state
        .metrics
        .http_counter
        .add(1, &[KeyValue::new("resource", "delete_queued_statement")]);

    follow_up(&state, Method::DELETE, &query_id, &uri, &headers, client_addr).await
}

#[instrument(
    name = "DELETE /v1/statement/executing/{queryId}/{slug}/{token}",
    skip(state, headers, uri)
)]
pub async fn delete_executing_statement(
    State(state): State<Arc<AppState>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    Path((query_id, _slug, _token)): Path<(TrinoQueryId, String, u64)>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, ExchangeError> {
    state
        .metrics
        .http_counter
        .add(1, &[KeyValue::new("resource", "delete_executing_statement")]);

    follow_up(&state, Method::DELETE, &query_id, &uri, &headers, client_addr).await
}

/// The web UI's query detail endpoint is pinned like any other follow-up.
#[instrument(name = "GET /ui/api/query/{queryId}", skip(state, headers, uri))]
pub async fn get_ui_api_query(
    State(state): State<Arc<AppState>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    Path(query_id): Path<TrinoQueryId>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, ExchangeError> {
    state
        .metrics
        .http_counter
        .add(1, &[KeyValue::new("resource", "get_ui_api_query")]);

    follow_up(&state, Method::GET, &query_id, &uri, &headers, client_addr).await
}

/// Forwards a follow-up request to the backend its query is bound to,
/// regardless of the backend's current health: if the coordinator is gone the
/// client gets the true error. A terminal response arms the binding's grace
/// deadline.
#[instrument(skip(state, headers, uri))]
async fn follow_up(
    state: &Arc<AppState>,
    method: Method,
    query_id: &str,
    uri: &Uri,
    headers: &HeaderMap,
    client_addr: SocketAddr,
) -> Result<Response, ExchangeError> {
    let backend = state
        .routing_manager
        .resolve(query_id)
        .context(ResolveQuerySnafu)?;

    let path_and_query = uri
        .path_and_query()
        .map(|path_and_query| path_and_query.as_str())
        .unwrap_or_else(|| uri.path());

    let response = state
        .proxy
        .forward_buffered(
            method,
            &backend,
            path_and_query,
            headers,
            Some(client_addr),
            Bytes::new(),
        )
        .await
        .context(ForwardSnafu)?;

    if response.status == StatusCode::OK {
        if let Ok(statement) = StatementApiResponse::from_bytes(&response.body) {
            if statement.is_terminal() {
                info!(query_id, "Query reached terminal state");
                state.routing_manager.mark_terminal(query_id);
            }
        }
    }

    Ok(rewritten_response(state, &backend, response))
}

/// Any backend URI in the response body is rewritten to the gateway address
/// before the response goes back to the client.
fn rewritten_response(state: &AppState, backend: &Backend, response: BufferedResponse) -> Response {
    let body = rewrite_response_uris(
        &response.body,
        &backend.external_url,
        &state.config.gateway.external_address,
    );

    (response.status, response.headers, body).into_response()
}

/// Query history is best effort: recorded from a spawned task, failures are
/// logged and never surface to the client.
fn record_history(
    state: &Arc<AppState>,
    query_id: TrinoQueryId,
    attributes: &RequestAttributes,
    backend: BackendName,
) {
    let history = Arc::clone(&state.history);
    let entry = QueryHistoryEntry {
        query_id,
        user: attributes.user.clone(),
        source: attributes.source.clone(),
        query: attributes.raw_sql.clone(),
        backend,
        submitted_at: SystemTime::now(),
    };

    tokio::spawn(async move {
        if let Err(error) = history.record(entry).await {
            warn!(?error, "Failed to record query history entry");
        }
    });
}
