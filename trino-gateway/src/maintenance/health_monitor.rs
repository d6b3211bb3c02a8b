use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use futures::future::join_all;
use reqwest::Client;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use tokio::time;
use tracing::{debug, info, info_span, instrument, warn, Instrument};
use trino_gateway_core::config::MonitorConfig;
use url::Url;

use crate::backend_manager::{Backend, BackendManager, HealthSnapshot};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Failed to create HTTP client"))]
    CreateHttpClient { source: reqwest::Error },
}

#[derive(Snafu, Debug)]
enum ProbeError {
    #[snafu(display("Failed to join API path onto backend url {backend_url}"))]
    JoinApiPath {
        source: url::ParseError,
        backend_url: Url,
    },

    #[snafu(display("Failed to contact backend"))]
    ContactBackend { source: reqwest::Error },

    #[snafu(display("Backend answered with status {status}"))]
    UnexpectedStatus { status: reqwest::StatusCode },

    #[snafu(display("Failed to decode backend response"))]
    DecodeResponse { source: reqwest::Error },
}

/// The `GET /v1/info` payload, reduced to what liveness needs.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfo {
    #[serde(default)]
    starting: bool,
}

/// The `GET /ui/api/stats` payload; only the queue depth is of interest.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterStats {
    queued_queries: u64,
}

/// Periodically probes every backend and swaps fresh [`HealthSnapshot`]s into
/// the backend manager. One probe per backend, all concurrent, so a hanging
/// backend never delays the others beyond the probe timeout.
pub struct HealthMonitor {
    backends: Arc<BackendManager>,
    probe_interval: Duration,
    http_client: Client,
}

impl HealthMonitor {
    #[instrument(skip(backends))]
    pub fn new(backends: Arc<BackendManager>, config: &MonitorConfig) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(config.probe_timeout)
            .danger_accept_invalid_certs(config.ignore_cert)
            .build()
            .context(CreateHttpClientSnafu)?;

        Ok(Self {
            backends,
            probe_interval: config.probe_interval,
            http_client,
        })
    }

    pub fn start_loop(self) {
        tokio::spawn(async move {
            let mut interval = time::interval(self.probe_interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                // First tick does not sleep, so let's put it at the start of the loop.
                interval.tick().await;

                async {
                    let backends = self.backends.all();
                    join_all(backends.iter().map(|backend| self.probe_backend(backend))).await;
                    debug!(
                        backend_count = backends.len(),
                        "HealthMonitor: Probed all backends"
                    );
                }
                .instrument(info_span!("Probing backend health"))
                .await;
            }
        });
    }

    #[instrument(skip(self, backend), fields(backend_name = backend.name))]
    async fn probe_backend(&self, backend: &Arc<Backend>) {
        let reachable = match self.fetch_server_info(backend).await {
            Ok(info) => !info.starting,
            Err(error) => {
                debug!(?error, "Backend probe failed");
                false
            }
        };

        // Queue depth is best effort; older Trino versions gate the stats
        // endpoint behind the UI login and then simply count as empty.
        let queued_queries = if reachable {
            self.fetch_queue_depth(backend).await.unwrap_or(0)
        } else {
            0
        };

        let previous = backend.health();
        if previous.reachable != reachable {
            if reachable {
                info!(backend_name = backend.name, "Backend became reachable");
            } else {
                warn!(backend_name = backend.name, "Backend became unreachable");
            }
        }

        backend.record_probe(HealthSnapshot {
            reachable,
            queued_queries,
            probed_at: SystemTime::now(),
        });
    }

    async fn fetch_server_info(&self, backend: &Backend) -> Result<ServerInfo, ProbeError> {
        let info_url = backend
            .proxy_url
            .join("v1/info")
            .context(JoinApiPathSnafu {
                backend_url: backend.proxy_url.clone(),
            })?;

        let response = self
            .http_client
            .get(info_url)
            .send()
            .await
            .context(ContactBackendSnafu)?;

        if !response.status().is_success() {
            return UnexpectedStatusSnafu {
                status: response.status(),
            }
            .fail();
        }

        response.json().await.context(DecodeResponseSnafu)
    }

    async fn fetch_queue_depth(&self, backend: &Backend) -> Option<u64> {
        let stats_url = backend.proxy_url.join("ui/api/stats").ok()?;

        let response = self
            .http_client
            .get(stats_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);

        match response {
            Ok(response) => match response.json::<ClusterStats>().await {
                Ok(stats) => Some(stats.queued_queries),
                Err(error) => {
                    debug!(?error, "Failed to decode cluster stats");
                    None
                }
            },
            Err(error) => {
                debug!(?error, "Failed to fetch cluster stats");
                None
            }
        }
    }
}
