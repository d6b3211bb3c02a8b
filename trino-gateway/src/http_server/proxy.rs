//! The outbound half of a proxied exchange: URL rewriting, header hygiene and
//! the actual forward to the chosen backend.

use std::{net::SocketAddr, time::Duration};

use axum::{
    body::{Body, Bytes},
    response::Response,
};
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use reqwest::Client;
use snafu::{ResultExt, Snafu};
use tracing::instrument;
use trino_gateway_core::{sanitization::Sanitize, BackendName};
use url::Url;

use crate::{backend_manager::Backend, routing::TRINO_ROUTING_GROUP_HEADER};

/// Deadline for the backend to produce response *headers*. Body streaming is
/// not limited, result pages may take arbitrarily long.
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Failed to create HTTP client"))]
    CreateHttpClient { source: reqwest::Error },

    #[snafu(display(
        "Failed to join the path of the current request {requested_path:?} to the backend \
         endpoint {backend_url}"
    ))]
    JoinRequestPathToBackendEndpoint {
        source: url::ParseError,
        requested_path: String,
        backend_url: Url,
    },

    /// Connection-level failure, surfaces to the client as 502.
    #[snafu(display("Failed to contact backend {backend_name:?}"))]
    ContactBackend {
        source: reqwest::Error,
        backend_name: BackendName,
    },

    /// The backend produced no response headers in time, surfaces as 504.
    #[snafu(display("Backend {backend_name:?} did not answer within {timeout:?}"))]
    ResponseHeaderTimeout {
        backend_name: BackendName,
        timeout: Duration,
    },

    #[snafu(display("Failed to read response body from backend {backend_name:?}"))]
    ReadResponseBody {
        source: reqwest::Error,
        backend_name: BackendName,
    },

    #[snafu(display("Failed to build response"))]
    BuildResponse { source: http::Error },
}

/// A fully buffered backend response, for the statement endpoints that need
/// to inspect and rewrite the (small) JSON control payloads.
pub struct BufferedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct ProxyClient {
    http_client: Client,
    forwarded_proto: &'static str,
}

impl ProxyClient {
    pub fn new(ssl: bool) -> Result<Self, Error> {
        // No global timeout: response bodies stream for as long as the query
        // produces pages. The header deadline is enforced per call.
        let http_client = Client::builder().build().context(CreateHttpClientSnafu)?;

        Ok(Self {
            http_client,
            forwarded_proto: if ssl { "https" } else { "http" },
        })
    }

    /// Forwards and buffers the whole response.
    #[instrument(
        skip(self, headers, body),
        fields(backend_name = backend.name, headers = ?headers.sanitize()),
    )]
    pub async fn forward_buffered(
        &self,
        method: Method,
        backend: &Backend,
        path_and_query: &str,
        headers: &HeaderMap,
        client_addr: Option<SocketAddr>,
        body: Bytes,
    ) -> Result<BufferedResponse, Error> {
        let response = self
            .send(method, backend, path_and_query, headers, client_addr, body)
            .await?;

        let status = response.status();
        let headers = filter_response_headers(response.headers());
        let body = response.bytes().await.context(ReadResponseBodySnafu {
            backend_name: &backend.name,
        })?;

        Ok(BufferedResponse {
            status,
            headers,
            body,
        })
    }

    /// Forwards and streams the response body straight back to the client.
    #[instrument(
        skip(self, headers, body),
        fields(backend_name = backend.name, headers = ?headers.sanitize()),
    )]
    pub async fn forward_streaming(
        &self,
        method: Method,
        backend: &Backend,
        path_and_query: &str,
        headers: &HeaderMap,
        client_addr: Option<SocketAddr>,
        body: Bytes,
    ) -> Result<Response, Error> {
        let response = self
            .send(method, backend, path_and_query, headers, client_addr, body)
            .await?;

        let status = response.status();
        let headers = filter_response_headers(response.headers());

        let mut builder = Response::builder().status(status);
        if let Some(response_headers) = builder.headers_mut() {
            *response_headers = headers;
        }
        builder
            .body(Body::from_stream(response.bytes_stream()))
            .context(BuildResponseSnafu)
    }

    async fn send(
        &self,
        method: Method,
        backend: &Backend,
        path_and_query: &str,
        headers: &HeaderMap,
        client_addr: Option<SocketAddr>,
        body: Bytes,
    ) -> Result<reqwest::Response, Error> {
        let target = backend.proxy_url.join(path_and_query).context(
            JoinRequestPathToBackendEndpointSnafu {
                requested_path: path_and_query,
                backend_url: backend.proxy_url.clone(),
            },
        )?;

        let headers = prepare_forward_headers(
            headers,
            &backend.external_url,
            client_addr,
            self.forwarded_proto,
        );

        let request = self
            .http_client
            .request(method, target)
            .headers(headers)
            .body(body);

        match tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, request.send()).await {
            Ok(response) => response.context(ContactBackendSnafu {
                backend_name: &backend.name,
            }),
            Err(_) => ResponseHeaderTimeoutSnafu {
                backend_name: &backend.name,
                timeout: RESPONSE_HEADER_TIMEOUT,
            }
            .fail(),
        }
    }
}

/// The gateway is protocol-transparent: headers pass through except `Host`
/// (set to the backend's *external* host, so the coordinator builds its
/// self-referential URIs from the address the rewriting keys on even when it
/// is dialed through a different proxy URL), the routing-group header
/// (consumed by the gateway) and the hop-by-hop set. The standard
/// `X-Forwarded-*` headers are appended, never overwritten.
fn prepare_forward_headers(
    headers: &HeaderMap,
    backend_external: &Url,
    client_addr: Option<SocketAddr>,
    forwarded_proto: &'static str,
) -> HeaderMap {
    let mut forwarded = headers.clone();

    let original_host = forwarded.remove(header::HOST);
    forwarded.remove(TRINO_ROUTING_GROUP_HEADER);
    forwarded.remove(header::CONTENT_LENGTH);
    forwarded.remove(header::TRANSFER_ENCODING);
    forwarded.remove(header::CONNECTION);

    let authority = url_authority(backend_external);
    if !authority.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&authority) {
            forwarded.insert(header::HOST, value);
        }
    }

    if let Some(client_addr) = client_addr {
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            forwarded.append("x-forwarded-for", value);
        }
    }
    forwarded.append("x-forwarded-proto", HeaderValue::from_static(forwarded_proto));
    if let Some(original_host) = original_host {
        forwarded.append("x-forwarded-host", original_host);
    }

    forwarded
}

/// `host[:port]` as spelled in the URL; default ports stay implicit.
fn url_authority(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    }
}

/// Hop-by-hop headers stay on their hop. `Content-Length` is dropped because
/// statement bodies may change length during URI rewriting; the server layer
/// recomputes it.
fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    const HOP_BY_HOP: [header::HeaderName; 5] = [
        header::CONNECTION,
        header::TRANSFER_ENCODING,
        header::CONTENT_LENGTH,
        header::UPGRADE,
        header::TRAILER,
    ];

    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if !HOP_BY_HOP.contains(name) {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_forward_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("trino-gateway:8080"));
        headers.insert("x-trino-user", HeaderValue::from_static("will"));
        headers.insert(
            TRINO_ROUTING_GROUP_HEADER,
            HeaderValue::from_static("etl"),
        );
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));

        let backend_external = Url::parse("http://trino-1.company.org:8080").unwrap();
        let client_addr = "10.0.0.2:51234".parse().ok();
        let forwarded =
            prepare_forward_headers(&headers, &backend_external, client_addr, "http");

        // Host carries the backend's external authority, even when the
        // gateway dials a different proxy URL; the routing-group header is
        // consumed by the gateway.
        assert_eq!(
            forwarded.get(header::HOST).unwrap(),
            "trino-1.company.org:8080"
        );
        assert!(forwarded.get(TRINO_ROUTING_GROUP_HEADER).is_none());

        // Trino protocol headers pass through untouched.
        assert_eq!(forwarded.get("x-trino-user").unwrap(), "will");

        // Forwarding headers are appended, not overwritten.
        assert_eq!(
            forwarded
                .get_all("x-forwarded-for")
                .iter()
                .collect::<Vec<_>>(),
            vec!["10.0.0.1", "10.0.0.2"]
        );
        assert_eq!(forwarded.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(
            forwarded.get("x-forwarded-host").unwrap(),
            "trino-gateway:8080"
        );
    }

    #[test]
    fn test_host_omits_default_port() {
        let backend_external = Url::parse("https://trino-1.company.org").unwrap();
        let forwarded =
            prepare_forward_headers(&HeaderMap::new(), &backend_external, None, "https");

        assert_eq!(forwarded.get(header::HOST).unwrap(), "trino-1.company.org");
    }

    #[test]
    fn test_filter_response_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("x-trino-set-catalog", HeaderValue::from_static("cat"));

        let filtered = filter_response_headers(&headers);
        assert_eq!(
            filtered.get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(filtered.get("x-trino-set-catalog").unwrap(), "cat");
        assert!(filtered.get(header::CONTENT_LENGTH).is_none());
        assert!(filtered.get(header::CONNECTION).is_none());
    }
}
