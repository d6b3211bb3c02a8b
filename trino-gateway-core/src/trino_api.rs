//! The slice of the Trino statement API the gateway inspects, plus the
//! response-URI rewriting that keeps clients pinned to the gateway.

use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use url::Url;

use crate::TrinoQueryId;

pub const TERMINAL_QUERY_STATES: [&str; 3] = ["FINISHED", "FAILED", "CANCELED"];

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Failed to deserialize Trino statement API response"))]
    DeserializeStatementResponse { source: serde_json::Error },
}

/// The subset of a statement API response the gateway looks at. Response
/// bodies are forwarded as received; this type is only ever deserialized,
/// never written back.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementApiResponse {
    pub id: TrinoQueryId,

    /// Absent on the final response of a query.
    pub next_uri: Option<String>,

    #[serde(default)]
    pub stats: StatementStats,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementStats {
    pub state: Option<String>,
}

impl StatementApiResponse {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(bytes).context(DeserializeStatementResponseSnafu)
    }

    /// A query is done once Trino stops handing out a `nextUri` and reports a
    /// terminal state.
    pub fn is_terminal(&self) -> bool {
        self.next_uri.is_none()
            && self
                .stats
                .state
                .as_deref()
                .is_some_and(|state| TERMINAL_QUERY_STATES.contains(&state))
    }
}

/// Replaces every occurrence of the backend's external URL prefix in `body`
/// with the gateway's external address, so `nextUri`, `infoUri` and
/// `partialCancelUri` keep pointing at the gateway.
///
/// This is a byte-level substitution on the raw response, not a JSON
/// round-trip: everything outside the rewritten prefix is preserved
/// byte-for-byte, unknown fields included.
pub fn rewrite_response_uris(body: &[u8], backend_external: &Url, gateway_external: &Url) -> Vec<u8> {
    let needle = url_prefix(backend_external);
    let replacement = url_prefix(gateway_external);
    if needle == replacement {
        return body.to_vec();
    }

    replace_all(body, needle.as_bytes(), replacement.as_bytes())
}

/// `scheme://host[:port]` without any trailing slash, the form URIs in Trino
/// responses start with.
fn url_prefix(url: &Url) -> String {
    let mut prefix = url.to_string();
    while prefix.ends_with('/') {
        prefix.pop();
    }
    prefix
}

fn replace_all(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    if needle.is_empty() {
        return haystack.to_vec();
    }

    let mut result = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            result.extend_from_slice(replacement);
            i += needle.len();
        } else {
            result.push(haystack[i]);
            i += 1;
        }
    }
    result
}
