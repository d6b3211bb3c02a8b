use http::HeaderMap;
use tracing::instrument;
use trino_gateway_core::attributes::RequestAttributes;

use crate::routing::RoutingGroupSelector;

/// The header clients use to request a routing group directly. The gateway
/// strips it before forwarding.
pub const TRINO_ROUTING_GROUP_HEADER: &str = "x-trino-routing-group";

/// Selects the group named by `X-Trino-Routing-Group`, if any.
pub struct HeaderSelector;

impl RoutingGroupSelector for HeaderSelector {
    #[instrument(name = "HeaderSelector::select", skip_all)]
    fn select(&self, headers: &HeaderMap, _attributes: &RequestAttributes) -> Option<String> {
        headers
            .get(TRINO_ROUTING_GROUP_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|group| !group.is_empty())
            .map(String::from)
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(None, None)]
    #[case(Some("etl"), Some("etl"))]
    #[case(Some("  etl  "), Some("etl"))]
    #[case(Some(""), None)]
    #[case(Some("   "), None)]
    fn test_header_selection(#[case] header: Option<&str>, #[case] expected: Option<&str>) {
        let mut headers = HeaderMap::new();
        if let Some(header) = header {
            headers.insert(
                TRINO_ROUTING_GROUP_HEADER,
                HeaderValue::from_str(header).unwrap(),
            );
        }

        assert_eq!(
            HeaderSelector
                .select(&headers, &RequestAttributes::default())
                .as_deref(),
            expected
        );
    }
}
