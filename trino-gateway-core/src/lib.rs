pub mod attributes;
pub mod config;
pub mod sanitization;
pub mod sql;
pub mod trino_api;

pub type TrinoQueryId = String;
pub type BackendName = String;
pub type RoutingGroupName = String;

/// The group selection that means "I have no opinion, use the default group".
pub const NO_MATCH_ROUTING_GROUP: &str = "no-match";

/// Checks whether `candidate` has the syntactic form of a Trino query id,
/// e.g. `20240101_000000_00001_abcde`.
pub fn is_trino_query_id(candidate: &str) -> bool {
    let mut parts = candidate.split('_');
    let (Some(date), Some(time), Some(sequence), Some(suffix), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };

    date.len() == 8
        && date.chars().all(|c| c.is_ascii_digit())
        && time.len() == 6
        && time.chars().all(|c| c.is_ascii_digit())
        && sequence.len() == 5
        && sequence.chars().all(|c| c.is_ascii_digit())
        && !suffix.is_empty()
        && suffix.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Extracts the first path segment that looks like a Trino query id. Covers
/// `/v1/statement/queued/{queryId}/...`, `/v1/statement/executing/{queryId}/...`
/// and `/ui/api/query/{queryId}` alike.
pub fn query_id_from_path(path: &str) -> Option<&str> {
    path.split('/').find(|segment| is_trino_query_id(segment))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("20240101_000000_00001_abcde", true)]
    #[case("20231125_173754_00083_4sknc", true)]
    #[case("20240101_000000_00001_ABCDE", true)]
    #[case("", false)]
    #[case("not_a_query_id", false)]
    #[case("20240101_000000_00001", false)]
    #[case("20240101_000000_00001_abcde_extra", false)]
    #[case("2024010_000000_00001_abcde", false)]
    #[case("20240101_00000_00001_abcde", false)]
    #[case("20240101_000000_0001_abcde", false)]
    #[case("20240101_000000_00001_", false)]
    #[case("20240101_000000_00001_ab-de", false)]
    fn test_is_trino_query_id(#[case] candidate: &str, #[case] expected: bool) {
        assert_eq!(is_trino_query_id(candidate), expected);
    }

    #[rstest]
    #[case(
        "/v1/statement/queued/20240101_000000_00001_abcde/y123/1",
        Some("20240101_000000_00001_abcde")
    )]
    #[case(
        "/v1/statement/executing/20240101_000000_00001_abcde/y123/0",
        Some("20240101_000000_00001_abcde")
    )]
    #[case(
        "/ui/api/query/20231125_173754_00083_4sknc",
        Some("20231125_173754_00083_4sknc")
    )]
    #[case("/v1/statement", None)]
    #[case("/v1/info", None)]
    #[case("/", None)]
    fn test_query_id_from_path(#[case] path: &str, #[case] expected: Option<&str>) {
        assert_eq!(query_id_from_path(path), expected);
    }
}
