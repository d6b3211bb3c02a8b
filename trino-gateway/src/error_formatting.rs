pub fn snafu_error_to_string<E: std::error::Error>(err: &E) -> String {
    let mut result = format!("{err}");
    let mut source = err.source();
    while let Some(err) = source {
        result.push_str(format!(": {err}").as_str());
        source = err.source();
    }

    result
}

#[cfg(test)]
mod tests {
    use snafu::Snafu;

    use super::*;

    #[derive(Snafu, Debug)]
    #[snafu(display("Failed to pick backend for routing group {group:?}"))]
    struct PickError {
        source: std::io::Error,
        group: String,
    }

    #[test]
    fn test_error_chain_formatting() {
        let err = PickError {
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused"),
            group: "adhoc".to_string(),
        };

        assert_eq!(
            snafu_error_to_string(&err),
            "Failed to pick backend for routing group \"adhoc\": connection refused"
        );
    }
}
