//! Routing group selection: given the attribute view of a new statement,
//! decide which group of backends should run it.

use std::sync::Arc;

use enum_dispatch::enum_dispatch;
use http::HeaderMap;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::instrument;
use trino_gateway_core::{
    attributes::RequestAttributes,
    config::{RoutingRulesConfig, SelectorConfig},
};

pub mod expression;
pub mod header;
pub mod rules;

pub use header::{HeaderSelector, TRINO_ROUTING_GROUP_HEADER};
pub use rules::RulesEngine;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Failed to load the routing rules"))]
    CreateRulesEngine { source: rules::Error },

    #[snafu(display(
        "Configuration error: `routingRules.rulesConfigPath` must be set for the \
         {selector:?} selector"
    ))]
    RulesConfigPathMissing { selector: String },
}

/// Selection is a pure function of the request and the current rule-set
/// snapshot: no I/O, no blocking, no await. `None` means "use the default
/// group".
#[enum_dispatch(RoutingGroupSelectorImplementation)]
pub trait RoutingGroupSelector {
    fn select(&self, headers: &HeaderMap, attributes: &RequestAttributes) -> Option<String>;
}

#[enum_dispatch]
pub enum RoutingGroupSelectorImplementation {
    Header(HeaderSelector),
    RulesEngine(RulesEngineSelector),
    HeaderWithRulesFallback(HeaderWithRulesFallbackSelector),
}

/// Ignores the routing-group header entirely; the rules decide.
pub struct RulesEngineSelector {
    engine: Arc<RulesEngine>,
}

impl RoutingGroupSelector for RulesEngineSelector {
    #[instrument(name = "RulesEngineSelector::select", skip_all)]
    fn select(&self, _headers: &HeaderMap, attributes: &RequestAttributes) -> Option<String> {
        self.engine.current().evaluate(attributes)
    }
}

/// Honors the routing-group header when present, otherwise asks the rules.
pub struct HeaderWithRulesFallbackSelector {
    header: HeaderSelector,
    engine: Arc<RulesEngine>,
}

impl RoutingGroupSelector for HeaderWithRulesFallbackSelector {
    #[instrument(name = "HeaderWithRulesFallbackSelector::select", skip_all)]
    fn select(&self, headers: &HeaderMap, attributes: &RequestAttributes) -> Option<String> {
        self.header
            .select(headers, attributes)
            .or_else(|| self.engine.current().evaluate(attributes))
    }
}

/// Builds the configured selector. The rules engine is returned separately so
/// the caller can wire up SIGHUP reloading.
#[instrument]
pub fn selector_from_config(
    config: &RoutingRulesConfig,
) -> Result<
    (
        RoutingGroupSelectorImplementation,
        Option<Arc<RulesEngine>>,
    ),
    Error,
> {
    let selector = config.effective_selector();

    match selector {
        SelectorConfig::Header => Ok((HeaderSelector.into(), None)),
        SelectorConfig::RulesEngine => {
            let engine = build_rules_engine(config, selector)?;
            Ok((
                RulesEngineSelector {
                    engine: Arc::clone(&engine),
                }
                .into(),
                Some(engine),
            ))
        }
        SelectorConfig::HeaderWithRulesFallback => {
            let engine = build_rules_engine(config, selector)?;
            Ok((
                HeaderWithRulesFallbackSelector {
                    header: HeaderSelector,
                    engine: Arc::clone(&engine),
                }
                .into(),
                Some(engine),
            ))
        }
    }
}

fn build_rules_engine(
    config: &RoutingRulesConfig,
    selector: SelectorConfig,
) -> Result<Arc<RulesEngine>, Error> {
    let rules_file = config
        .rules_config_path
        .as_ref()
        .context(RulesConfigPathMissingSnafu {
            selector: format!("{selector:?}"),
        })?;

    Ok(Arc::new(
        RulesEngine::from_file(rules_file).context(CreateRulesEngineSnafu)?,
    ))
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;
    use indoc::indoc;

    use super::*;
    use crate::routing::rules::RuleSet;

    fn rules_engine() -> Arc<RulesEngine> {
        let rule_set = RuleSet::parse(indoc! {r#"
            name: route-will
            condition: trinoRequestUser.userExistsAndEquals("will")
            actions:
              - result.put("routingGroup", "will-group")
        "#})
        .expect("Failed to parse test rules");
        Arc::new(RulesEngine::from_rule_set(rule_set))
    }

    fn will_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-trino-user", HeaderValue::from_static("will"));
        headers
    }

    fn will_attributes() -> RequestAttributes {
        RequestAttributes::from_statement(&will_headers(), "SELECT 1")
    }

    #[test]
    fn test_rules_engine_selector_ignores_header() {
        let selector: RoutingGroupSelectorImplementation = RulesEngineSelector {
            engine: rules_engine(),
        }
        .into();

        let mut headers = will_headers();
        headers.insert(
            TRINO_ROUTING_GROUP_HEADER,
            HeaderValue::from_static("header-group"),
        );

        assert_eq!(
            selector.select(&headers, &will_attributes()).as_deref(),
            Some("will-group")
        );
    }

    #[test]
    fn test_header_with_rules_fallback() {
        let selector: RoutingGroupSelectorImplementation = HeaderWithRulesFallbackSelector {
            header: HeaderSelector,
            engine: rules_engine(),
        }
        .into();

        // Header wins when present.
        let mut headers = will_headers();
        headers.insert(
            TRINO_ROUTING_GROUP_HEADER,
            HeaderValue::from_static("header-group"),
        );
        assert_eq!(
            selector.select(&headers, &will_attributes()).as_deref(),
            Some("header-group")
        );

        // Without the header the rules decide.
        assert_eq!(
            selector
                .select(&will_headers(), &will_attributes())
                .as_deref(),
            Some("will-group")
        );

        // Neither header nor rules match: no opinion.
        assert_eq!(
            selector.select(&HeaderMap::new(), &RequestAttributes::default()),
            None
        );
    }
}
