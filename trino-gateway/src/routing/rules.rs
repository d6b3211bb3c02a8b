//! Loading, compilation and evaluation of the routing rules file.
//!
//! The rules file is a stream of YAML documents. Every condition and action
//! is compiled when the file is loaded; a file that does not compile is
//! rejected as a whole, so a half-broken rule set can never become active.
//! Reloads (SIGHUP) swap the compiled set in atomically, evaluations that
//! already started keep the snapshot they loaded.

use std::{
    cmp::Reverse,
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use arc_swap::ArcSwap;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use tracing::{debug, info, instrument, warn};
use trino_gateway_core::attributes::RequestAttributes;

use crate::routing::expression::{
    self, Action, Expr, ResultMap, RESULTS_ROUTING_GROUP_KEY,
};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Failed to read rules file at {rules_file:?}"))]
    ReadRulesFile {
        source: std::io::Error,
        rules_file: PathBuf,
    },

    #[snafu(display("Failed to parse rules file document {document_index}"))]
    ParseRuleDocument {
        source: serde_yaml::Error,
        document_index: usize,
    },

    #[snafu(display("Rule name {rule_name:?} is used more than once"))]
    DuplicateRuleName { rule_name: String },

    #[snafu(display("Failed to compile condition of rule {rule_name:?}"))]
    CompileCondition {
        source: expression::ParseError,
        rule_name: String,
    },

    #[snafu(display("Failed to compile action {action:?} of rule {rule_name:?}"))]
    CompileAction {
        source: expression::ParseError,
        rule_name: String,
        action: String,
    },
}

/// One YAML document of the rules file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuleDefinition {
    name: String,

    #[allow(dead_code)]
    description: Option<String>,

    #[serde(default)]
    priority: i64,

    condition: String,

    #[serde(default)]
    actions: Vec<String>,
}

struct CompiledRule {
    name: String,
    condition: Expr,
    actions: Vec<Action>,
}

/// An immutable, fully compiled rule set, sorted by priority descending with
/// source order breaking ties.
#[derive(Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    pub fn parse(content: &str) -> Result<Self, Error> {
        let mut definitions = Vec::new();
        for (document_index, document) in serde_yaml::Deserializer::from_str(content).enumerate() {
            let value: serde_yaml::Value = serde_yaml::Value::deserialize(document)
                .context(ParseRuleDocumentSnafu { document_index })?;
            // Empty documents (e.g. a trailing `---`) are fine.
            if value.is_null() {
                continue;
            }
            let definition: RuleDefinition = serde_yaml::from_value(value)
                .context(ParseRuleDocumentSnafu { document_index })?;
            definitions.push(definition);
        }

        let mut names_seen = HashSet::new();
        let mut rules = Vec::with_capacity(definitions.len());
        for definition in &definitions {
            if !names_seen.insert(&definition.name) {
                DuplicateRuleNameSnafu {
                    rule_name: &definition.name,
                }
                .fail()?;
            }

            let condition =
                expression::compile_condition(&definition.condition).context(
                    CompileConditionSnafu {
                        rule_name: &definition.name,
                    },
                )?;

            let mut actions = Vec::with_capacity(definition.actions.len());
            for action in &definition.actions {
                actions.push(expression::compile_action(action).context(CompileActionSnafu {
                    rule_name: &definition.name,
                    action,
                })?);
            }

            rules.push((
                definition.priority,
                CompiledRule {
                    name: definition.name.clone(),
                    condition,
                    actions,
                },
            ));
        }

        // Stable sort: equal priorities stay in source order.
        rules.sort_by_key(|(priority, _)| Reverse(*priority));

        Ok(Self {
            rules: rules.into_iter().map(|(_, rule)| rule).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluates every rule in order. All matching rules fire, so a later
    /// (lower-priority) rule can overwrite the group an earlier one assigned.
    /// A rule whose condition or action errors behaves like one returning
    /// false; evaluation always continues.
    #[instrument(skip_all)]
    pub fn evaluate(&self, attributes: &RequestAttributes) -> Option<String> {
        let mut result = ResultMap::new();

        for rule in &self.rules {
            match expression::evaluate_condition(&rule.condition, attributes) {
                Ok(true) => {
                    debug!(rule = rule.name, "Rule matched");
                    for action in &rule.actions {
                        if let Err(error) = action.execute(attributes, &mut result) {
                            warn!(rule = rule.name, ?error, "Rule action failed, skipping it");
                        }
                    }
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(
                        rule = rule.name,
                        ?error,
                        "Rule condition failed to evaluate, treating it as false"
                    );
                }
            }
        }

        result.remove(RESULTS_ROUTING_GROUP_KEY)
    }
}

/// Owns the rules file path and the atomically swappable compiled snapshot.
pub struct RulesEngine {
    rules_file: PathBuf,
    rule_set: ArcSwap<RuleSet>,
}

impl RulesEngine {
    #[instrument]
    pub fn from_file(rules_file: &Path) -> Result<Self, Error> {
        let rule_set = load(rules_file)?;
        info!(
            ?rules_file,
            rule_count = rule_set.len(),
            "Loaded routing rules"
        );

        Ok(Self {
            rules_file: rules_file.to_path_buf(),
            rule_set: ArcSwap::from_pointee(rule_set),
        })
    }

    /// The snapshot to evaluate against. Taken once per request so a reload
    /// mid-evaluation cannot mix two rule sets.
    pub fn current(&self) -> Arc<RuleSet> {
        self.rule_set.load_full()
    }

    /// Re-reads and re-compiles the rules file. The new set only becomes
    /// active when it compiled completely; otherwise the old set stays.
    #[instrument(skip(self))]
    pub fn reload(&self) -> Result<usize, Error> {
        let rule_set = load(&self.rules_file)?;
        let rule_count = rule_set.len();
        self.rule_set.store(Arc::new(rule_set));

        Ok(rule_count)
    }
}

#[cfg(test)]
impl RulesEngine {
    /// Engine around an already compiled rule set, for selector tests.
    pub(crate) fn from_rule_set(rule_set: RuleSet) -> Self {
        Self {
            rules_file: PathBuf::new(),
            rule_set: ArcSwap::from_pointee(rule_set),
        }
    }
}

fn load(rules_file: &Path) -> Result<RuleSet, Error> {
    let content = std::fs::read_to_string(rules_file).context(ReadRulesFileSnafu { rules_file })?;
    RuleSet::parse(&content)
}

/// Reloads the rule set whenever the process receives SIGHUP. A failed reload
/// keeps the previous rule set active.
pub fn spawn_reload_on_sighup(engine: Arc<RulesEngine>) {
    #[cfg(unix)]
    tokio::spawn(async move {
        let mut hangups =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(hangups) => hangups,
                Err(error) => {
                    warn!(?error, "Failed to install SIGHUP handler, rules will not reload");
                    return;
                }
            };

        while hangups.recv().await.is_some() {
            match engine.reload() {
                Ok(rule_count) => info!(rule_count, "Reloaded routing rules"),
                Err(error) => warn!(
                    ?error,
                    "Failed to reload routing rules, keeping the previous rule set"
                ),
            }
        }
    });

    #[cfg(not(unix))]
    drop(engine);
}

#[cfg(test)]
mod tests {
    use http::{HeaderMap, HeaderName, HeaderValue};
    use indoc::indoc;

    use super::*;

    fn attributes(header_pairs: &[(&str, &str)], sql: &str) -> RequestAttributes {
        let mut headers = HeaderMap::new();
        for (name, value) in header_pairs {
            headers.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        RequestAttributes::from_statement(&headers, sql)
    }

    #[test]
    fn test_user_rule_routing() {
        let rules = RuleSet::parse(indoc! {r#"
            name: route-will
            description: Will gets his own group
            condition: trinoRequestUser.userExistsAndEquals("will")
            actions:
              - result.put("routingGroup", "will-group")
        "#})
        .unwrap();

        assert_eq!(
            rules.evaluate(&attributes(&[("x-trino-user", "will")], "SELECT 1")),
            Some("will-group".to_string())
        );
        assert_eq!(
            rules.evaluate(&attributes(&[("x-trino-user", "bob")], "SELECT 1")),
            None
        );
    }

    #[test]
    fn test_table_rule_via_prepared_statement() {
        let rules = RuleSet::parse(indoc! {r#"
            name: statement-header-rule
            condition: trinoQueryProperties.tablesContains("cat.schem.foo")
            actions:
              - result.put("routingGroup", "statement-header-group")
        "#})
        .unwrap();

        let attributes = attributes(
            &[
                ("x-trino-catalog", "cat"),
                ("x-trino-schema", "schem"),
                ("x-trino-prepared-statement", "stmt1=SELECT+%2A+FROM+foo"),
            ],
            "EXECUTE stmt1 USING 1",
        );

        assert_eq!(
            rules.evaluate(&attributes),
            Some("statement-header-group".to_string())
        );
    }

    #[test]
    fn test_all_matching_rules_fire_in_priority_order() {
        // Priority sorts descending, all matching rules fire, a later rule
        // overwrites the slot.
        let rules = RuleSet::parse(indoc! {r#"
            name: specific
            priority: 10
            condition: trinoRequestUser.userExistsAndEquals("will")
            actions:
              - result.put("routingGroup", "will-group")
            ---
            name: catch-all
            priority: -1
            condition: "true"
            actions:
              - result.put(RESULTS_ROUTING_GROUP_KEY, "no-match")
        "#})
        .unwrap();

        assert_eq!(
            rules.evaluate(&attributes(&[("x-trino-user", "will")], "SELECT 1")),
            Some("no-match".to_string())
        );
        assert_eq!(
            rules.evaluate(&attributes(&[], "SELECT 1")),
            Some("no-match".to_string())
        );
    }

    #[test]
    fn test_catch_all_assigns_no_match() {
        let rules = RuleSet::parse(indoc! {r#"
            name: catch-all
            priority: -1
            condition: "true"
            actions:
              - result.put(RESULTS_ROUTING_GROUP_KEY, "no-match")
        "#})
        .unwrap();

        assert_eq!(
            rules.evaluate(&attributes(&[], "SELECT 1")),
            Some("no-match".to_string())
        );
    }

    #[test]
    fn test_source_order_breaks_priority_ties() {
        let rules = RuleSet::parse(indoc! {r#"
            name: first
            condition: "true"
            actions:
              - result.put("routingGroup", "first-group")
            ---
            name: second
            condition: "true"
            actions:
              - result.put("routingGroup", "second-group")
        "#})
        .unwrap();

        assert_eq!(
            rules.evaluate(&attributes(&[], "SELECT 1")),
            Some("second-group".to_string())
        );
    }

    #[test]
    fn test_condition_error_behaves_like_false() {
        // get() on the absent default catalog errors; the rule must behave
        // exactly like one whose condition returned false.
        let rules = RuleSet::parse(indoc! {r#"
            name: defaults-group
            condition: trinoQueryProperties.defaultCatalog().get() == "cat"
            actions:
              - result.put("routingGroup", "defaults-group")
            ---
            name: fallback
            priority: -1
            condition: "true"
            actions:
              - result.put("routingGroup", "no-match")
        "#})
        .unwrap();

        assert_eq!(
            rules.evaluate(&attributes(&[], "SELECT 1")),
            Some("no-match".to_string())
        );

        // With the default catalog present the condition evaluates cleanly.
        let single = RuleSet::parse(indoc! {r#"
            name: defaults-group
            condition: trinoQueryProperties.defaultCatalog().get() == "cat"
            actions:
              - result.put("routingGroup", "defaults-group")
        "#})
        .unwrap();
        assert_eq!(
            single.evaluate(&attributes(&[("x-trino-catalog", "cat")], "SELECT 1")),
            Some("defaults-group".to_string())
        );
    }

    #[test]
    fn test_duplicate_rule_name_rejected() {
        let result = RuleSet::parse(indoc! {r#"
            name: twice
            condition: "true"
            ---
            name: twice
            condition: "false"
        "#});

        assert!(matches!(result, Err(Error::DuplicateRuleName { .. })));
    }

    #[test]
    fn test_broken_condition_rejected_at_compile_time() {
        let result = RuleSet::parse(indoc! {r#"
            name: broken
            condition: "trinoRequestUser.userExistsAndEquals("
        "#});

        assert!(matches!(result, Err(Error::CompileCondition { .. })));
    }

    #[test]
    fn test_broken_action_rejected_at_compile_time() {
        let result = RuleSet::parse(indoc! {r#"
            name: broken
            condition: "true"
            actions:
              - result.get("routingGroup")
        "#});

        assert!(matches!(result, Err(Error::CompileAction { .. })));
    }

    #[test]
    fn test_empty_documents_are_skipped() {
        let rules = RuleSet::parse("---\n").unwrap();
        assert!(rules.is_empty());
        assert_eq!(rules.evaluate(&attributes(&[], "SELECT 1")), None);
    }
}
