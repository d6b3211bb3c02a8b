//! The read-only view of a Trino HTTP request that routing rules are
//! evaluated against.

use std::collections::{BTreeSet, HashMap};

use http::{HeaderMap, Method};
use percent_encoding::percent_decode_str;
use tracing::debug;

use crate::sql::{self, QueryType, ResourceGroupQueryType};

pub const TRINO_USER_HEADER: &str = "x-trino-user";
pub const TRINO_SOURCE_HEADER: &str = "x-trino-source";
pub const TRINO_CLIENT_TAGS_HEADER: &str = "x-trino-client-tags";
pub const TRINO_CLIENT_INFO_HEADER: &str = "x-trino-client-info";
pub const TRINO_CATALOG_HEADER: &str = "x-trino-catalog";
pub const TRINO_SCHEMA_HEADER: &str = "x-trino-schema";
pub const TRINO_PREPARED_STATEMENT_HEADER: &str = "x-trino-prepared-statement";

/// Everything the rules engine may look at. Identifier sets are fully
/// qualified; references whose qualification failed for lack of a default
/// catalog/schema end up in `unqualified` and nowhere else.
#[derive(Clone, Debug, Default)]
pub struct RequestAttributes {
    pub user: Option<String>,
    pub source: Option<String>,
    pub client_tags: BTreeSet<String>,
    pub client_info: Option<String>,

    pub default_catalog: Option<String>,
    pub default_schema: Option<String>,
    pub prepared_statements: HashMap<String, String>,

    pub query_type: QueryType,
    pub resource_group_query_type: ResourceGroupQueryType,

    pub catalogs: BTreeSet<String>,
    pub schemas: BTreeSet<String>,
    pub catalog_schemas: BTreeSet<String>,
    pub tables: BTreeSet<String>,
    pub unqualified: BTreeSet<String>,

    /// Retained for the query history sink. Not exposed to rules.
    pub raw_sql: Option<String>,
}

impl RequestAttributes {
    /// The view for everything that is not a new statement: only the client
    /// identity is of interest.
    pub fn minimal(headers: &HeaderMap) -> Self {
        Self {
            user: header_string(headers, TRINO_USER_HEADER),
            ..Self::default()
        }
    }

    /// The full view for a `POST /v1/statement` request whose body is `sql`.
    pub fn from_statement(headers: &HeaderMap, sql: &str) -> Self {
        let mut attributes = Self {
            user: header_string(headers, TRINO_USER_HEADER),
            source: header_string(headers, TRINO_SOURCE_HEADER),
            client_tags: header_string(headers, TRINO_CLIENT_TAGS_HEADER)
                .map(|tags| {
                    tags.split(',')
                        .map(str::trim)
                        .filter(|tag| !tag.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            client_info: header_string(headers, TRINO_CLIENT_INFO_HEADER),
            default_catalog: header_string(headers, TRINO_CATALOG_HEADER),
            default_schema: header_string(headers, TRINO_SCHEMA_HEADER),
            prepared_statements: prepared_statements_from_headers(headers),
            raw_sql: Some(sql.to_string()),
            ..Self::default()
        };

        let mut summary = sql::summarize(sql);

        // EXECUTE references a prepared statement; the routing-relevant facts
        // are those of the statement it prepares.
        if summary.query_type == QueryType::Execute {
            match summary
                .execute_target
                .as_ref()
                .and_then(|name| attributes.prepared_statements.get(name))
            {
                Some(prepared_sql) => summary = sql::summarize(prepared_sql),
                None => debug!(
                    statement = ?summary.execute_target,
                    "EXECUTE references an unknown prepared statement"
                ),
            }
        }

        attributes.query_type = summary.query_type;
        attributes.resource_group_query_type = summary.query_type.into();

        for table_ref in &summary.table_refs {
            attributes.add_table_ref(table_ref);
        }
        for schema_ref in &summary.schema_refs {
            attributes.add_schema_ref(schema_ref);
        }

        attributes
    }

    /// Dispatch on the request shape: only a statement POST carries SQL.
    pub fn from_request(
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        body: Option<&str>,
    ) -> Self {
        match body {
            Some(sql) if method == Method::POST && path.starts_with("/v1/statement") => {
                Self::from_statement(headers, sql)
            }
            _ => Self::minimal(headers),
        }
    }

    fn add_table_ref(&mut self, parts: &[String]) {
        match parts {
            [catalog, schema, table] => {
                self.record_table(catalog.clone(), schema.clone(), table.clone())
            }
            [schema, table] => match self.default_catalog.clone() {
                Some(catalog) => self.record_table(catalog, schema.clone(), table.clone()),
                None => {
                    self.unqualified.insert(parts.join("."));
                }
            },
            [table] => match (self.default_catalog.clone(), self.default_schema.clone()) {
                (Some(catalog), Some(schema)) => {
                    self.record_table(catalog, schema, table.clone())
                }
                _ => {
                    self.unqualified.insert(table.clone());
                }
            },
            _ => {}
        }
    }

    fn add_schema_ref(&mut self, parts: &[String]) {
        match parts {
            [catalog, schema] => self.record_schema(catalog.clone(), schema.clone()),
            [schema] => match self.default_catalog.clone() {
                Some(catalog) => self.record_schema(catalog, schema.clone()),
                None => {
                    self.unqualified.insert(schema.clone());
                }
            },
            _ => {}
        }
    }

    fn record_table(&mut self, catalog: String, schema: String, table: String) {
        self.tables.insert(format!("{catalog}.{schema}.{table}"));
        self.record_schema(catalog, schema);
    }

    fn record_schema(&mut self, catalog: String, schema: String) {
        self.catalog_schemas.insert(format!("{catalog}.{schema}"));
        self.catalogs.insert(catalog);
        self.schemas.insert(schema);
    }

    pub fn user_exists_and_equals(&self, candidate: &str) -> bool {
        self.user.as_deref() == Some(candidate)
    }

    pub fn source_exists_and_equals(&self, candidate: &str) -> bool {
        self.source.as_deref() == Some(candidate)
    }

    pub fn client_tags_contain(&self, tag: &str) -> bool {
        self.client_tags.contains(tag)
    }

    pub fn tables_contain(&self, table: &str) -> bool {
        self.tables.contains(table)
    }

    pub fn catalogs_contain(&self, catalog: &str) -> bool {
        self.catalogs.contains(catalog)
    }

    pub fn schemas_contain(&self, schema: &str) -> bool {
        self.schemas.contains(schema)
    }

    pub fn catalog_schemas_contain(&self, catalog_schema: &str) -> bool {
        self.catalog_schemas.contains(catalog_schema)
    }

    pub fn query_type_str(&self) -> &'static str {
        self.query_type.into()
    }

    pub fn resource_group_query_type_str(&self) -> &'static str {
        self.resource_group_query_type.into()
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(String::from)
}

/// `X-Trino-Prepared-Statement` carries comma-joined `name=sql` pairs, both
/// sides URL-encoded by the client.
fn prepared_statements_from_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut prepared = HashMap::new();

    for value in headers.get_all(TRINO_PREPARED_STATEMENT_HEADER) {
        let Ok(value) = value.to_str() else {
            debug!("Skipping non-UTF8 prepared statement header");
            continue;
        };

        for pair in value.split(',') {
            let Some((name, sql)) = pair.split_once('=') else {
                debug!(pair, "Skipping malformed prepared statement entry");
                continue;
            };
            prepared.insert(url_decode(name.trim()), url_decode(sql.trim()));
        }
    }

    prepared
}

/// Form-style URL decoding: `+` is a space, the rest is percent-decoded.
fn url_decode(value: &str) -> String {
    let value = value.replace('+', " ");
    percent_decode_str(&value).decode_utf8_lossy().into_owned()
}
