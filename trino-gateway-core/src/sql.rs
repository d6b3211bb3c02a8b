//! Best-effort extraction of routing-relevant facts from Trino SQL text.
//!
//! This is *not* a SQL parser. Routing decisions only need the statement kind
//! and the referenced identifiers, so a lenient tokenizer is used that never
//! fails on malformed input. Anything it cannot make sense of is simply not
//! reported.

use strum::{EnumString, IntoStaticStr};

/// Statement kind, derived from the leading keyword (after an optional `WITH`
/// prelude).
#[derive(Clone, Copy, Debug, Default, EnumString, Eq, Hash, IntoStaticStr, PartialEq)]
#[strum(ascii_case_insensitive, serialize_all = "UPPERCASE")]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Delete,
    Merge,
    Explain,
    Describe,
    Show,
    Create,
    Drop,
    Alter,
    Use,
    Call,
    Execute,
    #[default]
    Other,
}

/// The coarse classification Trino resource groups use.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceGroupQueryType {
    DataDefinition,
    DataManagement,
    Describe,
    ReadOnly,
    #[default]
    Unknown,
}

impl From<QueryType> for ResourceGroupQueryType {
    fn from(query_type: QueryType) -> Self {
        match query_type {
            QueryType::Create | QueryType::Drop | QueryType::Alter => {
                ResourceGroupQueryType::DataDefinition
            }
            QueryType::Insert | QueryType::Update | QueryType::Delete | QueryType::Merge => {
                ResourceGroupQueryType::DataManagement
            }
            QueryType::Describe | QueryType::Show => ResourceGroupQueryType::Describe,
            QueryType::Select | QueryType::Explain | QueryType::Use => {
                ResourceGroupQueryType::ReadOnly
            }
            QueryType::Call | QueryType::Execute | QueryType::Other => {
                ResourceGroupQueryType::Unknown
            }
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Token {
    /// Unquoted word, case preserved as written. Identifier or keyword.
    Word(String),
    /// `"quoted"` identifier, `""` unescaped, case preserved.
    QuotedIdent(String),
    /// `'string'` literal, `''` unescaped.
    StringLit(String),
    Number(String),
    Symbol(char),
}

impl Token {
    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(word) if word.eq_ignore_ascii_case(keyword))
    }

    fn is_symbol(&self, symbol: char) -> bool {
        matches!(self, Token::Symbol(s) if *s == symbol)
    }

    fn name_part(&self) -> Option<&str> {
        match self {
            Token::Word(word) => Some(word),
            Token::QuotedIdent(ident) => Some(ident),
            _ => None,
        }
    }
}

/// What [`summarize`] could make of a statement. Identifier references are
/// reported as written; qualification against default catalog/schema happens
/// in [`crate::attributes`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SqlSummary {
    pub query_type: QueryType,

    /// Table-level references, each 1 to 3 parts.
    pub table_refs: Vec<Vec<String>>,

    /// Schema-level references (`USE`, `SHOW TABLES FROM`), each 1 to 2 parts.
    pub schema_refs: Vec<Vec<String>>,

    /// Prepared-statement name referenced by `EXECUTE`.
    pub execute_target: Option<String>,
}

/// Tokenizes `sql`, stripping `--` line comments and non-nested `/* ... */`
/// block comments. Never fails; unterminated quotes or comments run to the end
/// of the input.
pub fn tokenize(sql: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '-' if chars.peek() == Some(&'-') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = ' ';
                for c in chars.by_ref() {
                    if previous == '*' && c == '/' {
                        break;
                    }
                    previous = c;
                }
            }
            '"' => tokens.push(Token::QuotedIdent(read_quoted(&mut chars, '"'))),
            '\'' => tokens.push(Token::StringLit(read_quoted(&mut chars, '\''))),
            c if c.is_ascii_digit() => {
                let mut number = c.to_string();
                while let Some(c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '.' {
                        number.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut word = c.to_string();
                while let Some(c) = chars.peek() {
                    if c.is_alphanumeric() || *c == '_' || *c == '$' {
                        word.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(word));
            }
            c if c.is_whitespace() => {}
            c => tokens.push(Token::Symbol(c)),
        }
    }

    tokens
}

/// Reads up to the closing `quote`, unescaping doubled quotes.
fn read_quoted(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, quote: char) -> String {
    let mut value = String::new();
    while let Some(c) = chars.next() {
        if c == quote {
            if chars.peek() == Some(&quote) {
                value.push(quote);
                chars.next();
            } else {
                break;
            }
        } else {
            value.push(c);
        }
    }
    value
}

pub fn summarize(sql: &str) -> SqlSummary {
    let tokens = tokenize(sql);
    let query_type = leading_query_type(&tokens);

    let mut summary = SqlSummary {
        query_type,
        ..SqlSummary::default()
    };

    match query_type {
        QueryType::Use => {
            if let Some((name, _)) = parse_name(&tokens, 1) {
                if name.len() <= 2 {
                    summary.schema_refs.push(name);
                }
            }
        }
        QueryType::Show => {
            // SHOW TABLES FROM|IN <schema>
            if tokens.len() > 3
                && tokens[1].is_keyword("TABLES")
                && (tokens[2].is_keyword("FROM") || tokens[2].is_keyword("IN"))
            {
                if let Some((name, _)) = parse_name(&tokens, 3) {
                    if name.len() <= 2 {
                        summary.schema_refs.push(name);
                    }
                }
            }
        }
        QueryType::Describe => {
            if let Some((name, _)) = parse_name(&tokens, 1) {
                push_table_ref(&mut summary, name);
            }
        }
        QueryType::Execute => {
            summary.execute_target = tokens.get(1).and_then(|t| t.name_part()).map(String::from);
        }
        _ => harvest_identifiers(&tokens, &mut summary),
    }

    summary
}

/// The statement keyword, skipping an optional `WITH` prelude by tracking
/// parenthesis depth: the CTE bodies live inside parentheses, the statement
/// keyword is the first one found at depth zero.
fn leading_query_type(tokens: &[Token]) -> QueryType {
    let Some(first) = tokens.first() else {
        return QueryType::Other;
    };

    if first.is_keyword("WITH") {
        let mut depth = 0i32;
        for token in &tokens[1..] {
            match token {
                Token::Symbol('(') => depth += 1,
                Token::Symbol(')') => depth -= 1,
                Token::Word(word) if depth == 0 => {
                    if let Ok(query_type) = word.parse::<QueryType>() {
                        if matches!(
                            query_type,
                            QueryType::Select
                                | QueryType::Insert
                                | QueryType::Update
                                | QueryType::Delete
                                | QueryType::Merge
                        ) {
                            return query_type;
                        }
                    }
                }
                _ => {}
            }
        }
        return QueryType::Other;
    }

    match first {
        Token::Word(word) => word.parse().unwrap_or(QueryType::Other),
        _ => QueryType::Other,
    }
}

/// Single scan over the token stream collecting every table reference the
/// statement makes, in sub-selects included.
fn harvest_identifiers(tokens: &[Token], summary: &mut SqlSummary) {
    // CREATE/DROP/ALTER may carry modifiers before TABLE (OR REPLACE, ...),
    // so the TABLE keyword is matched anywhere after a DDL statement head.
    let mut pending_ddl = matches!(
        summary.query_type,
        QueryType::Create | QueryType::Drop | QueryType::Alter
    );

    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];

        if token.is_keyword("FROM") || token.is_keyword("JOIN") {
            i = parse_table_list(tokens, i + 1, summary);
            continue;
        }

        if token.is_keyword("INTO")
            && i > 0
            && (tokens[i - 1].is_keyword("INSERT") || tokens[i - 1].is_keyword("MERGE"))
        {
            if let Some((name, next)) = parse_name(tokens, i + 1) {
                push_table_ref(summary, name);
                i = next;
                continue;
            }
        }

        if token.is_keyword("UPDATE") && i == 0 {
            if let Some((name, next)) = parse_name(tokens, i + 1) {
                push_table_ref(summary, name);
                i = next;
                continue;
            }
        }

        if token.is_keyword("TABLE") {
            // Table-valued TABLE(...) wraps a qualified table or function name.
            if tokens.get(i + 1).is_some_and(|t| t.is_symbol('(')) {
                if let Some((name, next)) = parse_name(tokens, i + 2) {
                    push_table_ref(summary, name);
                    i = next;
                    continue;
                }
            } else if pending_ddl {
                let mut j = i + 1;
                // IF EXISTS / IF NOT EXISTS
                while tokens.get(j).is_some_and(|t| {
                    t.is_keyword("IF") || t.is_keyword("NOT") || t.is_keyword("EXISTS")
                }) {
                    j += 1;
                }
                if let Some((name, next)) = parse_name(tokens, j) {
                    push_table_ref(summary, name);
                    pending_ddl = false;
                    i = next;
                    continue;
                }
            }
        }

        i += 1;
    }
}

/// Parses the comma-separated relation list after `FROM` (a single relation
/// after `JOIN` behaves the same, the list just ends at the next keyword).
/// Returns the index scanning should continue at.
fn parse_table_list(tokens: &[Token], mut i: usize, summary: &mut SqlSummary) -> usize {
    loop {
        // A parenthesized relation is a sub-select; its own FROM/JOIN clauses
        // are picked up by the outer scan.
        if tokens.get(i).is_some_and(|t| t.is_symbol('(')) {
            return i + 1;
        }

        // TABLE(...) inside a FROM list is handled by the outer scan too.
        if tokens.get(i).is_some_and(|t| t.is_keyword("TABLE")) {
            return i;
        }

        let Some((name, next)) = parse_name(tokens, i) else {
            return i;
        };

        // A trailing parenthesis makes this a table-function call, e.g.
        // FROM UNNEST(x); those are not table references.
        if tokens.get(next).is_some_and(|t| t.is_symbol('(')) {
            return next + 1;
        }

        push_table_ref(summary, name);
        i = next;

        // Optional alias.
        if tokens.get(i).is_some_and(|t| t.is_keyword("AS")) {
            i += 1;
        }
        if tokens
            .get(i)
            .is_some_and(|t| t.name_part().is_some() && !is_clause_keyword(t))
        {
            i += 1;
        }

        if tokens.get(i).is_some_and(|t| t.is_symbol(',')) {
            i += 1;
        } else {
            return i;
        }
    }
}

/// Parses `part(.part)*` starting at `i`. Returns the parts and the index of
/// the first token after the name.
fn parse_name(tokens: &[Token], mut i: usize) -> Option<(Vec<String>, usize)> {
    let first = tokens.get(i)?;
    if first.name_part().is_none() || is_clause_keyword(first) {
        return None;
    }

    let mut parts = vec![first.name_part()?.to_string()];
    i += 1;

    while tokens.get(i).is_some_and(|t| t.is_symbol('.')) {
        let Some(part) = tokens.get(i + 1).and_then(|t| t.name_part()) else {
            break;
        };
        parts.push(part.to_string());
        i += 2;
    }

    Some((parts, i))
}

fn push_table_ref(summary: &mut SqlSummary, name: Vec<String>) {
    // More than three parts is not a valid table reference, better to report
    // nothing than something wrong.
    if (1..=3).contains(&name.len()) && !summary.table_refs.contains(&name) {
        summary.table_refs.push(name);
    }
}

fn is_clause_keyword(token: &Token) -> bool {
    const CLAUSE_KEYWORDS: [&str; 24] = [
        "SELECT", "WHERE", "GROUP", "ORDER", "HAVING", "LIMIT", "OFFSET", "FETCH", "UNION",
        "EXCEPT", "INTERSECT", "JOIN", "ON", "USING", "LEFT", "RIGHT", "FULL", "INNER", "OUTER",
        "CROSS", "NATURAL", "SET", "VALUES", "TABLESAMPLE",
    ];

    CLAUSE_KEYWORDS
        .iter()
        .any(|keyword| token.is_keyword(keyword))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("SELECT 1", QueryType::Select)]
    #[case("select * from foo", QueryType::Select)]
    #[case("  \n\tSELECT 1", QueryType::Select)]
    #[case("-- leading comment\nSELECT 1", QueryType::Select)]
    #[case("/* block */ INSERT INTO t VALUES (1)", QueryType::Insert)]
    #[case("WITH a AS (SELECT 1) SELECT * FROM a", QueryType::Select)]
    #[case(
        "WITH a AS (SELECT 1), b AS (SELECT 2) INSERT INTO t SELECT * FROM a",
        QueryType::Insert
    )]
    #[case("UPDATE t SET x = 1", QueryType::Update)]
    #[case("DELETE FROM t WHERE x = 1", QueryType::Delete)]
    #[case("MERGE INTO t USING u ON t.id = u.id", QueryType::Merge)]
    #[case("EXPLAIN SELECT 1", QueryType::Explain)]
    #[case("DESCRIBE foo", QueryType::Describe)]
    #[case("SHOW CATALOGS", QueryType::Show)]
    #[case("CREATE TABLE t (x int)", QueryType::Create)]
    #[case("DROP TABLE t", QueryType::Drop)]
    #[case("ALTER TABLE t RENAME TO u", QueryType::Alter)]
    #[case("USE cat.sch", QueryType::Use)]
    #[case("CALL system.flush()", QueryType::Call)]
    #[case("EXECUTE stmt1 USING 1", QueryType::Execute)]
    #[case("GRANT SELECT ON t TO role", QueryType::Other)]
    #[case("", QueryType::Other)]
    #[case("not sql at all ()", QueryType::Other)]
    fn test_query_type(#[case] sql: &str, #[case] expected: QueryType) {
        assert_eq!(summarize(sql).query_type, expected);
    }

    #[rstest]
    #[case(QueryType::Create, ResourceGroupQueryType::DataDefinition)]
    #[case(QueryType::Drop, ResourceGroupQueryType::DataDefinition)]
    #[case(QueryType::Alter, ResourceGroupQueryType::DataDefinition)]
    #[case(QueryType::Insert, ResourceGroupQueryType::DataManagement)]
    #[case(QueryType::Merge, ResourceGroupQueryType::DataManagement)]
    #[case(QueryType::Describe, ResourceGroupQueryType::Describe)]
    #[case(QueryType::Show, ResourceGroupQueryType::Describe)]
    #[case(QueryType::Select, ResourceGroupQueryType::ReadOnly)]
    #[case(QueryType::Explain, ResourceGroupQueryType::ReadOnly)]
    #[case(QueryType::Other, ResourceGroupQueryType::Unknown)]
    fn test_resource_group_query_type(
        #[case] query_type: QueryType,
        #[case] expected: ResourceGroupQueryType,
    ) {
        assert_eq!(ResourceGroupQueryType::from(query_type), expected);
    }

    fn table_refs(sql: &str) -> Vec<Vec<String>> {
        summarize(sql).table_refs
    }

    fn name(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[rstest]
    #[case("SELECT * FROM t", vec![name(&["t"])])]
    #[case("SELECT * FROM s.t", vec![name(&["s", "t"])])]
    #[case("SELECT * FROM c.s.t", vec![name(&["c", "s", "t"])])]
    #[case("SELECT * FROM a, b", vec![name(&["a"]), name(&["b"])])]
    #[case("SELECT * FROM a x, b y", vec![name(&["a"]), name(&["b"])])]
    #[case("SELECT * FROM a AS x JOIN b AS y ON x.id = y.id", vec![name(&["a"]), name(&["b"])])]
    #[case("SELECT * FROM a LEFT OUTER JOIN b ON a.id = b.id", vec![name(&["a"]), name(&["b"])])]
    #[case("SELECT * FROM (SELECT * FROM inner_t) x", vec![name(&["inner_t"])])]
    #[case("SELECT * FROM UNNEST(sequence(1, 3))", vec![])]
    #[case("SELECT * FROM TABLE(c.s.my_function(1))", vec![name(&["c", "s", "my_function"])])]
    #[case("INSERT INTO t SELECT * FROM u", vec![name(&["t"]), name(&["u"])])]
    #[case("UPDATE c.s.t SET x = 1 WHERE y = 2", vec![name(&["c", "s", "t"])])]
    #[case("DELETE FROM t WHERE x = 1", vec![name(&["t"])])]
    #[case("MERGE INTO t USING u ON t.id = u.id", vec![name(&["t"])])]
    #[case("CREATE TABLE t (x int)", vec![name(&["t"])])]
    #[case("CREATE TABLE IF NOT EXISTS s.t (x int)", vec![name(&["s", "t"])])]
    #[case("CREATE TABLE t AS SELECT * FROM u", vec![name(&["t"]), name(&["u"])])]
    #[case("DROP TABLE IF EXISTS t", vec![name(&["t"])])]
    #[case("ALTER TABLE t RENAME TO u", vec![name(&["t"])])]
    #[case("DESCRIBE c.s.t", vec![name(&["c", "s", "t"])])]
    #[case("SELECT * FROM \"Quoted Table\"", vec![name(&["Quoted Table"])])]
    #[case("SELECT * FROM \"with\"\"quote\"", vec![name(&["with\"quote"])])]
    #[case("SELECT * FROM c.\"Mixed Case\".t", vec![name(&["c", "Mixed Case", "t"])])]
    #[case("SELECT * FROM t -- FROM commented_out", vec![name(&["t"])])]
    #[case("SELECT * FROM t /* FROM commented_out */", vec![name(&["t"])])]
    #[case("SELECT 'FROM literal' FROM t", vec![name(&["t"])])]
    #[case("SELECT * FROM t WHERE x = 'a''b'", vec![name(&["t"])])]
    #[case("WITH a AS (SELECT * FROM t) SELECT * FROM a", vec![name(&["t"]), name(&["a"])])]
    #[case("SELECT * FROM t, t", vec![name(&["t"])])]
    #[case("SELECT 1", vec![])]
    #[case("((((", vec![])]
    fn test_table_refs(#[case] sql: &str, #[case] expected: Vec<Vec<String>>) {
        assert_eq!(table_refs(sql), expected);
    }

    #[rstest]
    #[case("USE sch", vec![name(&["sch"])])]
    #[case("USE cat.sch", vec![name(&["cat", "sch"])])]
    #[case("SHOW TABLES FROM sch", vec![name(&["sch"])])]
    #[case("SHOW TABLES IN cat.sch", vec![name(&["cat", "sch"])])]
    #[case("SHOW TABLES", vec![])]
    #[case("SHOW CATALOGS", vec![])]
    fn test_schema_refs(#[case] sql: &str, #[case] expected: Vec<Vec<String>>) {
        assert_eq!(summarize(sql).schema_refs, expected);
    }

    #[test]
    fn test_execute_target() {
        let summary = summarize("EXECUTE stmt1 USING 1");
        assert_eq!(summary.query_type, QueryType::Execute);
        assert_eq!(summary.execute_target.as_deref(), Some("stmt1"));
        assert!(summary.table_refs.is_empty());
    }

    #[test]
    fn test_unterminated_input_does_not_panic() {
        summarize("SELECT * FROM \"unterminated");
        summarize("SELECT '");
        summarize("/* unterminated");
        summarize("SELECT * FROM c.");
    }
}
