//! The predicate language routing rules are written in.
//!
//! Conditions are boolean expressions over two receivers, `trinoRequestUser`
//! and `trinoQueryProperties`, which expose the request attribute view.
//! Actions are `result.put(key, value)` statements against the per-request
//! result map. Everything is compiled to an AST at rule-load time; evaluation
//! is pure and never performs I/O.
//!
//! ```text
//! trinoRequestUser.userExistsAndEquals("will") && !trinoQueryProperties.defaultCatalog().isPresent()
//! result.put("routingGroup", "will-group")
//! ```

use std::collections::HashMap;

use snafu::{OptionExt, Snafu};
use trino_gateway_core::attributes::RequestAttributes;

/// The reserved result-map key holding the selected routing group. The
/// identifier `RESULTS_ROUTING_GROUP_KEY` in rule sources names the same slot
/// as the literal string.
pub const RESULTS_ROUTING_GROUP_KEY: &str = "routingGroup";

/// The per-request bag rule actions write into.
pub type ResultMap = HashMap<String, String>;

#[derive(Snafu, Debug)]
pub enum ParseError {
    #[snafu(display("Unexpected character {character:?} at offset {offset}"))]
    UnexpectedCharacter { character: char, offset: usize },

    #[snafu(display("Unexpected end of expression"))]
    UnexpectedEnd {},

    #[snafu(display("Unexpected token {token:?}"))]
    UnexpectedToken { token: String },

    #[snafu(display("Expected {expected:?} but found {found:?}"))]
    ExpectedToken { expected: String, found: String },

    #[snafu(display(
        "Actions must have the form `result.put(key, value)`, got {action:?}"
    ))]
    NotAnAction { action: String },
}

#[derive(Snafu, Debug)]
pub enum EvalError {
    #[snafu(display("Unknown identifier {identifier:?}"))]
    UnknownIdentifier { identifier: String },

    #[snafu(display("Unknown method {method:?} on {receiver}"))]
    UnknownMethod { receiver: String, method: String },

    #[snafu(display("Method {method:?} expects {expected} argument(s), got {got}"))]
    WrongArgumentCount {
        method: String,
        expected: usize,
        got: usize,
    },

    #[snafu(display("Expected a {expected} value, got {got:?}"))]
    TypeMismatch { expected: &'static str, got: Value },

    #[snafu(display("Called get() on an empty optional"))]
    EmptyOptional {},
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Str(String),
    Int(i64),
    /// Result of an optional-valued accessor such as `defaultCatalog()`.
    Optional(Option<String>),
}

impl Value {
    fn as_bool(&self) -> Result<bool, EvalError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => TypeMismatchSnafu {
                expected: "boolean",
                got: other.clone(),
            }
            .fail(),
        }
    }

    fn as_str(&self) -> Result<&str, EvalError> {
        match self {
            Value::Str(s) => Ok(s),
            Value::Optional(Some(s)) => Ok(s),
            other => TypeMismatchSnafu {
                expected: "string",
                got: other.clone(),
            }
            .fail(),
        }
    }

    /// Equality with the unwrapping the rule authors expect: an optional
    /// compares equal to a string when it is present and the contents match,
    /// and equal to `null` when it is absent.
    fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Optional(a), Value::Str(b)) | (Value::Str(b), Value::Optional(a)) => {
                a.as_deref() == Some(b)
            }
            (Value::Optional(a), Value::Null) | (Value::Null, Value::Optional(a)) => a.is_none(),
            (a, b) => a == b,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Value),
    Identifier(String),
    MethodCall {
        target: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
}

/// A compiled `result.put(key, value)` statement.
#[derive(Clone, Debug, PartialEq)]
pub struct Action {
    key: Expr,
    value: Expr,
}

pub fn compile_condition(source: &str) -> Result<Expr, ParseError> {
    let mut parser = Parser::new(source)?;
    let expr = parser.parse_or()?;
    parser.expect_end()?;
    Ok(expr)
}

pub fn compile_action(source: &str) -> Result<Action, ParseError> {
    let mut parser = Parser::new(source)?;
    let expr = parser.parse_or()?;
    parser.expect_end()?;

    match expr {
        Expr::MethodCall {
            target,
            method,
            args,
        } if *target == Expr::Identifier("result".to_string()) && method == "put" => {
            match <[Expr; 2]>::try_from(args) {
                Ok([key, value]) => Ok(Action { key, value }),
                Err(_) => NotAnActionSnafu { action: source }.fail(),
            }
        }
        _ => NotAnActionSnafu { action: source }.fail(),
    }
}

pub fn evaluate_condition(
    condition: &Expr,
    attributes: &RequestAttributes,
) -> Result<bool, EvalError> {
    evaluate(condition, attributes)?.as_bool()
}

impl Action {
    pub fn execute(
        &self,
        attributes: &RequestAttributes,
        result: &mut ResultMap,
    ) -> Result<(), EvalError> {
        let key = evaluate(&self.key, attributes)?.as_str()?.to_string();
        let value = evaluate(&self.value, attributes)?.as_str()?.to_string();
        result.insert(key, value);
        Ok(())
    }
}

fn evaluate(expr: &Expr, attributes: &RequestAttributes) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Identifier(identifier) => match identifier.as_str() {
            "RESULTS_ROUTING_GROUP_KEY" => Ok(Value::Str(RESULTS_ROUTING_GROUP_KEY.to_string())),
            _ => UnknownIdentifierSnafu { identifier }.fail(),
        },
        Expr::MethodCall {
            target,
            method,
            args,
        } => {
            let args = args
                .iter()
                .map(|arg| evaluate(arg, attributes))
                .collect::<Result<Vec<_>, _>>()?;

            match target.as_ref() {
                Expr::Identifier(receiver) if receiver == "trinoRequestUser" => {
                    call_request_user(attributes, method, &args)
                }
                Expr::Identifier(receiver) if receiver == "trinoQueryProperties" => {
                    call_query_properties(attributes, method, &args)
                }
                target => {
                    let value = evaluate(target, attributes)?;
                    call_value_method(&value, method, &args)
                }
            }
        }
        Expr::Not(inner) => Ok(Value::Bool(!evaluate(inner, attributes)?.as_bool()?)),
        Expr::And(left, right) => {
            // Short-circuiting, like the boolean operators rule authors know.
            if !evaluate(left, attributes)?.as_bool()? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(evaluate(right, attributes)?.as_bool()?))
        }
        Expr::Or(left, right) => {
            if evaluate(left, attributes)?.as_bool()? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(evaluate(right, attributes)?.as_bool()?))
        }
        Expr::Eq(left, right) => Ok(Value::Bool(
            evaluate(left, attributes)?.loosely_equals(&evaluate(right, attributes)?),
        )),
        Expr::Ne(left, right) => Ok(Value::Bool(
            !evaluate(left, attributes)?.loosely_equals(&evaluate(right, attributes)?),
        )),
    }
}

fn single_string_arg<'a>(method: &str, args: &'a [Value]) -> Result<&'a str, EvalError> {
    if args.len() != 1 {
        return WrongArgumentCountSnafu {
            method,
            expected: 1usize,
            got: args.len(),
        }
        .fail();
    }
    args[0].as_str()
}

fn no_args(method: &str, args: &[Value]) -> Result<(), EvalError> {
    if !args.is_empty() {
        return WrongArgumentCountSnafu {
            method,
            expected: 0usize,
            got: args.len(),
        }
        .fail();
    }
    Ok(())
}

fn call_request_user(
    attributes: &RequestAttributes,
    method: &str,
    args: &[Value],
) -> Result<Value, EvalError> {
    match method {
        "user" => {
            no_args(method, args)?;
            Ok(Value::Optional(attributes.user.clone()))
        }
        "userExistsAndEquals" => Ok(Value::Bool(
            attributes.user_exists_and_equals(single_string_arg(method, args)?),
        )),
        "sourceExistsAndEquals" => Ok(Value::Bool(
            attributes.source_exists_and_equals(single_string_arg(method, args)?),
        )),
        "clientTagsContain" | "clientTagsContains" => Ok(Value::Bool(
            attributes.client_tags_contain(single_string_arg(method, args)?),
        )),
        _ => UnknownMethodSnafu {
            receiver: "trinoRequestUser",
            method,
        }
        .fail(),
    }
}

fn call_query_properties(
    attributes: &RequestAttributes,
    method: &str,
    args: &[Value],
) -> Result<Value, EvalError> {
    match method {
        "tablesContain" | "tablesContains" => Ok(Value::Bool(
            attributes.tables_contain(single_string_arg(method, args)?),
        )),
        "catalogsContain" | "catalogsContains" => Ok(Value::Bool(
            attributes.catalogs_contain(single_string_arg(method, args)?),
        )),
        "schemasContain" | "schemasContains" => Ok(Value::Bool(
            attributes.schemas_contain(single_string_arg(method, args)?),
        )),
        "catalogSchemasContain" | "catalogSchemasContains" => Ok(Value::Bool(
            attributes.catalog_schemas_contain(single_string_arg(method, args)?),
        )),
        "queryType" => {
            no_args(method, args)?;
            Ok(Value::Str(attributes.query_type_str().to_string()))
        }
        "resourceGroupQueryType" => {
            no_args(method, args)?;
            Ok(Value::Str(
                attributes.resource_group_query_type_str().to_string(),
            ))
        }
        "defaultCatalog" => {
            no_args(method, args)?;
            Ok(Value::Optional(attributes.default_catalog.clone()))
        }
        "defaultSchema" => {
            no_args(method, args)?;
            Ok(Value::Optional(attributes.default_schema.clone()))
        }
        _ => UnknownMethodSnafu {
            receiver: "trinoQueryProperties",
            method,
        }
        .fail(),
    }
}

fn call_value_method(value: &Value, method: &str, args: &[Value]) -> Result<Value, EvalError> {
    match method {
        "isPresent" => {
            no_args(method, args)?;
            match value {
                Value::Optional(option) => Ok(Value::Bool(option.is_some())),
                other => TypeMismatchSnafu {
                    expected: "optional",
                    got: other.clone(),
                }
                .fail(),
            }
        }
        "get" => {
            no_args(method, args)?;
            match value {
                Value::Optional(Some(s)) => Ok(Value::Str(s.clone())),
                Value::Optional(None) => EmptyOptionalSnafu {}.fail(),
                other => TypeMismatchSnafu {
                    expected: "optional",
                    got: other.clone(),
                }
                .fail(),
            }
        }
        "equalsIgnoreCase" => {
            let candidate = single_string_arg(method, args)?;
            Ok(Value::Bool(value.as_str()?.eq_ignore_ascii_case(candidate)))
        }
        _ => UnknownMethodSnafu {
            receiver: "value",
            method,
        }
        .fail(),
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Token {
    Identifier(String),
    Str(String),
    Int(i64),
    Symbol(&'static str),
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn new(source: &str) -> Result<Self, ParseError> {
        Ok(Self {
            tokens: lex(source)?,
            position: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Result<Token, ParseError> {
        let token = self.tokens.get(self.position).context(UnexpectedEndSnafu)?;
        self.position += 1;
        Ok(token.clone())
    }

    fn eat_symbol(&mut self, symbol: &str) -> bool {
        if self.peek() == Some(&Token::Symbol(lookup_symbol(symbol))) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn expect_symbol(&mut self, symbol: &'static str) -> Result<(), ParseError> {
        match self.next()? {
            Token::Symbol(s) if s == symbol => Ok(()),
            token => ExpectedTokenSnafu {
                expected: symbol,
                found: format!("{token:?}"),
            }
            .fail(),
        }
    }

    fn expect_end(&self) -> Result<(), ParseError> {
        match self.peek() {
            None => Ok(()),
            Some(token) => UnexpectedTokenSnafu {
                token: format!("{token:?}"),
            }
            .fail(),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.eat_symbol("||") {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_equality()?;
        while self.eat_symbol("&&") {
            let right = self.parse_equality()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_unary()?;
        if self.eat_symbol("==") {
            let right = self.parse_unary()?;
            return Ok(Expr::Eq(Box::new(left), Box::new(right)));
        }
        if self.eat_symbol("!=") {
            let right = self.parse_unary()?;
            return Ok(Expr::Ne(Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat_symbol("!") {
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_postfix()
    }

    /// A primary expression followed by any number of `.method(args)` calls.
    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;

        while self.eat_symbol(".") {
            let method = match self.next()? {
                Token::Identifier(name) => name,
                token => ExpectedTokenSnafu {
                    expected: "method name",
                    found: format!("{token:?}"),
                }
                .fail()?,
            };

            self.expect_symbol("(")?;
            let mut args = Vec::new();
            if !self.eat_symbol(")") {
                loop {
                    args.push(self.parse_or()?);
                    if self.eat_symbol(")") {
                        break;
                    }
                    self.expect_symbol(",")?;
                }
            }

            expr = Expr::MethodCall {
                target: Box::new(expr),
                method,
                args,
            };
        }

        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.next()? {
            Token::Str(s) => Ok(Expr::Literal(Value::Str(s))),
            Token::Int(i) => Ok(Expr::Literal(Value::Int(i))),
            Token::Identifier(identifier) => match identifier.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => Ok(Expr::Identifier(identifier)),
            },
            Token::Symbol("(") => {
                let expr = self.parse_or()?;
                self.expect_symbol(")")?;
                Ok(expr)
            }
            token => UnexpectedTokenSnafu {
                token: format!("{token:?}"),
            }
            .fail(),
        }
    }
}

/// Maps a symbol to its interned spelling so tokens can hold `&'static str`.
fn lookup_symbol(symbol: &str) -> &'static str {
    match symbol {
        "&&" => "&&",
        "||" => "||",
        "==" => "==",
        "!=" => "!=",
        "!" => "!",
        "(" => "(",
        ")" => ")",
        "," => ",",
        "." => ".",
        _ => unreachable!("symbol table covers every caller"),
    }
}

fn lex(source: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let chars = source.char_indices().collect::<Vec<_>>();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' | ')' | ',' | '.' => {
                tokens.push(Token::Symbol(lookup_symbol(&c.to_string())));
                i += 1;
            }
            '&' | '|' => {
                if chars.get(i + 1).map(|(_, next)| *next) == Some(c) {
                    tokens.push(Token::Symbol(if c == '&' { "&&" } else { "||" }));
                    i += 2;
                } else {
                    return UnexpectedCharacterSnafu {
                        character: c,
                        offset,
                    }
                    .fail();
                }
            }
            '=' | '!' => {
                if chars.get(i + 1).map(|(_, next)| *next) == Some('=') {
                    tokens.push(Token::Symbol(if c == '=' { "==" } else { "!=" }));
                    i += 2;
                } else if c == '!' {
                    tokens.push(Token::Symbol("!"));
                    i += 1;
                } else {
                    return UnexpectedCharacterSnafu {
                        character: c,
                        offset,
                    }
                    .fail();
                }
            }
            quote @ ('"' | '\'') => {
                let mut value = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while j < chars.len() {
                    let (_, c) = chars[j];
                    if c == quote {
                        closed = true;
                        break;
                    }
                    value.push(c);
                    j += 1;
                }
                if !closed {
                    return UnexpectedEndSnafu {}.fail();
                }
                tokens.push(Token::Str(value));
                i = j + 1;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut number = c.to_string();
                let mut j = i + 1;
                while j < chars.len() && chars[j].1.is_ascii_digit() {
                    number.push(chars[j].1);
                    j += 1;
                }
                let value = number.parse().ok().context(UnexpectedCharacterSnafu {
                    character: c,
                    offset,
                })?;
                tokens.push(Token::Int(value));
                i = j;
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut identifier = c.to_string();
                let mut j = i + 1;
                while j < chars.len() && (chars[j].1.is_alphanumeric() || chars[j].1 == '_') {
                    identifier.push(chars[j].1);
                    j += 1;
                }
                tokens.push(Token::Identifier(identifier));
                i = j;
            }
            c => {
                return UnexpectedCharacterSnafu {
                    character: c,
                    offset,
                }
                .fail()
            }
        }
    }

    Ok(tokens)
}
