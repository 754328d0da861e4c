//! SOQL evaluation for the fake server.
//!
//! Supports the subset the sync targets emit against flat objects:
//! `SELECT <fields> FROM <type> [WHERE <condition>] [ORDER BY <field>
//! [ASC|DESC]] [LIMIT <n>]`. Conditions combine comparisons and `IN` /
//! `NOT IN` lists with `AND`, `OR`, `NOT` and parentheses. Subqueries are
//! rejected.

use mobilesync_protocol::{timestamp, Record, SoqlMutator};
use serde_json::{Map, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Op(String),
    LParen,
    RParen,
    Comma,
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-' | '+')
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            _ if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '\'' => {
                chars.next();
                let mut literal = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => literal.extend(chars.next()),
                        Some('\'') => break,
                        Some(other) => literal.push(other),
                        None => return Err(format!("unterminated literal in `{text}`")),
                    }
                }
                tokens.push(Token::Str(literal));
            }
            '=' | '!' | '<' | '>' => {
                let mut op = String::new();
                while let Some(&next) = chars.peek() {
                    if matches!(next, '=' | '!' | '<' | '>') {
                        op.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Op(op));
            }
            _ if is_word_char(c) => {
                let mut word = String::new();
                while let Some(&next) = chars.peek() {
                    if is_word_char(next) {
                        word.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(word));
            }
            _ => return Err(format!("unexpected `{c}` in `{text}`")),
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn parse(op: &str) -> Result<Self, String> {
        Ok(match op {
            "=" => CompareOp::Eq,
            "!=" | "<>" => CompareOp::Ne,
            "<" => CompareOp::Lt,
            "<=" => CompareOp::Le,
            ">" => CompareOp::Gt,
            ">=" => CompareOp::Ge,
            other => return Err(format!("unknown operator `{other}`")),
        })
    }

    fn holds(self, ordering: Option<Ordering>) -> bool {
        match self {
            CompareOp::Eq => ordering == Some(Ordering::Equal),
            CompareOp::Ne => ordering != Some(Ordering::Equal),
            CompareOp::Lt => ordering == Some(Ordering::Less),
            CompareOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
            CompareOp::Gt => ordering == Some(Ordering::Greater),
            CompareOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    In {
        field: String,
        values: Vec<Value>,
        negated: bool,
    },
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
}

fn compare_values(actual: Option<&Value>, expected: &Value) -> Option<Ordering> {
    match (actual.unwrap_or(&Value::Null), expected) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::String(a), Value::String(b)) => Some(timestamp::compare(a, b)),
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

impl Condition {
    fn matches(&self, record: &Record) -> bool {
        match self {
            Condition::Compare { field, op, value } => {
                op.holds(compare_values(record.project(field), value))
            }
            Condition::In {
                field,
                values,
                negated,
            } => {
                let actual = record.project(field);
                let found = values
                    .iter()
                    .any(|v| compare_values(actual, v) == Some(Ordering::Equal));
                found != *negated
            }
            Condition::And(l, r) => l.matches(record) && r.matches(record),
            Condition::Or(l, r) => l.matches(record) || r.matches(record),
            Condition::Not(inner) => !inner.matches(record),
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            other => Err(format!("expected {expected:?}, found {other:?}")),
        }
    }

    fn parse_or(&mut self) -> Result<Condition, String> {
        let mut left = self.parse_and()?;
        while self.peek_keyword("OR") {
            self.pos += 1;
            left = Condition::Or(Box::new(left), Box::new(self.parse_and()?));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Condition, String> {
        let mut left = self.parse_unary()?;
        while self.peek_keyword("AND") {
            self.pos += 1;
            left = Condition::And(Box::new(left), Box::new(self.parse_unary()?));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Condition, String> {
        if self.peek_keyword("NOT") {
            self.pos += 1;
            return Ok(Condition::Not(Box::new(self.parse_unary()?)));
        }
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.parse_or()?;
            self.expect(Token::RParen)?;
            return Ok(inner);
        }
        self.parse_predicate()
    }

    fn parse_predicate(&mut self) -> Result<Condition, String> {
        let field = match self.next() {
            Some(Token::Word(field)) => field,
            other => return Err(format!("expected a field, found {other:?}")),
        };
        let negated = self.peek_keyword("NOT");
        if negated {
            self.pos += 1;
        }
        if self.peek_keyword("IN") {
            self.pos += 1;
            return Ok(Condition::In {
                field,
                values: self.parse_list()?,
                negated,
            });
        }
        if negated {
            return Err(format!("expected IN after NOT for {field}"));
        }
        match self.next() {
            Some(Token::Op(op)) => Ok(Condition::Compare {
                field,
                op: CompareOp::parse(&op)?,
                value: self.parse_value()?,
            }),
            other => Err(format!("expected an operator after {field}, found {other:?}")),
        }
    }

    fn parse_list(&mut self) -> Result<Vec<Value>, String> {
        self.expect(Token::LParen)?;
        if self.peek_keyword("SELECT") {
            return Err("subqueries are not supported".into());
        }
        let mut values = vec![self.parse_value()?];
        loop {
            match self.next() {
                Some(Token::Comma) => values.push(self.parse_value()?),
                Some(Token::RParen) => return Ok(values),
                other => return Err(format!("expected `,` or `)`, found {other:?}")),
            }
        }
    }

    fn parse_value(&mut self) -> Result<Value, String> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Word(w)) => Ok(literal(&w)),
            other => Err(format!("expected a value, found {other:?}")),
        }
    }
}

fn literal(word: &str) -> Value {
    match word.to_ascii_lowercase().as_str() {
        "null" => Value::Null,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => word
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| word.parse::<f64>().map(Value::from))
            .unwrap_or_else(|_| Value::String(word.to_string())),
    }
}

fn parse_condition(text: &str) -> Result<Condition, String> {
    let mut parser = Parser {
        tokens: tokenize(text)?,
        pos: 0,
    };
    let condition = parser.parse_or()?;
    match parser.peek() {
        None => Ok(condition),
        Some(token) => Err(format!("unexpected {token:?} in `{text}`")),
    }
}

/// Sets `value` at a dotted path, creating nested objects on the way.
fn insert_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            target.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(inner) = entry {
                insert_path(inner, rest, value);
            }
        }
    }
}

/// A parsed query.
#[derive(Debug, Clone)]
pub struct SoqlQuery {
    fields: Vec<String>,
    object_type: String,
    condition: Option<Condition>,
    order_by: Option<(String, bool)>,
    limit: Option<usize>,
}

impl SoqlQuery {
    /// Parses a query, rejecting anything outside the supported subset.
    pub fn parse(soql: &str) -> Result<Self, String> {
        let mutator = SoqlMutator::new(soql).map_err(|e| e.to_string())?;
        let fields: Vec<String> = mutator.select_fields().iter().map(|f| f.to_string()).collect();
        if fields.iter().any(|f| f.starts_with('(')) {
            return Err("subqueries are not supported".into());
        }
        let condition = mutator.where_clause().map(parse_condition).transpose()?;
        let order_by = mutator.order_by_clause().map(|order| {
            let mut words = order.split_whitespace();
            let field = words.next().unwrap_or_default().to_string();
            let descending = words.any(|w| w.eq_ignore_ascii_case("DESC"));
            (field, descending)
        });
        let limit = mutator
            .limit_clause()
            .map(|l| l.trim().parse::<usize>().map_err(|e| format!("bad LIMIT: {e}")))
            .transpose()?;
        Ok(Self {
            fields,
            object_type: mutator.object_type().to_string(),
            condition,
            order_by,
            limit,
        })
    }

    /// Object type queried.
    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    /// Returns true if `record` satisfies the WHERE clause.
    pub fn matches(&self, record: &Record) -> bool {
        self.condition.as_ref().map_or(true, |c| c.matches(record))
    }

    /// Filters, orders, limits and projects `records`.
    pub fn apply<'r, I>(&self, records: I) -> Vec<Value>
    where
        I: IntoIterator<Item = &'r Record>,
    {
        let mut selected: Vec<&Record> = records.into_iter().filter(|r| self.matches(r)).collect();
        if let Some((field, descending)) = &self.order_by {
            selected.sort_by(|a, b| {
                let ordering = match (a.project(field), b.project(field)) {
                    (Some(x), Some(y)) => compare_values(Some(x), y).unwrap_or(Ordering::Equal),
                    (None, Some(_)) => Ordering::Less,
                    (Some(_), None) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                if *descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected.into_iter().map(|r| self.project(r)).collect()
    }

    fn project(&self, record: &Record) -> Value {
        let mut projected = Map::new();
        projected.insert(
            "attributes".into(),
            serde_json::json!({ "type": self.object_type }),
        );
        for field in &self.fields {
            let value = record.project(field).cloned().unwrap_or(Value::Null);
            insert_path(&mut projected, field, value);
        }
        Value::Object(projected)
    }
}
