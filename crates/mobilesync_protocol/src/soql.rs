//! SOQL building and rewriting.
//!
//! [`SoqlBuilder`] assembles queries from parts. [`SoqlMutator`] splits an
//! existing query into its top level clauses (subqueries and string
//! literals are left alone) so fields, predicates and ordering can be
//! added without re-parsing the whole grammar.

use crate::error::{ProtocolError, ProtocolResult};
use crate::timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Clause {
    Select,
    From,
    Where,
    GroupBy,
    Having,
    OrderBy,
    Limit,
    Offset,
}

impl Clause {
    fn keyword(&self) -> &'static str {
        match self {
            Clause::Select => "SELECT",
            Clause::From => "FROM",
            Clause::Where => "WHERE",
            Clause::GroupBy => "GROUP BY",
            Clause::Having => "HAVING",
            Clause::OrderBy => "ORDER BY",
            Clause::Limit => "LIMIT",
            Clause::Offset => "OFFSET",
        }
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'.'
}

/// Splits on `separator` outside parentheses and string literals.
fn split_top_level(text: &str, separator: u8) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut parts = Vec::new();
    let (mut depth, mut in_quote, mut start, mut i) = (0i32, false, 0usize, 0usize);
    while i < bytes.len() {
        let b = bytes[i];
        if in_quote {
            if b == b'\\' {
                i += 1;
            } else if b == b'\'' {
                in_quote = false;
            }
        } else if b == b'\'' {
            in_quote = true;
        } else if b == b'(' {
            depth += 1;
        } else if b == b')' {
            depth -= 1;
        } else if b == separator && depth == 0 {
            parts.push(text[start..i].trim());
            start = i + 1;
        }
        i += 1;
    }
    parts.push(text[start..].trim());
    parts
}

/// Finds top level clause keywords: (clause, keyword start, body start).
fn scan_clauses(query: &str) -> Vec<(Clause, usize, usize)> {
    let bytes = query.as_bytes();
    let len = bytes.len();
    let mut marks = Vec::new();
    let (mut depth, mut in_quote, mut i) = (0i32, false, 0usize);

    let read_word = |from: usize| {
        let mut end = from;
        while end < len && is_word_byte(bytes[end]) {
            end += 1;
        }
        end
    };

    while i < len {
        let b = bytes[i];
        if in_quote {
            if b == b'\\' {
                i += 1;
            } else if b == b'\'' {
                in_quote = false;
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' => in_quote = true,
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ if b.is_ascii_alphabetic() => {
                let start = i;
                let end = read_word(start);
                let bounded = start == 0 || !is_word_byte(bytes[start - 1]);
                if depth == 0 && bounded {
                    let word = query[start..end].to_ascii_lowercase();
                    let single = match word.as_str() {
                        "select" => Some(Clause::Select),
                        "from" => Some(Clause::From),
                        "where" => Some(Clause::Where),
                        "having" => Some(Clause::Having),
                        "limit" => Some(Clause::Limit),
                        "offset" => Some(Clause::Offset),
                        _ => None,
                    };
                    if let Some(clause) = single {
                        marks.push((clause, start, end));
                    } else if word == "group" || word == "order" {
                        let mut next = end;
                        while next < len && bytes[next].is_ascii_whitespace() {
                            next += 1;
                        }
                        let by_end = read_word(next);
                        if next > end && query[next..by_end].eq_ignore_ascii_case("by") {
                            let clause = if word == "group" {
                                Clause::GroupBy
                            } else {
                                Clause::OrderBy
                            };
                            marks.push((clause, start, by_end));
                            i = by_end;
                            continue;
                        }
                    }
                }
                i = end;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    marks
}

/// Top level view of a SOQL query that can be edited clause by clause.
#[derive(Debug, Clone, PartialEq)]
pub struct SoqlMutator {
    clauses: Vec<(Clause, String)>,
}

impl SoqlMutator {
    /// Parses a query.
    pub fn new(query: &str) -> ProtocolResult<Self> {
        let marks = scan_clauses(query);
        let first = marks
            .first()
            .ok_or_else(|| ProtocolError::invalid_query(format!("no SELECT in `{query}`")))?;
        if first.0 != Clause::Select || !query[..first.1].trim().is_empty() {
            return Err(ProtocolError::invalid_query(format!(
                "`{query}` does not start with SELECT"
            )));
        }
        let mut clauses: Vec<(Clause, String)> = Vec::with_capacity(marks.len());
        for (idx, (clause, _, body_start)) in marks.iter().enumerate() {
            if clauses.last().is_some_and(|(last, _)| last >= clause) {
                return Err(ProtocolError::invalid_query(format!(
                    "misplaced {} in `{query}`",
                    clause.keyword()
                )));
            }
            let body_end = marks.get(idx + 1).map(|m| m.1).unwrap_or(query.len());
            let body = query[*body_start..body_end].trim();
            if body.is_empty() {
                return Err(ProtocolError::invalid_query(format!(
                    "empty {} clause in `{query}`",
                    clause.keyword()
                )));
            }
            clauses.push((*clause, body.to_string()));
        }
        if !clauses.iter().any(|(c, _)| *c == Clause::From) {
            return Err(ProtocolError::invalid_query(format!("no FROM in `{query}`")));
        }
        Ok(Self { clauses })
    }

    fn body(&self, clause: Clause) -> Option<&str> {
        self.clauses
            .iter()
            .find(|(c, _)| *c == clause)
            .map(|(_, body)| body.as_str())
    }

    fn set(&mut self, clause: Clause, body: String) {
        match self.clauses.iter_mut().find(|(c, _)| *c == clause) {
            Some(entry) => entry.1 = body,
            None => {
                self.clauses.push((clause, body));
                self.clauses.sort_by_key(|(c, _)| *c);
            }
        }
    }

    /// Items of the select list, subqueries included.
    pub fn select_fields(&self) -> Vec<&str> {
        self.body(Clause::Select)
            .map(|b| split_top_level(b, b','))
            .unwrap_or_default()
    }

    /// Returns true if `field` is in the select list.
    pub fn is_selecting_field(&self, field: &str) -> bool {
        self.select_fields()
            .iter()
            .any(|f| f.eq_ignore_ascii_case(field))
    }

    /// Appends fields to the select list.
    pub fn add_select_fields(&mut self, fields: &[&str]) {
        let mut select = self.body(Clause::Select).unwrap_or_default().to_string();
        for field in fields {
            select.push_str(", ");
            select.push_str(field);
        }
        self.set(Clause::Select, select);
    }

    /// Replaces the select list.
    pub fn replace_select_fields(&mut self, fields: &[&str]) {
        self.set(Clause::Select, fields.join(", "));
    }

    /// Body of the FROM clause.
    pub fn from_clause(&self) -> &str {
        self.body(Clause::From).unwrap_or_default()
    }

    /// Object type queried.
    pub fn object_type(&self) -> &str {
        self.from_clause().split_whitespace().next().unwrap_or_default()
    }

    /// Body of the WHERE clause.
    pub fn where_clause(&self) -> Option<&str> {
        self.body(Clause::Where)
    }

    /// Adds a predicate that must hold in addition to the existing ones.
    pub fn add_predicate(&mut self, predicate: &str) {
        let body = match self.where_clause() {
            Some(existing) => format!("{predicate} AND ({existing})"),
            None => predicate.to_string(),
        };
        self.set(Clause::Where, body);
    }

    /// Returns true if the query has an ORDER BY clause.
    pub fn has_order_by(&self) -> bool {
        self.body(Clause::OrderBy).is_some()
    }

    /// Returns true if the query is ordered ascending by `field` first.
    pub fn is_ordering_by(&self, field: &str) -> bool {
        let Some(order) = self.body(Clause::OrderBy) else {
            return false;
        };
        let first = split_top_level(order, b',').into_iter().next().unwrap_or_default();
        let mut words = first.split_whitespace();
        words.next().is_some_and(|f| f.eq_ignore_ascii_case(field))
            && !words.any(|w| w.eq_ignore_ascii_case("desc"))
    }

    /// Body of the ORDER BY clause.
    pub fn order_by_clause(&self) -> Option<&str> {
        self.body(Clause::OrderBy)
    }

    /// Body of the LIMIT clause.
    pub fn limit_clause(&self) -> Option<&str> {
        self.body(Clause::Limit)
    }

    /// Replaces the ORDER BY clause.
    pub fn replace_order_by(&mut self, order: &str) {
        self.set(Clause::OrderBy, order.to_string());
    }

    /// Drops the ORDER BY clause.
    pub fn clear_order_by(&mut self) {
        self.clauses.retain(|(c, _)| *c != Clause::OrderBy);
    }

    /// Renders the query.
    pub fn build(&self) -> String {
        self.clauses
            .iter()
            .map(|(c, body)| format!("{} {body}", c.keyword()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Makes sure a sync-down query selects the id and modification date and is
/// ordered by modification date when it has no ordering of its own.
///
/// A query that already satisfies all three is returned unchanged.
pub fn ensure_sync_fields(
    query: &str,
    id_field_name: &str,
    modification_date_field_name: &str,
) -> ProtocolResult<String> {
    let mut mutator = SoqlMutator::new(query)?;
    let mut mutated = false;
    if !mutator.is_selecting_field(id_field_name) {
        mutator.add_select_fields(&[id_field_name]);
        mutated = true;
    }
    if !mutator.is_selecting_field(modification_date_field_name) {
        mutator.add_select_fields(&[modification_date_field_name]);
        mutated = true;
    }
    if !mutator.has_order_by() {
        mutator.replace_order_by(&format!("{modification_date_field_name} ASC"));
        mutated = true;
    }
    Ok(if mutated {
        mutator.build()
    } else {
        query.to_string()
    })
}

/// `field > <timestamp>` predicate.
pub fn modification_date_filter(field: &str, max_timestamp: i64) -> ProtocolResult<String> {
    Ok(format!("{field} > {}", timestamp::format_millis(max_timestamp)?))
}

/// Restricts a query to records modified after `max_timestamp`.
///
/// Non-positive timestamps mean a full fetch and leave the query unchanged.
pub fn add_filter_for_resync(
    query: &str,
    modification_date_field_name: &str,
    max_timestamp: i64,
) -> ProtocolResult<String> {
    if max_timestamp <= 0 {
        return Ok(query.to_string());
    }
    let mut mutator = SoqlMutator::new(query)?;
    mutator.add_predicate(&modification_date_filter(
        modification_date_field_name,
        max_timestamp,
    )?);
    Ok(mutator.build())
}

/// Quotes a string literal.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// `field IN ('a', 'b')` predicate.
pub fn in_predicate<S: AsRef<str>>(field: &str, values: &[S]) -> String {
    let quoted: Vec<String> = values.iter().map(|v| quote(v.as_ref())).collect();
    format!("{field} IN ({})", quoted.join(", "))
}

/// Assembles a query from parts.
#[derive(Debug, Clone, Default)]
pub struct SoqlBuilder {
    fields: Vec<String>,
    from: Option<String>,
    where_clause: Option<String>,
    order_by: Option<String>,
    limit: Option<usize>,
}

impl SoqlBuilder {
    /// Starts a query selecting `fields`.
    pub fn with_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Sets the FROM clause.
    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Sets the WHERE clause; blank predicates are ignored.
    pub fn where_clause(mut self, predicate: impl Into<String>) -> Self {
        let predicate = predicate.into();
        self.where_clause = (!predicate.trim().is_empty()).then_some(predicate);
        self
    }

    /// Sets the ORDER BY clause.
    pub fn order_by(mut self, order: impl Into<String>) -> Self {
        self.order_by = Some(order.into());
        self
    }

    /// Sets the LIMIT clause.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Renders the query.
    pub fn build(&self) -> ProtocolResult<String> {
        if self.fields.is_empty() {
            return Err(ProtocolError::invalid_query("no fields selected"));
        }
        let from = self
            .from
            .as_deref()
            .ok_or_else(|| ProtocolError::invalid_query("no FROM clause"))?;
        let mut query = format!("SELECT {} FROM {from}", self.fields.join(", "));
        if let Some(predicate) = &self.where_clause {
            query.push_str(" WHERE ");
            query.push_str(predicate);
        }
        if let Some(order) = &self.order_by {
            query.push_str(" ORDER BY ");
            query.push_str(order);
        }
        if let Some(limit) = self.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }
        Ok(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_clauses() {
        let m = SoqlMutator::new(
            "select Name, (SELECT Id FROM Contacts WHERE Name = 'order by') from Account \
             where Name like 'A%' order by Name limit 10",
        )
        .unwrap();
        assert_eq!(m.select_fields().len(), 2);
        assert_eq!(m.object_type(), "Account");
        assert_eq!(m.where_clause(), Some("Name like 'A%'"));
        assert!(m.has_order_by());
        assert!(m.is_ordering_by("Name"));
        assert_eq!(m.order_by_clause(), Some("Name"));
        assert_eq!(m.limit_clause(), Some("10"));
        assert_eq!(
            m.build(),
            "SELECT Name, (SELECT Id FROM Contacts WHERE Name = 'order by') FROM Account \
             WHERE Name like 'A%' ORDER BY Name LIMIT 10"
        );
    }

    #[test]
    fn rejects_malformed_queries() {
        assert!(SoqlMutator::new("Name FROM Account").is_err());
        assert!(SoqlMutator::new("SELECT Name").is_err());
        assert!(SoqlMutator::new("SELECT Name FROM Account LIMIT 5 WHERE Name = 'x'").is_err());
        assert!(SoqlMutator::new("").is_err());
    }

    #[test]
    fn injects_missing_sync_fields() {
        let query = ensure_sync_fields("SELECT Name FROM Account LIMIT 5", "Id", "LastModifiedDate")
            .unwrap();
        assert_eq!(
            query,
            "SELECT Name, Id, LastModifiedDate FROM Account ORDER BY LastModifiedDate ASC LIMIT 5"
        );
    }

    #[test]
    fn complete_query_is_untouched() {
        let query = "select id,  LastModifiedDate,Name from Account  order by Name";
        assert_eq!(ensure_sync_fields(query, "Id", "LastModifiedDate").unwrap(), query);
    }

    #[test]
    fn subquery_fields_do_not_count() {
        let query = "SELECT Name, (SELECT Id, LastModifiedDate FROM Contacts) FROM Account";
        let rewritten = ensure_sync_fields(query, "Id", "LastModifiedDate").unwrap();
        assert!(rewritten.starts_with(
            "SELECT Name, (SELECT Id, LastModifiedDate FROM Contacts), Id, LastModifiedDate FROM"
        ));
    }

    #[test]
    fn resync_filter() {
        let ts = 1_709_287_200_000;
        let disjunction = "SELECT Id FROM Account WHERE A = 1 OR B = 2";
        assert_eq!(
            add_filter_for_resync("SELECT Id FROM Account", "LastModifiedDate", ts).unwrap(),
            "SELECT Id FROM Account WHERE LastModifiedDate > 2024-03-01T10:00:00.000Z"
        );
        assert_eq!(
            add_filter_for_resync(disjunction, "LastModifiedDate", ts).unwrap(),
            "SELECT Id FROM Account \
             WHERE LastModifiedDate > 2024-03-01T10:00:00.000Z AND (A = 1 OR B = 2)"
        );
        let untouched = "select Id from Account";
        assert_eq!(add_filter_for_resync(untouched, "LastModifiedDate", 0).unwrap(), untouched);
    }

    #[test]
    fn in_predicate_quotes_values() {
        assert_eq!(in_predicate("Id", &["a", "b'c"]), "Id IN ('a', 'b\\'c')");
    }

    #[test]
    fn builder() {
        let q = SoqlBuilder::with_fields(["Id", "Name"])
            .from("Account")
            .where_clause("")
            .order_by("Id")
            .limit(3)
            .build()
            .unwrap();
        assert_eq!(q, "SELECT Id, Name FROM Account ORDER BY Id LIMIT 3");
        assert!(SoqlBuilder::default().from("Account").build().is_err());
    }

    proptest! {
        #[test]
        fn injection_is_idempotent(fields in prop::collection::vec("[A-Z][a-z]{1,8}__c", 1..5)) {
            let query = format!("SELECT {} FROM Account", fields.join(", "));
            let once = ensure_sync_fields(&query, "Id", "LastModifiedDate").unwrap();
            let twice = ensure_sync_fields(&once, "Id", "LastModifiedDate").unwrap();
            prop_assert_eq!(&once, &twice);
            let parsed = SoqlMutator::new(&once).unwrap();
            prop_assert!(parsed.is_selecting_field("Id"));
            prop_assert!(parsed.is_ordering_by("LastModifiedDate"));
        }
    }
}
