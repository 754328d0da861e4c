//! Query predicates, ordering and paging.

use mobilesync_protocol::Record;
use serde_json::Value;
use std::cmp::Ordering;

/// Default number of entries per query page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Predicate over soup entries.
///
/// Paths are dotted (`attributes.type`). A missing path never equals
/// anything, so `Not(Eq(..))` matches entries that lack the field.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Every entry.
    All,
    /// The value at a path equals the given value.
    Eq(String, Value),
    /// The value at a path equals one of the given values.
    In(String, Vec<Value>),
    /// All sub-filters match.
    And(Vec<Filter>),
    /// The sub-filter does not match.
    Not(Box<Filter>),
}

impl Filter {
    /// `path = value`.
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(path.into(), value.into())
    }

    /// `path IN (values)`.
    pub fn is_in<I, V>(path: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Filter::In(path.into(), values.into_iter().map(Into::into).collect())
    }

    /// Conjunction with another filter.
    #[must_use]
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And(mut left), Filter::And(right)) => {
                left.extend(right);
                Filter::And(left)
            }
            (Filter::And(mut left), f) => {
                left.push(f);
                Filter::And(left)
            }
            (f, other) => Filter::And(vec![f, other]),
        }
    }

    /// Negation.
    #[allow(clippy::should_implement_trait)]
    #[must_use]
    pub fn not(self) -> Self {
        Filter::Not(Box::new(self))
    }

    /// Returns true if the entry matches.
    pub fn matches(&self, entry: &Record) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(path, expected) => entry
                .project(path)
                .is_some_and(|actual| loosely_equal(actual, expected)),
            Filter::In(path, values) => entry
                .project(path)
                .is_some_and(|actual| values.iter().any(|v| loosely_equal(actual, v))),
            Filter::And(filters) => filters.iter().all(|f| f.matches(entry)),
            Filter::Not(filter) => !filter.matches(entry),
        }
    }
}

/// Equality that tolerates flags and numbers stored as strings.
fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) => {
            s == if *b { "true" } else { "false" }
        }
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            s.parse::<f64>().ok() == n.as_f64()
        }
        _ => actual == expected,
    }
}

/// Orders two optional values: absent first, numbers numerically, the rest
/// by their string form.
pub(crate) fn compare_values(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    match (left, right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(a), Some(b)) => a.to_string().cmp(&b.to_string()),
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Smallest first.
    #[default]
    Ascending,
    /// Largest first.
    Descending,
}

/// A paged query over one soup.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    /// Entry predicate.
    pub filter: Filter,
    /// Ordering path; entry id order when `None`.
    pub order_path: Option<String>,
    /// Sort direction.
    pub order: SortOrder,
    /// Entries per page.
    pub page_size: usize,
}

impl Default for QuerySpec {
    fn default() -> Self {
        Self {
            filter: Filter::All,
            order_path: None,
            order: SortOrder::Ascending,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl QuerySpec {
    /// Query matching every entry.
    pub fn all() -> Self {
        Self::default()
    }

    /// Query matching `filter`.
    pub fn matching(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    /// Orders by a path.
    #[must_use]
    pub fn order_by(mut self, path: impl Into<String>, order: SortOrder) -> Self {
        self.order_path = Some(path.into());
        self.order = order;
        self
    }

    /// Sets the page size; zero is treated as one.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub(crate) fn compare(&self, left: &Record, right: &Record) -> Ordering {
        let ordering = match &self.order_path {
            Some(path) => compare_values(left.project(path), right.project(path)),
            None => Ordering::Equal,
        };
        match self.order {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        }
    }
}
