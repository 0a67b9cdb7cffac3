use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Comparison applied to a single column of a changed row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FilterOp {
    Eq(String),
    Neq(String),
    Lt(String),
    Lte(String),
    Gt(String),
    Gte(String),
    In(Vec<String>),
}

/// Row filter in the realtime `column=op.value` syntax, e.g. `user_id=eq.<uuid>`
/// or `status=in.(active,resolved)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RowFilter {
    column: String,
    op: FilterOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterParseError {
    #[error("filter {0:?} has no column")]
    MissingColumn(String),
    #[error("filter {0:?} has no operator")]
    MissingOperator(String),
    #[error("unsupported filter operator {0:?}")]
    UnsupportedOperator(String),
    #[error("malformed `in` list {0:?}")]
    MalformedList(String),
}

impl RowFilter {
    pub fn new(column: impl Into<String>, op: FilterOp) -> Self {
        Self {
            column: column.into(),
            op,
        }
    }

    pub fn eq(column: impl Into<String>, value: impl ToString) -> Self {
        Self::new(column, FilterOp::Eq(value.to_string()))
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn op(&self) -> &FilterOp {
        &self.op
    }

    /// The value an `eq` filter pins its column to, if this is one.
    pub fn eq_value(&self) -> Option<&str> {
        match &self.op {
            FilterOp::Eq(v) => Some(v),
            _ => None,
        }
    }

    /// Whether `row` (a JSON object) passes this filter. Missing columns and
    /// non-scalar values never match.
    pub fn matches(&self, row: &Value) -> bool {
        let Some(actual) = row.get(&self.column).and_then(scalar_text) else {
            return false;
        };

        match &self.op {
            FilterOp::Eq(v) => actual == *v,
            FilterOp::Neq(v) => actual != *v,
            FilterOp::Lt(v) => compare(&actual, v) == Some(Ordering::Less),
            FilterOp::Lte(v) => matches!(compare(&actual, v), Some(Ordering::Less | Ordering::Equal)),
            FilterOp::Gt(v) => compare(&actual, v) == Some(Ordering::Greater),
            FilterOp::Gte(v) => {
                matches!(compare(&actual, v), Some(Ordering::Greater | Ordering::Equal))
            }
            FilterOp::In(values) => values.iter().any(|v| *v == actual),
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some("null".to_string()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Numeric comparison when both sides parse as numbers, lexical otherwise.
fn compare(actual: &str, expected: &str) -> Option<Ordering> {
    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b),
        _ => Some(actual.cmp(expected)),
    }
}

impl FromStr for RowFilter {
    type Err = FilterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (column, rest) = s
            .split_once('=')
            .filter(|(column, _)| !column.trim().is_empty())
            .ok_or_else(|| FilterParseError::MissingColumn(s.to_string()))?;
        let (op, value) = rest
            .split_once('.')
            .ok_or_else(|| FilterParseError::MissingOperator(s.to_string()))?;

        let op = match op {
            "eq" => FilterOp::Eq(value.to_string()),
            "neq" => FilterOp::Neq(value.to_string()),
            "lt" => FilterOp::Lt(value.to_string()),
            "lte" => FilterOp::Lte(value.to_string()),
            "gt" => FilterOp::Gt(value.to_string()),
            "gte" => FilterOp::Gte(value.to_string()),
            "in" => {
                let inner = value
                    .strip_prefix('(')
                    .and_then(|v| v.strip_suffix(')'))
                    .ok_or_else(|| FilterParseError::MalformedList(value.to_string()))?;
                FilterOp::In(
                    inner
                        .split(',')
                        .map(|item| item.trim().trim_matches('"').to_string())
                        .filter(|item| !item.is_empty())
                        .collect(),
                )
            }
            other => return Err(FilterParseError::UnsupportedOperator(other.to_string())),
        };

        Ok(Self::new(column.trim(), op))
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let column = &self.column;
        match &self.op {
            FilterOp::Eq(v) => write!(f, "{column}=eq.{v}"),
            FilterOp::Neq(v) => write!(f, "{column}=neq.{v}"),
            FilterOp::Lt(v) => write!(f, "{column}=lt.{v}"),
            FilterOp::Lte(v) => write!(f, "{column}=lte.{v}"),
            FilterOp::Gt(v) => write!(f, "{column}=gt.{v}"),
            FilterOp::Gte(v) => write!(f, "{column}=gte.{v}"),
            FilterOp::In(values) => write!(f, "{column}=in.({})", values.join(",")),
        }
    }
}

impl TryFrom<String> for RowFilter {
    type Error = FilterParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RowFilter> for String {
    fn from(filter: RowFilter) -> Self {
        filter.to_string()
    }
}
