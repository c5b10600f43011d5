//! Driver-neutral rows and parameter values.

use chrono::{DateTime, Utc};

use crate::error::{GatewayError, GatewayResult};

/// A bound parameter or a decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n.into())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Value::Timestamp(ts)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One result row: column names paired with values, in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column (builder style).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.columns.push((name.into(), value.into()));
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.columns.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    fn required(&self, name: &str) -> GatewayResult<&Value> {
        self.get(name)
            .ok_or_else(|| GatewayError::Decode(format!("column `{}` not found", name)))
    }

    pub fn bool(&self, name: &str) -> GatewayResult<bool> {
        match self.required(name)? {
            Value::Bool(b) => Ok(*b),
            other => Err(mismatch(name, "bool", other)),
        }
    }

    pub fn int(&self, name: &str) -> GatewayResult<i64> {
        match self.required(name)? {
            Value::Int(n) => Ok(*n),
            other => Err(mismatch(name, "integer", other)),
        }
    }

    pub fn text(&self, name: &str) -> GatewayResult<String> {
        match self.required(name)? {
            Value::Text(s) => Ok(s.clone()),
            other => Err(mismatch(name, "text", other)),
        }
    }

    /// Nullable text column.
    pub fn opt_text(&self, name: &str) -> GatewayResult<Option<String>> {
        match self.required(name)? {
            Value::Null => Ok(None),
            Value::Text(s) => Ok(Some(s.clone())),
            other => Err(mismatch(name, "text", other)),
        }
    }

    pub fn timestamp(&self, name: &str) -> GatewayResult<DateTime<Utc>> {
        match self.required(name)? {
            Value::Timestamp(ts) => Ok(*ts),
            other => Err(mismatch(name, "timestamp", other)),
        }
    }
}

fn mismatch(name: &str, expected: &str, found: &Value) -> GatewayError {
    GatewayError::Decode(format!(
        "column `{}`: expected {}, found {:?}",
        name, expected, found
    ))
}

/// Every row returned by one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    rows: Vec<Row>,
}

impl RowSet {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }
}

impl From<Vec<Row>> for RowSet {
    fn from(rows: Vec<Row>) -> Self {
        Self::new(rows)
    }
}

impl IntoIterator for RowSet {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a RowSet {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}
