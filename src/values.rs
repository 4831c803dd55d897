//! Column/value map passed to insert and update operations.

use rusqlite::types::Value as SqlValue;
use std::collections::BTreeMap;

/// Conversion into a stored SQL value. Covers the handful of types callers
/// actually pass; string slices are owned on the way in.
pub trait IntoSqlValue {
    fn into_sql_value(self) -> SqlValue;
}

impl IntoSqlValue for SqlValue {
    fn into_sql_value(self) -> SqlValue {
        self
    }
}

impl IntoSqlValue for &str {
    fn into_sql_value(self) -> SqlValue {
        SqlValue::Text(self.to_string())
    }
}

impl IntoSqlValue for String {
    fn into_sql_value(self) -> SqlValue {
        SqlValue::Text(self)
    }
}

impl IntoSqlValue for i64 {
    fn into_sql_value(self) -> SqlValue {
        SqlValue::Integer(self)
    }
}

impl IntoSqlValue for i32 {
    fn into_sql_value(self) -> SqlValue {
        SqlValue::Integer(self as i64)
    }
}

impl IntoSqlValue for u32 {
    fn into_sql_value(self) -> SqlValue {
        SqlValue::Integer(self as i64)
    }
}

impl IntoSqlValue for f64 {
    fn into_sql_value(self) -> SqlValue {
        SqlValue::Real(self)
    }
}

impl IntoSqlValue for bool {
    fn into_sql_value(self) -> SqlValue {
        SqlValue::Integer(self as i64)
    }
}

impl<V: IntoSqlValue> IntoSqlValue for Option<V> {
    fn into_sql_value(self) -> SqlValue {
        match self {
            Some(value) => value.into_sql_value(),
            None => SqlValue::Null,
        }
    }
}

/// Ordered column -> value map for a single row write. Ordering keeps
/// generated SQL deterministic, which keeps tests and logs readable.
#[derive(Debug, Clone, Default)]
pub struct ContentValues {
    values: BTreeMap<String, SqlValue>,
}

impl ContentValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<S: Into<String>, V: IntoSqlValue>(&mut self, column: S, value: V) -> &mut Self {
        self.values.insert(column.into(), value.into_sql_value());
        self
    }

    pub fn put_null<S: Into<String>>(&mut self, column: S) -> &mut Self {
        self.values.insert(column.into(), SqlValue::Null);
        self
    }

    pub fn remove(&mut self, column: &str) -> Option<SqlValue> {
        self.values.remove(column)
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.values.get(column)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        match self.values.get(column) {
            Some(SqlValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        match self.values.get(column) {
            Some(SqlValue::Integer(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn contains(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<S: Into<String>, V: IntoSqlValue> FromIterator<(S, V)> for ContentValues {
    fn from_iter<T: IntoIterator<Item = (S, V)>>(iter: T) -> Self {
        let mut values = ContentValues::new();
        for (column, value) in iter {
            values.put(column, value);
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_and_typed_getters() {
        let mut values = ContentValues::new();
        values.put("path", "/a/b.jpg");
        values.put("size", 42i64);
        values.put_null("title");

        assert_eq!(values.get_str("path"), Some("/a/b.jpg"));
        assert_eq!(values.get_i64("size"), Some(42));
        assert!(matches!(values.get("title"), Some(SqlValue::Null)));
        assert_eq!(values.get_str("size"), None);
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn columns_iterate_in_stable_order() {
        let values: ContentValues =
            [("b", 1i64), ("a", 2), ("c", 3)].into_iter().collect();
        let columns: Vec<&str> = values.columns().collect();
        assert_eq!(columns, vec!["a", "b", "c"]);
    }
}
