//! Named bind parameters rendered as positional `$n` placeholders.

use serde_json::Value;
use sqlx::postgres::{PgArguments, Postgres};
use sqlx::query::Query;

/// A value bound to a statement. Scalars travel as text and are cast in SQL
/// (`$1::integer`); compound values travel as JSONB.
#[derive(Clone, Debug, PartialEq)]
pub enum BindValue {
    Text(Option<String>),
    Json(Value),
}

impl BindValue {
    pub fn scalar(v: &Value) -> Self {
        match v {
            Value::Null => BindValue::Text(None),
            Value::Bool(b) => BindValue::Text(Some(b.to_string())),
            Value::Number(n) => BindValue::Text(Some(n.to_string())),
            Value::String(s) => BindValue::Text(Some(s.clone())),
            Value::Array(_) | Value::Object(_) => BindValue::Json(v.clone()),
        }
    }

    pub fn json(v: &Value) -> Self {
        BindValue::Json(v.clone())
    }
}

/// Accumulates binds by name. Binding the same name twice reuses its position.
#[derive(Clone, Debug, Default)]
pub struct Binds {
    names: Vec<String>,
    values: Vec<BindValue>,
}

impl Binds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `value` under `name` and returns its placeholder, e.g. `$3`.
    pub fn bind(&mut self, name: &str, value: BindValue) -> String {
        if let Some(pos) = self.names.iter().position(|n| n == name) {
            return format!("${}", pos + 1);
        }
        self.names.push(name.to_string());
        self.values.push(value);
        format!("${}", self.values.len())
    }

    /// Placeholder with a cast, e.g. `$2::integer`.
    pub fn bind_cast(&mut self, name: &str, value: BindValue, cast: Option<&str>) -> String {
        let ph = self.bind(name, value);
        match cast {
            Some(t) => format!("{}::{}", ph, t),
            None => ph,
        }
    }

    pub fn values(&self) -> &[BindValue] {
        &self.values
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Builds a query with every bind attached in order.
pub fn bind_all<'q>(sql: &'q str, binds: &'q [BindValue]) -> Query<'q, Postgres, PgArguments> {
    binds.iter().fold(sqlx::query(sql), |q, b| match b {
        BindValue::Text(s) => q.bind(s.as_deref()),
        BindValue::Json(v) => q.bind(sqlx::types::Json(v)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn same_name_reuses_position() {
        let mut b = Binds::new();
        assert_eq!(b.bind("w_name", BindValue::scalar(&json!("Acme"))), "$1");
        assert_eq!(b.bind_cast("w_id", BindValue::scalar(&json!(3)), Some("integer")), "$2::integer");
        assert_eq!(b.bind("w_name", BindValue::scalar(&json!("Other"))), "$1");
        assert_eq!(b.values().len(), 2);
        assert_eq!(b.names(), ["w_name".to_string(), "w_id".to_string()]);
    }

    #[test]
    fn scalar_conversion() {
        assert_eq!(BindValue::scalar(&json!(1.5)), BindValue::Text(Some("1.5".into())));
        assert_eq!(BindValue::scalar(&json!(true)), BindValue::Text(Some("true".into())));
        assert_eq!(BindValue::scalar(&Value::Null), BindValue::Text(None));
        assert_eq!(BindValue::scalar(&json!([1])), BindValue::Json(json!([1])));
    }
}
