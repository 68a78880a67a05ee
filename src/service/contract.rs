//! Validation contracts generated per operation from field descriptors.
//!
//! A contract checks a JSON object field by field, coercing query-string
//! scalars to their declared types, and returns either the cleaned object or
//! a [`ContractError`] carrying both the per-field messages and whatever did
//! validate (the nested-extension fallback re-validates from that).

use crate::config::{FieldDescriptor, ValidationRule, ValueType};
use crate::error::{ConfigError, FieldErrors};
use regex::Regex;
use serde_json::{Map, Number, Value};
use std::sync::Arc;

pub const MSG_UNKNOWN: &str = "Unknown field.";
pub const MSG_REQUIRED: &str = "Missing data for required field.";
pub const MSG_NULL: &str = "Field may not be null.";
pub const MSG_EMPTY: &str = "Field cannot be empty.";

/// How a field's value is interpreted beyond its scalar type.
#[derive(Clone, Debug)]
pub enum Shape {
    Plain,
    /// Remote id; in read contracts also an object of the linked resource's lookup fields.
    ForeignKey { lookup: Option<Arc<Contract>> },
    /// JSON array of remote ids; read contracts also take a single id.
    ManyToMany { accept_scalar: bool },
    /// JSON object validated against a nested contract.
    Nested(Arc<Contract>),
}

#[derive(Clone, Debug)]
pub struct ContractField {
    pub name: String,
    pub value_type: ValueType,
    pub items: Option<ValueType>,
    pub allow_none: bool,
    pub required: bool,
    pub missing: Option<Value>,
    pub rule: ValidationRule,
    pattern: Option<Regex>,
    pub shape: Shape,
}

impl ContractField {
    pub fn from_descriptor(d: &FieldDescriptor) -> Result<Self, ConfigError> {
        let pattern = match d.validate.pattern.as_deref() {
            Some(p) => Some(Regex::new(p).map_err(|e| {
                ConfigError::Validation(format!("field {}: invalid pattern: {}", d.name, e))
            })?),
            None => None,
        };
        let shape = if d.is_many_to_many() {
            Shape::ManyToMany { accept_scalar: false }
        } else if d.is_foreign_key() {
            Shape::ForeignKey { lookup: None }
        } else {
            Shape::Plain
        };
        Ok(ContractField {
            name: d.name.clone(),
            value_type: d.value_type,
            items: d.items,
            allow_none: d.allow_none,
            required: d.required,
            missing: d.missing.clone(),
            rule: d.validate.clone(),
            pattern,
            shape,
        })
    }

    pub fn with_shape(mut self, shape: Shape) -> Self {
        self.shape = shape;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct Contract {
    fields: Vec<ContractField>,
    partial: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ContractError {
    pub errors: FieldErrors,
    /// Fields that did validate.
    pub valid: Map<String, Value>,
}

enum Issue {
    Messages(Vec<String>),
    Nested(FieldErrors),
}

impl Issue {
    fn one(msg: impl Into<String>) -> Self {
        Issue::Messages(vec![msg.into()])
    }
}

impl Contract {
    pub fn new(fields: Vec<ContractField>) -> Self {
        Contract { fields, partial: false }
    }

    /// Partial contracts never enforce `required` and never fill `missing` defaults.
    pub fn partial(mut self) -> Self {
        self.partial = true;
        self
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn field(&self, name: &str) -> Option<&ContractField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn fields(&self) -> &[ContractField] {
        &self.fields
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    pub fn validate(&self, input: &Map<String, Value>) -> Result<Map<String, Value>, ContractError> {
        let mut errors = FieldErrors::new();
        let mut valid = Map::new();

        for key in input.keys() {
            if self.field(key).is_none() {
                errors.push(key, MSG_UNKNOWN);
            }
        }

        for field in &self.fields {
            match input.get(&field.name) {
                Some(Value::Null) => {
                    if field.allow_none {
                        valid.insert(field.name.clone(), Value::Null);
                    } else {
                        errors.push(&field.name, MSG_NULL);
                    }
                }
                Some(raw) => match check_field(field, raw) {
                    Ok(v) => {
                        valid.insert(field.name.clone(), v);
                    }
                    Err(Issue::Messages(msgs)) => {
                        for m in msgs {
                            errors.push(&field.name, m);
                        }
                    }
                    Err(Issue::Nested(nested)) => errors.insert_nested(&field.name, nested),
                },
                None if self.partial => {}
                None => {
                    if let Some(default) = &field.missing {
                        valid.insert(field.name.clone(), default.clone());
                    } else if field.required {
                        errors.push(&field.name, MSG_REQUIRED);
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(valid)
        } else {
            Err(ContractError { errors, valid })
        }
    }
}

fn check_field(field: &ContractField, raw: &Value) -> Result<Value, Issue> {
    let value = match &field.shape {
        Shape::Nested(contract) => {
            let obj = raw.as_object().ok_or_else(|| Issue::one("Not a valid mapping type."))?;
            return contract
                .validate(obj)
                .map(Value::Object)
                .map_err(|e| Issue::Nested(e.errors));
        }
        Shape::ForeignKey { lookup: Some(contract) } if raw.is_object() => {
            let obj = raw.as_object().cloned().unwrap_or_default();
            return contract
                .validate(&obj)
                .map(Value::Object)
                .map_err(|e| Issue::Nested(e.errors));
        }
        Shape::ManyToMany { accept_scalar } => {
            let item_type = field.items.unwrap_or(ValueType::Integer);
            match raw {
                Value::Array(_) => convert(ValueType::List, Some(item_type), raw)?,
                _ if *accept_scalar => convert(item_type, None, raw)?,
                _ => return Err(Issue::one("Not a valid list.")),
            }
        }
        _ => convert(field.value_type, field.items, raw)?,
    };
    check_rule(field, &value)?;
    Ok(value)
}

fn convert(ty: ValueType, items: Option<ValueType>, raw: &Value) -> Result<Value, Issue> {
    match ty {
        ValueType::Integer => to_integer(raw).ok_or_else(|| Issue::one("Not a valid integer.")),
        ValueType::Float => to_float(raw).ok_or_else(|| Issue::one("Not a valid number.")),
        ValueType::String => match raw {
            Value::String(_) => Ok(raw.clone()),
            _ => Err(Issue::one("Not a valid string.")),
        },
        ValueType::Boolean => to_bool(raw).ok_or_else(|| Issue::one("Not a valid boolean.")),
        ValueType::Date => raw
            .as_str()
            .and_then(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .ok_or_else(|| Issue::one("Not a valid date.")),
        ValueType::Datetime => raw
            .as_str()
            .and_then(parse_datetime)
            .map(Value::String)
            .ok_or_else(|| Issue::one("Not a valid datetime.")),
        ValueType::Uuid => raw
            .as_str()
            .and_then(|s| uuid::Uuid::parse_str(s).ok())
            .map(|u| Value::String(u.to_string()))
            .ok_or_else(|| Issue::one("Not a valid UUID.")),
        ValueType::List => {
            let list = match raw {
                Value::Array(list) => list.clone(),
                // a single query-string value stands for a one-element list
                Value::String(_) => vec![raw.clone()],
                _ => return Err(Issue::one("Not a valid list.")),
            };
            let Some(item_type) = items else {
                return Ok(Value::Array(list));
            };
            let mut out = Vec::with_capacity(list.len());
            let mut nested = FieldErrors::new();
            for (i, item) in list.iter().enumerate() {
                match convert(item_type, None, item) {
                    Ok(v) => out.push(v),
                    Err(Issue::Messages(msgs)) => {
                        for m in msgs {
                            nested.push(&i.to_string(), m);
                        }
                    }
                    Err(Issue::Nested(n)) => nested.insert_nested(&i.to_string(), n),
                }
            }
            if nested.is_empty() {
                Ok(Value::Array(out))
            } else {
                Err(Issue::Nested(nested))
            }
        }
        ValueType::Dict => match raw {
            Value::Object(_) => Ok(raw.clone()),
            Value::String(s) => serde_json::from_str::<Value>(s)
                .ok()
                .filter(Value::is_object)
                .ok_or_else(|| Issue::one("Not a valid mapping type.")),
            _ => Err(Issue::one("Not a valid mapping type.")),
        },
    }
}

fn to_integer(raw: &Value) -> Option<Value> {
    match raw {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .map(|i| Value::Number(i.into())),
        Value::String(s) => s.trim().parse::<i64>().ok().map(|i| Value::Number(i.into())),
        _ => None,
    }
}

fn to_float(raw: &Value) -> Option<Value> {
    match raw {
        Value::Number(_) => Some(raw.clone()),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
        _ => None,
    }
}

fn to_bool(raw: &Value) -> Option<Value> {
    match raw {
        Value::Bool(_) => Some(raw.clone()),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(Value::Bool(false)),
            Some(1) => Some(Value::Bool(true)),
            _ => None,
        },
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(Value::Bool(true)),
            "false" | "0" | "no" | "off" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}

fn parse_datetime(s: &str) -> Option<String> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.to_rfc3339());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
}

fn check_rule(field: &ContractField, v: &Value) -> Result<(), Issue> {
    let rule = &field.rule;
    let mut msgs = Vec::new();
    if let Some(format) = &rule.format {
        if let Some(s) = v.as_str() {
            match format.to_lowercase().as_str() {
                "email" => {
                    let ok = s
                        .split_once('@')
                        .map(|(user, host)| !user.is_empty() && host.contains('.'))
                        .unwrap_or(false);
                    if !ok {
                        msgs.push("Not a valid email address.".to_string());
                    }
                }
                "uuid" if uuid::Uuid::parse_str(s).is_err() => {
                    msgs.push("Not a valid UUID.".to_string())
                }
                _ => {}
            }
        }
    }
    let len = match v {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(a) => Some(a.len()),
        _ => None,
    };
    if let (Some(max), Some(len)) = (rule.max_length, len) {
        if len > max as usize {
            msgs.push(format!("Longer than maximum length {}.", max));
        }
    }
    if let (Some(min), Some(len)) = (rule.min_length, len) {
        if len < min as usize {
            msgs.push(format!("Shorter than minimum length {}.", min));
        }
    }
    if let (Some(re), Some(s)) = (&field.pattern, v.as_str()) {
        if !re.is_match(s) {
            msgs.push("String does not match expected pattern.".to_string());
        }
    }
    if let Some(allowed) = &rule.allowed {
        if !allowed.iter().any(|a| value_eq(v, a)) {
            let choices: Vec<String> = allowed
                .iter()
                .map(|a| a.as_str().map(str::to_string).unwrap_or_else(|| a.to_string()))
                .collect();
            msgs.push(format!("Must be one of: {}.", choices.join(", ")));
        }
    }
    if let (Some(min), Some(n)) = (rule.minimum, v.as_f64()) {
        if n < min {
            msgs.push(format!("Must be greater than or equal to {}.", min));
        }
    }
    if let (Some(max), Some(n)) = (rule.maximum, v.as_f64()) {
        if n > max {
            msgs.push(format!("Must be less than or equal to {}.", max));
        }
    }
    if rule.not_empty == Some(true) {
        let empty = match v {
            Value::String(s) => s.trim().is_empty(),
            Value::Array(a) => a.is_empty(),
            Value::Object(o) => o.is_empty(),
            _ => false,
        };
        if empty {
            msgs.push(MSG_EMPTY.to_string());
        }
    }
    if msgs.is_empty() {
        Ok(())
    } else {
        Err(Issue::Messages(msgs))
    }
}

fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(n), Value::Number(m)) => n.as_f64() == m.as_f64(),
        _ => a == b,
    }
}

pub const DEFAULT_LIMIT: u64 = 100;
pub const MAX_LIMIT: u64 = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderDir {
    Asc,
    Desc,
}

impl OrderDir {
    pub fn as_sql(&self) -> &'static str {
        match self {
            OrderDir::Asc => "ASC",
            OrderDir::Desc => "DESC",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PaginationSpec {
    pub page: u64,
    pub limit: u64,
    pub order_by: Vec<String>,
    pub order_dir: OrderDir,
}

impl PaginationSpec {
    /// Row offset of the page, or `None` when it does not fit a PostgreSQL bigint.
    pub fn checked_offset(&self) -> Option<u64> {
        self.page
            .checked_sub(1)?
            .checked_mul(self.limit)
            .filter(|offset| *offset <= i64::MAX as u64)
    }

    pub fn offset(&self) -> u64 {
        self.checked_offset().unwrap_or(i64::MAX as u64)
    }
}

/// Validates `page`, `limit`, `order_by` and `order_dir` for list requests.
#[derive(Clone, Debug)]
pub struct PaginationContract {
    /// list_by minus compound-typed fields.
    pub allowed_order_by: Vec<String>,
    pub default_order_by: Vec<String>,
}

pub const PAGINATION_KEYS: [&str; 4] = ["page", "limit", "order_by", "order_dir"];

impl PaginationContract {
    /// Removes the pagination keys from `query` and validates them.
    pub fn validate(&self, query: &mut Map<String, Value>) -> Result<PaginationSpec, FieldErrors> {
        let mut errors = FieldErrors::new();

        let page = match query.remove("page") {
            None => 1,
            Some(raw) => match single(&raw).and_then(|v| to_integer(&v)).and_then(|v| v.as_i64()) {
                Some(n) if n >= 1 => n as u64,
                Some(_) => {
                    errors.push("page", "Must be greater than or equal to 1.");
                    1
                }
                None => {
                    errors.push("page", "Not a valid integer.");
                    1
                }
            },
        };

        let limit = match query.remove("limit") {
            None => DEFAULT_LIMIT,
            Some(raw) => match single(&raw).and_then(|v| to_integer(&v)).and_then(|v| v.as_i64()) {
                Some(n) if n > 0 => (n as u64).min(MAX_LIMIT),
                Some(_) => {
                    errors.push("limit", "Must be greater than 0.");
                    DEFAULT_LIMIT
                }
                None => {
                    errors.push("limit", "Not a valid integer.");
                    DEFAULT_LIMIT
                }
            },
        };

        let order_by = match query.remove("order_by") {
            None => self.default_order_by.clone(),
            Some(raw) => {
                let requested = split_list(&raw);
                let bad: Vec<&String> = requested
                    .iter()
                    .filter(|f| !self.allowed_order_by.contains(f))
                    .collect();
                if requested.is_empty() {
                    errors.push("order_by", MSG_EMPTY);
                } else if !bad.is_empty() {
                    errors.push(
                        "order_by",
                        format!("Must be one of: {}.", self.allowed_order_by.join(", ")),
                    );
                }
                requested
            }
        };

        let order_dir = match query.remove("order_dir") {
            None => OrderDir::Asc,
            Some(raw) => match single(&raw).as_ref().and_then(Value::as_str).map(str::to_lowercase) {
                Some(d) if d == "asc" => OrderDir::Asc,
                Some(d) if d == "desc" => OrderDir::Desc,
                _ => {
                    errors.push("order_dir", "Must be one of: asc, desc.");
                    OrderDir::Asc
                }
            },
        };

        let spec = PaginationSpec {
            page,
            limit,
            order_by,
            order_dir,
        };
        if spec.checked_offset().is_none() {
            errors.push("page", "Page is out of range.");
        }

        if errors.is_empty() {
            Ok(spec)
        } else {
            Err(errors)
        }
    }
}

/// Last value of a possibly repeated query parameter.
fn single(raw: &Value) -> Option<Value> {
    match raw {
        Value::Array(list) => list.last().cloned(),
        other => Some(other.clone()),
    }
}

/// Comma-joined or repeated names, trimmed, empties dropped.
pub fn split_list(raw: &Value) -> Vec<String> {
    let parts: Vec<&str> = match raw {
        Value::Array(list) => list.iter().filter_map(Value::as_str).collect(),
        Value::String(s) => vec![s.as_str()],
        _ => Vec::new(),
    };
    parts
        .iter()
        .flat_map(|p| p.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
