//! Raw declaration types matching the resource JSON format.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// The fixed operation set every resource route can expose.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Get,
    List,
    Post,
    Put,
    Patch,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::Get,
        Operation::List,
        Operation::Post,
        Operation::Put,
        Operation::Patch,
        Operation::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::List => "list",
            Operation::Post => "post",
            Operation::Put => "put",
            Operation::Patch => "patch",
            Operation::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value type accepted by validation contracts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Integer,
    Float,
    String,
    Boolean,
    Date,
    Datetime,
    Uuid,
    List,
    Dict,
}

impl ValueType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, ValueType::Integer | ValueType::Float)
    }

    /// JSON list or dict: compound values stored as JSON documents.
    pub fn is_compound(&self) -> bool {
        matches!(self, ValueType::List | ValueType::Dict)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlType {
    Simple(String),
    Parameterized { name: String, params: Option<Vec<u32>> },
}

impl SqlType {
    /// Column type as written in DDL, e.g. `varchar(2)`.
    pub fn type_str(&self) -> String {
        match self {
            SqlType::Simple(s) => s.clone(),
            SqlType::Parameterized { name, params } => {
                let p = params
                    .as_ref()
                    .map(|v| v.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(", "))
                    .unwrap_or_default();
                if p.is_empty() {
                    name.clone()
                } else {
                    format!("{}({})", name, p)
                }
            }
        }
    }

    /// Lower-cased type name without parameters, e.g. `varchar`.
    pub fn base_name(&self) -> String {
        let full = match self {
            SqlType::Simple(s) => s.as_str(),
            SqlType::Parameterized { name, .. } => name.as_str(),
        };
        full.split('(').next().unwrap_or(full).trim().to_lowercase()
    }

    /// Type usable in a `$n::<type>` cast. Serial pseudo-types cast to their integer type.
    pub fn cast_name(&self) -> String {
        match self.base_name().as_str() {
            "serial" | "serial4" => "integer".into(),
            "bigserial" | "serial8" => "bigint".into(),
            "smallserial" | "serial2" => "smallint".into(),
            other => other.to_string(),
        }
    }

    pub fn is_jsonb(&self) -> bool {
        self.base_name() == "jsonb"
    }

    pub fn is_json(&self) -> bool {
        matches!(self.base_name().as_str(), "json" | "jsonb")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub max_length: Option<u32>,
    #[serde(default)]
    pub min_length: Option<u32>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub allowed: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
    #[serde(default)]
    pub not_empty: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    /// Item type for list fields.
    #[serde(default)]
    pub items: Option<ValueType>,
    /// Storage column type. Absent means compute-only.
    #[serde(default)]
    pub sql: Option<SqlType>,
    #[serde(default)]
    pub primary_key: bool,
    /// Sequence name backing an autoincrement primary key.
    #[serde(default)]
    pub autoincrement: Option<String>,
    #[serde(default = "default_true")]
    pub allow_none: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub index: bool,
    /// Server-side default as an SQL expression.
    #[serde(default)]
    pub default: Option<String>,
    /// Value the create contract fills in when the field is absent.
    #[serde(default)]
    pub missing: Option<Value>,
    #[serde(default)]
    pub read_only: bool,
    /// Accepted on input, never projected.
    #[serde(default)]
    pub load_only: bool,
    #[serde(default)]
    pub required: bool,
    /// `table.column` target of a foreign key or many-to-many array.
    #[serde(default)]
    pub references: Option<String>,
    #[serde(default)]
    pub many: bool,
    #[serde(default)]
    pub validate: ValidationRule,
}

fn default_true() -> bool {
    true
}

impl FieldDescriptor {
    /// Splits `references` into `(table, column)`.
    pub fn reference_target(&self) -> Option<(&str, &str)> {
        self.references.as_deref().and_then(|r| r.split_once('.'))
    }

    pub fn is_foreign_key(&self) -> bool {
        self.references.is_some() && !self.many
    }

    pub fn is_many_to_many(&self) -> bool {
        self.references.is_some() && self.many
    }
}

/// Execution mode for after-write hooks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookMode {
    /// Runs before the response; a failure fails the request.
    #[default]
    Awaited,
    /// Spawned on the runtime; failures are logged and reported on the hook error channel.
    Background,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Access {
    Roles(Vec<String>),
    Predicate { predicate: String },
}

/// Permission tiers: operations open to anyone, and operations that need a session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub public: Vec<Operation>,
    #[serde(default)]
    pub authenticated: HashMap<Operation, Access>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtendsOn {
    pub parent: String,
    pub column: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceMeta {
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub get_by: Option<Vec<String>>,
    #[serde(default)]
    pub list_by: Option<Vec<String>>,
    #[serde(default)]
    pub delete_by: Option<Vec<String>>,
    #[serde(default)]
    pub excluded_ops: Vec<Operation>,
    #[serde(default)]
    pub exclude_from_updates: Vec<String>,
    #[serde(default = "default_true")]
    pub create_views: bool,
    #[serde(default)]
    pub permissions: Option<Permissions>,
    /// Fill the primary key from the session's actor id on create.
    #[serde(default)]
    pub pk_from_session: bool,
    #[serde(default)]
    pub hook_modes: HashMap<Operation, HookMode>,
    #[serde(default)]
    pub unique_together: Vec<Vec<String>>,
    #[serde(default)]
    pub extends_on: Option<ExtendsOn>,
}

impl Default for ResourceMeta {
    fn default() -> Self {
        ResourceMeta {
            route: None,
            get_by: None,
            list_by: None,
            delete_by: None,
            excluded_ops: Vec::new(),
            exclude_from_updates: Vec::new(),
            create_views: true,
            permissions: None,
            pk_from_session: false,
            hook_modes: HashMap::new(),
            unique_together: Vec::new(),
            extends_on: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceSchema {
    pub name: String,
    #[serde(default)]
    pub table: Option<String>,
    pub fields: Vec<FieldDescriptor>,
    #[serde(default)]
    pub meta: ResourceMeta,
}

impl ResourceSchema {
    /// Declared table name, or the lower-cased resource name.
    pub fn table_name(&self) -> String {
        self.table.clone().unwrap_or_else(|| self.name.to_lowercase())
    }

    pub fn route(&self) -> String {
        self.meta.route.clone().unwrap_or_else(|| self.name.to_lowercase())
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn primary_key(&self) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.primary_key)
    }

    pub fn is_kid(&self) -> bool {
        self.meta.extends_on.is_some()
    }
}

/// All declared resources, in registration order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceSet {
    pub resources: Vec<ResourceSchema>,
}

impl ResourceSet {
    pub fn by_name(&self, name: &str) -> Option<&ResourceSchema> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Non-kid resource owning `table`.
    pub fn by_table(&self, table: &str) -> Option<&ResourceSchema> {
        self.resources
            .iter()
            .find(|r| !r.is_kid() && r.table_name() == table)
    }
}
