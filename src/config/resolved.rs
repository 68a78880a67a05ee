//! Compiled resources: declarations validated, flattened and turned into
//! contracts and SQL templates once at startup.

use crate::config::{ExtendsOn, FieldDescriptor, HookMode, Operation, Permissions};
use crate::model::TableDef;
use crate::service::contract::{Contract, PaginationContract};
use crate::sql::QueryTemplate;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Where a field's value lives.
#[derive(Clone, Debug, PartialEq)]
pub enum Storage {
    /// A column on the resource's table.
    Column,
    /// A key inside the parent's JSON extension column (kid fields).
    Extension { column: String },
    /// Compute-only; validated but never persisted or projected.
    Virtual,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FieldKind {
    Scalar,
    ForeignKey { table: String, column: String },
    ManyToMany { table: String, column: String },
    /// The parent column holding a kid resource's fields.
    NestedExtension { child: String },
}

#[derive(Clone, Debug)]
pub struct ResolvedField {
    pub descriptor: FieldDescriptor,
    pub kind: FieldKind,
    pub storage: Storage,
    /// Cast applied to bound values, e.g. `integer`.
    pub cast: Option<String>,
}

impl ResolvedField {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn is_column(&self) -> bool {
        self.storage == Storage::Column
    }

    /// Projected by default: stored somewhere and not input-only.
    pub fn is_readable(&self) -> bool {
        self.storage != Storage::Virtual && !self.descriptor.load_only
    }

    /// JSON list, JSON dict or extension column: patched with a deep merge.
    pub fn is_mergeable(&self) -> bool {
        matches!(self.kind, FieldKind::NestedExtension { .. })
            || (self.descriptor.value_type.is_compound()
                && !matches!(self.kind, FieldKind::ManyToMany { .. })
                && self.descriptor.sql.as_ref().map(|s| s.is_jsonb()).unwrap_or(false))
    }
}

/// A lazily emitted `LEFT JOIN` for a selectable foreign key.
#[derive(Clone, Debug)]
pub struct JoinSpec {
    pub field: String,
    pub linked_resource: String,
    pub linked_table: String,
    pub linked_column: String,
    pub alias: String,
    pub fragment: String,
    /// Linked columns nested into single fetches.
    pub get_fields: Vec<String>,
    /// Linked columns nested into list rows.
    pub list_fields: Vec<String>,
    /// Linked column name to cast, for sub-key filters.
    pub casts: HashMap<String, Option<String>>,
}

/// A dependent table holding a many-to-many JSON array of this resource's ids.
#[derive(Clone, Debug, PartialEq)]
pub struct Cherrypick {
    pub table: String,
    pub column: String,
    pub pk: String,
}

#[derive(Clone, Debug)]
pub struct Contracts {
    pub post: Contract,
    pub get: Arc<Contract>,
    pub list: Arc<Contract>,
    pub delete: Contract,
    pub update: Contract,
    /// Kid-only fields, for nested-extension resources.
    pub child: Option<Arc<Contract>>,
    pub pagination: PaginationContract,
}

/// Templates with the select slot compiled in; `*_base` keep it open for `select` overrides.
#[derive(Clone, Debug)]
pub struct Templates {
    pub insert: QueryTemplate,
    pub get: QueryTemplate,
    pub get_base: QueryTemplate,
    pub list: QueryTemplate,
    pub list_base: QueryTemplate,
    pub update: QueryTemplate,
    pub delete: QueryTemplate,
    pub delete_deep: QueryTemplate,
    /// M2M back-reference cleanup; `$1` is a JSON array of deleted ids.
    pub cleanup: Option<String>,
    /// Joins the compiled-in get/list projections need.
    pub get_joins: BTreeSet<String>,
    pub list_joins: BTreeSet<String>,
}

#[derive(Clone, Debug)]
pub struct CompiledResource {
    pub name: String,
    pub route: String,
    pub table: String,
    pub pk: String,
    pub autoincrement: Option<String>,
    /// Full field set; a kid sees the parent's fields followed by its own.
    pub fields: Vec<ResolvedField>,
    /// Fields only the kid declares.
    pub child_fields: Vec<String>,
    pub extends_on: Option<ExtendsOn>,
    pub operations: BTreeSet<Operation>,
    pub get_by: Vec<String>,
    pub list_by: Vec<String>,
    pub delete_by: Vec<String>,
    pub exclude_from_updates: Vec<String>,
    pub create_views: bool,
    pub permissions: Option<Permissions>,
    pub pk_from_session: bool,
    pub hook_modes: HashMap<Operation, HookMode>,
    pub joins: Vec<JoinSpec>,
    pub cherrypicks: Vec<Cherrypick>,
    pub contracts: Contracts,
    pub templates: Templates,
}

impl CompiledResource {
    pub fn field(&self, name: &str) -> Option<&ResolvedField> {
        self.fields.iter().find(|f| f.name() == name)
    }

    pub fn join(&self, field: &str) -> Option<&JoinSpec> {
        self.joins.iter().find(|j| j.field == field)
    }

    pub fn is_kid(&self) -> bool {
        self.extends_on.is_some()
    }

    pub fn allows(&self, op: Operation) -> bool {
        self.operations.contains(&op)
    }

    pub fn hook_mode(&self, op: Operation) -> HookMode {
        self.hook_modes.get(&op).copied().unwrap_or_default()
    }

    /// Parent column a kid's own fields are packed into.
    pub fn kid_column(&self) -> Option<&str> {
        self.extends_on.as_ref().map(|e| e.column.as_str())
    }

    pub fn is_child_field(&self, name: &str) -> bool {
        self.child_fields.iter().any(|f| f == name)
    }
}

/// Process-wide, read-only registry of compiled resources.
#[derive(Debug, Default)]
pub struct Registry {
    resources: Vec<Arc<CompiledResource>>,
    by_route: HashMap<String, Arc<CompiledResource>>,
    by_name: HashMap<String, Arc<CompiledResource>>,
    tables: Vec<TableDef>,
}

impl Registry {
    pub(crate) fn new(resources: Vec<CompiledResource>, tables: Vec<TableDef>) -> Self {
        let resources: Vec<Arc<CompiledResource>> = resources.into_iter().map(Arc::new).collect();
        let by_route = resources
            .iter()
            .filter(|r| r.create_views)
            .map(|r| (r.route.clone(), r.clone()))
            .collect();
        let by_name = resources.iter().map(|r| (r.name.clone(), r.clone())).collect();
        Registry {
            resources,
            by_route,
            by_name,
            tables,
        }
    }

    /// Resource exposed under `route`; resources with `create_views = false` are not routable.
    pub fn by_route(&self, route: &str) -> Option<&Arc<CompiledResource>> {
        self.by_route.get(route)
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<CompiledResource>> {
        self.by_name.get(name)
    }

    pub fn resources(&self) -> &[Arc<CompiledResource>] {
        &self.resources
    }

    /// Table definitions for provisioning, in registration order.
    pub fn tables(&self) -> &[TableDef] {
        &self.tables
    }
}
