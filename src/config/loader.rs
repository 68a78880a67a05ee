//! Load resource declarations from JSON and compile them into a [`Registry`].

use crate::config::resolved::{
    Cherrypick, CompiledResource, Contracts, FieldKind, JoinSpec, Registry, ResolvedField, Storage, Templates,
};
use crate::config::types::*;
use crate::config::validate;
use crate::error::ConfigError;
use crate::model::synthesize_all;
use crate::service::contract::{Contract, ContractField, PaginationContract, Shape};
use crate::sql::builder::{self, qualified, quoted, TableView};
use crate::sql::{Slot, SlotValues};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Effective list metadata after defaults and kid inheritance.
#[derive(Clone, Debug, Default)]
struct Lists {
    get_by: Vec<String>,
    list_by: Vec<String>,
    delete_by: Vec<String>,
    excluded_ops: Vec<Operation>,
    exclude_from_updates: Vec<String>,
}

fn union<T: Clone + PartialEq>(a: &[T], b: &[T]) -> Vec<T> {
    let mut out = a.to_vec();
    for x in b {
        if !out.contains(x) {
            out.push(x.clone());
        }
    }
    out
}

fn own_lists(schema: &ResourceSchema) -> Lists {
    let meta = &schema.meta;
    let pk: Vec<String> = schema.primary_key().map(|f| vec![f.name.clone()]).unwrap_or_default();
    let get_by = meta.get_by.clone().unwrap_or_else(|| {
        let unique: Vec<String> = schema
            .fields
            .iter()
            .filter(|f| f.unique && !f.primary_key && f.sql.is_some())
            .map(|f| f.name.clone())
            .collect();
        union(&pk, &unique)
    });
    Lists {
        list_by: meta.list_by.clone().unwrap_or_else(|| get_by.clone()),
        delete_by: meta.delete_by.clone().unwrap_or(pk),
        get_by,
        excluded_ops: meta.excluded_ops.clone(),
        exclude_from_updates: meta.exclude_from_updates.clone(),
    }
}

/// A kid's lists are the parent's plus whatever the kid declares.
fn lists(set: &ResourceSet, schema: &ResourceSchema) -> Lists {
    let Some(parent) = schema.meta.extends_on.as_ref().and_then(|e| set.by_name(&e.parent)) else {
        return own_lists(schema);
    };
    let base = own_lists(parent);
    let meta = &schema.meta;
    let declared = |v: &Option<Vec<String>>| v.clone().unwrap_or_default();
    Lists {
        get_by: union(&base.get_by, &declared(&meta.get_by)),
        list_by: union(&base.list_by, &declared(&meta.list_by)),
        delete_by: union(&base.delete_by, &declared(&meta.delete_by)),
        excluded_ops: union(&base.excluded_ops, &meta.excluded_ops),
        exclude_from_updates: union(&base.exclude_from_updates, &meta.exclude_from_updates),
    }
}

fn kid_of<'a>(set: &'a ResourceSet, parent: &str, column: &str) -> Option<&'a ResourceSchema> {
    set.resources.iter().find(|r| {
        r.meta
            .extends_on
            .as_ref()
            .map(|e| e.parent == parent && e.column == column)
            .unwrap_or(false)
    })
}

fn resolve_field(set: &ResourceSet, owner: &ResourceSchema, d: &FieldDescriptor, storage: Storage) -> ResolvedField {
    let kind = if storage != Storage::Column {
        FieldKind::Scalar
    } else if let (Some((table, column)), true) = (d.reference_target(), d.many) {
        FieldKind::ManyToMany {
            table: table.to_string(),
            column: column.to_string(),
        }
    } else if let Some((table, column)) = d.reference_target() {
        FieldKind::ForeignKey {
            table: table.to_string(),
            column: column.to_string(),
        }
    } else if let Some(kid) = kid_of(set, &owner.name, &d.name) {
        FieldKind::NestedExtension { child: kid.name.clone() }
    } else {
        FieldKind::Scalar
    };
    let cast = match storage {
        Storage::Column => d.sql.as_ref().map(SqlType::cast_name),
        _ => None,
    };
    ResolvedField {
        descriptor: d.clone(),
        kind,
        storage,
        cast,
    }
}

fn storage_of(d: &FieldDescriptor) -> Storage {
    if d.sql.is_some() {
        Storage::Column
    } else {
        Storage::Virtual
    }
}

/// Contract over a kid's own fields, as validated inside the parent's extension column.
fn child_contract(kid: &ResourceSchema, parent: &ResourceSchema) -> Result<Contract, ConfigError> {
    let fields = kid
        .fields
        .iter()
        .filter(|f| parent.field(&f.name).is_none())
        .map(ContractField::from_descriptor)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Contract::new(fields))
}

fn lookup_contract(linked: &ResourceSchema, names: &[String]) -> Result<Arc<Contract>, ConfigError> {
    let fields = names
        .iter()
        .filter_map(|n| linked.field(n))
        .map(ContractField::from_descriptor)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Arc::new(Contract::new(fields).partial()))
}

struct Lookups {
    get: Arc<Contract>,
    list: Arc<Contract>,
}

fn build_joins(
    set: &ResourceSet,
    table: &str,
    fields: &[ResolvedField],
    lists: &Lists,
) -> Result<(Vec<JoinSpec>, HashMap<String, Lookups>), ConfigError> {
    let mut joins = Vec::new();
    let mut lookups = HashMap::new();
    for name in union(&lists.get_by, &lists.list_by) {
        let Some(field) = fields.iter().find(|f| f.name() == name) else { continue };
        let FieldKind::ForeignKey { table: linked_table, column } = &field.kind else { continue };
        let linked = set.by_table(linked_table).ok_or_else(|| ConfigError::MissingReference {
            kind: "table",
            id: linked_table.clone(),
        })?;
        let linked_lists = own_lists(linked);
        let stored = |names: &[String]| -> Vec<String> {
            names
                .iter()
                .filter(|n| linked.field(n).map(|f| f.sql.is_some()).unwrap_or(false))
                .cloned()
                .collect()
        };
        let alias = format!("j_{}", name);
        joins.push(JoinSpec {
            field: name.clone(),
            linked_resource: linked.name.clone(),
            linked_table: linked_table.clone(),
            linked_column: column.clone(),
            fragment: format!(
                "LEFT JOIN {} AS {} ON {} = {}",
                quoted(linked_table),
                quoted(&alias),
                qualified(&alias, column),
                qualified(table, &name)
            ),
            alias,
            get_fields: stored(&linked_lists.get_by),
            list_fields: stored(&linked_lists.list_by),
            casts: linked
                .fields
                .iter()
                .filter_map(|f| f.sql.as_ref().map(|s| (f.name.clone(), Some(s.cast_name()))))
                .collect(),
        });
        lookups.insert(
            name.clone(),
            Lookups {
                get: lookup_contract(linked, &stored(&linked_lists.get_by))?,
                list: lookup_contract(linked, &stored(&linked_lists.list_by))?,
            },
        );
    }
    Ok((joins, lookups))
}

/// Dependent tables whose many-to-many arrays hold this table's primary keys.
fn cherrypicks(set: &ResourceSet, table: &str, pk: &str) -> Vec<Cherrypick> {
    let mut out = Vec::new();
    for other in set.resources.iter().filter(|r| !r.is_kid()) {
        let Some(other_pk) = other.primary_key() else { continue };
        for f in &other.fields {
            if f.is_many_to_many() && f.reference_target() == Some((table, pk)) {
                out.push(Cherrypick {
                    table: other.table_name(),
                    column: f.name.clone(),
                    pk: other_pk.name.clone(),
                });
            }
        }
    }
    out
}

fn compile(set: &ResourceSet, schema: &ResourceSchema) -> Result<CompiledResource, ConfigError> {
    let parent = match &schema.meta.extends_on {
        Some(ext) => Some(
            set.by_name(&ext.parent)
                .ok_or_else(|| ConfigError::MissingExtensionTarget(schema.name.clone()))?,
        ),
        None => None,
    };
    let owner = parent.unwrap_or(schema);
    let kid_column = schema.meta.extends_on.as_ref().map(|e| e.column.clone());
    let pk = owner.primary_key().ok_or_else(|| ConfigError::InvalidPrimaryKey {
        resource: schema.name.clone(),
        reason: "no primary key declared".into(),
    })?;
    let table = owner.table_name();

    let mut fields: Vec<ResolvedField> = owner
        .fields
        .iter()
        .map(|d| resolve_field(set, owner, d, storage_of(d)))
        .collect();
    let mut child_fields = Vec::new();
    if let (Some(parent), Some(column)) = (parent, &kid_column) {
        for d in schema.fields.iter().filter(|d| parent.field(&d.name).is_none()) {
            fields.push(resolve_field(set, owner, d, Storage::Extension { column: column.clone() }));
            child_fields.push(d.name.clone());
        }
    }

    let lists = lists(set, schema);
    let (joins, lookups) = build_joins(set, &table, &fields, &lists)?;

    // Nested contracts for extension columns on this table.
    let mut nested_full: HashMap<String, Arc<Contract>> = HashMap::new();
    let mut nested_partial: HashMap<String, Arc<Contract>> = HashMap::new();
    for f in &fields {
        if let FieldKind::NestedExtension { child } = &f.kind {
            if let Some(kid) = set.by_name(child) {
                let contract = child_contract(kid, owner)?;
                nested_partial.insert(f.name().to_string(), Arc::new(contract.clone().partial()));
                nested_full.insert(f.name().to_string(), Arc::new(contract));
            }
        }
    }

    let pk_from_session = schema.meta.pk_from_session || owner.meta.pk_from_session;
    let autoincrement = pk.autoincrement.clone();
    let is_kid_column = |f: &ResolvedField| Some(f.name()) == kid_column.as_deref();

    let post = {
        let mut out = Vec::new();
        for f in &fields {
            let d = &f.descriptor;
            if d.read_only || is_kid_column(f) {
                continue;
            }
            if d.primary_key && (autoincrement.is_some() || pk_from_session) {
                continue;
            }
            let mut cf = ContractField::from_descriptor(d)?;
            if let Some(c) = nested_full.get(f.name()) {
                cf = cf.with_shape(Shape::Nested(c.clone()));
            }
            out.push(cf);
        }
        Contract::new(out)
    };

    let read = |names: &[String], list: bool| -> Result<Contract, ConfigError> {
        let mut out = Vec::new();
        for name in names {
            let Some(f) = fields.iter().find(|f| f.name() == name) else { continue };
            let cf = ContractField::from_descriptor(&f.descriptor)?;
            let cf = match &f.kind {
                FieldKind::ManyToMany { .. } => cf.with_shape(Shape::ManyToMany { accept_scalar: true }),
                FieldKind::ForeignKey { .. } => {
                    let lookup = lookups.get(name).map(|l| if list { l.list.clone() } else { l.get.clone() });
                    cf.with_shape(Shape::ForeignKey { lookup })
                }
                FieldKind::NestedExtension { .. } => match nested_partial.get(name) {
                    Some(c) => cf.with_shape(Shape::Nested(c.clone())),
                    None => cf,
                },
                FieldKind::Scalar => cf,
            };
            out.push(cf);
        }
        Ok(Contract::new(out).partial())
    };
    let get = Arc::new(read(&lists.get_by, false)?);
    let list = Arc::new(read(&lists.list_by, true)?);
    let delete = read(&lists.delete_by, false)?;

    let update = {
        let mut out = Vec::new();
        for f in &fields {
            let d = &f.descriptor;
            if d.read_only || d.primary_key || is_kid_column(f) || lists.exclude_from_updates.contains(&d.name) {
                continue;
            }
            let mut cf = ContractField::from_descriptor(d)?;
            if let Some(c) = nested_partial.get(f.name()) {
                cf = cf.with_shape(Shape::Nested(c.clone()));
            }
            out.push(cf);
        }
        Contract::new(out).partial()
    };

    let child = match parent {
        Some(p) => Some(Arc::new(child_contract(schema, p)?.partial())),
        None => None,
    };

    let pagination = PaginationContract {
        allowed_order_by: lists
            .list_by
            .iter()
            .filter(|n| {
                fields
                    .iter()
                    .find(|f| f.name() == n.as_str())
                    .map(|f| !f.descriptor.value_type.is_compound() && !matches!(f.kind, FieldKind::ManyToMany { .. }))
                    .unwrap_or(false)
            })
            .cloned()
            .collect(),
        default_order_by: vec![pk.name.clone()],
    };

    let cherrypicks = cherrypicks(set, &table, &pk.name);
    let view = TableView {
        table: &table,
        pk: &pk.name,
        fields: &fields,
        joins: &joins,
    };
    let selection = builder::default_selection(view, kid_column.as_deref());
    let (get_select, get_joins) = builder::select_expr(view, &selection, false);
    let (list_select, list_joins) = builder::select_expr(view, &selection, true);
    let get_base = builder::get_template(&table)?;
    let list_base = builder::list_template(&table)?;
    let templates = Templates {
        insert: builder::insert_template(&table, &pk.name)?,
        get: get_base.fill(&SlotValues::new().with(Slot::Select, get_select)),
        get_base,
        list: list_base.fill(&SlotValues::new().with(Slot::Select, list_select)),
        list_base,
        update: builder::update_template(&table)?,
        delete: builder::delete_template(&table)?,
        delete_deep: builder::delete_deep_template(&table, &pk.name)?,
        cleanup: builder::cleanup_statement(&cherrypicks),
        get_joins,
        list_joins,
    };

    let operations: BTreeSet<Operation> = Operation::ALL
        .iter()
        .copied()
        .filter(|op| !lists.excluded_ops.contains(op))
        .collect();

    Ok(CompiledResource {
        name: schema.name.clone(),
        route: schema.route(),
        table,
        pk: pk.name.clone(),
        autoincrement,
        fields,
        child_fields,
        extends_on: schema.meta.extends_on.clone(),
        operations,
        get_by: lists.get_by,
        list_by: lists.list_by,
        delete_by: lists.delete_by,
        exclude_from_updates: lists.exclude_from_updates,
        create_views: schema.meta.create_views,
        permissions: schema.meta.permissions.clone(),
        pk_from_session,
        hook_modes: schema.meta.hook_modes.clone(),
        joins,
        cherrypicks,
        contracts: Contracts {
            post,
            get,
            list,
            delete,
            update,
            child,
            pagination,
        },
        templates,
    })
}

/// Validate declarations and compile every resource (call once at startup).
pub fn resolve(set: &ResourceSet) -> Result<Registry, ConfigError> {
    validate(set)?;
    let tables = synthesize_all(set)?;
    let mut compiled = Vec::with_capacity(set.resources.len());
    for schema in &set.resources {
        let resource = compile(set, schema)?;
        tracing::debug!(
            resource = %resource.name,
            route = %resource.route,
            table = %resource.table,
            joins = resource.joins.len(),
            "resource compiled"
        );
        if !resource.create_views {
            tracing::info!(resource = %resource.name, "compiled without routes");
        }
        if let Some(perms) = &resource.permissions {
            for op in resource.operations.iter() {
                if !perms.public.contains(op) && !perms.authenticated.contains_key(op) {
                    tracing::warn!(resource = %resource.name, operation = %op, "operation is granted to nobody");
                }
            }
        }
        if resource.allows(Operation::List) && resource.contracts.pagination.allowed_order_by.is_empty() {
            tracing::warn!(resource = %resource.name, "no list_by field can be used in order_by");
        }
        compiled.push(resource);
    }
    Ok(Registry::new(compiled, tables))
}

/// Parses a JSON array of resources, a `{"resources": [...]}` object, or one resource object.
pub fn parse_resources(text: &str) -> Result<Vec<ResourceSchema>, ConfigError> {
    let value: Value = serde_json::from_str(text).map_err(|e| ConfigError::Load(e.to_string()))?;
    let parsed = match value {
        Value::Array(_) => serde_json::from_value(value),
        Value::Object(ref obj) if obj.contains_key("resources") => {
            serde_json::from_value::<ResourceSet>(value).map(|s| s.resources)
        }
        other => serde_json::from_value::<ResourceSchema>(other).map(|r| vec![r]),
    };
    parsed.map_err(|e| ConfigError::Load(e.to_string()))
}

async fn read_file(path: &Path) -> Result<String, ConfigError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))
}

/// Load declarations from a JSON file, or from every `*.json` file of a directory in name order.
pub async fn load_from_path(path: impl AsRef<Path>) -> Result<ResourceSet, ConfigError> {
    let path = path.as_ref();
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
    if !meta.is_dir() {
        let resources = parse_resources(&read_file(path).await?)?;
        return Ok(ResourceSet { resources });
    }

    let mut entries = tokio::fs::read_dir(path)
        .await
        .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
    let mut files: Vec<PathBuf> = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ConfigError::Load(e.to_string()))?
    {
        let p = entry.path();
        if p.extension().and_then(|e| e.to_str()) == Some("json") {
            files.push(p);
        }
    }
    files.sort();

    let mut resources = Vec::new();
    for file in &files {
        let parsed = parse_resources(&read_file(file).await?)?;
        tracing::debug!(file = %file.display(), count = parsed.len(), "resources loaded");
        resources.extend(parsed);
    }
    Ok(ResourceSet { resources })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shop() -> ResourceSet {
        serde_json::from_value(json!({"resources": [
            {"name": "Distributor", "table": "dist", "fields": [
                {"name": "id", "type": "integer", "sql": "integer", "primary_key": true,
                 "autoincrement": "distributor_id_seq", "read_only": true},
                {"name": "name", "type": "string", "sql": "varchar(64)", "unique": true, "required": true, "allow_none": false},
                {"name": "meta", "type": "string", "sql": "varchar(2)", "validate": {"max_length": 2}}
            ], "meta": {"route": "dist", "list_by": ["id", "name", "meta"], "delete_by": ["id", "meta"]}},
            {"name": "Producer", "fields": [
                {"name": "id", "type": "integer", "sql": "integer", "primary_key": true, "autoincrement": "producer_id_seq", "read_only": true},
                {"name": "name", "type": "string", "sql": "varchar(64)", "unique": true, "required": true},
                {"name": "distributors", "type": "list", "items": "integer", "sql": "jsonb",
                 "references": "dist.id", "many": true, "missing": []}
            ]},
            {"name": "Product", "fields": [
                {"name": "id", "type": "integer", "sql": "integer", "primary_key": true, "autoincrement": "product_id_seq", "read_only": true},
                {"name": "name", "type": "string", "sql": "varchar(64)", "required": true},
                {"name": "producer", "type": "integer", "sql": "integer", "references": "producer.id"}
            ], "meta": {"get_by": ["id", "name", "producer"], "list_by": ["id", "name", "producer"], "excluded_ops": ["put"]}},
            {"name": "Actor", "fields": [
                {"name": "id", "type": "integer", "sql": "integer", "primary_key": true, "autoincrement": "actor_id_seq", "read_only": true},
                {"name": "name", "type": "string", "sql": "varchar(64)"},
                {"name": "details", "type": "dict", "sql": "jsonb", "default": "'{}'::jsonb", "missing": {}}
            ], "meta": {"list_by": ["id", "name"]}},
            {"name": "Operator", "fields": [
                {"name": "phone", "type": "string", "required": true},
                {"name": "rating", "type": "integer"}
            ], "meta": {"route": "op", "extends_on": {"parent": "Actor", "column": "details"}, "list_by": ["rating"]}}
        ]}))
        .unwrap()
    }

    #[test]
    fn defaults_and_routes() {
        let reg = resolve(&shop()).unwrap();
        let dist = reg.by_route("dist").unwrap();
        assert_eq!(dist.get_by, ["id", "name"]);
        assert_eq!(dist.delete_by, ["id", "meta"]);
        assert_eq!(dist.contracts.pagination.allowed_order_by, ["id", "name", "meta"]);
        assert!(dist.contracts.post.field("id").is_none());
        assert_eq!(reg.tables().len(), 4);

        let product = reg.by_route("product").unwrap();
        assert!(!product.allows(Operation::Put));
        assert!(product.allows(Operation::Patch));
    }

    #[test]
    fn foreign_keys_in_lookup_lists_get_joins() {
        let reg = resolve(&shop()).unwrap();
        let product = reg.by_name("Product").unwrap();
        let join = product.join("producer").unwrap();
        assert_eq!(
            join.fragment,
            "LEFT JOIN \"producer\" AS \"j_producer\" ON \"j_producer\".\"id\" = \"product\".\"producer\""
        );
        assert_eq!(join.get_fields, ["id", "name"]);
        assert!(product.templates.get.to_string().contains("'producer', CASE WHEN \"j_producer\".\"id\" IS NULL"));
        assert!(product.templates.get_joins.contains("producer"));
        assert!(product.templates.get_base.has_slot(Slot::Select));
        assert!(!product.templates.get.has_slot(Slot::Select));
    }

    #[test]
    fn many_to_many_targets_get_cleanup() {
        let reg = resolve(&shop()).unwrap();
        let dist = reg.by_name("Distributor").unwrap();
        assert_eq!(
            dist.cherrypicks,
            vec![Cherrypick {
                table: "producer".into(),
                column: "distributors".into(),
                pk: "id".into()
            }]
        );
        assert!(dist.templates.cleanup.is_some());
        assert!(reg.by_name("Product").unwrap().templates.cleanup.is_none());
    }

    #[test]
    fn kid_inherits_parent_table_and_lists() {
        let reg = resolve(&shop()).unwrap();
        let op = reg.by_route("op").unwrap();
        assert_eq!(op.table, "actor");
        assert_eq!(op.pk, "id");
        assert_eq!(op.child_fields, ["phone", "rating"]);
        assert_eq!(op.list_by, ["id", "name", "rating"]);
        assert_eq!(
            op.field("rating").unwrap().storage,
            Storage::Extension { column: "details".into() }
        );
        assert!(op.contracts.post.field("details").is_none());
        assert!(op.contracts.post.field("phone").unwrap().required);
        let get = op.templates.get.to_string();
        assert!(get.contains("'rating', \"actor\".\"details\"->'rating'"));
        assert!(!get.contains("'details'"));

        let actor = reg.by_name("Actor").unwrap();
        assert_eq!(
            actor.field("details").unwrap().kind,
            FieldKind::NestedExtension { child: "Operator".into() }
        );
        assert!(matches!(actor.contracts.post.field("details").unwrap().shape, Shape::Nested(_)));
    }

    #[test]
    fn parses_every_declaration_form() {
        let one = parse_resources(r#"{"name": "A", "fields": []}"#).unwrap();
        assert_eq!(one.len(), 1);
        let many = parse_resources(r#"[{"name": "A", "fields": []}, {"name": "B", "fields": []}]"#).unwrap();
        assert_eq!(many.len(), 2);
        let wrapped = parse_resources(r#"{"resources": [{"name": "A", "fields": []}]}"#).unwrap();
        assert_eq!(wrapped[0].name, "A");
        assert!(matches!(parse_resources("{"), Err(ConfigError::Load(_))));
    }

    #[tokio::test]
    async fn missing_path_is_a_load_error() {
        let err = load_from_path("/nonexistent/resources.json").await.unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }
}
