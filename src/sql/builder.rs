//! Query compiler: builds templates at startup and request-time fragments
//! (projection, WHERE, SET, INSERT lists) from compiled resources.
//! Identifiers come from declarations only; values always go through binds.

use crate::config::{Cherrypick, CompiledResource, FieldKind, JoinSpec, Operation, ResolvedField, Storage, ValueType};
use crate::sql::params::{BindValue, Binds};
use crate::sql::template::{QueryTemplate, TemplateError};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Quote identifier for PostgreSQL (safe: only from declarations).
pub fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Qualified column, e.g. `"product"."name"`.
pub fn qualified(table: &str, column: &str) -> String {
    format!("{}.{}", quoted(table), quoted(column))
}

pub(crate) fn literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Table, fields and joins of one resource: everything the compiler reads.
#[derive(Clone, Copy)]
pub struct TableView<'a> {
    pub table: &'a str,
    pub pk: &'a str,
    pub fields: &'a [ResolvedField],
    pub joins: &'a [JoinSpec],
}

impl<'a> TableView<'a> {
    pub fn of(resource: &'a CompiledResource) -> Self {
        TableView {
            table: &resource.table,
            pk: &resource.pk,
            fields: &resource.fields,
            joins: &resource.joins,
        }
    }

    fn field(&self, name: &str) -> Option<&'a ResolvedField> {
        self.fields.iter().find(|f| f.name() == name)
    }

    fn join(&self, name: &str) -> Option<&'a JoinSpec> {
        self.joins.iter().find(|j| j.field == name)
    }

    /// SQL expression reading a field: a column or a key of the extension column.
    pub fn field_expr(&self, field: &ResolvedField) -> Option<String> {
        match &field.storage {
            Storage::Column => Some(qualified(self.table, field.name())),
            Storage::Extension { column } => Some(format!(
                "{}->{}",
                qualified(self.table, column),
                literal(field.name())
            )),
            Storage::Virtual => None,
        }
    }
}

/// A projected field, optionally narrowed to some of a joined resource's fields.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectField {
    pub name: String,
    pub sub: Option<Vec<String>>,
}

impl SelectField {
    pub fn plain(name: &str) -> Self {
        SelectField {
            name: name.to_string(),
            sub: None,
        }
    }
}

#[derive(Clone, Debug)]
enum Projection {
    Expr(String),
    Object {
        entries: Vec<(String, Projection)>,
        /// Renders NULL when this expression is NULL (unmatched LEFT JOIN).
        null_guard: Option<String>,
    },
}

fn render_projection(p: &Projection) -> String {
    match p {
        Projection::Expr(e) => e.clone(),
        Projection::Object { entries, null_guard } => {
            let body = entries
                .iter()
                .map(|(k, v)| format!("{}, {}", literal(k), render_projection(v)))
                .collect::<Vec<_>>()
                .join(", ");
            let obj = format!("json_build_object({})", body);
            match null_guard {
                Some(g) => format!("CASE WHEN {} IS NULL THEN NULL ELSE {} END", g, obj),
                None => obj,
            }
        }
    }
}

/// Default projection: every readable field; a kid hides the extension column it lives in.
pub fn default_selection(view: TableView<'_>, extension_column: Option<&str>) -> Vec<SelectField> {
    view.fields
        .iter()
        .filter(|f| f.is_readable())
        .filter(|f| Some(f.name()) != extension_column)
        .map(|f| SelectField::plain(f.name()))
        .collect()
}

/// `json_build_object(...)` for the selection, plus the joins it needs.
pub fn select_expr(view: TableView<'_>, selection: &[SelectField], list: bool) -> (String, BTreeSet<String>) {
    let mut joins = BTreeSet::new();
    let mut entries = Vec::new();
    for sel in selection {
        let Some(field) = view.field(&sel.name) else { continue };
        let join = match field.kind {
            FieldKind::ForeignKey { .. } if field.is_column() => view.join(&sel.name),
            _ => None,
        };
        let projection = match join {
            Some(j) => {
                let defaults = if list { &j.list_fields } else { &j.get_fields };
                let subs = sel.sub.as_ref().unwrap_or(defaults);
                joins.insert(j.field.clone());
                Projection::Object {
                    entries: subs
                        .iter()
                        .map(|s| (s.clone(), Projection::Expr(qualified(&j.alias, s))))
                        .collect(),
                    null_guard: Some(qualified(&j.alias, &j.linked_column)),
                }
            }
            None => match view.field_expr(field) {
                Some(e) => Projection::Expr(e),
                None => continue,
            },
        };
        entries.push((sel.name.clone(), projection));
    }
    let root = Projection::Object {
        entries,
        null_guard: None,
    };
    (render_projection(&root), joins)
}

/// Join fragments for the active joins, in declaration order.
pub fn joins_sql(view: TableView<'_>, active: &BTreeSet<String>) -> String {
    view.joins
        .iter()
        .filter(|j| active.contains(&j.field))
        .map(|j| j.fragment.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WhereMode {
    /// SELECTs: foreign sub-key filters go through the LEFT JOIN alias.
    Select,
    /// UPDATE/DELETE: foreign sub-key filters become `IN (SELECT ...)` subqueries.
    Mutate,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WhereClause {
    pub sql: String,
    /// Joins activated by foreign sub-key filters.
    pub joins: BTreeSet<String>,
}

fn json_text(v: &Value) -> BindValue {
    match v {
        Value::String(s) => BindValue::Text(Some(s.clone())),
        other => BindValue::Text(Some(other.to_string())),
    }
}

fn bind_field(binds: &mut Binds, name: &str, field: &ResolvedField, v: &Value) -> String {
    if field.descriptor.value_type.is_compound() || v.is_array() || v.is_object() {
        binds.bind_cast(name, BindValue::json(v), Some("jsonb"))
    } else {
        binds.bind_cast(name, BindValue::scalar(v), field.cast.as_deref())
    }
}

fn predicate_group(field: &ResolvedField, v: &Value) -> u8 {
    match (&field.storage, &field.kind) {
        (Storage::Extension { .. }, _) | (_, FieldKind::ManyToMany { .. }) => 0,
        (_, FieldKind::NestedExtension { .. }) if v.is_object() => 0,
        (_, FieldKind::ForeignKey { .. }) if v.is_object() => 1,
        _ => 2,
    }
}

/// WHERE clause for a validated filter payload. Extension, many-to-many and
/// foreign sub-key predicates come first; flat equality predicates follow as
/// one group. No predicates yields `1=1`.
pub fn whereize(view: TableView<'_>, payload: &Map<String, Value>, mode: WhereMode, binds: &mut Binds) -> WhereClause {
    let mut json_preds: Vec<String> = Vec::new();
    let mut foreign_preds: Vec<String> = Vec::new();
    let mut flat_preds: Vec<String> = Vec::new();
    let mut joins = BTreeSet::new();

    // Binds are numbered in predicate order.
    let mut present: Vec<(&ResolvedField, &Value)> = view
        .fields
        .iter()
        .filter_map(|f| payload.get(f.name()).map(|v| (f, v)))
        .collect();
    present.sort_by_key(|(f, v)| predicate_group(f, v));

    for (field, v) in present {
        let name = field.name();
        let Some(expr) = view.field_expr(field) else { continue };

        if let Storage::Extension { .. } = field.storage {
            let target = format!("({})", expr);
            let pred = if v.is_null() {
                format!("({t} IS NULL OR {t} = 'null'::jsonb)", t = target)
            } else if field.descriptor.value_type.is_numeric() {
                format!("{} = {}", target, binds.bind_cast(name, BindValue::json(v), Some("jsonb")))
            } else if field.descriptor.value_type == ValueType::List {
                let list = if v.is_array() { v.clone() } else { Value::Array(vec![v.clone()]) };
                format!("{} @> {}", target, binds.bind_cast(name, BindValue::json(&list), Some("jsonb")))
            } else {
                format!("{} ? {}", target, binds.bind(name, json_text(v)))
            };
            json_preds.push(pred);
            continue;
        }

        match &field.kind {
            FieldKind::ManyToMany { .. } => {
                let list = if v.is_array() { v.clone() } else { Value::Array(vec![v.clone()]) };
                json_preds.push(format!(
                    "{} @> {}",
                    expr,
                    binds.bind_cast(name, BindValue::json(&list), Some("jsonb"))
                ));
            }
            FieldKind::NestedExtension { .. } if v.is_object() => {
                json_preds.push(format!(
                    "{} @> {}",
                    expr,
                    binds.bind_cast(name, BindValue::json(v), Some("jsonb"))
                ));
            }
            FieldKind::ForeignKey { .. } if v.is_object() => {
                let Some(join) = view.join(name) else { continue };
                let sub = v.as_object().cloned().unwrap_or_default();
                let source = match mode {
                    WhereMode::Select => join.alias.as_str(),
                    WhereMode::Mutate => join.linked_table.as_str(),
                };
                let mut parts = Vec::new();
                for (key, sv) in &sub {
                    let col = qualified(source, key);
                    if sv.is_null() {
                        parts.push(format!("{} IS NULL", col));
                    } else {
                        let cast = join.casts.get(key).cloned().flatten();
                        let bind_name = format!("{}_{}", name, key);
                        let ph = if sv.is_array() || sv.is_object() {
                            binds.bind_cast(&bind_name, BindValue::json(sv), Some("jsonb"))
                        } else {
                            binds.bind_cast(&bind_name, BindValue::scalar(sv), cast.as_deref())
                        };
                        parts.push(format!("{} = {}", col, ph));
                    }
                }
                if parts.is_empty() {
                    continue;
                }
                match mode {
                    WhereMode::Select => {
                        joins.insert(join.field.clone());
                        foreign_preds.extend(parts);
                    }
                    WhereMode::Mutate => foreign_preds.push(format!(
                        "{} IN (SELECT {} FROM {} WHERE {})",
                        expr,
                        qualified(&join.linked_table, &join.linked_column),
                        quoted(&join.linked_table),
                        parts.join(" AND ")
                    )),
                }
            }
            _ => {
                if v.is_null() {
                    flat_preds.push(format!("{} IS NULL", expr));
                } else {
                    let ph = bind_field(binds, &format!("w_{}", name), field, v);
                    flat_preds.push(format!("{} = {}", expr, ph));
                }
            }
        }
    }

    let mut all = json_preds;
    all.extend(foreign_preds);
    if !flat_preds.is_empty() {
        all.push(flat_preds.join(" AND "));
    }
    let sql = if all.is_empty() { "1=1".to_string() } else { all.join(" AND ") };
    WhereClause { sql, joins }
}

/// SET list. Patch deep-merges mergeable JSON columns; put assigns, except that a
/// kid's extension column keeps keys the payload does not mention.
pub fn updates(view: TableView<'_>, payload: &Map<String, Value>, op: Operation, kid_column: Option<&str>, binds: &mut Binds) -> String {
    let mut sets = Vec::new();
    for field in view.fields.iter().filter(|f| f.is_column()) {
        let name = field.name();
        let Some(v) = payload.get(name) else { continue };
        if name == view.pk {
            continue;
        }
        let current = qualified(view.table, name);
        let bind_name = format!("u_{}", name);
        let rhs = if v.is_null() {
            "NULL".to_string()
        } else if op == Operation::Patch && field.is_mergeable() {
            format!(
                "jsonb_merge_deep({}, {})",
                current,
                binds.bind_cast(&bind_name, BindValue::json(v), Some("jsonb"))
            )
        } else if Some(name) == kid_column {
            format!(
                "COALESCE({}, '{{}}'::jsonb) || {}",
                current,
                binds.bind_cast(&bind_name, BindValue::json(v), Some("jsonb"))
            )
        } else {
            bind_field(binds, &bind_name, field, v)
        };
        sets.push(format!("{} = {}", quoted(name), rhs));
    }
    sets.join(", ")
}

/// INSERT column and value lists. An autoincrement key takes `nextval` inside the statement.
pub fn insert_lists(view: TableView<'_>, autoincrement: Option<&str>, payload: &Map<String, Value>, binds: &mut Binds) -> (String, String) {
    let mut cols = Vec::new();
    let mut vals = Vec::new();
    if let Some(seq) = autoincrement {
        cols.push(quoted(view.pk));
        vals.push(format!("nextval({})", literal(seq)));
    }
    for field in view.fields.iter().filter(|f| f.is_column()) {
        let name = field.name();
        if autoincrement.is_some() && name == view.pk {
            continue;
        }
        let Some(v) = payload.get(name) else { continue };
        cols.push(quoted(name));
        vals.push(if v.is_null() {
            "NULL".to_string()
        } else {
            bind_field(binds, &format!("i_{}", name), field, v)
        });
    }
    (cols.join(", "), vals.join(", "))
}

/// ORDER BY expression list for validated order_by names.
pub fn order_by(view: TableView<'_>, names: &[String]) -> String {
    names
        .iter()
        .filter_map(|n| view.field(n))
        .filter_map(|f| view.field_expr(f))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn get_template(table: &str) -> Result<QueryTemplate, TemplateError> {
    QueryTemplate::parse(&format!(
        "SELECT {{select}} AS \"inner\" FROM {} {{joins}} WHERE {{where}} LIMIT 1",
        quoted(table)
    ))
}

pub fn list_template(table: &str) -> Result<QueryTemplate, TemplateError> {
    let t = quoted(table);
    QueryTemplate::parse(&format!(
        "SELECT json_build_object('data', COALESCE((SELECT json_agg(page.\"inner\" ORDER BY page.rn) FROM (\
SELECT {{select}} AS \"inner\", row_number() OVER (ORDER BY {{orderby}} {{orderhow}}) AS rn \
FROM {t} {{joins}} WHERE {{where}} ORDER BY {{orderby}} {{orderhow}} LIMIT {{limit}} OFFSET {{offset}}\
) page), '[]'::json), 'total_count', (SELECT count(*) FROM {t} {{joins}} WHERE {{where}})) AS \"outer\"",
        t = t
    ))
}

pub fn insert_template(table: &str, pk: &str) -> Result<QueryTemplate, TemplateError> {
    QueryTemplate::parse(&format!(
        "INSERT INTO {} ({{cols}}) VALUES ({{vals}}) RETURNING to_json({})",
        quoted(table),
        qualified(table, pk)
    ))
}

pub fn update_template(table: &str) -> Result<QueryTemplate, TemplateError> {
    QueryTemplate::parse(&format!(
        "WITH rows AS (UPDATE {} SET {{updates}} WHERE {{where}} RETURNING 1) SELECT count(*) FROM rows",
        quoted(table)
    ))
}

pub fn delete_template(table: &str) -> Result<QueryTemplate, TemplateError> {
    QueryTemplate::parse(&format!(
        "WITH rows AS (DELETE FROM {} WHERE {{where}} RETURNING 1) SELECT count(*) FROM rows",
        quoted(table)
    ))
}

/// Deep variant: returns a JSON array of the deleted keys (NULL when nothing matched).
pub fn delete_deep_template(table: &str, pk: &str) -> Result<QueryTemplate, TemplateError> {
    QueryTemplate::parse(&format!(
        "WITH rows AS (DELETE FROM {} WHERE {{where}} RETURNING {}) SELECT json_agg(rows.{}) FROM rows",
        quoted(table),
        qualified(table, pk),
        quoted(pk)
    ))
}

/// One statement pruning deleted ids (bound as `$1`, a JSON array) from every
/// dependent many-to-many array, returning `{"table.column": rows touched}`.
///
/// Columns of the same table share one UPDATE, since a statement can modify a row once.
pub fn cleanup_statement(cherrypicks: &[Cherrypick]) -> Option<String> {
    if cherrypicks.is_empty() {
        return None;
    }
    let mut by_table: Vec<(&str, &str, Vec<&str>)> = Vec::new();
    for c in cherrypicks {
        match by_table.iter_mut().find(|(table, _, _)| *table == c.table) {
            Some((_, _, columns)) => {
                if !columns.contains(&c.column.as_str()) {
                    columns.push(&c.column);
                }
            }
            None => by_table.push((&c.table, &c.pk, vec![&c.column])),
        }
    }

    let mut ctes = Vec::new();
    let mut summary = Vec::new();
    for (table, pk, columns) in &by_table {
        let cte = quoted(&format!("{}_cleanup", table));
        let hits: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, column)| {
                let col = format!("src.{}", quoted(column));
                format!(
                    "CASE WHEN jsonb_typeof({col}) = 'array' THEN EXISTS (SELECT 1 FROM jsonb_array_elements_text({col}) AS x(val) \
WHERE x.val IN (SELECT jsonb_array_elements_text($1::jsonb))) ELSE false END AS hit_{i}",
                    col = col,
                    i = i
                )
            })
            .collect();
        let sets: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, column)| {
                let col = qualified(table, column);
                format!(
                    "{c} = CASE WHEN h.hit_{i} THEN COALESCE((SELECT jsonb_agg(e.elem) FROM jsonb_array_elements({col}) AS e(elem) \
WHERE (e.elem #>> '{{}}') NOT IN (SELECT jsonb_array_elements_text($1::jsonb))), '[]'::jsonb) ELSE {col} END",
                    c = quoted(column),
                    col = col,
                    i = i
                )
            })
            .collect();
        let flags: Vec<String> = (0..columns.len()).map(|i| format!("h.hit_{}", i)).collect();
        ctes.push(format!(
            "{cte} AS (UPDATE {t} SET {sets} FROM (SELECT src.{pk} AS rid, {hits} FROM {t} AS src) AS h \
WHERE {target_pk} = h.rid AND ({any}) RETURNING {returned})",
            cte = cte,
            t = quoted(table),
            sets = sets.join(", "),
            pk = quoted(pk),
            hits = hits.join(", "),
            target_pk = qualified(table, pk),
            any = flags.join(" OR "),
            returned = flags.join(", ")
        ));
        for (i, column) in columns.iter().enumerate() {
            summary.push(format!(
                "{}, (SELECT count(*) FROM {} WHERE hit_{})",
                literal(&format!("{}.{}", table, column)),
                cte,
                i
            ));
        }
    }
    Some(format!(
        "WITH {} SELECT json_build_object({})",
        ctes.join(", "),
        summary.join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FieldDescriptor, SqlType};
    use crate::sql::template::{Slot, SlotValues};
    use serde_json::json;
    use std::collections::HashMap;

    fn field(v: Value, kind: FieldKind, storage: Storage) -> ResolvedField {
        let descriptor: FieldDescriptor = serde_json::from_value(v).unwrap();
        let cast = descriptor.sql.as_ref().map(SqlType::cast_name);
        ResolvedField {
            descriptor,
            kind,
            storage,
            cast,
        }
    }

    fn product_fields() -> Vec<ResolvedField> {
        vec![
            field(json!({"name": "id", "type": "integer", "sql": "integer", "primary_key": true}), FieldKind::Scalar, Storage::Column),
            field(json!({"name": "name", "type": "string", "sql": "varchar(64)"}), FieldKind::Scalar, Storage::Column),
            field(
                json!({"name": "producer", "type": "integer", "sql": "integer", "references": "producer.id"}),
                FieldKind::ForeignKey { table: "producer".into(), column: "id".into() },
                Storage::Column,
            ),
            field(
                json!({"name": "distributors", "type": "list", "items": "integer", "sql": "jsonb",
                       "references": "distributor.id", "many": true}),
                FieldKind::ManyToMany { table: "distributor".into(), column: "id".into() },
                Storage::Column,
            ),
            field(json!({"name": "attrs", "type": "dict", "sql": "jsonb"}), FieldKind::Scalar, Storage::Column),
            field(json!({"name": "preview", "type": "string"}), FieldKind::Scalar, Storage::Virtual),
        ]
    }

    fn producer_join() -> Vec<JoinSpec> {
        vec![JoinSpec {
            field: "producer".into(),
            linked_resource: "Producer".into(),
            linked_table: "producer".into(),
            linked_column: "id".into(),
            alias: "j_producer".into(),
            fragment: "LEFT JOIN \"producer\" AS \"j_producer\" ON \"j_producer\".\"id\" = \"product\".\"producer\"".into(),
            get_fields: vec!["id".into(), "name".into()],
            list_fields: vec!["name".into()],
            casts: HashMap::from([("id".to_string(), Some("integer".to_string())), ("name".to_string(), Some("varchar".to_string()))]),
        }]
    }

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn projection_nests_joined_fields_and_skips_virtual() {
        let fields = product_fields();
        let joins = producer_join();
        let view = TableView { table: "product", pk: "id", fields: &fields, joins: &joins };
        let selection = default_selection(view, None);
        assert_eq!(selection.len(), 5);
        let (sql, active) = select_expr(view, &selection, true);
        assert_eq!(
            sql,
            "json_build_object('id', \"product\".\"id\", 'name', \"product\".\"name\", \
'producer', CASE WHEN \"j_producer\".\"id\" IS NULL THEN NULL ELSE json_build_object('name', \"j_producer\".\"name\") END, \
'distributors', \"product\".\"distributors\", 'attrs', \"product\".\"attrs\")"
        );
        assert!(active.contains("producer"));
    }

    #[test]
    fn narrowed_selection_elides_joins() {
        let fields = product_fields();
        let joins = producer_join();
        let view = TableView { table: "product", pk: "id", fields: &fields, joins: &joins };
        let (sql, active) = select_expr(view, &[SelectField::plain("name")], false);
        assert_eq!(sql, "json_build_object('name', \"product\".\"name\")");
        assert!(active.is_empty());
        assert_eq!(joins_sql(view, &active), "");
    }

    #[test]
    fn where_groups_and_binds() {
        let fields = product_fields();
        let joins = producer_join();
        let view = TableView { table: "product", pk: "id", fields: &fields, joins: &joins };
        let mut binds = Binds::new();
        let w = whereize(
            view,
            &obj(json!({"name": "Chair", "distributors": 2, "producer": {"name": "Acme"}})),
            WhereMode::Select,
            &mut binds,
        );
        assert_eq!(
            w.sql,
            "\"product\".\"distributors\" @> $1::jsonb AND \"j_producer\".\"name\" = $2::varchar AND \"product\".\"name\" = $3::varchar"
        );
        assert_eq!(binds.names(), ["distributors", "producer_name", "w_name"]);
        assert_eq!(binds.values()[0], BindValue::Json(json!([2])));
        assert!(w.joins.contains("producer"));
    }

    #[test]
    fn where_in_mutations_uses_subqueries() {
        let fields = product_fields();
        let joins = producer_join();
        let view = TableView { table: "product", pk: "id", fields: &fields, joins: &joins };
        let mut binds = Binds::new();
        let w = whereize(view, &obj(json!({"producer": {"name": "Acme"}, "id": null})), WhereMode::Mutate, &mut binds);
        assert_eq!(
            w.sql,
            "\"product\".\"producer\" IN (SELECT \"producer\".\"id\" FROM \"producer\" WHERE \"producer\".\"name\" = $1::varchar) AND \"product\".\"id\" IS NULL"
        );
        assert!(w.joins.is_empty());
    }

    #[test]
    fn empty_filter_is_always_true() {
        let fields = product_fields();
        let view = TableView { table: "product", pk: "id", fields: &fields, joins: &[] };
        let mut binds = Binds::new();
        assert_eq!(whereize(view, &Map::new(), WhereMode::Select, &mut binds).sql, "1=1");
        assert!(binds.is_empty());
    }

    #[test]
    fn extension_predicates_follow_field_type() {
        let fields = vec![
            field(json!({"name": "id", "type": "integer", "sql": "integer", "primary_key": true}), FieldKind::Scalar, Storage::Column),
            field(json!({"name": "rating", "type": "integer"}), FieldKind::Scalar, Storage::Extension { column: "details".into() }),
            field(json!({"name": "badges", "type": "list"}), FieldKind::Scalar, Storage::Extension { column: "details".into() }),
            field(json!({"name": "city", "type": "string"}), FieldKind::Scalar, Storage::Extension { column: "details".into() }),
        ];
        let view = TableView { table: "actor", pk: "id", fields: &fields, joins: &[] };
        let mut binds = Binds::new();
        let w = whereize(view, &obj(json!({"rating": 5, "badges": ["gold"], "city": "Oslo"})), WhereMode::Select, &mut binds);
        assert_eq!(
            w.sql,
            "(\"actor\".\"details\"->'rating') = $1::jsonb AND (\"actor\".\"details\"->'badges') @> $2::jsonb AND (\"actor\".\"details\"->'city') ? $3"
        );
        assert_eq!(binds.values()[2], BindValue::Text(Some("Oslo".into())));
    }

    #[test]
    fn patch_merges_put_assigns() {
        let fields = product_fields();
        let view = TableView { table: "product", pk: "id", fields: &fields, joins: &[] };
        let payload = obj(json!({"attrs": {"color": "red"}, "name": "Stool", "id": 9}));

        let mut binds = Binds::new();
        let sets = updates(view, &payload, Operation::Patch, None, &mut binds);
        assert_eq!(
            sets,
            "\"name\" = $1::varchar, \"attrs\" = jsonb_merge_deep(\"product\".\"attrs\", $2::jsonb)"
        );

        let mut binds = Binds::new();
        let sets = updates(view, &payload, Operation::Put, None, &mut binds);
        assert_eq!(sets, "\"name\" = $1::varchar, \"attrs\" = $2::jsonb");
    }

    #[test]
    fn insert_uses_sequence_for_autoincrement() {
        let fields = product_fields();
        let view = TableView { table: "product", pk: "id", fields: &fields, joins: &[] };
        let mut binds = Binds::new();
        let (cols, vals) = insert_lists(
            view,
            Some("product_id_seq"),
            &obj(json!({"name": "Chair", "distributors": [1], "preview": "x"})),
            &mut binds,
        );
        assert_eq!(cols, "\"id\", \"name\", \"distributors\"");
        assert_eq!(vals, "nextval('product_id_seq'), $1::varchar, $2::jsonb");

        let sql = insert_template("product", "id")
            .unwrap()
            .render(&SlotValues::new().with(Slot::Cols, cols).with(Slot::Vals, vals))
            .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"product\" (\"id\", \"name\", \"distributors\") VALUES (nextval('product_id_seq'), $1::varchar, $2::jsonb) RETURNING to_json(\"product\".\"id\")"
        );
    }

    #[test]
    fn templates_expose_request_slots() {
        assert_eq!(get_template("dist").unwrap().open_slots(), vec![Slot::Select, Slot::Joins, Slot::Where]);
        let list = list_template("dist").unwrap();
        for slot in [Slot::Select, Slot::OrderBy, Slot::OrderHow, Slot::Limit, Slot::Offset, Slot::Joins, Slot::Where] {
            assert!(list.has_slot(slot), "{:?}", slot);
        }
        let deep = delete_deep_template("dist", "id").unwrap().to_string();
        assert_eq!(
            deep,
            "WITH rows AS (DELETE FROM \"dist\" WHERE {where} RETURNING \"dist\".\"id\") SELECT json_agg(rows.\"id\") FROM rows"
        );
    }

    #[test]
    fn cleanup_covers_every_dependent_table() {
        assert_eq!(cleanup_statement(&[]), None);
        let sql = cleanup_statement(&[
            Cherrypick { table: "producer".into(), column: "distributors".into(), pk: "id".into() },
            Cherrypick { table: "store".into(), column: "distributors".into(), pk: "id".into() },
        ])
        .unwrap();
        assert!(sql.starts_with("WITH \"producer_cleanup\" AS (UPDATE \"producer\" SET \"distributors\" = CASE WHEN h.hit_0"));
        assert!(sql.contains("(e.elem #>> '{}')"));
        assert!(sql.ends_with(
            "SELECT json_build_object('producer.distributors', (SELECT count(*) FROM \"producer_cleanup\" WHERE hit_0), \
'store.distributors', (SELECT count(*) FROM \"store_cleanup\" WHERE hit_0))"
        ));
    }

    #[test]
    fn cleanup_updates_sibling_columns_together() {
        let sql = cleanup_statement(&[
            Cherrypick { table: "store".into(), column: "suppliers".into(), pk: "id".into() },
            Cherrypick { table: "store".into(), column: "carriers".into(), pk: "id".into() },
        ])
        .unwrap();
        assert_eq!(sql.matches("UPDATE \"store\"").count(), 1);
        assert!(sql.contains("WHERE \"store\".\"id\" = h.rid AND (h.hit_0 OR h.hit_1) RETURNING h.hit_0, h.hit_1)"));
        assert!(sql.ends_with(
            "SELECT json_build_object('store.suppliers', (SELECT count(*) FROM \"store_cleanup\" WHERE hit_0), \
'store.carriers', (SELECT count(*) FROM \"store_cleanup\" WHERE hit_1))"
        ));
    }
}
