//! Renders compiled templates for validated payloads and executes them against PostgreSQL.

use crate::config::{CompiledResource, Operation};
use crate::error::{AppError, FieldErrors};
use crate::response::{Deleted, ListPage};
use crate::service::cascade;
use crate::service::contract::{PaginationSpec, MSG_NULL};
use crate::sql::builder::{self, SelectField, TableView, WhereMode};
use crate::sql::{bind_all, Binds, Slot, SlotValues};
use regex::Regex;
use serde_json::{Map, Value};
use sqlx::postgres::{PgDatabaseError, PgRow, Postgres};
use sqlx::{PgPool, Row};
use std::sync::OnceLock;
use std::time::Duration;

/// Executes resource statements on a pool, each bounded by a statement timeout.
#[derive(Clone)]
pub struct CrudService<'a> {
    pool: &'a PgPool,
    timeout: Duration,
}

impl<'a> CrudService<'a> {
    pub fn new(pool: &'a PgPool, timeout: Duration) -> Self {
        CrudService { pool, timeout }
    }

    /// One row as JSON, or `{}` when nothing matches.
    pub async fn get(
        &self,
        resource: &CompiledResource,
        filter: &Map<String, Value>,
        selection: Option<&[SelectField]>,
    ) -> Result<Value, AppError> {
        let view = TableView::of(resource);
        let mut binds = Binds::new();
        let clause = builder::whereize(view, filter, WhereMode::Select, &mut binds);
        let (template, mut joins) = match selection {
            Some(sel) => {
                let (select, joins) = builder::select_expr(view, sel, false);
                (resource.templates.get_base.fill(&SlotValues::new().with(Slot::Select, select)), joins)
            }
            None => (resource.templates.get.clone(), resource.templates.get_joins.clone()),
        };
        joins.extend(clause.joins);
        let sql = template.render(
            &SlotValues::new()
                .with(Slot::Joins, builder::joins_sql(view, &joins))
                .with(Slot::Where, clause.sql),
        )?;
        let row = self.fetch_value(self.pool, &sql, &binds).await?;
        Ok(row.unwrap_or_else(|| Value::Object(Map::new())))
    }

    pub async fn list(
        &self,
        resource: &CompiledResource,
        filter: &Map<String, Value>,
        page: &PaginationSpec,
        selection: Option<&[SelectField]>,
    ) -> Result<ListPage, AppError> {
        let view = TableView::of(resource);
        let mut binds = Binds::new();
        let clause = builder::whereize(view, filter, WhereMode::Select, &mut binds);
        let (template, mut joins) = match selection {
            Some(sel) => {
                let (select, joins) = builder::select_expr(view, sel, true);
                (resource.templates.list_base.fill(&SlotValues::new().with(Slot::Select, select)), joins)
            }
            None => (resource.templates.list.clone(), resource.templates.list_joins.clone()),
        };
        joins.extend(clause.joins);
        let sql = template.render(
            &SlotValues::new()
                .with(Slot::Joins, builder::joins_sql(view, &joins))
                .with(Slot::Where, clause.sql)
                .with(Slot::OrderBy, builder::order_by(view, &page.order_by))
                .with(Slot::OrderHow, page.order_dir.as_sql())
                .with(Slot::Limit, page.limit.to_string())
                .with(Slot::Offset, page.offset().to_string()),
        )?;
        let value = self
            .fetch_value(self.pool, &sql, &binds)
            .await?
            .ok_or(AppError::Db(sqlx::Error::RowNotFound))?;
        serde_json::from_value(value).map_err(|e| AppError::Db(sqlx::Error::Decode(Box::new(e))))
    }

    /// Inserts one row and returns its primary key as JSON.
    pub async fn create(&self, resource: &CompiledResource, payload: &Map<String, Value>) -> Result<Value, AppError> {
        let view = TableView::of(resource);
        let mut binds = Binds::new();
        let (cols, vals) = builder::insert_lists(view, resource.autoincrement.as_deref(), payload, &mut binds);
        if cols.is_empty() {
            return Err(AppError::field("_schema", "Payload cannot be empty"));
        }
        let sql = resource
            .templates
            .insert
            .render(&SlotValues::new().with(Slot::Cols, cols).with(Slot::Vals, vals))?;
        self.fetch_value(self.pool, &sql, &binds)
            .await?
            .ok_or(AppError::Db(sqlx::Error::RowNotFound))
    }

    /// Updates every row matching `filter`; zero matches is [`AppError::UpdateFailed`].
    /// Storage errors are reported under `"payload"`.
    pub async fn update(
        &self,
        resource: &CompiledResource,
        op: Operation,
        filter: &Map<String, Value>,
        payload: &Map<String, Value>,
    ) -> Result<i64, AppError> {
        let view = TableView::of(resource);
        let mut binds = Binds::new();
        let clause = builder::whereize(view, filter, WhereMode::Mutate, &mut binds);
        let sets = builder::updates(view, payload, op, resource.kid_column(), &mut binds);
        if sets.is_empty() {
            return Err(AppError::Validation(
                FieldErrors::single("_schema", "No stored fields to update").wrap("payload"),
            ));
        }
        let sql = resource
            .templates
            .update
            .render(&SlotValues::new().with(Slot::Updates, sets).with(Slot::Where, clause.sql))?;
        let updated = self.fetch_count(self.pool, &sql, &binds).await.map_err(|e| match e {
            AppError::Validation(errors) => AppError::Validation(errors.wrap("payload")),
            other => other,
        })?;
        if updated == 0 {
            return Err(AppError::UpdateFailed);
        }
        Ok(updated)
    }

    /// Deletes matching rows. With dependent many-to-many tables (or `deep`) the deleted
    /// keys are collected in a transaction; `deep` also prunes them from those tables.
    pub async fn delete(
        &self,
        resource: &CompiledResource,
        filter: &Map<String, Value>,
        deep: bool,
    ) -> Result<Deleted, AppError> {
        let view = TableView::of(resource);
        let mut binds = Binds::new();
        let clause = builder::whereize(view, filter, WhereMode::Mutate, &mut binds);
        let values = SlotValues::new().with(Slot::Where, clause.sql);

        if !deep && resource.cherrypicks.is_empty() {
            let sql = resource.templates.delete.render(&values)?;
            let deleted = self.fetch_count(self.pool, &sql, &binds).await?;
            if deleted == 0 {
                return Err(AppError::delete_failed());
            }
            return Ok(Deleted {
                deleted_resource_records: deleted,
                deleted_m2m_refs: 0,
            });
        }

        let sql = resource.templates.delete_deep.render(&values)?;
        let mut tx = self.pool.begin().await?;
        let ids = match self.fetch_value(&mut *tx, &sql, &binds).await? {
            Some(Value::Array(ids)) if !ids.is_empty() => ids,
            _ => return Err(AppError::delete_failed()),
        };
        let refs = if deep {
            cascade::prune_references(self, &mut tx, resource, &ids).await?.total
        } else {
            0
        };
        tx.commit().await?;
        tracing::debug!(resource = %resource.name, records = ids.len(), refs, "rows deleted");
        Ok(Deleted {
            deleted_resource_records: ids.len() as i64,
            deleted_m2m_refs: refs,
        })
    }

    async fn fetch_row<'c, E>(&self, executor: E, sql: &str, binds: &Binds) -> Result<Option<PgRow>, AppError>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        tracing::debug!(sql = %sql, params = ?binds.values(), "query");
        let fut = bind_all(sql, binds.values()).fetch_optional(executor);
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(row)) => Ok(row),
            Ok(Err(e)) => Err(translate_db_error(e, sql)),
            Err(_) => {
                tracing::error!(sql = %sql, timeout_ms = self.timeout.as_millis() as u64, "statement timed out");
                Err(AppError::Timeout)
            }
        }
    }

    /// First column of the first row, decoded as JSON.
    pub(crate) async fn fetch_value<'c, E>(&self, executor: E, sql: &str, binds: &Binds) -> Result<Option<Value>, AppError>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        match self.fetch_row(executor, sql, binds).await? {
            Some(row) => Ok(row.try_get::<Option<Value>, _>(0)?),
            None => Ok(None),
        }
    }

    async fn fetch_count<'c, E>(&self, executor: E, sql: &str, binds: &Binds) -> Result<i64, AppError>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        match self.fetch_row(executor, sql, binds).await? {
            Some(row) => Ok(row.try_get::<i64, _>(0)?),
            None => Ok(0),
        }
    }
}

fn integrity_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?P<prefix>([\s\w]|_)+)\((?P<name>.*?)\)=\((?P<val>.*?)\)(?P<reason>.*)").ok())
        .as_ref()
}

/// Per-column messages from an integrity violation detail such as
/// `Key (name)=(Acme) already exists.` → `{"name": ["Key (Acme) already exists."]}`.
/// Composite keys yield one entry per column.
pub fn parse_integrity_detail(detail: &str) -> Option<FieldErrors> {
    let caps = integrity_pattern()?.captures(detail)?;
    let prefix = &caps["prefix"];
    let reason = caps["reason"].trim();
    let mut errors = FieldErrors::new();
    for (name, val) in caps["name"].split(", ").zip(caps["val"].split(", ")) {
        errors.push(name, format!("{}({}) {}", prefix, val, reason));
    }
    if errors.is_empty() {
        None
    } else {
        Some(errors)
    }
}

/// Constraint and data errors become field errors; anything else is logged with its statement.
pub fn translate_db_error(err: sqlx::Error, sql: &str) -> AppError {
    if let sqlx::Error::Database(db) = &err {
        if let Some(pg) = db.try_downcast_ref::<PgDatabaseError>() {
            let code = pg.code();
            if code == "23502" {
                if let Some(column) = pg.column() {
                    return AppError::field(column, MSG_NULL);
                }
            }
            if code.starts_with("23") {
                if let Some(errors) = pg.detail().and_then(parse_integrity_detail) {
                    return AppError::Validation(errors);
                }
                return AppError::field("_schema", pg.message());
            }
            if code.starts_with("22") {
                return AppError::field("_schema", pg.message());
            }
        }
    }
    tracing::error!(sql = %sql, error = %err, "statement failed");
    AppError::Db(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unique_violation_detail() {
        let errors = parse_integrity_detail("Key (name)=(Acme) already exists.").unwrap();
        assert_eq!(
            serde_json::to_value(&errors).unwrap(),
            json!({"name": ["Key (Acme) already exists."]})
        );
    }

    #[test]
    fn foreign_key_violation_detail() {
        let errors = parse_integrity_detail("Key (producer)=(42) is not present in table \"producer\".").unwrap();
        assert_eq!(
            serde_json::to_value(&errors).unwrap(),
            json!({"producer": ["Key (42) is not present in table \"producer\"."]})
        );
    }

    #[test]
    fn composite_key_detail_names_each_column() {
        let errors = parse_integrity_detail("Key (name, producer)=(Chair, 1) already exists.").unwrap();
        assert_eq!(
            serde_json::to_value(&errors).unwrap(),
            json!({
                "name": ["Key (Chair) already exists."],
                "producer": ["Key (1) already exists."]
            })
        );
    }

    #[test]
    fn unparseable_detail() {
        assert!(parse_integrity_detail("Failing row contains (1, null).").is_none());
    }

    #[test]
    fn other_errors_stay_database_errors() {
        let err = translate_db_error(sqlx::Error::RowNotFound, "SELECT 1");
        assert!(matches!(err, AppError::Db(sqlx::Error::RowNotFound)));
    }
}
