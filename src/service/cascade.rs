//! Cascade delete: prune deleted ids from dependent many-to-many arrays.

use crate::config::CompiledResource;
use crate::error::AppError;
use crate::service::crud::CrudService;
use crate::sql::{BindValue, Binds};
use serde_json::Value;
use sqlx::{Postgres, Transaction};
use std::collections::BTreeMap;

/// Rows touched per dependent `table.column`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CascadeReport {
    pub per_column: BTreeMap<String, i64>,
    pub total: i64,
}

impl CascadeReport {
    /// Reads the `{"table.column": count}` summary the cleanup statement returns.
    pub fn from_summary(summary: &Value) -> Option<Self> {
        let obj = summary.as_object()?;
        let mut report = CascadeReport::default();
        for (column, count) in obj {
            let n = count.as_i64()?;
            report.total += n;
            report.per_column.insert(column.clone(), n);
        }
        Some(report)
    }
}

/// Runs the resource's cleanup statement for `ids` inside `tx`. A statement error or a
/// missing summary fails the whole delete; the caller's transaction rolls back on drop.
pub async fn prune_references(
    crud: &CrudService<'_>,
    tx: &mut Transaction<'_, Postgres>,
    resource: &CompiledResource,
    ids: &[Value],
) -> Result<CascadeReport, AppError> {
    let Some(sql) = resource.templates.cleanup.as_deref() else {
        return Ok(CascadeReport::default());
    };
    let mut binds = Binds::new();
    binds.bind("deleted", BindValue::Json(Value::Array(ids.to_vec())));
    let summary = crud.fetch_value(&mut **tx, sql, &binds).await?;
    let report = summary
        .as_ref()
        .and_then(CascadeReport::from_summary)
        .ok_or_else(|| AppError::DeleteFailed("reference cleanup returned no summary".into()))?;
    tracing::debug!(
        resource = %resource.name,
        columns = ?report.per_column,
        total = report.total,
        "m2m references pruned"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn summary_counts_add_up() {
        let report = CascadeReport::from_summary(&json!({"producer.distributors": 2, "store.distributors": 1, "store.suppliers": 1}))
            .unwrap();
        assert_eq!(report.total, 4);
        assert_eq!(report.per_column["store.suppliers"], 1);
    }

    #[test]
    fn zero_references_is_fine() {
        let report = CascadeReport::from_summary(&json!({"producer.distributors": 0})).unwrap();
        assert_eq!(report.total, 0);
    }

    #[test]
    fn malformed_summary() {
        assert!(CascadeReport::from_summary(&json!([1])).is_none());
        assert!(CascadeReport::from_summary(&json!({"producer.distributors": "x"})).is_none());
    }
}
