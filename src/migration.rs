//! Apply the synthesized model to the database: the deep-merge function, sequences,
//! tables, indexes and foreign keys. Every statement is idempotent, so this runs on
//! each startup.

use crate::config::Registry;
use crate::error::AppError;
use sqlx::ConnectOptions;
use sqlx::PgPool;
use std::str::FromStr;

/// Recursive jsonb merge used by PATCH on mergeable columns. Objects merge key by key,
/// arrays concatenate keeping the first occurrence of each element, anything else is
/// replaced by the patch. A NULL target takes the patch as is.
pub const MERGE_FUNCTION_SQL: &str = r#"CREATE OR REPLACE FUNCTION jsonb_merge_deep(target jsonb, patch jsonb)
RETURNS jsonb LANGUAGE plpgsql IMMUTABLE AS $fn$
DECLARE
  result jsonb;
  k text;
  v jsonb;
BEGIN
  IF target IS NULL OR jsonb_typeof(target) = 'null' THEN
    RETURN patch;
  END IF;
  IF patch IS NULL THEN
    RETURN target;
  END IF;
  IF jsonb_typeof(target) = 'object' AND jsonb_typeof(patch) = 'object' THEN
    result := target;
    FOR k, v IN SELECT key, value FROM jsonb_each(patch) LOOP
      IF result ? k THEN
        result := jsonb_set(result, ARRAY[k], jsonb_merge_deep(result -> k, v));
      ELSE
        result := result || jsonb_build_object(k, v);
      END IF;
    END LOOP;
    RETURN result;
  END IF;
  IF jsonb_typeof(target) = 'array' AND jsonb_typeof(patch) = 'array' THEN
    SELECT COALESCE(jsonb_agg(d.elem ORDER BY d.ord), '[]'::jsonb) INTO result
    FROM (
      SELECT e.elem, min(e.ord) AS ord
      FROM jsonb_array_elements(target || patch) WITH ORDINALITY AS e(elem, ord)
      GROUP BY e.elem
    ) d;
    RETURN result;
  END IF;
  RETURN patch;
END
$fn$"#;

/// Provisioning statements in dependency order.
pub fn migration_statements(registry: &Registry) -> Vec<String> {
    let tables = registry.tables();
    let mut out = vec![MERGE_FUNCTION_SQL.to_string()];
    for t in tables {
        for seq in t.sequences() {
            out.push(format!(
                "CREATE SEQUENCE IF NOT EXISTS {}",
                crate::sql::builder::quoted(seq)
            ));
        }
    }
    out.extend(tables.iter().map(|t| t.create_table_sql()));
    out.extend(tables.iter().flat_map(|t| t.index_sql()));
    out.extend(tables.iter().flat_map(|t| t.foreign_key_sql()));
    out
}

/// Create everything the registry needs. Fails on the first statement error.
pub async fn apply_migrations(pool: &PgPool, registry: &Registry) -> Result<(), AppError> {
    let statements = migration_statements(registry);
    for sql in &statements {
        tracing::debug!(sql = %sql, "migration");
        sqlx::query(sql).execute(pool).await.map_err(|e| {
            tracing::error!(error = %e, sql = %sql, "migration statement failed");
            AppError::Db(e)
        })?;
    }
    tracing::info!(
        tables = registry.tables().len(),
        statements = statements.len(),
        "migrations applied"
    );
    Ok(())
}

/// Ensure the database in `database_url` exists; create it if not. Connects to the
/// default `postgres` database to run CREATE DATABASE. Call before creating the main pool.
pub async fn ensure_database_exists(database_url: &str) -> Result<(), AppError> {
    let (admin_url, db_name) = parse_db_name_from_url(database_url)?;
    if db_name.is_empty() || db_name == "postgres" {
        return Ok(());
    }
    let opts = sqlx::postgres::PgConnectOptions::from_str(&admin_url)
        .map_err(|e| AppError::BadRequest(format!("invalid DATABASE_URL: {}", e)))?;
    let mut conn: sqlx::PgConnection = opts.connect().await.map_err(AppError::Db)?;
    let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(&db_name)
        .fetch_one(&mut conn)
        .await
        .map_err(AppError::Db)?;
    if !exists.0 {
        tracing::info!(database = %db_name, "creating database");
        sqlx::query(&format!("CREATE DATABASE {}", crate::sql::builder::quoted(&db_name)))
            .execute(&mut conn)
            .await
            .map_err(AppError::Db)?;
    }
    Ok(())
}

fn parse_db_name_from_url(url: &str) -> Result<(String, String), AppError> {
    let path_start = url.rfind('/').ok_or_else(|| AppError::BadRequest("DATABASE_URL: no path".into()))? + 1;
    let path_and_query = url.get(path_start..).unwrap_or("");
    let db_name = path_and_query.split('?').next().unwrap_or("").trim();
    let base = url.get(..path_start).unwrap_or(url);
    let admin_url = format!("{}postgres", base);
    Ok((admin_url, db_name.to_string()))
}
