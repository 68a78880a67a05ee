//! Demo server: the shop resources plus a hook-driven `customop` resource.
//!
//! Run from repo root: `cargo run -p example-consumer`
//! Set `RESOURCES_PATH` to serve other declarations; without it the shop fixture is used.

use async_trait::async_trait;
use resource_sdk::config::Operation;
use resource_sdk::{
    app, apply_migrations, ensure_database_exists, init_tracing, load_from_path, parse_resources, resolve,
    AppError, AppState, HookContext, HookRegistry, ResourceHooks, ResourceSet, Settings,
};
use serde_json::{Map, Value};
use tokio::net::TcpListener;

const SHOP: &str = include_str!("../../tests/fixtures/shop.json");

/// Derives read-only columns on write and guards one filter value on read.
struct CustomOps;

fn derive_state(payload: &mut Map<String, Value>) {
    let state = match payload.get("address").and_then(Value::as_str) {
        Some(a) if a.contains("Washington") => "DC",
        Some(a) if a.contains("Seattle") => "Oregon",
        Some(a) if !a.is_empty() => "N/A",
        _ => return,
    };
    payload.insert("state".into(), Value::String(state.into()));
}

#[async_trait]
impl ResourceHooks for CustomOps {
    async fn before_get(&self, _ctx: &HookContext, filter: &mut Map<String, Value>) -> Result<(), AppError> {
        if filter.get("read_only_field").and_then(Value::as_str) == Some("secret_requested") {
            return Err(AppError::Forbidden);
        }
        Ok(())
    }

    async fn before_list(&self, ctx: &HookContext, filter: &mut Map<String, Value>) -> Result<(), AppError> {
        self.before_get(ctx, filter).await
    }

    async fn before_post(&self, _ctx: &HookContext, payload: &mut Map<String, Value>) -> Result<(), AppError> {
        payload.insert("read_only_field".into(), Value::String("initial_val".into()));
        derive_state(payload);
        Ok(())
    }

    async fn before_update(
        &self,
        _ctx: &HookContext,
        _op: Operation,
        _select: &mut Map<String, Value>,
        payload: &mut Map<String, Value>,
    ) -> Result<(), AppError> {
        derive_state(payload);
        Ok(())
    }

    async fn after_post(&self, ctx: &HookContext, pk: &Value, _payload: &Map<String, Value>) -> Result<(), AppError> {
        sqlx::query("UPDATE customop SET read_only_field = 'sth_else_modified' WHERE id = $1")
            .bind(pk.as_i64())
            .execute(&ctx.pool)
            .await?;
        Ok(())
    }

    async fn after_update(
        &self,
        ctx: &HookContext,
        op: Operation,
        _select: &Map<String, Value>,
        payload: &Map<String, Value>,
        _updated: i64,
    ) -> Result<(), AppError> {
        let Some(address) = payload.get("address").and_then(Value::as_str) else {
            return Ok(());
        };
        sqlx::query("UPDATE customop SET custom_getter = custom_getter || $1 WHERE address = $2")
            .bind(format!("_{}", op))
            .bind(address)
            .execute(&ctx.pool)
            .await?;
        Ok(())
    }
}

async fn declarations(settings: &Settings) -> Result<ResourceSet, Box<dyn std::error::Error>> {
    if settings.resources_path.exists() {
        return Ok(load_from_path(&settings.resources_path).await?);
    }
    tracing::info!(path = %settings.resources_path.display(), "resources path missing, serving the shop fixture");
    Ok(ResourceSet {
        resources: parse_resources(SHOP)?,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load()?;
    init_tracing("resource_sdk=info,example_consumer=info");

    ensure_database_exists(&settings.database_url).await?;
    let pool = settings.pool_options().connect(&settings.database_url).await?;

    let registry = resolve(&declarations(&settings).await?)?;
    apply_migrations(&pool, &registry).await?;

    let hooks = HookRegistry::new().with_hooks("CustomOp", CustomOps);
    let (tx, mut failures) = tokio::sync::mpsc::unbounded_channel::<resource_sdk::service::HookFailure>();
    tokio::spawn(async move {
        while let Some(f) = failures.recv().await {
            tracing::warn!(resource = %f.resource, operation = %f.operation, error = %f.error, "after-hook failed");
        }
    });
    let state = AppState::new(pool, registry, hooks, settings.statement_timeout)?.with_hook_failures(tx);
    let app = app(state, settings.body_limit_bytes);

    let listener = TcpListener::bind(&settings.bind_addr).await?;
    tracing::info!("Example consumer listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
