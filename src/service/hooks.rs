//! Per-resource hooks, verb overrides and named row predicates.

use crate::config::{Access, CompiledResource, Operation, Registry};
use crate::error::{AppError, ConfigError};
use crate::extractors::SessionContext;
use crate::response::Deleted;
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// What a hook sees besides its payload.
#[derive(Clone)]
pub struct HookContext {
    pub pool: PgPool,
    pub session: SessionContext,
    pub resource: Arc<CompiledResource>,
}

/// Customization points for one resource. Every method defaults to a no-op.
///
/// Before-hooks may rewrite the validated payload or reject the request. After-hooks run
/// once the statement succeeded; with `hook_modes` set to `background` for the operation
/// they are spawned and cannot fail the request.
#[async_trait]
pub trait ResourceHooks: Send + Sync {
    /// Operations whose generated SQL path is replaced by [`ResourceHooks::handle`].
    fn overrides(&self) -> &[Operation] {
        &[]
    }

    /// Serves an overridden operation; the value becomes the response body.
    ///
    /// `select` carries the validated row criteria of PUT and PATCH and is `None` for the
    /// other verbs, whose filter or body arrives as `payload`.
    async fn handle(
        &self,
        ctx: &HookContext,
        op: Operation,
        select: Option<Map<String, Value>>,
        payload: Map<String, Value>,
    ) -> Result<Value, AppError> {
        let _ = (ctx, select, payload);
        Err(AppError::MethodNotAllowed(op.to_string()))
    }

    async fn before_get(&self, _ctx: &HookContext, _filter: &mut Map<String, Value>) -> Result<(), AppError> {
        Ok(())
    }

    async fn before_list(&self, _ctx: &HookContext, _filter: &mut Map<String, Value>) -> Result<(), AppError> {
        Ok(())
    }

    async fn before_post(&self, _ctx: &HookContext, _payload: &mut Map<String, Value>) -> Result<(), AppError> {
        Ok(())
    }

    async fn before_update(
        &self,
        _ctx: &HookContext,
        _op: Operation,
        _select: &mut Map<String, Value>,
        _payload: &mut Map<String, Value>,
    ) -> Result<(), AppError> {
        Ok(())
    }

    async fn before_delete(&self, _ctx: &HookContext, _filter: &mut Map<String, Value>) -> Result<(), AppError> {
        Ok(())
    }

    async fn after_post(&self, _ctx: &HookContext, _pk: &Value, _payload: &Map<String, Value>) -> Result<(), AppError> {
        Ok(())
    }

    async fn after_update(
        &self,
        _ctx: &HookContext,
        _op: Operation,
        _select: &Map<String, Value>,
        _payload: &Map<String, Value>,
        _updated: i64,
    ) -> Result<(), AppError> {
        Ok(())
    }

    async fn after_delete(&self, _ctx: &HookContext, _filter: &Map<String, Value>, _deleted: &Deleted) -> Result<(), AppError> {
        Ok(())
    }
}

/// Completed write handed to after-hooks.
#[derive(Clone, Debug)]
pub enum AfterEvent {
    Post {
        pk: Value,
        payload: Map<String, Value>,
    },
    Update {
        op: Operation,
        select: Map<String, Value>,
        payload: Map<String, Value>,
        updated: i64,
    },
    Delete {
        filter: Map<String, Value>,
        deleted: Deleted,
    },
}

impl AfterEvent {
    pub fn operation(&self) -> Operation {
        match self {
            AfterEvent::Post { .. } => Operation::Post,
            AfterEvent::Update { op, .. } => *op,
            AfterEvent::Delete { .. } => Operation::Delete,
        }
    }

    pub async fn run(&self, hooks: &dyn ResourceHooks, ctx: &HookContext) -> Result<(), AppError> {
        match self {
            AfterEvent::Post { pk, payload } => hooks.after_post(ctx, pk, payload).await,
            AfterEvent::Update {
                op,
                select,
                payload,
                updated,
            } => hooks.after_update(ctx, *op, select, payload, *updated).await,
            AfterEvent::Delete { filter, deleted } => hooks.after_delete(ctx, filter, deleted).await,
        }
    }
}

/// A background after-hook that failed.
#[derive(Clone, Debug, PartialEq)]
pub struct HookFailure {
    pub resource: String,
    pub operation: Operation,
    pub error: String,
}

/// Row predicate for `{"predicate": "<name>"}` permissions. Gets the session and the
/// request's filter or payload.
pub type RowPredicate = Arc<dyn Fn(&SessionContext, Option<&Value>) -> bool + Send + Sync>;

/// Hooks and predicates registered by name before serving.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: HashMap<String, Arc<dyn ResourceHooks>>,
    predicates: HashMap<String, RowPredicate>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach hooks to the resource named `resource`.
    pub fn with_hooks(mut self, resource: &str, hooks: impl ResourceHooks + 'static) -> Self {
        self.hooks.insert(resource.to_string(), Arc::new(hooks));
        self
    }

    pub fn with_predicate<F>(mut self, name: &str, predicate: F) -> Self
    where
        F: Fn(&SessionContext, Option<&Value>) -> bool + Send + Sync + 'static,
    {
        self.predicates.insert(name.to_string(), Arc::new(predicate));
        self
    }

    pub fn hooks(&self, resource: &str) -> Option<&Arc<dyn ResourceHooks>> {
        self.hooks.get(resource)
    }

    pub fn predicate(&self, name: &str) -> Option<&RowPredicate> {
        self.predicates.get(name)
    }

    /// Every hook names a compiled resource and every predicate a permission refers to exists.
    pub fn check(&self, registry: &Registry) -> Result<(), ConfigError> {
        for name in self.hooks.keys() {
            if registry.by_name(name).is_none() {
                return Err(ConfigError::MissingReference {
                    kind: "hook resource",
                    id: name.clone(),
                });
            }
        }
        for resource in registry.resources() {
            let Some(perms) = &resource.permissions else { continue };
            for access in perms.authenticated.values() {
                if let Access::Predicate { predicate } = access {
                    if !self.predicates.contains_key(predicate) {
                        return Err(ConfigError::MissingReference {
                            kind: "predicate",
                            id: predicate.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Spawns `event` on the runtime; failures are logged and sent to `failures` when set.
pub fn spawn_after(
    hooks: Arc<dyn ResourceHooks>,
    ctx: HookContext,
    event: AfterEvent,
    failures: Option<UnboundedSender<HookFailure>>,
) {
    tokio::spawn(async move {
        if let Err(e) = event.run(hooks.as_ref(), &ctx).await {
            tracing::error!(
                resource = %ctx.resource.name,
                operation = %event.operation(),
                error = %e,
                "background hook failed"
            );
            if let Some(tx) = failures {
                let _ = tx.send(HookFailure {
                    resource: ctx.resource.name.clone(),
                    operation: event.operation(),
                    error: e.to_string(),
                });
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, ResourceSet};
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl ResourceHooks for Noop {}

    fn registry(perms: Value) -> Registry {
        let set: ResourceSet = serde_json::from_value(json!({"resources": [
            {"name": "Note", "fields": [{"name": "id", "type": "integer", "sql": "integer", "primary_key": true}],
             "meta": {"permissions": perms}}
        ]}))
        .unwrap();
        resolve(&set).unwrap()
    }

    #[test]
    fn unknown_hook_resource_rejected() {
        let reg = registry(json!({"public": ["get"]}));
        let hooks = HookRegistry::new().with_hooks("Nope", Noop);
        assert!(matches!(hooks.check(&reg), Err(ConfigError::MissingReference { kind: "hook resource", .. })));
        HookRegistry::new().with_hooks("Note", Noop).check(&reg).unwrap();
    }

    #[test]
    fn unknown_predicate_rejected() {
        let reg = registry(json!({"authenticated": {"patch": {"predicate": "is_owner"}}}));
        assert!(HookRegistry::new().check(&reg).is_err());
        HookRegistry::new()
            .with_predicate("is_owner", |_, _| true)
            .check(&reg)
            .unwrap();
    }

    #[test]
    fn default_override_list_is_empty() {
        assert!(Noop.overrides().is_empty());
    }
}
