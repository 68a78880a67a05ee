//! Shared application state for all routes. The registry is compiled once at startup.

use crate::config::Registry;
use crate::error::ConfigError;
use crate::service::{CrudService, HookFailure, HookRegistry};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub registry: Arc<Registry>,
    pub hooks: Arc<HookRegistry>,
    pub statement_timeout: Duration,
    /// Receives failures of background after-hooks.
    pub hook_failures: Option<UnboundedSender<HookFailure>>,
}

impl AppState {
    /// Fails when a hook or predicate refers to something the registry does not know.
    pub fn new(
        pool: PgPool,
        registry: Registry,
        hooks: HookRegistry,
        statement_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        hooks.check(&registry)?;
        Ok(AppState {
            pool,
            registry: Arc::new(registry),
            hooks: Arc::new(hooks),
            statement_timeout,
            hook_failures: None,
        })
    }

    pub fn with_hook_failures(mut self, tx: UnboundedSender<HookFailure>) -> Self {
        self.hook_failures = Some(tx);
        self
    }

    pub fn crud(&self) -> CrudService<'_> {
        CrudService::new(&self.pool, self.statement_timeout)
    }
}
