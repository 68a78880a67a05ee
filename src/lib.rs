//! Resource SDK: declarative resources compiled into validated REST CRUD over PostgreSQL.

pub mod config;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod migration;
pub mod model;
pub mod response;
pub mod routes;
pub mod service;
pub mod sql;
pub mod state;
pub mod telemetry;

pub use config::{load_from_path, parse_resources, resolve, CompiledResource, Registry, ResourceSchema, ResourceSet, Settings};
pub use error::{AppError, ConfigError, FieldErrors};
pub use extractors::SessionContext;
pub use migration::{apply_migrations, ensure_database_exists};
pub use response::{error_body, Deleted, ListPage, Updated};
pub use routes::{app, common_routes, resource_routes};
pub use service::{CrudService, HookContext, HookRegistry, ResourceHooks};
pub use state::AppState;
pub use telemetry::init_tracing;
