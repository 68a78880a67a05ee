//! Request validation, statement execution, cascade cleanup, hooks and permissions.

pub mod cascade;
pub mod contract;
mod crud;
pub mod dispatch;
pub mod hooks;
pub mod permissions;

pub use cascade::CascadeReport;
pub use contract::{Contract, ContractError, PaginationContract, PaginationSpec};
pub use crud::{parse_integrity_detail, translate_db_error, CrudService};
pub use dispatch::{parse_selection, Dispatcher};
pub use hooks::{AfterEvent, HookContext, HookFailure, HookRegistry, ResourceHooks, RowPredicate};
pub use permissions::authorize;
