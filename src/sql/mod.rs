//! Safe SQL building: identifiers from declarations only, values as parameters.

pub mod builder;
pub mod params;
mod template;

pub use builder::{SelectField, TableView, WhereClause, WhereMode};
pub use params::{bind_all, BindValue, Binds};
pub use template::{QueryTemplate, Slot, SlotValues, TemplateError};
