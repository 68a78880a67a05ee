//! HTTP handlers for generated resource operations.

pub mod resource;
pub use resource::*;
