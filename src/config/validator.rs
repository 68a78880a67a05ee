//! Declaration validation: referential integrity and route consistency.

use crate::config::{ResourceSchema, ResourceSet};
use crate::error::ConfigError;
use std::collections::HashSet;

/// Paths served by the common routes; resources cannot claim them.
pub const RESERVED_ROUTES: [&str; 3] = ["health", "ready", "version"];

fn check_names(schema: &ResourceSchema, list: &'static str, names: &[String], extra: &[&ResourceSchema]) -> Result<(), ConfigError> {
    for name in names {
        let known = schema.field(name).is_some() || extra.iter().any(|s| s.field(name).is_some());
        if !known {
            return Err(ConfigError::UnknownField {
                resource: schema.name.clone(),
                list,
                field: name.clone(),
            });
        }
    }
    Ok(())
}

pub fn validate(set: &ResourceSet) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    let mut routes = HashSet::new();
    let mut extended = HashSet::new();

    for schema in &set.resources {
        if !names.insert(schema.name.as_str()) {
            return Err(ConfigError::Validation(format!("resource {} declared twice", schema.name)));
        }
        if schema.meta.create_views {
            let route = schema.route();
            if route.is_empty() || route.contains('/') || RESERVED_ROUTES.contains(&route.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "resource {}: route '{}' is not available",
                    schema.name, route
                )));
            }
            if !routes.insert(route.clone()) {
                return Err(ConfigError::DuplicateRoute(route));
            }
        }

        let parent = match &schema.meta.extends_on {
            Some(ext) => {
                let parent = set
                    .by_name(&ext.parent)
                    .filter(|p| !p.is_kid())
                    .ok_or_else(|| ConfigError::MissingExtensionTarget(schema.name.clone()))?;
                let column = parent
                    .field(&ext.column)
                    .filter(|f| f.sql.as_ref().map(|s| s.is_jsonb()).unwrap_or(false))
                    .ok_or_else(|| ConfigError::MissingExtensionTarget(schema.name.clone()))?;
                if !extended.insert((parent.name.as_str(), column.name.as_str())) {
                    return Err(ConfigError::Validation(format!(
                        "{}.{} is extended by more than one resource",
                        parent.name, column.name
                    )));
                }
                Some(parent)
            }
            None => None,
        };
        let inherited: Vec<&ResourceSchema> = parent.into_iter().collect();

        let meta = &schema.meta;
        for (list, fields) in [
            ("get_by", &meta.get_by),
            ("list_by", &meta.list_by),
            ("delete_by", &meta.delete_by),
        ] {
            if let Some(fields) = fields {
                check_names(schema, list, fields, &inherited)?;
            }
        }
        check_names(schema, "exclude_from_updates", &meta.exclude_from_updates, &inherited)?;
        for group in &meta.unique_together {
            check_names(schema, "unique_together", group, &[])?;
        }

        for field in &schema.fields {
            if let Some(pattern) = &field.validate.pattern {
                regex::Regex::new(pattern).map_err(|e| {
                    ConfigError::Validation(format!("{}.{}: bad pattern: {}", schema.name, field.name, e))
                })?;
            }
            if field.references.is_none() {
                continue;
            }
            let (table, column) = field.reference_target().ok_or_else(|| ConfigError::MissingReference {
                kind: "reference",
                id: format!("{}.{}", schema.name, field.name),
            })?;
            let target = set.by_table(table).ok_or_else(|| ConfigError::MissingReference {
                kind: "table",
                id: table.to_string(),
            })?;
            if target.field(column).and_then(|f| f.sql.as_ref()).is_none() {
                return Err(ConfigError::MissingReference {
                    kind: "column",
                    id: format!("{}.{}", table, column),
                });
            }
            if field.many && !field.sql.as_ref().map(|s| s.is_jsonb()).unwrap_or(false) {
                return Err(ConfigError::Validation(format!(
                    "{}.{}: many-to-many fields are stored as jsonb",
                    schema.name, field.name
                )));
            }
        }
    }
    Ok(())
}
