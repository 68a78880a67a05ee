//! Storage-table definitions synthesized from resource declarations.

use crate::config::{ResourceSchema, ResourceSet};
use crate::error::ConfigError;
use crate::sql::builder::{literal, quoted};

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub primary_key: bool,
    pub unique: bool,
    pub index: bool,
    /// Sequence feeding the column's default.
    pub sequence: Option<String>,
    /// `(table, column)` for foreign keys.
    pub references: Option<(String, String)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TableDef {
    pub resource: String,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub unique_together: Vec<Vec<String>>,
}

impl TableDef {
    pub fn primary_key(&self) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.primary_key)
    }

    pub fn sequences(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().filter_map(|c| c.sequence.as_deref())
    }

    /// `CREATE TABLE IF NOT EXISTS` without foreign keys; those are added once every table exists.
    pub fn create_table_sql(&self) -> String {
        let mut defs: Vec<String> = Vec::new();
        for c in &self.columns {
            let mut def = format!("{} {}", quoted(&c.name), c.sql_type);
            if c.primary_key {
                def.push_str(" PRIMARY KEY");
            } else if !c.nullable {
                def.push_str(" NOT NULL");
            }
            match (&c.sequence, &c.default) {
                (Some(seq), _) => def.push_str(&format!(" DEFAULT nextval({})", literal(seq))),
                (None, Some(d)) => def.push_str(&format!(" DEFAULT {}", d)),
                (None, None) => {}
            }
            if c.unique && !c.primary_key {
                def.push_str(" UNIQUE");
            }
            defs.push(def);
        }
        for group in &self.unique_together {
            let cols: Vec<String> = group.iter().map(|s| quoted(s)).collect();
            defs.push(format!("UNIQUE ({})", cols.join(", ")));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  {}\n)",
            quoted(&self.name),
            defs.join(",\n  ")
        )
    }

    pub fn index_sql(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.index && !c.unique && !c.primary_key)
            .map(|c| {
                format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                    quoted(&format!("ix_{}_{}", self.name, c.name)),
                    quoted(&self.name),
                    quoted(&c.name)
                )
            })
            .collect()
    }

    /// One idempotent statement per foreign key.
    pub fn foreign_key_sql(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter_map(|c| c.references.as_ref().map(|r| (c, r)))
            .map(|(c, (table, column))| {
                format!(
                    "DO $$ BEGIN\n  ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({});\nEXCEPTION WHEN duplicate_object THEN NULL;\nEND $$",
                    quoted(&self.name),
                    quoted(&format!("fk_{}_{}", self.name, c.name)),
                    quoted(&c.name),
                    quoted(table),
                    quoted(column)
                )
            })
            .collect()
    }
}

/// Table for one resource. Kid resources live in their parent's table and yield `None`.
pub fn synthesize(schema: &ResourceSchema) -> Result<Option<TableDef>, ConfigError> {
    if schema.is_kid() {
        return Ok(None);
    }
    let pks: Vec<_> = schema.fields.iter().filter(|f| f.primary_key).collect();
    match pks.as_slice() {
        [pk] if pk.sql.is_some() => {}
        [_] => {
            return Err(ConfigError::InvalidPrimaryKey {
                resource: schema.name.clone(),
                reason: "primary key has no storage type".into(),
            })
        }
        [] => {
            return Err(ConfigError::InvalidPrimaryKey {
                resource: schema.name.clone(),
                reason: "no primary key declared".into(),
            })
        }
        _ => {
            return Err(ConfigError::InvalidPrimaryKey {
                resource: schema.name.clone(),
                reason: "more than one primary key declared".into(),
            })
        }
    }

    let columns = schema
        .fields
        .iter()
        .filter_map(|f| {
            let sql = f.sql.as_ref()?;
            Some(ColumnDef {
                name: f.name.clone(),
                sql_type: sql.type_str(),
                nullable: f.allow_none && !f.primary_key,
                default: f.default.clone(),
                primary_key: f.primary_key,
                unique: f.unique,
                index: f.index,
                sequence: if f.primary_key { f.autoincrement.clone() } else { None },
                references: if f.is_foreign_key() {
                    f.reference_target().map(|(t, c)| (t.to_string(), c.to_string()))
                } else {
                    None
                },
            })
        })
        .collect();

    Ok(Some(TableDef {
        resource: schema.name.clone(),
        name: schema.table_name(),
        columns,
        unique_together: schema.meta.unique_together.clone(),
    }))
}

pub fn synthesize_all(set: &ResourceSet) -> Result<Vec<TableDef>, ConfigError> {
    let mut tables = Vec::new();
    for schema in &set.resources {
        if let Some(table) = synthesize(schema)? {
            tables.push(table);
        }
    }
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(v: serde_json::Value) -> ResourceSchema {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn skips_compute_only_fields_and_maps_options() {
        let s = schema(json!({
            "name": "Product",
            "fields": [
                {"name": "id", "type": "integer", "sql": "integer", "primary_key": true,
                 "autoincrement": "product_id_seq"},
                {"name": "name", "type": "string", "sql": "varchar(64)", "allow_none": false, "index": true},
                {"name": "producer", "type": "integer", "sql": "integer", "references": "producer.id"},
                {"name": "tags", "type": "list", "sql": "jsonb", "default": "'[]'::jsonb"},
                {"name": "preview", "type": "string"}
            ],
            "meta": {"unique_together": [["name", "producer"]]}
        }));
        let t = synthesize(&s).unwrap().unwrap();
        assert_eq!(t.name, "product");
        assert_eq!(
            t.columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            ["id", "name", "producer", "tags"]
        );
        assert_eq!(t.sequences().collect::<Vec<_>>(), ["product_id_seq"]);
        assert_eq!(
            t.create_table_sql(),
            "CREATE TABLE IF NOT EXISTS \"product\" (\n  \
             \"id\" integer PRIMARY KEY DEFAULT nextval('product_id_seq'),\n  \
             \"name\" varchar(64) NOT NULL,\n  \
             \"producer\" integer,\n  \
             \"tags\" jsonb DEFAULT '[]'::jsonb,\n  \
             UNIQUE (\"name\", \"producer\")\n)"
        );
        assert_eq!(
            t.index_sql(),
            ["CREATE INDEX IF NOT EXISTS \"ix_product_name\" ON \"product\" (\"name\")"]
        );
        let fks = t.foreign_key_sql();
        assert_eq!(fks.len(), 1);
        assert!(fks[0].contains(
            "ALTER TABLE \"product\" ADD CONSTRAINT \"fk_product_producer\" FOREIGN KEY (\"producer\") REFERENCES \"producer\" (\"id\")"
        ));
    }

    #[test]
    fn kids_never_materialize() {
        let s = schema(json!({
            "name": "Operator",
            "fields": [{"name": "phone", "type": "string"}],
            "meta": {"extends_on": {"parent": "Actor", "column": "details"}}
        }));
        assert_eq!(synthesize(&s).unwrap(), None);
    }

    #[test]
    fn primary_key_needs_storage() {
        let s = schema(json!({
            "name": "Broken",
            "table": "broken",
            "fields": [{"name": "id", "type": "integer", "primary_key": true}]
        }));
        assert!(matches!(synthesize(&s), Err(ConfigError::InvalidPrimaryKey { .. })));

        let s = schema(json!({"name": "NoKey", "fields": [{"name": "a", "type": "string", "sql": "text"}]}));
        assert!(matches!(synthesize(&s), Err(ConfigError::InvalidPrimaryKey { .. })));
    }
}
