//! Catalog introspection and shaping.
//!
//! The catalog is materialized from a bounded set of information-schema
//! queries and folded into the uniform [`DatabaseModel`]. Backends disagree
//! on what their own database is called (the IPC host exposes the
//! persistent database under a reserved name, the in-process engine uses
//! the user-visible one); shaping normalizes both to
//! [`CANONICAL_DATABASE`] so callers see a stable identifier.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::Engine;
use crate::error::Result;
use crate::result_set::{ColumnInfo, Row, RowSet};
use crate::stream::quote_literal;

/// The canonical name of the engine's own database.
pub const CANONICAL_DATABASE: &str = "main";

const SYSTEM_SCHEMAS: &[&str] = &["information_schema", "pg_catalog"];

/// `database name → schemas → objects → columns`.
pub type DatabaseModel = BTreeMap<String, DatabaseEntry>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseEntry {
    #[serde(default)]
    pub schemas: Vec<SchemaEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub name: String,
    #[serde(default)]
    pub objects: Vec<ObjectEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Table,
    View,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub name: String,
    pub kind: ObjectKind,
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
}

const TABLES_SQL: &str = "SELECT table_catalog, table_schema, table_name, table_type \
     FROM information_schema.tables \
     ORDER BY table_catalog, table_schema, table_name";

const COLUMNS_SQL: &str = "SELECT table_catalog, table_schema, table_name, column_name, data_type, is_nullable \
     FROM information_schema.columns \
     ORDER BY table_catalog, table_schema, table_name, ordinal_position";

const DATABASES_SQL: &str =
    "SELECT DISTINCT catalog_name FROM information_schema.schemata ORDER BY catalog_name";

pub(crate) async fn load_catalog<E: Engine + ?Sized>(engine: &E) -> Result<DatabaseModel> {
    let tables = engine.execute(TABLES_SQL, &[]).await?;
    let columns = engine.execute(COLUMNS_SQL, &[]).await?;
    Ok(fold_catalog(&tables, &columns, &engine.system_database_name()))
}

pub(crate) async fn list_databases<E: Engine + ?Sized>(engine: &E) -> Result<Vec<String>> {
    let system = engine.system_database_name();
    let result = engine.execute(DATABASES_SQL, &[]).await?;

    let mut databases: Vec<String> = result
        .rows
        .iter()
        .filter_map(|row| text(row, "catalog_name"))
        .map(|name| normalize_database(name, &system))
        .collect();
    databases.sort();
    databases.dedup();
    Ok(databases)
}

pub(crate) async fn list_tables<E: Engine + ?Sized>(
    engine: &E,
    database: &str,
) -> Result<Vec<String>> {
    let catalog = denormalize_database(database, &engine.system_database_name());
    let sql = format!(
        "SELECT table_name FROM information_schema.tables \
         WHERE table_catalog = {} \
           AND table_schema NOT IN ('information_schema', 'pg_catalog') \
         ORDER BY table_name",
        quote_literal(&catalog)
    );

    let result = engine.execute(&sql, &[]).await?;
    Ok(result
        .rows
        .iter()
        .filter_map(|row| text(row, "table_name"))
        .map(str::to_owned)
        .collect())
}

pub(crate) async fn list_columns<E: Engine + ?Sized>(
    engine: &E,
    database: &str,
    table: &str,
) -> Result<Vec<ColumnInfo>> {
    let catalog = denormalize_database(database, &engine.system_database_name());
    let sql = format!(
        "SELECT column_name, data_type, is_nullable \
         FROM information_schema.columns \
         WHERE table_catalog = {} AND table_name = {} \
         ORDER BY ordinal_position",
        quote_literal(&catalog),
        quote_literal(table)
    );

    let result = engine.execute(&sql, &[]).await?;
    Ok(result.rows.iter().filter_map(column_from_row).collect())
}

/// Fold table and column listings into the uniform model.
pub(crate) fn fold_catalog(tables: &RowSet, columns: &RowSet, system_db: &str) -> DatabaseModel {
    // database → schema → object name → entry, keyed for the column pass
    let mut folded: BTreeMap<String, BTreeMap<String, BTreeMap<String, ObjectEntry>>> =
        BTreeMap::new();

    for row in &tables.rows {
        let (Some(catalog), Some(schema), Some(name)) = (
            text(row, "table_catalog"),
            text(row, "table_schema"),
            text(row, "table_name"),
        ) else {
            continue;
        };
        if SYSTEM_SCHEMAS.contains(&schema) {
            continue;
        }

        let kind = match text(row, "table_type") {
            Some(kind) if kind.to_ascii_uppercase().contains("VIEW") => ObjectKind::View,
            _ => ObjectKind::Table,
        };

        folded
            .entry(normalize_database(catalog, system_db))
            .or_default()
            .entry(schema.to_owned())
            .or_default()
            .insert(
                name.to_owned(),
                ObjectEntry {
                    name: name.to_owned(),
                    kind,
                    columns: Vec::new(),
                },
            );
    }

    for row in &columns.rows {
        let (Some(catalog), Some(schema), Some(table)) = (
            text(row, "table_catalog"),
            text(row, "table_schema"),
            text(row, "table_name"),
        ) else {
            continue;
        };

        let Some(column) = column_from_row(row) else {
            continue;
        };

        if let Some(object) = folded
            .get_mut(&normalize_database(catalog, system_db))
            .and_then(|schemas| schemas.get_mut(schema))
            .and_then(|objects| objects.get_mut(table))
        {
            object.columns.push(column);
        }
    }

    folded
        .into_iter()
        .map(|(database, schemas)| {
            let entry = DatabaseEntry {
                schemas: schemas
                    .into_iter()
                    .map(|(name, objects)| SchemaEntry {
                        name,
                        objects: objects.into_values().collect(),
                    })
                    .collect(),
            };
            (database, entry)
        })
        .collect()
}

fn column_from_row(row: &Row) -> Option<ColumnInfo> {
    Some(ColumnInfo {
        name: text(row, "column_name")?.to_owned(),
        logical_type: text(row, "data_type").unwrap_or("UNKNOWN").to_owned(),
        nullable: text(row, "is_nullable").map(|n| n.eq_ignore_ascii_case("yes")),
    })
}

fn text<'r>(row: &'r Row, key: &str) -> Option<&'r str> {
    row.get(key).and_then(Value::as_str)
}

pub(crate) fn normalize_database(raw: &str, system_db: &str) -> String {
    if raw == system_db {
        CANONICAL_DATABASE.to_owned()
    } else {
        raw.to_owned()
    }
}

pub(crate) fn denormalize_database(database: &str, system_db: &str) -> String {
    if database == CANONICAL_DATABASE {
        system_db.to_owned()
    } else {
        database.to_owned()
    }
}

/// Re-key a backend-shaped model so the system database appears under the
/// canonical name.
pub(crate) fn normalize_model(model: DatabaseModel, system_db: &str) -> DatabaseModel {
    model
        .into_iter()
        .map(|(database, entry)| (normalize_database(&database, system_db), entry))
        .collect()
}
