use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;

use super::DatabaseError;

/// Operational tables, in dependency order.
pub const OPERATIONAL_TABLES: &[&str] = &[
    "facilities",
    "patients",
    "encounters",
    "procedures",
    "diagnoses",
    "encounter_diagnoses",
    "reports",
];

/// Warehouse tables, in load order (dimensions, fact, bridges).
pub const WAREHOUSE_TABLES: &[&str] = &[
    "dim_time",
    "dim_facility",
    "dim_patient",
    "dim_procedure",
    "dim_diagnosis",
    "fact_encounters",
    "bridge_encounter_procedures",
    "bridge_encounter_diagnoses",
];

/// Open a SQLite connection to the given path and run migrations
pub fn open_database(path: &Path, busy_timeout: Duration) -> Result<Connection, DatabaseError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| DatabaseError::MigrationFailed {
                version: 0,
                reason: format!("cannot create {}: {e}", parent.display()),
            })?;
        }
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    configure_pragmas(&conn)?;
    run_migrations(&conn)?;
    Ok(conn)
}

/// Open an in-memory database (for testing)
pub fn open_memory_database() -> Result<Connection, DatabaseError> {
    let conn = Connection::open_in_memory()?;
    configure_pragmas(&conn)?;
    run_migrations(&conn)?;
    Ok(conn)
}

fn configure_pragmas(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA foreign_keys=ON;"
    )?;
    Ok(())
}

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_current_version(conn);

    let migrations: Vec<(i64, &str)> = vec![
        (1, include_str!("../../resources/migrations/001_operational.sql")),
        (2, include_str!("../../resources/migrations/002_warehouse.sql")),
    ];

    for (version, sql) in migrations {
        if version > current_version {
            tracing::info!("Running migration v{version}");
            conn.execute_batch(sql).map_err(|e| DatabaseError::MigrationFailed {
                version,
                reason: e.to_string(),
            })?;
        }
    }

    Ok(())
}

/// Get the current schema version (0 if no schema exists yet)
fn get_current_version(conn: &Connection) -> i64 {
    conn.query_row(
        "SELECT MAX(version) FROM schema_version",
        [],
        |row| row.get::<_, i64>(0),
    )
    .unwrap_or(0)
}

/// Presence of one expected table.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TableStatus {
    pub name: &'static str,
    pub exists: bool,
}

/// Which of the expected operational and warehouse tables exist.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SchemaReport {
    pub operational: Vec<TableStatus>,
    pub warehouse: Vec<TableStatus>,
}

impl SchemaReport {
    pub fn is_complete(&self) -> bool {
        self.operational.iter().chain(&self.warehouse).all(|t| t.exists)
    }
}

pub fn verify_schema(conn: &Connection) -> Result<SchemaReport, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
    )?;
    let present: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<_, _>>()?;

    let status = |tables: &[&'static str]| -> Vec<TableStatus> {
        tables
            .iter()
            .map(|name| TableStatus {
                name: *name,
                exists: present.iter().any(|p| p.as_str() == *name),
            })
            .collect()
    };

    Ok(SchemaReport {
        operational: status(OPERATIONAL_TABLES),
        warehouse: status(WAREHOUSE_TABLES),
    })
}

/// Row count of a table named in [`OPERATIONAL_TABLES`] or [`WAREHOUSE_TABLES`].
pub fn count_rows(conn: &Connection, table: &str) -> Result<i64, DatabaseError> {
    if !OPERATIONAL_TABLES.contains(&table) && !WAREHOUSE_TABLES.contains(&table) {
        return Err(DatabaseError::NotFound {
            entity_type: "table".into(),
            id: table.into(),
        });
    }
    let count = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get::<_, i64>(0)
    })?;
    Ok(count)
}
