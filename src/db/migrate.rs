use rusqlite::{Connection, params};
use crate::error::{GraphRagError, Result};

/// Migration metadata
struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

/// Migrations compiled into the binary, in version order.
const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "001_graph_tables",
    sql: include_str!("../../migrations/001_graph_tables.sql"),
}];

/// Create schema_migrations table if it doesn't exist
fn ensure_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get list of applied migrations
pub fn get_applied_migrations(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM schema_migrations ORDER BY version")?;
    let names: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
    Ok(names)
}

/// Run all pending migrations
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    ensure_migrations_table(conn)?;

    let applied = get_applied_migrations(conn)?;

    for migration in MIGRATIONS {
        if applied.iter().any(|name| name == migration.name) {
            log::debug!("Migration {} already applied, skipping", migration.name);
            continue;
        }

        log::info!("Applying migration: {} (version {})", migration.name, migration.version);

        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql).map_err(|e| {
            GraphRagError::Config(format!("Failed to execute migration {}: {}", migration.name, e))
        })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )?;
        tx.commit()?;

        log::info!("Migration {} applied successfully", migration.name);
    }

    Ok(())
}
