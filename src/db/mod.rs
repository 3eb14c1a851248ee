use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tokio::task;
use crate::error::{GraphRagError, Result};

pub mod migrate;

const CONNECTION_PRAGMAS: &str = "PRAGMA journal_mode = WAL; \
     PRAGMA synchronous = NORMAL; \
     PRAGMA foreign_keys = ON; \
     PRAGMA temp_store = MEMORY; \
     PRAGMA cache_size = -65536; \
     PRAGMA busy_timeout = 5000;";

/// Database connection wrapper
///
/// Holds only the path; every call opens its own connection on the blocking
/// pool so concurrent readers never share a `Connection`.
#[derive(Debug, Clone)]
pub struct Db {
    path: PathBuf,
}

impl Db {
    /// Create a new database connection manager
    pub fn new<P: AsRef<Path>>(db_path: P) -> Self {
        Self {
            path: db_path.as_ref().to_path_buf(),
        }
    }

    /// Path of the underlying database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Execute a closure with a database connection in a blocking task
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let mut conn = Connection::open(&path)?;
            conn.execute_batch(CONNECTION_PRAGMAS)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| GraphRagError::Io(std::io::Error::other(format!("database task failed: {}", e))))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_db_connection() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Db::new(&db_path);

        let result = db
            .with_connection(|conn| {
                conn.execute("CREATE TABLE test (id INTEGER PRIMARY KEY)", [])?;
                Ok(())
            })
            .await;

        assert!(result.is_ok());
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_pragmas_set() {
        let temp_dir = TempDir::new().unwrap();
        let db = Db::new(temp_dir.path().join("test.db"));

        db.with_connection(|conn| {
            let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
            assert_eq!(journal_mode.to_uppercase(), "WAL");

            let foreign_keys: i32 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
            assert_eq!(foreign_keys, 1);

            Ok::<(), GraphRagError>(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_closure_error_propagates() {
        let temp_dir = TempDir::new().unwrap();
        let db = Db::new(temp_dir.path().join("test.db"));

        let result: Result<()> = db
            .with_connection(|_conn| Err(GraphRagError::InvalidInput("boom".into())))
            .await;
        assert!(matches!(result, Err(GraphRagError::InvalidInput(_))));
    }
}
