use chrono::{NaiveDateTime, Utc};
use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::{Connection, SqliteConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use uuid::Uuid;

use crate::core::error::{CoreError, CoreResult};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

pub const BUSY_TIMEOUT_MS: u32 = 5000;

/// Per-connection PRAGMAs applied whenever the pool opens a connection.
///
/// `busy_timeout` goes first so that the WAL switch waits instead of failing
/// when several pooled connections open at once.
#[derive(Debug, Clone, Copy)]
pub struct SqlitePragmas {
    pub busy_timeout_ms: u32,
}

impl Default for SqlitePragmas {
    fn default() -> Self {
        Self {
            busy_timeout_ms: BUSY_TIMEOUT_MS,
        }
    }
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout={}; PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;",
            self.busy_timeout_ms
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Open a single connection with the same PRAGMAs the pool applies.
pub fn connect_sqlite(database_url: &str) -> CoreResult<SqliteConnection> {
    let mut conn = SqliteConnection::establish(database_url)
        .map_err(|e| CoreError::Internal(format!("Failed to connect to {database_url}: {e}")))?;
    SqlitePragmas::default()
        .on_acquire(&mut conn)
        .map_err(|e| CoreError::Internal(format!("Failed to apply pragmas: {e}")))?;
    Ok(conn)
}

pub fn run_migrations(conn: &mut SqliteConnection) -> CoreResult<()> {
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| CoreError::Internal(format!("Migration error: {e}")))?;
    Ok(())
}

pub fn create_pool(database_url: &str, pool_size: u32) -> CoreResult<DbPool> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    Pool::builder()
        .max_size(pool_size.max(1))
        .connection_customizer(Box::new(SqlitePragmas::default()))
        .build(manager)
        .map_err(CoreError::from)
}

/// Migrate the database file once on a dedicated connection, then open the pool.
pub fn init_database(database_url: &str, pool_size: u32) -> CoreResult<DbPool> {
    let mut conn = connect_sqlite(database_url)?;
    run_migrations(&mut conn)?;
    drop(conn);
    let pool = create_pool(database_url, pool_size)?;
    tracing::info!(database_url, pool_size, "Database ready");
    Ok(pool)
}

/// Run a whole read-check-write operation, retrying it once when it loses a
/// lock or uniqueness race. A second transient failure is surfaced as
/// [`CoreError::TransientConflict`].
pub fn with_retry<T, F>(operation: &str, mut run: F) -> CoreResult<T>
where
    F: FnMut() -> CoreResult<T>,
{
    match run() {
        Err(err) if err.is_transient() => {
            tracing::warn!(operation, error = %err, "Transient conflict, retrying once");
            run().map_err(|retry_err| match retry_err {
                CoreError::TransientConflict(msg) => {
                    CoreError::TransientConflict(format!("{operation}: {msg}"))
                }
                other => other,
            })
        }
        other => other,
    }
}

pub fn now_utc() -> NaiveDateTime {
    Utc::now().naive_utc()
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_with_retry_retries_transient_once() {
        let calls = Cell::new(0);
        let result = with_retry("test", || {
            calls.set(calls.get() + 1);
            if calls.get() == 1 {
                Err(CoreError::TransientConflict("database is locked".into()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.ok(), Some(7));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_with_retry_surfaces_second_transient() {
        let calls = Cell::new(0);
        let result: CoreResult<()> = with_retry("allocate", || {
            calls.set(calls.get() + 1);
            Err(CoreError::TransientConflict("busy".into()))
        });
        assert!(matches!(result, Err(CoreError::TransientConflict(ref m)) if m.starts_with("allocate")));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_with_retry_does_not_retry_validation() {
        let calls = Cell::new(0);
        let result: CoreResult<()> = with_retry("test", || {
            calls.set(calls.get() + 1);
            Err(CoreError::Validation("bad".into()))
        });
        assert!(matches!(result, Err(CoreError::Validation(_))));
        assert_eq!(calls.get(), 1);
    }
}
