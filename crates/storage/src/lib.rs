//! SQLite storage with engine-enforced tenant isolation.
//!
//! Tenant-scoped tables are never queried directly by application code. A
//! [`TenantGuard`] checks a connection out of the pool, binds the tenant into
//! the connection's `temp.tenant_session` table, and hands out a
//! [`TenantScope`]. Repositories hang off the scope and only ever name the
//! per-connection `scoped_*` views, whose filtering and write stamping are
//! done by SQLite itself.

pub mod aggregate;
pub mod audit;
pub mod capability;
pub mod directory;
pub mod error;
pub mod guard;
pub mod schema;
pub mod scoped;
mod session;

use std::{str::FromStr, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    SqlitePool,
};
use thiserror::Error;

pub use aggregate::{AggregateError, OrganizationSummary, PlatformAggregator};
pub use audit::{AuditFinding, AuditReport, IsolationAudit, SourceAudit};
pub use capability::{CapabilityCheck, DirectoryCapability};
pub use directory::{Directory, DirectoryError};
pub use error::{DataError, IsolationError};
pub use guard::{current_context, ScopeObserver, ScopeOutcome, TenantGuard, TenantScope};

const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        Self::connect_with(database_url, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Establishes a pool with an explicit connection cap.
    ///
    /// Every connection gets its own `temp.tenant_session` table on connect.
    /// Checkout arms the guard views/triggers once the schema exists and
    /// refuses connections still carrying a tenant binding; release re-checks
    /// the binding and closes the connection instead of pooling it when it
    /// is not neutral.
    pub async fn connect_with(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    session::install_session_table(conn).await?;
                    session::arm(conn).await?;
                    Ok(())
                })
            })
            .before_acquire(|conn, _meta| Box::pin(async move { session::admit(conn).await }))
            .after_release(|conn, _meta| Box::pin(async move { session::readmit(conn).await }))
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Platform-level registry of organizations, principals and memberships.
    pub fn directory(&self) -> Directory {
        Directory::new(self.pool.clone())
    }

    /// The audited cross-tenant read path.
    pub fn aggregator(&self) -> PlatformAggregator {
        PlatformAggregator::new(self.pool.clone(), self.directory())
    }

    /// Schema and probe audits over live connections.
    pub fn audit(&self) -> IsolationAudit {
        IsolationAudit::new(self.pool.clone())
    }

    /// Checks a connection out of the pool and reports which tenant, if any,
    /// is bound to it. A neutral connection reports `None`.
    pub async fn session_binding(&self) -> Result<Option<String>, StorageError> {
        let mut conn = self.pool.acquire().await?;
        Ok(session::bound_tenant(&mut conn).await?)
    }

    /// Exposes the inner pool when lower level access is required.
    ///
    /// Connections from here are not bound to any tenant; the scoped views
    /// return nothing and tenant table writes are rejected.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub(crate) fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
pub(crate) mod test_support {
    use tempfile::TempDir;

    use super::Database;

    /// File-backed database in a temporary directory; the directory lives as
    /// long as the returned guard.
    pub async fn setup_db() -> (Database, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        (db, dir)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::setup_db;

    #[tokio::test]
    async fn migrations_apply() {
        let (db, _dir) = setup_db().await;

        let tables: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
                .fetch_one(db.pool())
                .await
                .expect("fetch tables");
        assert!(tables.0 >= 10, "expected core tables to be created");
    }

    #[tokio::test]
    async fn fresh_connections_are_neutral() {
        let (db, _dir) = setup_db().await;
        assert_eq!(db.session_binding().await.expect("binding"), None);
    }
}
