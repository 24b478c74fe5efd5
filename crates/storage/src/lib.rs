use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

pub mod repository;
pub mod replication;
pub mod schema;
pub mod session;

pub use repository::{BulkImageRow, Repository};
pub use replication::{
    apply_sync_operation, bump_sequence, ensure_table, fetch_row_by_id, fetch_rows_above,
    table_snapshot, upsert_row_json, TableSnapshot,
};
pub use session::{
    new_auto_sync_flag, AutoSyncFlag, AutoSyncSession, InsertedRow, PendingOp, PgSession, Session,
    SyncPublisher,
};

/// Owns the connection pool and migration bootstrap for one node's
/// database. Grounded on the teacher's `Storage::new`/`with_pool_size`
/// split, generalized so the pool size follows the worker topology rather
/// than a single hardcoded figure.
#[derive(Clone)]
pub struct Storage {
    pool: PgPool,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_pool_size(database_url, 20).await
    }

    pub async fn with_pool_size(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!(max_connections, "connected to postgres");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn repository(&self) -> Repository {
        Repository::new(self.pool.clone())
    }

    pub fn session(&self) -> PgSession {
        PgSession::new(self.pool.clone())
    }

    /// Creates every replicated table if missing, then seeds the default
    /// category. Fragment files are concatenated in dependency order so
    /// `images.category_id` can reference `categories` on a fresh database.
    pub async fn run_migrations(&self) -> Result<()> {
        for table in ["categories", "images", "crawl_sessions", "tags"] {
            let ddl = schema::create_statement(table)
                .unwrap_or_else(|| panic!("no migration fragment registered for table {table}"));
            sqlx::raw_sql(ddl).execute(&self.pool).await?;
        }
        sqlx::raw_sql(include_str!("../migrations/002_seed.sql")).execute(&self.pool).await?;
        info!("migrations complete");
        Ok(())
    }

    /// Creates a single table on a node that is missing it, used by the
    /// Failover Controller when promoting a standby whose schema has
    /// drifted. See spec.md §7 and `schema::REPLICATED_TABLES`.
    pub async fn ensure_table(&self, table: &str) -> Result<()> {
        replication::ensure_table(&self.pool, table).await
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replicated_tables_all_have_fragments() {
        for table in schema::REPLICATED_TABLES {
            assert!(schema::create_statement(table).is_some(), "missing fragment for {table}");
        }
        assert!(schema::create_statement("not_a_table").is_none());
    }
}
