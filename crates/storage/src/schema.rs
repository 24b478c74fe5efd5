/// Per-table `CREATE TABLE IF NOT EXISTS` statements, split out of the
/// embedded migration SQL so the Failover Controller can pre-create a
/// missing table on a promotion target (spec.md §7 "Schema — missing table
/// on target during failover or sync. Recovered by creating the table from
/// the in-process schema definition on the target node").
pub fn create_statement(table: &str) -> Option<&'static str> {
    match table {
        "categories" => Some(include_str!("../migrations/fragments/categories.sql")),
        "images" => Some(include_str!("../migrations/fragments/images.sql")),
        "crawl_sessions" => Some(include_str!("../migrations/fragments/crawl_sessions.sql")),
        "tags" => Some(include_str!("../migrations/fragments/tags.sql")),
        _ => None,
    }
}

/// The tables this deployment replicates, per spec.md §9's default
/// `sync_tables`.
pub const REPLICATED_TABLES: &[&str] = &["images", "categories", "crawl_sessions", "tags"];

/// Every replicated table owns an auto-incrementing `id` and an
/// `updated_at`, per spec.md §6 ("Every replicated table MUST own an
/// auto-incrementing integer `id` and an `updated_at` timestamp;
/// reconciliation depends on both."). Used by the sync/reconciliation path
/// to build `jsonb_populate_record`-based generic upserts without needing a
/// per-table Rust struct.
pub fn has_replicated_shape(table: &str) -> bool {
    REPLICATED_TABLES.contains(&table)
}
