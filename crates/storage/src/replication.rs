use std::collections::BTreeMap;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use icrawl_core::{ColumnValue, SyncOpKind, SyncOperation};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};

/// Advances `table`'s id sequence past the current max id, per spec.md
/// §4.7's sequence-bump invariant: after any cross-node write or bulk copy,
/// `sequence(T, N) >= max(T.id on N) + 1`. Idempotent — safe to call after
/// every apply, not just bulk ones.
pub async fn bump_sequence(pool: &PgPool, table: &str) -> Result<()> {
    let sql = format!(
        "SELECT setval(pg_get_serial_sequence('{table}', 'id'), \
         (SELECT COALESCE(MAX(id), 0) FROM {table}) + 1, false)"
    );
    sqlx::query(&sql).execute(pool).await?;
    Ok(())
}

/// Creates `table` on `pool` if it is missing, from the in-process schema
/// definition. Used by the Failover Controller when promoting a target
/// whose schema has drifted (spec.md §7 "Schema" error kind).
pub async fn ensure_table(pool: &PgPool, table: &str) -> Result<()> {
    let ddl = crate::schema::create_statement(table)
        .ok_or_else(|| anyhow::anyhow!("unknown replicated table {table}"))?;
    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}

fn bind_column<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q ColumnValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        ColumnValue::Null => query.bind(Option::<String>::None),
        ColumnValue::Bool(b) => query.bind(*b),
        ColumnValue::Int(i) => query.bind(*i),
        ColumnValue::Float(f) => query.bind(*f),
        ColumnValue::Text(s) => query.bind(s),
        ColumnValue::Timestamp(t) => query.bind(*t),
        ColumnValue::Json(j) => query.bind(j),
    }
}

fn extract_id(payload: &BTreeMap<String, ColumnValue>) -> Result<i64> {
    match payload.get("id") {
        Some(ColumnValue::Int(id)) => Ok(*id),
        _ => bail!("sync operation payload is missing an integer id"),
    }
}

/// Applies one `SyncOperation` to `pool`, per spec.md §4.7's apply path:
/// INSERT becomes an upsert-by-id (bumping the sequence afterward), UPDATE
/// touches every non-id column present in the payload, DELETE is by-id.
/// Affecting zero rows is not an error for UPDATE/DELETE.
pub async fn apply_sync_operation(pool: &PgPool, op: &SyncOperation) -> Result<()> {
    match op.kind {
        SyncOpKind::Insert => apply_insert(pool, &op.table_name, &op.payload).await,
        SyncOpKind::Update => apply_update(pool, &op.table_name, &op.payload).await,
        SyncOpKind::Delete => apply_delete(pool, &op.table_name, &op.payload).await,
    }
}

async fn apply_insert(pool: &PgPool, table: &str, payload: &BTreeMap<String, ColumnValue>) -> Result<()> {
    extract_id(payload)?;
    let columns: Vec<&str> = payload.keys().map(String::as_str).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
    let set_clause: Vec<String> = payload
        .keys()
        .filter(|k| k.as_str() != "id")
        .map(|k| format!("{k} = EXCLUDED.{k}"))
        .collect();
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT (id) DO UPDATE SET {}",
        columns.join(", "),
        placeholders.join(", "),
        set_clause.join(", "),
    );
    let mut query = sqlx::query(&sql);
    for value in payload.values() {
        query = bind_column(query, value);
    }
    query.execute(pool).await?;
    bump_sequence(pool, table).await?;
    Ok(())
}

async fn apply_update(pool: &PgPool, table: &str, payload: &BTreeMap<String, ColumnValue>) -> Result<()> {
    let id = extract_id(payload)?;
    let columns: Vec<&str> = payload.keys().filter(|k| k.as_str() != "id").map(String::as_str).collect();
    if columns.is_empty() {
        return Ok(());
    }
    let assignments: Vec<String> =
        columns.iter().enumerate().map(|(i, col)| format!("{col} = ${}", i + 1)).collect();
    let sql = format!("UPDATE {table} SET {} WHERE id = ${}", assignments.join(", "), columns.len() + 1);
    let mut query = sqlx::query(&sql);
    for col in &columns {
        query = bind_column(query, &payload[*col]);
    }
    query.bind(id).execute(pool).await?;
    Ok(())
}

async fn apply_delete(pool: &PgPool, table: &str, payload: &BTreeMap<String, ColumnValue>) -> Result<()> {
    let id = extract_id(payload)?;
    sqlx::query(&format!("DELETE FROM {table} WHERE id = $1")).bind(id).execute(pool).await?;
    Ok(())
}

/// `(count, min(id), max(id))` plus the newest `newest_n` rows' `(id,
/// updated_at)`, per spec.md §4.7's full reconciliation comparison.
#[derive(Debug, Clone, Default)]
pub struct TableSnapshot {
    pub count: i64,
    pub min_id: Option<i64>,
    pub max_id: Option<i64>,
    pub newest: Vec<(i64, DateTime<Utc>)>,
}

pub async fn table_snapshot(pool: &PgPool, table: &str, newest_n: i64) -> Result<TableSnapshot> {
    let row = sqlx::query(&format!("SELECT COUNT(*) AS count, MIN(id) AS min_id, MAX(id) AS max_id FROM {table}"))
        .fetch_one(pool)
        .await?;
    let count: i64 = row.try_get("count")?;
    let min_id: Option<i64> = row.try_get("min_id")?;
    let max_id: Option<i64> = row.try_get("max_id")?;

    let newest_rows = sqlx::query(&format!("SELECT id, updated_at FROM {table} ORDER BY id DESC LIMIT $1"))
        .bind(newest_n)
        .fetch_all(pool)
        .await?;
    let mut newest = Vec::with_capacity(newest_rows.len());
    for row in newest_rows {
        newest.push((row.try_get::<i64, _>("id")?, row.try_get::<DateTime<Utc>, _>("updated_at")?));
    }
    Ok(TableSnapshot { count, min_id, max_id, newest })
}

/// Rows with `id > min_id_exclusive`, ascending, capped at `limit` — the
/// "copy rows whose id > max_id_in_secondary" direction-selection rule.
pub async fn fetch_rows_above(
    pool: &PgPool,
    table: &str,
    min_id_exclusive: i64,
    limit: i64,
) -> Result<Vec<serde_json::Value>> {
    if limit <= 0 {
        return Ok(Vec::new());
    }
    let rows = sqlx::query(&format!(
        "SELECT row_to_json(t) AS row FROM (SELECT * FROM {table} WHERE id > $1 ORDER BY id LIMIT $2) t"
    ))
    .bind(min_id_exclusive)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(|r| r.try_get::<serde_json::Value, _>("row").map_err(Into::into)).collect()
}

pub async fn fetch_row_by_id(pool: &PgPool, table: &str, id: i64) -> Result<Option<serde_json::Value>> {
    let row = sqlx::query(&format!("SELECT row_to_json(t) AS row FROM (SELECT * FROM {table} WHERE id = $1) t"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| r.try_get::<serde_json::Value, _>("row").map_err(Into::into)).transpose()
}

/// Upserts a full row (as produced by `fetch_rows_above`/`fetch_row_by_id`)
/// via `jsonb_populate_record`, generic across every replicated table's
/// column set. Bumps the receiver's sequence afterward.
pub async fn upsert_row_json(pool: &PgPool, table: &str, row: &serde_json::Value) -> Result<()> {
    let set_clause = row
        .as_object()
        .map(|obj| {
            obj.keys()
                .filter(|k| k.as_str() != "id")
                .map(|k| format!("{k} = EXCLUDED.{k}"))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();
    let sql = format!(
        "INSERT INTO {table} SELECT * FROM jsonb_populate_record(NULL::{table}, $1::jsonb) \
         ON CONFLICT (id) DO UPDATE SET {set_clause}"
    );
    sqlx::query(&sql).bind(row).execute(pool).await?;
    bump_sequence(pool, table).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use icrawl_core::SyncOpStatus;

    #[test]
    fn extract_id_requires_integer_id_column() {
        let mut payload = BTreeMap::new();
        payload.insert("id".to_string(), ColumnValue::Int(7));
        assert_eq!(extract_id(&payload).unwrap(), 7);

        let empty = BTreeMap::new();
        assert!(extract_id(&empty).is_err());
    }

    #[test]
    fn sync_operation_table_name_round_trips_through_json() {
        let mut payload = BTreeMap::new();
        payload.insert("id".to_string(), ColumnValue::Int(1));
        payload.insert("url".to_string(), ColumnValue::Text("https://example.com/a.jpg".into()));
        let op = SyncOperation {
            id: SyncOperation::derive_id(Utc::now(), "node-a", 0),
            kind: SyncOpKind::Insert,
            table_name: "images".into(),
            payload,
            origin_node: "node-a".into(),
            target_nodes: vec!["node-b".into()],
            status: SyncOpStatus::Pending,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&op).unwrap();
        let back: SyncOperation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.table_name, "images");
    }
}
