//! 同步队列 DAO - sync_queue 表

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::error::{FailureKind, Result};
use crate::storage::entities::{EntityKind, SyncAction, SyncQueueItem};

const COLUMNS: &str = "id, entity_type, entity_client_id, entity_id, action, payload, created_at, \
    retry_count, last_error, next_attempt_at, failure_kind";

/// 新入队项
#[derive(Debug, Clone)]
pub struct NewQueueItem<'p> {
    pub entity_type: EntityKind,
    pub entity_client_id: &'p str,
    pub entity_id: Option<i64>,
    pub action: SyncAction,
    pub payload: &'p serde_json::Value,
    pub created_at: i64,
}

pub struct SyncQueueDao<'a> {
    conn: &'a Connection,
}

impl<'a> SyncQueueDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, item: &NewQueueItem<'_>) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO sync_queue (entity_type, entity_client_id, entity_id, action, payload, created_at, next_attempt_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            "#,
            params![
                item.entity_type.as_str(),
                item.entity_client_id,
                item.entity_id,
                item.action.as_str(),
                serde_json::to_string(item.payload)?,
                item.created_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get(&self, id: i64) -> Result<Option<SyncQueueItem>> {
        let sql = format!("SELECT {} FROM sync_queue WHERE id = ?1", COLUMNS);
        Ok(self.conn.query_row(&sql, params![id], row_to_item).optional()?)
    }

    /// 到期且未耗尽重试次数的项，FIFO
    pub fn due(&self, now: i64, max_retries: u32, limit: usize) -> Result<Vec<SyncQueueItem>> {
        self.due_excluding(now, max_retries, limit, &[])
    }

    /// 同 `due`，跳过 `exclude` 中的实体
    pub fn due_excluding(
        &self,
        now: i64,
        max_retries: u32,
        limit: usize,
        exclude: &[&str],
    ) -> Result<Vec<SyncQueueItem>> {
        let skip = if exclude.is_empty() {
            String::new()
        } else {
            let marks: Vec<String> = (0..exclude.len()).map(|i| format!("?{}", i + 4)).collect();
            format!("AND entity_client_id NOT IN ({})", marks.join(", "))
        };
        let sql = format!(
            r#"
            SELECT {} FROM sync_queue
            WHERE retry_count < ?1 AND next_attempt_at <= ?2 {}
            ORDER BY created_at ASC, id ASC
            LIMIT ?3
            "#,
            COLUMNS, skip
        );
        let mut values = vec![
            Value::Integer(i64::from(max_retries)),
            Value::Integer(now),
            Value::Integer(limit as i64),
        ];
        values.extend(exclude.iter().map(|id| Value::Text((*id).to_string())));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), row_to_item)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_for_entity(&self, client_id: &str) -> Result<Vec<SyncQueueItem>> {
        let sql = format!(
            "SELECT {} FROM sync_queue WHERE entity_client_id = ?1 ORDER BY created_at ASC, id ASC",
            COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![client_id], row_to_item)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_exhausted(&self, max_retries: u32) -> Result<Vec<SyncQueueItem>> {
        let sql = format!(
            "SELECT {} FROM sync_queue WHERE retry_count >= ?1 ORDER BY created_at ASC, id ASC",
            COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![max_retries], row_to_item)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn delete(&self, id: i64) -> Result<bool> {
        Ok(self.conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])? > 0)
    }

    pub fn delete_for_entity(&self, client_id: &str) -> Result<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM sync_queue WHERE entity_client_id = ?1", params![client_id])?)
    }

    pub fn record_failure(
        &self,
        id: i64,
        error: &str,
        kind: FailureKind,
        next_attempt_at: i64,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            r#"
            UPDATE sync_queue
            SET retry_count = retry_count + 1, last_error = ?2, failure_kind = ?3, next_attempt_at = ?4
            WHERE id = ?1
            "#,
            params![id, error, kind.as_str(), next_attempt_at],
        )?;
        Ok(changed > 0)
    }

    /// 直接耗尽（不可再自动重试的失败）
    pub fn park(&self, id: i64, max_retries: u32) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE sync_queue SET retry_count = MAX(retry_count, ?2) WHERE id = ?1",
            params![id, max_retries],
        )?;
        Ok(changed > 0)
    }

    /// 把未耗尽项的下次尝试时间提前到 `now`
    pub fn reset_backoff(&self, now: i64, max_retries: u32) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE sync_queue SET next_attempt_at = ?1 WHERE retry_count < ?2 AND next_attempt_at > ?1",
            params![now, max_retries],
        )?)
    }

    pub fn reset_retries(&self, client_id: &str, now: i64) -> Result<usize> {
        Ok(self.conn.execute(
            r#"
            UPDATE sync_queue
            SET retry_count = 0, last_error = NULL, failure_kind = NULL, next_attempt_at = ?2
            WHERE entity_client_id = ?1
            "#,
            params![client_id, now],
        )?)
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM sync_queue", [], |r| r.get(0))?;
        Ok(n as u64)
    }

    pub fn has_entity(&self, client_id: &str) -> Result<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM sync_queue WHERE entity_client_id = ?1",
            params![client_id],
            |r| r.get(0),
        )?;
        Ok(exists)
    }
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncQueueItem> {
    fn bad_text<E>(idx: usize, e: E) -> rusqlite::Error
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    }

    let entity_type: String = row.get(1)?;
    let action: String = row.get(4)?;
    let payload: String = row.get(5)?;
    let failure_kind: Option<String> = row.get(10)?;
    Ok(SyncQueueItem {
        id: row.get(0)?,
        entity_type: entity_type.parse().map_err(|e| bad_text(1, e))?,
        entity_client_id: row.get(2)?,
        entity_id: row.get(3)?,
        action: action.parse().map_err(|e| bad_text(4, e))?,
        payload: serde_json::from_str(&payload).map_err(|e| bad_text(5, e))?,
        created_at: row.get(6)?,
        retry_count: row.get(7)?,
        last_error: row.get(8)?,
        next_attempt_at: row.get(9)?,
        failure_kind: failure_kind.as_deref().and_then(FailureKind::parse),
    })
}
