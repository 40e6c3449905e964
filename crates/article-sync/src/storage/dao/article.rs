//! 文章 DAO - articles 表

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::storage::entities::{LocalArticle, SyncStatus};

const COLUMNS: &str = "client_id, server_id, title, content, summary, folder_id, local_version, \
    remote_version, content_hash, local_updated_at, server_updated_at, sync_status, sync_error, \
    has_conflict, conflict_remote_content, conflict_detected_at";

pub struct ArticleDao<'a> {
    conn: &'a Connection,
}

impl<'a> ArticleDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, a: &LocalArticle) -> Result<()> {
        let sql = format!(
            "INSERT INTO articles ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            COLUMNS
        );
        self.conn.execute(
            &sql,
            params![
                a.client_id,
                a.server_id,
                a.title,
                a.content,
                a.summary,
                a.folder_id,
                a.local_version,
                a.remote_version,
                a.content_hash,
                a.local_updated_at,
                a.server_updated_at,
                a.sync_status.as_str(),
                a.sync_error,
                a.has_conflict as i32,
                a.conflict_remote_content,
                a.conflict_detected_at,
            ],
        )?;
        Ok(())
    }

    /// 整行覆盖（client_id 不变）
    pub fn update(&self, a: &LocalArticle) -> Result<bool> {
        let sql = r#"
            UPDATE articles SET
                server_id = ?2,
                title = ?3,
                content = ?4,
                summary = ?5,
                folder_id = ?6,
                local_version = ?7,
                remote_version = ?8,
                content_hash = ?9,
                local_updated_at = ?10,
                server_updated_at = ?11,
                sync_status = ?12,
                sync_error = ?13,
                has_conflict = ?14,
                conflict_remote_content = ?15,
                conflict_detected_at = ?16
            WHERE client_id = ?1
        "#;
        let changed = self.conn.execute(
            sql,
            params![
                a.client_id,
                a.server_id,
                a.title,
                a.content,
                a.summary,
                a.folder_id,
                a.local_version,
                a.remote_version,
                a.content_hash,
                a.local_updated_at,
                a.server_updated_at,
                a.sync_status.as_str(),
                a.sync_error,
                a.has_conflict as i32,
                a.conflict_remote_content,
                a.conflict_detected_at,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_by_client_id(&self, client_id: &str) -> Result<Option<LocalArticle>> {
        let sql = format!("SELECT {} FROM articles WHERE client_id = ?1", COLUMNS);
        let article = self
            .conn
            .query_row(&sql, params![client_id], row_to_article)
            .optional()?;
        Ok(article)
    }

    pub fn get_by_server_id(&self, server_id: i64) -> Result<Option<LocalArticle>> {
        let sql = format!("SELECT {} FROM articles WHERE server_id = ?1", COLUMNS);
        let article = self
            .conn
            .query_row(&sql, params![server_id], row_to_article)
            .optional()?;
        Ok(article)
    }

    pub fn list_by_status(&self, status: SyncStatus) -> Result<Vec<LocalArticle>> {
        let sql = format!(
            "SELECT {} FROM articles WHERE sync_status = ?1 ORDER BY local_updated_at ASC",
            COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![status.as_str()], row_to_article)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list(&self) -> Result<Vec<LocalArticle>> {
        let sql = format!("SELECT {} FROM articles ORDER BY local_updated_at DESC", COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_article)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count_by_status(&self, status: SyncStatus) -> Result<u32> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM articles WHERE sync_status = ?1",
            params![status.as_str()],
            |r| r.get(0),
        )?;
        Ok(n as u32)
    }

    pub fn delete(&self, client_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM articles WHERE client_id = ?1", params![client_id])?;
        Ok(changed > 0)
    }
}

fn row_to_article(row: &rusqlite::Row<'_>) -> rusqlite::Result<LocalArticle> {
    let status: String = row.get(11)?;
    let sync_status = status.parse::<SyncStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(11, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(LocalArticle {
        client_id: row.get(0)?,
        server_id: row.get(1)?,
        title: row.get(2)?,
        content: row.get(3)?,
        summary: row.get(4)?,
        folder_id: row.get(5)?,
        local_version: row.get(6)?,
        remote_version: row.get(7)?,
        content_hash: row.get(8)?,
        local_updated_at: row.get(9)?,
        server_updated_at: row.get(10)?,
        sync_status,
        sync_error: row.get(12)?,
        has_conflict: row.get::<_, i32>(13)? != 0,
        conflict_remote_content: row.get(14)?,
        conflict_detected_at: row.get(15)?,
    })
}
