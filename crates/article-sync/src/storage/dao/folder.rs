//! 文件夹 DAO - folders 表

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::storage::entities::{LocalFolder, SyncStatus};

pub struct FolderDao<'a> {
    conn: &'a Connection,
}

impl<'a> FolderDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 新建行；client_id 已存在时返回约束错误，不覆盖
    pub fn insert(&self, f: &LocalFolder) -> Result<()> {
        let sql = r#"
            INSERT INTO folders (client_id, server_id, name, parent_id, local_version, local_updated_at, sync_status, sync_error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#;
        self.conn.execute(
            sql,
            params![
                f.client_id,
                f.server_id,
                f.name,
                f.parent_id,
                f.local_version,
                f.local_updated_at,
                f.sync_status.as_str(),
                f.sync_error,
            ],
        )?;
        Ok(())
    }

    /// 更新已有行，返回是否命中
    pub fn update(&self, f: &LocalFolder) -> Result<bool> {
        let sql = r#"
            UPDATE folders SET
                server_id = ?2,
                name = ?3,
                parent_id = ?4,
                local_version = ?5,
                local_updated_at = ?6,
                sync_status = ?7,
                sync_error = ?8
            WHERE client_id = ?1
        "#;
        let changed = self.conn.execute(
            sql,
            params![
                f.client_id,
                f.server_id,
                f.name,
                f.parent_id,
                f.local_version,
                f.local_updated_at,
                f.sync_status.as_str(),
                f.sync_error,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get(&self, client_id: &str) -> Result<Option<LocalFolder>> {
        let sql = r#"
            SELECT client_id, server_id, name, parent_id, local_version, local_updated_at, sync_status, sync_error
            FROM folders WHERE client_id = ?1
        "#;
        Ok(self.conn.query_row(sql, params![client_id], row_to_folder).optional()?)
    }

    pub fn list(&self) -> Result<Vec<LocalFolder>> {
        let sql = r#"
            SELECT client_id, server_id, name, parent_id, local_version, local_updated_at, sync_status, sync_error
            FROM folders ORDER BY name ASC
        "#;
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], row_to_folder)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn delete(&self, client_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM folders WHERE client_id = ?1", params![client_id])?;
        Ok(changed > 0)
    }
}

fn row_to_folder(row: &rusqlite::Row<'_>) -> rusqlite::Result<LocalFolder> {
    let status: String = row.get(6)?;
    let sync_status = status.parse::<SyncStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(LocalFolder {
        client_id: row.get(0)?,
        server_id: row.get(1)?,
        name: row.get(2)?,
        parent_id: row.get(3)?,
        local_version: row.get(4)?,
        local_updated_at: row.get(5)?,
        sync_status,
        sync_error: row.get(7)?,
    })
}
