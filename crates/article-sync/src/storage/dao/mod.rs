//! 数据访问层 (DAO) - 每张表一个专门的操作模块

pub mod article;
pub mod folder;
pub mod sync_queue;

pub use article::ArticleDao;
pub use folder::FolderDao;
pub use sync_queue::{NewQueueItem, SyncQueueDao};

use rusqlite::Connection;

use crate::error::Result;

/// 事务管理器 - 跨表操作放进同一事务
pub struct TransactionManager<'a> {
    conn: &'a Connection,
}

impl<'a> TransactionManager<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 闭包返回错误时事务随 drop 回滚
    pub fn execute<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let tx = self.conn.unchecked_transaction()?;
        let result = f(self.conn)?;
        tx.commit()?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::{EntityKind, LocalFolder, SyncAction, SyncStatus};
    use crate::storage::migrate::init_db;

    fn conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        init_db(&mut conn).unwrap();
        conn
    }

    fn folder(id: &str, name: &str) -> LocalFolder {
        LocalFolder {
            client_id: id.into(),
            server_id: None,
            name: name.into(),
            parent_id: None,
            local_version: 1,
            local_updated_at: 10,
            sync_status: SyncStatus::Pending,
            sync_error: None,
        }
    }

    #[test]
    fn test_folder_update_overwrites() {
        let conn = conn();
        let dao = FolderDao::new(&conn);
        dao.insert(&folder("f1", "drafts")).unwrap();
        let mut renamed = folder("f1", "published");
        renamed.local_version = 2;
        assert!(dao.update(&renamed).unwrap());
        assert!(!dao.update(&folder("missing", "x")).unwrap());

        let stored = dao.get("f1").unwrap().unwrap();
        assert_eq!(stored.name, "published");
        assert_eq!(stored.local_version, 2);
        assert_eq!(dao.list().unwrap().len(), 1);
    }

    #[test]
    fn test_folder_insert_never_overwrites() {
        let conn = conn();
        let dao = FolderDao::new(&conn);
        let mut synced = folder("f1", "drafts");
        synced.server_id = Some(7);
        dao.insert(&synced).unwrap();

        assert!(dao.insert(&folder("f1", "published")).is_err());
        let stored = dao.get("f1").unwrap().unwrap();
        assert_eq!(stored.name, "drafts");
        assert_eq!(stored.server_id, Some(7));
    }

    #[test]
    fn test_queue_due_respects_backoff_and_fifo() {
        let conn = conn();
        let dao = SyncQueueDao::new(&conn);
        let payload = serde_json::json!({});
        let mk = |client_id: &'static str, created_at: i64| NewQueueItem {
            entity_type: EntityKind::Article,
            entity_client_id: client_id,
            entity_id: None,
            action: SyncAction::Update,
            payload: &payload,
            created_at,
        };
        let first = dao.insert(&mk("a", 100)).unwrap();
        let second = dao.insert(&mk("b", 200)).unwrap();
        dao.insert(&mk("c", 50)).unwrap();

        dao.record_failure(first, "timeout", crate::error::FailureKind::Transport, 10_000)
            .unwrap();

        let due: Vec<_> = dao.due(1_000, 5, 10).unwrap().into_iter().map(|i| i.entity_client_id).collect();
        assert_eq!(due, vec!["c".to_string(), "b".to_string()]);

        let item = dao.get(first).unwrap().unwrap();
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.failure_kind, Some(crate::error::FailureKind::Transport));

        assert_eq!(dao.reset_backoff(1_000, 5).unwrap(), 1);
        assert_eq!(dao.due(1_000, 5, 10).unwrap().len(), 3);
        assert!(dao.delete(second).unwrap());
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let conn = conn();
        let tm = TransactionManager::new(&conn);
        let result: Result<()> = tm.execute(|c| {
            FolderDao::new(c).insert(&folder("f1", "x"))?;
            Err(crate::error::SyncError::validation("name", "boom"))
        });
        assert!(result.is_err());
        assert!(FolderDao::new(&conn).get("f1").unwrap().is_none());
    }
}
