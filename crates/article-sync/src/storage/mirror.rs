//! 本地镜像 - 文章与文件夹的持久化副本
//!
//! 所有状态写入都经过 `SyncStatus::can_transition_to`，非法转换直接返回错误，
//! 不会落库。读-改-写在同一个 SQLite 事务里完成。

use std::sync::Arc;

use rusqlite::Connection;

use crate::error::{Result, SyncError};
use crate::remote::RemoteArticle;
use crate::storage::dao::{ArticleDao, FolderDao, SyncQueueDao, TransactionManager};
use crate::storage::entities::{ArticleDraft, ArticlePatch, LocalArticle, LocalFolder, SyncStatus};
use crate::storage::SharedConnection;
use crate::utils::{Clock, IdGenerator};

/// 服务端确认写入后的处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum AcceptOutcome {
    /// 发出的就是最新版本，进入 synced
    Synced(LocalArticle),
    /// 飞行期间又有本地编辑：remote_version 前进，但保持 pending
    Superseded(LocalArticle),
    /// 实体已在本地删除
    Missing,
}

#[derive(Debug, Clone)]
pub struct LocalMirrorStore {
    conn: SharedConnection,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl LocalMirrorStore {
    pub fn new(conn: SharedConnection, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { conn, clock, ids }
    }

    // ========== 文章：本地编辑 ==========

    pub async fn create(&self, draft: ArticleDraft) -> Result<LocalArticle> {
        let client_id = self.ids.next_client_id()?;
        let article = self.new_article(client_id, draft);
        let conn = self.conn.lock().await;
        ArticleDao::new(&conn).insert(&article)?;
        tracing::debug!("[mirror] 新建文章 {} v{}", article.client_id, article.local_version);
        Ok(article)
    }

    /// 合并修改，local_version +1；未知 client_id 视为首次编辑并建行
    pub async fn upsert(&self, client_id: &str, patch: ArticlePatch) -> Result<LocalArticle> {
        let now = self.clock.now_millis();
        let conn = self.conn.lock().await;
        TransactionManager::new(&conn).execute(|c| {
            let dao = ArticleDao::new(c);
            match dao.get_by_client_id(client_id)? {
                Some(mut article) => {
                    let next = article.sync_status.after_local_edit();
                    article.sync_status = article.sync_status.transition(next)?;
                    patch.apply_to(&mut article);
                    article.local_version += 1;
                    article.content_hash = article.compute_hash();
                    article.local_updated_at = now;
                    article.sync_error = None;
                    dao.update(&article)?;
                    tracing::debug!(
                        "[mirror] 编辑文章 {} -> v{} ({})",
                        client_id,
                        article.local_version,
                        article.sync_status
                    );
                    Ok(article)
                }
                None => {
                    let mut article = self.new_article(client_id.to_string(), ArticleDraft::default());
                    patch.apply_to(&mut article);
                    article.content_hash = article.compute_hash();
                    dao.insert(&article)?;
                    tracing::debug!("[mirror] 首次编辑即建行 {}", client_id);
                    Ok(article)
                }
            }
        })
    }

    fn new_article(&self, client_id: String, draft: ArticleDraft) -> LocalArticle {
        let mut article = LocalArticle {
            client_id,
            server_id: None,
            title: draft.title,
            content: draft.content,
            summary: draft.summary,
            folder_id: draft.folder_id,
            local_version: 1,
            remote_version: 0,
            content_hash: String::new(),
            local_updated_at: self.clock.now_millis(),
            server_updated_at: None,
            sync_status: SyncStatus::Pending,
            sync_error: None,
            has_conflict: false,
            conflict_remote_content: None,
            conflict_detected_at: None,
        };
        article.content_hash = article.compute_hash();
        article
    }

    // ========== 文章：查询 ==========

    pub async fn get_by_client_id(&self, client_id: &str) -> Result<Option<LocalArticle>> {
        let conn = self.conn.lock().await;
        ArticleDao::new(&conn).get_by_client_id(client_id)
    }

    pub async fn get_by_server_id(&self, server_id: i64) -> Result<Option<LocalArticle>> {
        let conn = self.conn.lock().await;
        ArticleDao::new(&conn).get_by_server_id(server_id)
    }

    /// 不存在时返回 `NotFound`
    pub async fn require(&self, client_id: &str) -> Result<LocalArticle> {
        self.get_by_client_id(client_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("article {}", client_id)))
    }

    pub async fn query_by_sync_status(&self, status: SyncStatus) -> Result<Vec<LocalArticle>> {
        let conn = self.conn.lock().await;
        ArticleDao::new(&conn).list_by_status(status)
    }

    pub async fn list(&self) -> Result<Vec<LocalArticle>> {
        let conn = self.conn.lock().await;
        ArticleDao::new(&conn).list()
    }

    pub async fn count_by_status(&self, status: SyncStatus) -> Result<u32> {
        let conn = self.conn.lock().await;
        ArticleDao::new(&conn).count_by_status(status)
    }

    // ========== 文章：同步簿记 ==========

    /// 仅做状态转换
    pub async fn transition(&self, client_id: &str, to: SyncStatus) -> Result<LocalArticle> {
        self.modify(client_id, |article| {
            article.sync_status = article.sync_status.transition(to)?;
            if to != SyncStatus::Error {
                article.sync_error = None;
            }
            Ok(())
        })
        .await
    }

    pub async fn mark_syncing(&self, client_id: &str) -> Result<LocalArticle> {
        self.transition(client_id, SyncStatus::Syncing).await
    }

    /// 服务端接受了 `sent_local_version`。飞行期间若出现更新的本地版本，只推进
    /// remote_version，状态回到 pending，由调用方保留队列项。
    pub async fn apply_accept(
        &self,
        client_id: &str,
        sent_local_version: i64,
        server_id: i64,
        server_version: i64,
    ) -> Result<AcceptOutcome> {
        let now = self.clock.now_millis();
        let conn = self.conn.lock().await;
        TransactionManager::new(&conn).execute(|c| {
            let dao = ArticleDao::new(c);
            let Some(mut article) = dao.get_by_client_id(client_id)? else {
                return Ok(AcceptOutcome::Missing);
            };
            article.server_id = Some(server_id);
            if article.sync_status == SyncStatus::Conflict {
                // 探测已把它标成冲突，不覆盖用户待处理的冲突
                dao.update(&article)?;
                return Ok(AcceptOutcome::Superseded(article));
            }
            article.remote_version = article.remote_version.max(server_version);
            article.server_updated_at = Some(now);
            article.sync_error = None;

            if article.local_version == sent_local_version && article.sync_status == SyncStatus::Syncing {
                article.sync_status = article.sync_status.transition(SyncStatus::Synced)?;
                dao.update(&article)?;
                Ok(AcceptOutcome::Synced(article))
            } else {
                if article.sync_status == SyncStatus::Syncing {
                    article.sync_status = article.sync_status.transition(SyncStatus::Pending)?;
                }
                dao.update(&article)?;
                tracing::debug!(
                    "[mirror] {} 回执 v{} 已过期（本地 v{}），保持 {}",
                    client_id,
                    sent_local_version,
                    article.local_version,
                    article.sync_status
                );
                Ok(AcceptOutcome::Superseded(article))
            }
        })
    }

    /// 强制覆盖成功：本地与远端版本统一为 server_version。
    /// 飞行期间又有编辑时，local_version 抬到 server_version 之上并保持 pending。
    pub async fn apply_forced(
        &self,
        client_id: &str,
        sent_local_version: i64,
        server_id: i64,
        server_version: i64,
    ) -> Result<AcceptOutcome> {
        let now = self.clock.now_millis();
        let conn = self.conn.lock().await;
        TransactionManager::new(&conn).execute(|c| {
            let dao = ArticleDao::new(c);
            let Some(mut article) = dao.get_by_client_id(client_id)? else {
                return Ok(AcceptOutcome::Missing);
            };
            article.server_id = Some(server_id);
            article.remote_version = server_version;
            article.server_updated_at = Some(now);
            article.sync_error = None;

            if article.local_version == sent_local_version && article.sync_status == SyncStatus::Syncing {
                article.sync_status = article.sync_status.transition(SyncStatus::Synced)?;
                article.local_version = server_version;
                dao.update(&article)?;
                Ok(AcceptOutcome::Synced(article))
            } else {
                if article.local_version <= server_version {
                    article.local_version = server_version + 1;
                }
                let next = article.sync_status.after_local_edit();
                article.sync_status = article.sync_status.transition(next)?;
                dao.update(&article)?;
                Ok(AcceptOutcome::Superseded(article))
            }
        })
    }

    /// 文件夹状态转换（恢复时把残留的 syncing 拉回 pending）
    pub async fn transition_folder(&self, client_id: &str, to: SyncStatus) -> Result<LocalFolder> {
        self.modify_folder(client_id, |folder| {
            folder.sync_status = folder.sync_status.transition(to)?;
            if to != SyncStatus::Error {
                folder.sync_error = None;
            }
            Ok(())
        })
        .await
    }

    /// 进入冲突：remote_version 记为服务端版本，退出自动同步路径
    pub async fn mark_conflict(&self, client_id: &str, server_id: i64, server_version: i64) -> Result<LocalArticle> {
        let now = self.clock.now_millis();
        self.modify(client_id, |article| {
            article.sync_status = article.sync_status.transition(SyncStatus::Conflict)?;
            article.server_id = Some(server_id);
            article.has_conflict = true;
            article.remote_version = server_version;
            article.conflict_detected_at.get_or_insert(now);
            article.sync_error = None;
            Ok(())
        })
        .await
    }

    pub async fn set_conflict_remote(&self, client_id: &str, remote_content: String) -> Result<LocalArticle> {
        self.modify(client_id, |article| {
            article.conflict_remote_content = Some(remote_content);
            Ok(())
        })
        .await
    }

    /// 传输失败。飞行期间被编辑过的实体已是 pending，保持不变
    pub async fn mark_error(&self, client_id: &str, message: &str) -> Result<LocalArticle> {
        self.modify(client_id, |article| {
            if matches!(article.sync_status, SyncStatus::Syncing | SyncStatus::Error) {
                article.sync_status = article.sync_status.transition(SyncStatus::Error)?;
                article.sync_error = Some(message.to_string());
            }
            Ok(())
        })
        .await
    }

    /// 采用服务端版本（取远端 / 快进），local_version 回到 remote_version
    pub async fn adopt_remote(&self, client_id: &str, remote: &RemoteArticle) -> Result<LocalArticle> {
        self.modify(client_id, |article| {
            article.sync_status = article.sync_status.transition(SyncStatus::Synced)?;
            article.server_id = Some(remote.id);
            article.title = remote.title.clone();
            article.content = remote.content.clone();
            article.summary = remote.summary.clone();
            article.folder_id = remote.folder_id.clone();
            article.remote_version = remote.version;
            article.local_version = remote.version;
            article.content_hash = article.compute_hash();
            article.server_updated_at = Some(remote.updated_at);
            article.sync_error = None;
            article.has_conflict = false;
            article.conflict_remote_content = None;
            article.conflict_detected_at = None;
            Ok(())
        })
        .await
    }

    /// 保留本地：remote_version := server_version，local_version 抬到其上，conflict -> pending
    pub async fn prepare_keep_local(&self, client_id: &str, server_version: i64) -> Result<LocalArticle> {
        let now = self.clock.now_millis();
        self.modify(client_id, |article| {
            article.sync_status = article.sync_status.transition(SyncStatus::Pending)?;
            article.remote_version = server_version;
            article.local_version = article.local_version.max(server_version) + 1;
            article.local_updated_at = now;
            article.has_conflict = false;
            article.conflict_remote_content = None;
            article.conflict_detected_at = None;
            Ok(())
        })
        .await
    }

    /// 删除行及其全部队列项
    pub async fn delete(&self, client_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        TransactionManager::new(&conn).execute(|c| {
            SyncQueueDao::new(c).delete_for_entity(client_id)?;
            ArticleDao::new(c).delete(client_id)
        })
    }

    async fn modify<F>(&self, client_id: &str, f: F) -> Result<LocalArticle>
    where
        F: FnOnce(&mut LocalArticle) -> Result<()>,
    {
        let conn = self.conn.lock().await;
        modify_article(&conn, client_id, f)
    }

    // ========== 文件夹 ==========

    pub async fn create_folder(&self, name: &str, parent_id: Option<String>) -> Result<LocalFolder> {
        let folder = LocalFolder {
            client_id: self.ids.next_client_id()?,
            server_id: None,
            name: name.to_string(),
            parent_id,
            local_version: 1,
            local_updated_at: self.clock.now_millis(),
            sync_status: SyncStatus::Pending,
            sync_error: None,
        };
        let conn = self.conn.lock().await;
        FolderDao::new(&conn).insert(&folder)?;
        tracing::debug!("[mirror] 新建文件夹 {} '{}'", folder.client_id, folder.name);
        Ok(folder)
    }

    /// 重命名 / 移动，`parent_id` 为 `Some(None)` 表示移到根
    pub async fn update_folder(
        &self,
        client_id: &str,
        name: Option<String>,
        parent_id: Option<Option<String>>,
    ) -> Result<LocalFolder> {
        let now = self.clock.now_millis();
        self.modify_folder(client_id, |folder| {
            folder.sync_status = folder.sync_status.transition(SyncStatus::Pending)?;
            if let Some(name) = name {
                folder.name = name;
            }
            if let Some(parent_id) = parent_id {
                folder.parent_id = parent_id;
            }
            folder.local_version += 1;
            folder.local_updated_at = now;
            folder.sync_error = None;
            Ok(())
        })
        .await
    }

    pub async fn get_folder(&self, client_id: &str) -> Result<Option<LocalFolder>> {
        let conn = self.conn.lock().await;
        FolderDao::new(&conn).get(client_id)
    }

    pub async fn list_folders(&self) -> Result<Vec<LocalFolder>> {
        let conn = self.conn.lock().await;
        FolderDao::new(&conn).list()
    }

    pub async fn delete_folder(&self, client_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        TransactionManager::new(&conn).execute(|c| {
            SyncQueueDao::new(c).delete_for_entity(client_id)?;
            FolderDao::new(c).delete(client_id)
        })
    }

    pub async fn mark_folder_syncing(&self, client_id: &str) -> Result<LocalFolder> {
        self.modify_folder(client_id, |folder| {
            folder.sync_status = folder.sync_status.transition(SyncStatus::Syncing)?;
            Ok(())
        })
        .await
    }

    /// 文件夹最后写入者胜出；回执版本落后于本地时回到 pending
    pub async fn apply_folder_accept(
        &self,
        client_id: &str,
        sent_local_version: i64,
        server_id: i64,
    ) -> Result<Option<LocalFolder>> {
        let conn = self.conn.lock().await;
        let dao = FolderDao::new(&conn);
        let Some(mut folder) = dao.get(client_id)? else {
            return Ok(None);
        };
        folder.server_id = Some(server_id);
        folder.sync_error = None;
        let target = if folder.local_version == sent_local_version {
            SyncStatus::Synced
        } else {
            SyncStatus::Pending
        };
        if folder.sync_status == SyncStatus::Syncing {
            folder.sync_status = folder.sync_status.transition(target)?;
        }
        dao.update(&folder)?;
        Ok(Some(folder))
    }

    pub async fn mark_folder_error(&self, client_id: &str, message: &str) -> Result<LocalFolder> {
        self.modify_folder(client_id, |folder| {
            if matches!(folder.sync_status, SyncStatus::Syncing | SyncStatus::Error) {
                folder.sync_status = folder.sync_status.transition(SyncStatus::Error)?;
                folder.sync_error = Some(message.to_string());
            }
            Ok(())
        })
        .await
    }

    async fn modify_folder<F>(&self, client_id: &str, f: F) -> Result<LocalFolder>
    where
        F: FnOnce(&mut LocalFolder) -> Result<()>,
    {
        let conn = self.conn.lock().await;
        TransactionManager::new(&conn).execute(|c| {
            let dao = FolderDao::new(c);
            let mut folder = dao
                .get(client_id)?
                .ok_or_else(|| SyncError::NotFound(format!("folder {}", client_id)))?;
            f(&mut folder)?;
            dao.update(&folder)?;
            Ok(folder)
        })
    }
}

fn modify_article<F>(conn: &Connection, client_id: &str, f: F) -> Result<LocalArticle>
where
    F: FnOnce(&mut LocalArticle) -> Result<()>,
{
    TransactionManager::new(conn).execute(|c| {
        let dao = ArticleDao::new(c);
        let mut article = dao
            .get_by_client_id(client_id)?
            .ok_or_else(|| SyncError::NotFound(format!("article {}", client_id)))?;
        f(&mut article)?;
        dao.update(&article)?;
        Ok(article)
    })
}
