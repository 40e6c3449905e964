//! 持久化同步队列
//!
//! 队列项只表示"这个实体需要重新同步"，发送内容总在 flush 时从镜像重读。
//! 同一实体、同一动作的未耗尽项会合并，离线期间反复编辑不会堆积。

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{FailureKind, Result};
use crate::storage::dao::{NewQueueItem, SyncQueueDao};
use crate::storage::entities::{EntityKind, SyncAction, SyncQueueItem};
use crate::storage::SharedConnection;
use crate::utils::Clock;

#[derive(Debug, Clone)]
pub struct SyncQueue {
    conn: SharedConnection,
    clock: Arc<dyn Clock>,
    max_retries: u32,
}

impl SyncQueue {
    pub fn new(conn: SharedConnection, clock: Arc<dyn Clock>, max_retries: u32) -> Self {
        Self {
            conn,
            clock,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// 返回队列项 id（合并时为已有项的 id）
    pub async fn enqueue(
        &self,
        entity_type: EntityKind,
        client_id: &str,
        entity_id: Option<i64>,
        action: SyncAction,
        payload: serde_json::Value,
    ) -> Result<i64> {
        let now = self.clock.now_millis();
        let conn = self.conn.lock().await;
        let dao = SyncQueueDao::new(&conn);

        if let Some(existing) = dao
            .list_for_entity(client_id)?
            .into_iter()
            .find(|item| item.action == action && item.retry_count < self.max_retries)
        {
            tracing::debug!("[queue] {} {} 已在队列中 (#{})", action, client_id, existing.id);
            return Ok(existing.id);
        }

        let id = dao.insert(&NewQueueItem {
            entity_type,
            entity_client_id: client_id,
            entity_id,
            action,
            payload: &payload,
            created_at: now,
        })?;
        tracing::debug!("[queue] 入队 #{} {} {} {}", id, entity_type, action, client_id);
        Ok(id)
    }

    /// FIFO 取出到期且未耗尽重试的项
    pub async fn next_batch(&self, limit: usize) -> Result<Vec<SyncQueueItem>> {
        self.next_batch_excluding(limit, &HashSet::new()).await
    }

    /// 同 `next_batch`，跳过本轮已处理过的实体
    pub async fn next_batch_excluding(
        &self,
        limit: usize,
        exclude: &HashSet<String>,
    ) -> Result<Vec<SyncQueueItem>> {
        let now = self.clock.now_millis();
        let exclude: Vec<&str> = exclude.iter().map(String::as_str).collect();
        let conn = self.conn.lock().await;
        SyncQueueDao::new(&conn).due_excluding(now, self.max_retries, limit, &exclude)
    }

    pub async fn remove(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        SyncQueueDao::new(&conn).delete(id)
    }

    /// 删除该实体的全部队列项
    pub async fn remove_for_entity(&self, client_id: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        let removed = SyncQueueDao::new(&conn).delete_for_entity(client_id)?;
        if removed > 0 {
            tracing::debug!("[queue] 清除 {} 的 {} 个队列项", client_id, removed);
        }
        Ok(removed)
    }

    /// retry_count +1，记录错误与下次尝试时间
    pub async fn record_failure(
        &self,
        id: i64,
        error: &str,
        kind: FailureKind,
        next_attempt_at: i64,
    ) -> Result<Option<SyncQueueItem>> {
        let conn = self.conn.lock().await;
        let dao = SyncQueueDao::new(&conn);
        if !dao.record_failure(id, error, kind, next_attempt_at)? {
            return Ok(None);
        }
        dao.get(id)
    }

    /// 停放到已耗尽，等待 `reset_retries`
    pub async fn park(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        SyncQueueDao::new(&conn).park(id, self.max_retries)
    }

    pub async fn get(&self, id: i64) -> Result<Option<SyncQueueItem>> {
        let conn = self.conn.lock().await;
        SyncQueueDao::new(&conn).get(id)
    }

    /// 恢复联网：未耗尽项立即到期
    pub async fn reset_backoff(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        let conn = self.conn.lock().await;
        SyncQueueDao::new(&conn).reset_backoff(now, self.max_retries)
    }

    /// 人工重试：清零该实体的重试计数
    pub async fn reset_retries(&self, client_id: &str) -> Result<usize> {
        let now = self.clock.now_millis();
        let conn = self.conn.lock().await;
        SyncQueueDao::new(&conn).reset_retries(client_id, now)
    }

    pub async fn len(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        SyncQueueDao::new(&conn).count()
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn contains(&self, client_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        SyncQueueDao::new(&conn).has_entity(client_id)
    }

    pub async fn items_for(&self, client_id: &str) -> Result<Vec<SyncQueueItem>> {
        let conn = self.conn.lock().await;
        SyncQueueDao::new(&conn).list_for_entity(client_id)
    }

    /// 已耗尽重试、等待人工处理的项
    pub async fn exhausted(&self) -> Result<Vec<SyncQueueItem>> {
        let conn = self.conn.lock().await;
        SyncQueueDao::new(&conn).list_exhausted(self.max_retries)
    }
}
