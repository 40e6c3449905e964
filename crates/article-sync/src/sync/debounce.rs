//! 编辑防抖 - 基于 DelayQueue，按 client_id 去重
//!
//! 同一实体的新编辑会重置计时，只有最后一次编辑后静默满 `delay` 才触发。

use futures::future::poll_fn;
use std::collections::HashMap;
use std::task::Poll;
use std::time::Duration;
use tokio_util::time::{delay_queue, DelayQueue};

use crate::storage::entities::EntityKind;

/// 到期的实体
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebouncedEntity {
    pub kind: EntityKind,
    pub client_id: String,
}

#[derive(Debug, Default)]
pub struct Debouncer {
    queue: DelayQueue<DebouncedEntity>,
    keys: HashMap<String, delay_queue::Key>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 安排或重置计时
    pub fn schedule(&mut self, kind: EntityKind, client_id: &str, delay: Duration) {
        if let Some(key) = self.keys.get(client_id) {
            self.queue.reset(key, delay);
            return;
        }
        let key = self.queue.insert(
            DebouncedEntity {
                kind,
                client_id: client_id.to_string(),
            },
            delay,
        );
        self.keys.insert(client_id.to_string(), key);
    }

    /// 取消计时，返回是否存在
    pub fn cancel(&mut self, client_id: &str) -> bool {
        match self.keys.remove(client_id) {
            Some(key) => {
                self.queue.remove(&key);
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, client_id: &str) -> bool {
        self.keys.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// 等待下一个到期项；队列为空时一直挂起（配合 select! 使用）
    pub async fn expired(&mut self) -> DebouncedEntity {
        let entity = poll_fn(|cx| match self.queue.poll_expired(cx) {
            Poll::Ready(Some(expired)) => Poll::Ready(expired.into_inner()),
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        })
        .await;
        self.keys.remove(&entity.client_id);
        entity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_resets_timer() {
        let mut debouncer = Debouncer::new();
        let delay = Duration::from_millis(1_000);
        let start = tokio::time::Instant::now();

        debouncer.schedule(EntityKind::Article, "a1", delay);
        tokio::time::sleep(Duration::from_millis(600)).await;
        debouncer.schedule(EntityKind::Article, "a1", delay);
        assert_eq!(debouncer.len(), 1);

        let fired = debouncer.expired().await;
        assert_eq!(fired.client_id, "a1");
        assert!(start.elapsed() >= Duration::from_millis(1_600));
        assert!(debouncer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let mut debouncer = Debouncer::new();
        debouncer.schedule(EntityKind::Article, "a1", Duration::from_millis(100));
        debouncer.schedule(EntityKind::Folder, "f1", Duration::from_millis(200));
        assert!(debouncer.cancel("a1"));
        assert!(!debouncer.cancel("a1"));

        let fired = debouncer.expired().await;
        assert_eq!(fired.kind, EntityKind::Folder);
        assert!(!debouncer.is_scheduled("f1"));
    }
}
