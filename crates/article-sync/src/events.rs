//! 事件系统模块 - 同步过程中的可观察事件
//!
//! 功能包括：
//! - 实体同步状态变更
//! - 冲突检测与解决
//! - 网络状态变化
//! - 事件广播、按类型监听、统计

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::FailureKind;
use crate::network::NetworkStatus;
use crate::storage::entities::{EntityKind, SyncStatus};
use crate::sync::resolution::Resolution;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    ConnectivityChanged {
        status: NetworkStatus,
        timestamp: i64,
    },
    StatusChanged {
        entity_type: EntityKind,
        client_id: String,
        old: SyncStatus,
        new: SyncStatus,
        timestamp: i64,
    },
    ConflictDetected {
        client_id: String,
        local_version: i64,
        server_version: i64,
        timestamp: i64,
    },
    ConflictResolved {
        client_id: String,
        resolution: Resolution,
        timestamp: i64,
    },
    /// 本地干净时远端有新版本，已快进
    RemoteUpdated {
        client_id: String,
        remote_version: i64,
        timestamp: i64,
    },
    SyncFailed {
        client_id: String,
        kind: FailureKind,
        message: String,
        timestamp: i64,
    },
    QueueDrained {
        processed: usize,
        remaining: u64,
        timestamp: i64,
    },
}

impl SyncEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::ConnectivityChanged { .. } => "connectivity_changed",
            SyncEvent::StatusChanged { .. } => "status_changed",
            SyncEvent::ConflictDetected { .. } => "conflict_detected",
            SyncEvent::ConflictResolved { .. } => "conflict_resolved",
            SyncEvent::RemoteUpdated { .. } => "remote_updated",
            SyncEvent::SyncFailed { .. } => "sync_failed",
            SyncEvent::QueueDrained { .. } => "queue_drained",
        }
    }

    /// 关联实体
    pub fn client_id(&self) -> Option<&str> {
        match self {
            SyncEvent::StatusChanged { client_id, .. }
            | SyncEvent::ConflictDetected { client_id, .. }
            | SyncEvent::ConflictResolved { client_id, .. }
            | SyncEvent::RemoteUpdated { client_id, .. }
            | SyncEvent::SyncFailed { client_id, .. } => Some(client_id),
            SyncEvent::ConnectivityChanged { .. } | SyncEvent::QueueDrained { .. } => None,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            SyncEvent::ConnectivityChanged { timestamp, .. }
            | SyncEvent::StatusChanged { timestamp, .. }
            | SyncEvent::ConflictDetected { timestamp, .. }
            | SyncEvent::ConflictResolved { timestamp, .. }
            | SyncEvent::RemoteUpdated { timestamp, .. }
            | SyncEvent::SyncFailed { timestamp, .. }
            | SyncEvent::QueueDrained { timestamp, .. } => *timestamp,
        }
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    /// 按事件类型注册的监听器，"*" 表示全部
    listeners: Arc<tokio::sync::RwLock<HashMap<String, Vec<EventListener>>>>,
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<i64>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 失败属正常
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read().await;
        for key in [event.event_type(), "*"] {
            if let Some(event_listeners) = listeners.get(key) {
                for listener in event_listeners {
                    listener(&event);
                }
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(event_type.to_string())
            .or_insert_with(Vec::new)
            .push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", event_type);
    }

    pub async fn clear_listeners(&self) {
        self.listeners.write().await.clear();
        self.stats.write().await.listener_count = 0;
    }

    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn status_event(client_id: &str) -> SyncEvent {
        SyncEvent::StatusChanged {
            entity_type: EntityKind::Article,
            client_id: client_id.into(),
            old: SyncStatus::Pending,
            new: SyncStatus::Syncing,
            timestamp: 1,
        }
    }

    #[tokio::test]
    async fn test_emit_reaches_subscribers_and_listeners() {
        let manager = EventManager::new(16);
        let mut rx = manager.subscribe();

        let typed = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));
        {
            let typed = typed.clone();
            manager
                .add_listener("status_changed", move |_| {
                    typed.fetch_add(1, Ordering::SeqCst);
                })
                .await;
            let all = all.clone();
            manager
                .add_listener("*", move |_| {
                    all.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }

        manager.emit(status_event("a1")).await;
        manager
            .emit(SyncEvent::QueueDrained {
                processed: 2,
                remaining: 0,
                timestamp: 2,
            })
            .await;

        assert_eq!(rx.recv().await.unwrap().client_id(), Some("a1"));
        assert_eq!(typed.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);

        let stats = manager.get_stats().await;
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.events_by_type.get("queue_drained"), Some(&1));
        assert_eq!(stats.listener_count, 2);
        assert_eq!(stats.last_event_time, Some(2));
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(status_event("a1")).unwrap();
        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["new"], "syncing");
    }
}
