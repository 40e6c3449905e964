//! 冲突探测（客户端侧）
//!
//! 写入时的冲突由 `sync_update` 内联发现；这里负责打开文章时和停留期间的
//! 轻量探测：只发送版本与指纹，服务端只回元数据。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::events::SyncEvent;
use crate::storage::SyncStatus;
use crate::sync::coordinator::SyncCoordinator;

/// 探测结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictCheck {
    pub has_conflict: bool,
    pub remote_updated_at: Option<i64>,
    pub sync_status: SyncStatus,
}

#[derive(Debug, Clone)]
pub struct ConflictDetector {
    coordinator: SyncCoordinator,
}

impl ConflictDetector {
    pub fn new(coordinator: SyncCoordinator) -> Self {
        Self { coordinator }
    }

    /// 探测一次。远端前进且本地有未同步修改 -> 冲突；本地干净 -> 快进采用远端
    pub async fn check(&self, client_id: &str) -> Result<ConflictCheck> {
        let lock = self.coordinator.entity_lock(client_id).await;
        let _guard = lock.lock().await;

        let mirror = self.coordinator.mirror();
        let article = mirror.require(client_id).await?;
        if article.has_conflict {
            return Ok(ConflictCheck {
                has_conflict: true,
                remote_updated_at: article.server_updated_at,
                sync_status: article.sync_status,
            });
        }
        // 从未被服务端接受，无从比较
        let Some(server_id) = article.server_id.filter(|_| article.remote_version > 0) else {
            return Ok(ConflictCheck {
                has_conflict: false,
                remote_updated_at: None,
                sync_status: article.sync_status,
            });
        };
        if !self.coordinator.is_online() {
            return Err(SyncError::Offline);
        }

        let check = self
            .coordinator
            .remote()
            .check_conflict(server_id, article.remote_version, &article.content_hash)
            .await?;
        if !check.has_conflict {
            debug!("{} 远端未变化 (v{})", client_id, check.server_version);
            return Ok(ConflictCheck {
                has_conflict: false,
                remote_updated_at: Some(check.remote_updated_at),
                sync_status: article.sync_status,
            });
        }

        if article.is_clean() {
            let remote = self.coordinator.remote().fetch(server_id).await?;
            let adopted = mirror.adopt_remote(client_id, &remote).await?;
            info!("⏩ {} 快进到远端 v{}", client_id, remote.version);
            self.coordinator
                .emit(SyncEvent::RemoteUpdated {
                    client_id: client_id.to_string(),
                    remote_version: remote.version,
                    timestamp: self.coordinator.now(),
                })
                .await;
            return Ok(ConflictCheck {
                has_conflict: false,
                remote_updated_at: Some(remote.updated_at),
                sync_status: adopted.sync_status,
            });
        }

        let conflicted = self
            .coordinator
            .enter_conflict(client_id, article.sync_status, server_id, check.server_version)
            .await?;
        Ok(ConflictCheck {
            has_conflict: true,
            remote_updated_at: Some(check.remote_updated_at),
            sync_status: conflicted.sync_status,
        })
    }

    /// 按 `conflict_poll_interval` 持续探测，句柄释放即停止
    pub fn watch(&self, client_id: &str) -> ConflictWatch {
        let period = self.coordinator.config().conflict_poll_interval();
        self.watch_every(client_id, period)
    }

    pub fn watch_every(&self, client_id: &str, period: Duration) -> ConflictWatch {
        let (tx, rx) = watch::channel(None);
        let detector = self.clone();
        let client_id = client_id.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if !detector.coordinator.is_online() {
                    continue;
                }
                match detector.check(&client_id).await {
                    Ok(check) => {
                        if tx.send(Some(check)).is_err() {
                            break;
                        }
                    }
                    Err(SyncError::NotFound(_)) => {
                        debug!("{} 已不存在，停止探测", client_id);
                        break;
                    }
                    Err(e) => warn!("探测 {} 失败: {}", client_id, e),
                }
            }
        });
        ConflictWatch { handle, latest: rx }
    }
}

/// 轮询句柄；drop 时停止
#[derive(Debug)]
pub struct ConflictWatch {
    handle: JoinHandle<()>,
    latest: watch::Receiver<Option<ConflictCheck>>,
}

impl ConflictWatch {
    /// 最近一次探测结果
    pub fn latest(&self) -> Option<ConflictCheck> {
        self.latest.borrow().clone()
    }

    /// 等待下一次探测结果
    pub async fn changed(&mut self) -> Option<ConflictCheck> {
        self.latest.changed().await.ok()?;
        self.latest.borrow_and_update().clone()
    }

    pub fn stop(self) {}
}

impl Drop for ConflictWatch {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
