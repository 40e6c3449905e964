//! 冲突解决：取远端 / 保留本地
//!
//! 同一实体同时只允许一个解决动作；对非冲突实体调用是幂等的空操作。

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use crate::error::{Result, SyncError};
use crate::events::SyncEvent;
use crate::storage::{EntityKind, LocalArticle, SyncStatus};
use crate::sync::coordinator::SyncCoordinator;

/// 解决方式（线上格式 `"remote"` / `"local"`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "remote")]
    UseRemote,
    #[serde(rename = "local")]
    UseLocal,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::UseRemote => "remote",
            Resolution::UseLocal => "local",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 每实体的重入保护，drop 时释放
struct ResolutionGuard<'a> {
    coordinator: &'a SyncCoordinator,
    client_id: String,
}

impl<'a> ResolutionGuard<'a> {
    fn acquire(coordinator: &'a SyncCoordinator, client_id: &str) -> Result<Self> {
        if !coordinator.resolving().lock().insert(client_id.to_string()) {
            return Err(SyncError::ResolutionInProgress(client_id.to_string()));
        }
        Ok(Self {
            coordinator,
            client_id: client_id.to_string(),
        })
    }
}

impl Drop for ResolutionGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.resolving().lock().remove(&self.client_id);
    }
}

#[derive(Debug, Clone)]
pub struct ConflictResolver {
    coordinator: SyncCoordinator,
}

impl ConflictResolver {
    pub fn new(coordinator: SyncCoordinator) -> Self {
        Self { coordinator }
    }

    pub async fn resolve(&self, client_id: &str, resolution: Resolution) -> Result<LocalArticle> {
        match resolution {
            Resolution::UseRemote => self.use_remote_version(client_id).await,
            Resolution::UseLocal => self.use_local_version(client_id).await,
        }
    }

    /// 放弃本地修改，采用服务端内容与版本
    pub async fn use_remote_version(&self, client_id: &str) -> Result<LocalArticle> {
        let _resolving = ResolutionGuard::acquire(&self.coordinator, client_id)?;
        let lock = self.coordinator.entity_lock(client_id).await;
        let _guard = lock.lock().await;

        let article = self.coordinator.mirror().require(client_id).await?;
        let Some(server_id) = conflicted_server_id(&article) else {
            return Ok(article);
        };

        let remote = self.coordinator.remote().fetch(server_id).await?;
        let adopted = self.coordinator.mirror().adopt_remote(client_id, &remote).await?;
        self.coordinator.queue().remove_for_entity(client_id).await?;

        if let Err(e) = self
            .coordinator
            .remote()
            .resolve_conflict(server_id, Resolution::UseRemote, remote.version)
            .await
        {
            // 本地已落定，回执只是通知
            warn!("冲突解决回执失败 {}: {}", client_id, e);
        }
        info!("✅ {} 冲突已解决：采用远端 v{}", client_id, remote.version);
        self.finish(client_id, Resolution::UseRemote, &adopted).await;
        Ok(adopted)
    }

    /// 保留本地内容：版本抬到服务端之上后立即重新推送
    pub async fn use_local_version(&self, client_id: &str) -> Result<LocalArticle> {
        let _resolving = ResolutionGuard::acquire(&self.coordinator, client_id)?;
        let prepared = {
            let lock = self.coordinator.entity_lock(client_id).await;
            let _guard = lock.lock().await;

            let article = self.coordinator.mirror().require(client_id).await?;
            let Some(server_id) = conflicted_server_id(&article) else {
                return Ok(article);
            };

            let server_version = match self
                .coordinator
                .remote()
                .check_conflict(server_id, article.remote_version, &article.content_hash)
                .await
            {
                Ok(check) => check.server_version,
                // 离线时沿用冲突发生时记录的服务端版本
                Err(e) if e.is_unreachable() => article.remote_version,
                Err(e) => return Err(e),
            };
            self.coordinator
                .mirror()
                .prepare_keep_local(client_id, server_version)
                .await?
        };
        self.coordinator
            .emit_status(EntityKind::Article, client_id, SyncStatus::Conflict, prepared.sync_status)
            .await;

        let article = match self.coordinator.sync_to_server(client_id).await {
            Ok(article) => article,
            // 已入队，稍后重放
            Err(e) if e.is_unreachable() => {
                warn!("{} 保留本地后推送失败，已入队: {}", client_id, e);
                self.coordinator.mirror().require(client_id).await?
            }
            Err(e) => return Err(e),
        };

        if article.sync_status == SyncStatus::Synced {
            if let Some(server_id) = article.server_id {
                if let Err(e) = self
                    .coordinator
                    .remote()
                    .resolve_conflict(server_id, Resolution::UseLocal, article.remote_version)
                    .await
                {
                    warn!("冲突解决回执失败 {}: {}", client_id, e);
                }
            }
        }
        info!(
            "✅ {} 冲突已解决：保留本地 v{} ({})",
            client_id, article.local_version, article.sync_status
        );
        self.finish(client_id, Resolution::UseLocal, &article).await;
        Ok(article)
    }

    async fn finish(&self, client_id: &str, resolution: Resolution, article: &LocalArticle) {
        if resolution == Resolution::UseRemote {
            self.coordinator
                .emit_status(EntityKind::Article, client_id, SyncStatus::Conflict, article.sync_status)
                .await;
        }
        self.coordinator
            .emit(SyncEvent::ConflictResolved {
                client_id: client_id.to_string(),
                resolution,
                timestamp: self.coordinator.now(),
            })
            .await;
    }
}

/// 仍处于冲突时返回服务端 ID
fn conflicted_server_id(article: &LocalArticle) -> Option<i64> {
    if article.sync_status != SyncStatus::Conflict {
        return None;
    }
    article.server_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_wire_format() {
        assert_eq!(serde_json::to_string(&Resolution::UseRemote).unwrap(), "\"remote\"");
        assert_eq!(
            serde_json::from_str::<Resolution>("\"local\"").unwrap(),
            Resolution::UseLocal
        );
        assert_eq!(Resolution::UseLocal.to_string(), "local");
    }
}
