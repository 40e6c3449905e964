//! 网络状态监控
//!
//! 平台层通过 `set_status` 或 `ConnectivitySource` 上报在线/离线，
//! 只有状态真正变化时才广播。

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    Online,
    Offline,
}

impl NetworkStatus {
    pub fn is_online(self) -> bool {
        matches!(self, NetworkStatus::Online)
    }
}

/// 网络状态变化事件
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: i64,
}

/// 连通性探测（由平台层实现，如系统网络回调）
#[async_trait]
pub trait ConnectivitySource: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatus>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 网络监控管理器
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    current_status: Arc<RwLock<NetworkStatus>>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (status_sender, _) = broadcast::channel(100);
        Self {
            status_sender,
            current_status: Arc::new(RwLock::new(initial)),
        }
    }

    /// 接入平台探测器：先同步一次当前状态，再转发后续变化
    pub async fn attach(&self, source: Arc<dyn ConnectivitySource>) -> Result<JoinHandle<()>> {
        self.set_status(source.current_status().await);
        let mut receiver = source.start_monitoring().await?;
        let monitor = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(status) => {
                        monitor.set_status(status);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("网络状态事件积压，丢弃 {} 条", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("网络探测器已关闭");
        }))
    }

    pub fn status(&self) -> NetworkStatus {
        *self.current_status.read()
    }

    pub fn is_online(&self) -> bool {
        self.status().is_online()
    }

    /// 更新状态；仅在变化时广播，返回是否变化
    pub fn set_status(&self, new_status: NetworkStatus) -> bool {
        let old_status = {
            let mut status = self.current_status.write();
            if *status == new_status {
                return false;
            }
            std::mem::replace(&mut *status, new_status)
        };

        tracing::info!("🌐 网络状态变化: {:?} -> {:?}", old_status, new_status);
        let event = NetworkStatusEvent {
            old_status,
            new_status,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        // 没有订阅者时发送失败，忽略
        let _ = self.status_sender.send(event);
        true
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.status_sender.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkStatus::Online)
    }
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;

    /// 测试用：手动驱动的探测器
    #[derive(Debug)]
    pub struct DummyConnectivitySource {
        status: RwLock<NetworkStatus>,
        sender: broadcast::Sender<NetworkStatus>,
    }

    impl DummyConnectivitySource {
        pub fn new(initial: NetworkStatus) -> Self {
            let (sender, _) = broadcast::channel(16);
            Self {
                status: RwLock::new(initial),
                sender,
            }
        }

        pub fn emit(&self, status: NetworkStatus) {
            *self.status.write() = status;
            let _ = self.sender.send(status);
        }
    }

    #[async_trait]
    impl ConnectivitySource for DummyConnectivitySource {
        async fn current_status(&self) -> NetworkStatus {
            *self.status.read()
        }

        async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatus>> {
            Ok(self.sender.subscribe())
        }

        async fn stop_monitoring(&self) {}
    }
}

#[cfg(test)]
mod tests {
    use super::test_helpers::DummyConnectivitySource;
    use super::*;

    #[test]
    fn test_only_changes_are_published() {
        let monitor = NetworkMonitor::new(NetworkStatus::Online);
        let mut rx = monitor.subscribe();

        assert!(!monitor.set_status(NetworkStatus::Online));
        assert!(monitor.set_status(NetworkStatus::Offline));
        assert!(!monitor.set_status(NetworkStatus::Offline));
        assert!(monitor.set_status(NetworkStatus::Online));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.old_status, NetworkStatus::Online);
        assert_eq!(first.new_status, NetworkStatus::Offline);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.new_status, NetworkStatus::Online);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_source_drives_monitor() {
        let monitor = NetworkMonitor::new(NetworkStatus::Online);
        let source = Arc::new(DummyConnectivitySource::new(NetworkStatus::Offline));
        let mut rx = monitor.subscribe();

        let _handle = monitor.attach(source.clone()).await.unwrap();
        assert!(!monitor.is_online());
        assert_eq!(rx.recv().await.unwrap().new_status, NetworkStatus::Offline);

        source.emit(NetworkStatus::Online);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.new_status, NetworkStatus::Online);
        assert!(monitor.is_online());
    }
}
