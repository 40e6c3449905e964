#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use article_sync::{
    ArticleDraft, ArticleServer, LocalArticle, ManualClock, NetworkStatus, ServerTransport, StorageManager,
    SyncConfig, SyncCoordinator, SyncDeps,
};
use article_sync::config::SyncConfigBuilder;

pub const START_MILLIS: i64 = 1_700_000_000_000;

pub struct TestEnv {
    pub coordinator: SyncCoordinator,
    pub transport: Arc<ServerTransport>,
    pub clock: Arc<ManualClock>,
}

impl TestEnv {
    pub fn server(&self) -> &Arc<ArticleServer> {
        self.transport.server()
    }

    pub fn go_offline(&self) {
        self.coordinator.network().set_status(NetworkStatus::Offline);
    }

    pub fn go_online(&self) {
        self.coordinator.network().set_status(NetworkStatus::Online);
    }

    /// 新建并立即同步，返回已同步的文章
    pub async fn synced_article(&self, title: &str, content: &str) -> LocalArticle {
        let article = self
            .coordinator
            .create_article(ArticleDraft::new(title, content))
            .await
            .unwrap();
        let synced = self.coordinator.sync_now(&article.client_id).await.unwrap();
        assert!(synced.is_clean(), "expected clean article, got {synced:?}");
        synced
    }

    pub async fn article(&self, client_id: &str) -> LocalArticle {
        self.coordinator.get_article(client_id).await.unwrap().unwrap()
    }
}

pub fn config() -> SyncConfigBuilder {
    SyncConfig::builder().device_id("dev").last_modified_by("tester")
}

pub fn env() -> TestEnv {
    env_with(config().build().unwrap())
}

pub fn env_with(config: SyncConfig) -> TestEnv {
    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let server = Arc::new(ArticleServer::new(clock.clone()));
    let transport = Arc::new(ServerTransport::new(server));
    env_on(config, StorageManager::open_in_memory().unwrap(), transport, clock)
}

pub fn env_on(
    config: SyncConfig,
    storage: StorageManager,
    transport: Arc<ServerTransport>,
    clock: Arc<ManualClock>,
) -> TestEnv {
    let deps = SyncDeps::new(config, storage, transport.clone(), clock.clone()).unwrap();
    TestEnv {
        coordinator: SyncCoordinator::new(deps),
        transport,
        clock,
    }
}

/// 轮询直到条件成立（暂停时钟下 sleep 会自动推进）
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}
