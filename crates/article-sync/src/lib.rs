//! Article Sync - 离线优先的文章 / 文件夹同步引擎
//!
//! 本库提供：
//! - 📝 本地镜像：SQLite 持久化，每次编辑 local_version 单调递增
//! - 📡 防抖推送与持久化队列：离线编辑在恢复联网后按 FIFO 重放
//! - ⚔️ 乐观并发：基于版本号的冲突检测，冲突永不自动覆盖
//! - 🧭 冲突解决：取远端 / 保留本地，单实体重入保护
//! - 🔁 分类重试：传输 / 校验失败指数退避，耗尽后停放等待人工重试
//! - ⚙️ 事件系统：状态变化、冲突、网络变化统一广播
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use article_sync::{ArticleDraft, ArticlePatch, SyncConfig, SyncCoordinator, SyncDeps};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     article_sync::logging::init(None);
//!
//!     let config = SyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .server_url("https://api.example.com")
//!         .last_modified_by("alice")
//!         .build()?;
//!
//!     let coordinator = SyncCoordinator::new(SyncDeps::open(config).await?);
//!     coordinator.start().await?;
//!
//!     let article = coordinator.create_article(ArticleDraft::new("标题", "正文")).await?;
//!     coordinator
//!         .edit_article(&article.client_id, ArticlePatch::content("修改后的正文"))
//!         .await?;
//!     coordinator.sync_now(&article.client_id).await?;
//!
//!     coordinator.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod hasher;
pub mod logging;
pub mod network;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod utils;
pub mod version;

pub use config::{HttpClientConfig, SyncConfig, SyncConfigBuilder};
pub use error::{FailureKind, Result, SyncError};
pub use events::{EventManager, SyncEvent};
pub use hasher::{ContentHash, ContentHasher};
pub use network::{ConnectivitySource, NetworkMonitor, NetworkStatus, NetworkStatusEvent};
pub use remote::{
    ArticlePayload, ArticleServer, HttpTransport, RemoteArticle, RemoteClient, RemoteRequest, RemoteResponse,
    RemoteTransport, ServerTransport, WriteOutcome,
};
pub use storage::{
    ArticleDraft, ArticlePatch, EntityKind, LocalArticle, LocalFolder, LocalMirrorStore, StorageManager, SyncAction,
    SyncQueue, SyncQueueItem, SyncStatus,
};
pub use sync::{
    ConflictCheck, ConflictDetector, ConflictResolver, ConflictWatch, DrainReport, RecoveryReport, Resolution,
    RetryPolicy, SyncCoordinator, SyncDeps, SyncSummary,
};
pub use utils::{ClientIdGenerator, Clock, IdGenerator, IdWatermark, ManualClock, SystemClock};
pub use version::build_info;
