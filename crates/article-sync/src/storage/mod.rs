//! 存储模块 - 本地镜像的持久化层
//!
//! 分层：
//! - StorageManager: 打开 SQLite 与 sled，执行迁移
//! - LocalMirrorStore / SyncQueue: 领域 API
//! - DAO Layer: 每张表一个操作模块
//! - Entities: 数据实体与同步状态机

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::SyncConfig;
use crate::error::Result;

pub mod dao;
pub mod entities;
pub mod kv;
pub mod migrate;
pub mod mirror;
pub mod queue;

pub use entities::*;
pub use kv::KvStore;
pub use mirror::{AcceptOutcome, LocalMirrorStore};
pub use queue::SyncQueue;

/// 串行化的 SQLite 连接；所有读写都经过这把锁
pub type SharedConnection = Arc<Mutex<Connection>>;

/// 存储管理器
#[derive(Debug, Clone)]
pub struct StorageManager {
    conn: SharedConnection,
    kv: KvStore,
    data_dir: Option<PathBuf>,
}

impl StorageManager {
    /// 打开 `config.data_dir` 下的 mirror.db 与 kv/
    pub async fn open(config: &SyncConfig) -> Result<Self> {
        Self::open_at(&config.data_dir).await
    }

    pub async fn open_at(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("mirror.db");

        let mut conn = Connection::open(&db_path)?;
        migrate::init_db(&mut conn)?;
        let kv = KvStore::open(data_dir).await?;

        tracing::info!("✅ 本地镜像已打开: {}", db_path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            kv,
            data_dir: Some(data_dir.to_path_buf()),
        })
    }

    /// 内存数据库 + 临时 KV（测试用）
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrate::init_db(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            kv: KvStore::temporary()?,
            data_dir: None,
        })
    }

    pub fn connection(&self) -> SharedConnection {
        self.conn.clone()
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    /// 刷盘 KV；SQLite 每次提交即持久
    pub async fn flush(&self) -> Result<()> {
        self.kv.flush().await
    }
}
