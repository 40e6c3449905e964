//! KV 存储模块 - 基于 sled 的同步元数据存储
//!
//! 只保存小体量元数据：设备 ID、最近一次 drain / 成功同步的时间。
//! 实体数据全部在 SQLite 镜像里。

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::error::{Result, SyncError};
use crate::utils::IdWatermark;

const META_TREE: &str = "sync_meta";

pub const KEY_DEVICE_ID: &str = "device_id";
pub const KEY_LAST_DRAIN_AT: &str = "last_drain_at";
pub const KEY_LAST_SUCCESSFUL_SYNC_AT: &str = "last_successful_sync_at";
pub const KEY_CLIENT_ID_WATERMARK: &str = "client_id_watermark";

/// KV 存储组件
#[derive(Debug, Clone)]
pub struct KvStore {
    db: Arc<Db>,
    tree: Tree,
}

impl KvStore {
    /// 打开 `{base_path}/kv`
    pub async fn open(base_path: &Path) -> Result<Self> {
        let kv_path = base_path.join("kv");
        tokio::fs::create_dir_all(&kv_path).await?;

        // 上一个实例可能刚释放文件锁，带退避重试
        const MAX_OPEN_RETRIES: u32 = 5;
        const RETRY_DELAY_MS: u64 = 100;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(db) => return Self::from_db(db),
                Err(e) => {
                    let msg = e.to_string();
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock") || msg.contains("WouldBlock");
                    if !is_lock || attempt + 1 == MAX_OPEN_RETRIES {
                        break;
                    }
                    tracing::warn!("sled 被占用，{}ms 后重试 (第 {} 次)", RETRY_DELAY_MS << attempt, attempt + 1);
                    tokio::time::sleep(std::time::Duration::from_millis(RETRY_DELAY_MS << attempt)).await;
                }
            }
        }
        Err(SyncError::Kv(
            last_err
                .map(|e| format!("打开 sled 数据库失败: {}", e))
                .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
        ))
    }

    /// 临时存储，进程退出即删除（测试用）
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        let tree = db.open_tree(META_TREE)?;
        Ok(Self { db: Arc::new(db), tree })
    }

    pub fn set<V: Serialize>(&self, key: &str, value: &V) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.tree.insert(key, bytes)?;
        Ok(())
    }

    pub fn get<V>(&self, key: &str) -> Result<Option<V>>
    where
        V: for<'de> Deserialize<'de>,
    {
        match self.tree.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.tree.remove(key)?.is_some())
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    /// 读取已持久化的设备 ID，没有则用 `generate` 生成并写入
    pub fn device_id_or_init(&self, generate: impl FnOnce() -> String) -> Result<String> {
        if let Some(existing) = self.get::<String>(KEY_DEVICE_ID)? {
            return Ok(existing);
        }
        let device_id = generate();
        self.set(KEY_DEVICE_ID, &device_id)?;
        tracing::info!("生成新的设备 ID: {}", device_id);
        Ok(device_id)
    }

    pub fn record_drain(&self, at_millis: i64) -> Result<()> {
        self.set(KEY_LAST_DRAIN_AT, &at_millis)
    }

    pub fn record_successful_sync(&self, at_millis: i64) -> Result<()> {
        self.set(KEY_LAST_SUCCESSFUL_SYNC_AT, &at_millis)
    }

    pub fn last_drain_at(&self) -> Result<Option<i64>> {
        self.get(KEY_LAST_DRAIN_AT)
    }

    pub fn last_successful_sync_at(&self) -> Result<Option<i64>> {
        self.get(KEY_LAST_SUCCESSFUL_SYNC_AT)
    }
}

impl IdWatermark for KvStore {
    fn load_watermark(&self) -> Result<Option<i64>> {
        self.get(KEY_CLIENT_ID_WATERMARK)
    }

    fn store_watermark(&self, millis: i64) -> Result<()> {
        self.set(KEY_CLIENT_ID_WATERMARK, &millis)
    }
}
