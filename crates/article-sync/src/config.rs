//! 同步引擎配置

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::sync::retry_policy::RetryPolicy;

/// HTTP 客户端配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 请求超时（秒）
    pub request_timeout_secs: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

/// 同步引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 数据存储目录（mirror.db 与 kv/）
    pub data_dir: PathBuf,
    /// 远端 RPC 地址，如 https://api.example.com
    pub server_url: Option<String>,
    /// 固定设备 ID；None 时首次启动生成并持久化
    pub device_id: Option<String>,
    /// 写入服务端的 last_modified_by
    pub last_modified_by: String,
    /// 编辑后的防抖时间（毫秒）
    pub debounce_ms: u64,
    /// 每批 drain 的队列项数
    pub batch_size: usize,
    /// 冲突轮询间隔（秒）
    pub conflict_poll_interval_secs: u64,
    /// 单篇文章内容上限（字节）
    pub max_content_bytes: usize,
    /// 事件缓冲区大小
    pub event_capacity: usize,
    pub retry: RetryPolicy,
    pub http: HttpClientConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./article_sync_data"),
            server_url: None,
            device_id: None,
            last_modified_by: "local".to_string(),
            debounce_ms: 1_000,
            batch_size: 10,
            conflict_poll_interval_secs: 30,
            max_content_bytes: 5 * 1024 * 1024,
            event_capacity: 256,
            retry: RetryPolicy::default(),
            http: HttpClientConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn conflict_poll_interval(&self) -> Duration {
        Duration::from_secs(self.conflict_poll_interval_secs)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("mirror.db")
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be greater than 0".into()));
        }
        if self.debounce_ms == 0 {
            return Err(SyncError::Config("debounce_ms must be greater than 0".into()));
        }
        if self.conflict_poll_interval_secs == 0 {
            return Err(SyncError::Config(
                "conflict_poll_interval_secs must be greater than 0".into(),
            ));
        }
        if self.max_content_bytes == 0 {
            return Err(SyncError::Config("max_content_bytes must be greater than 0".into()));
        }
        if self.retry.max_retries == 0 {
            return Err(SyncError::Config("retry.max_retries must be greater than 0".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(SyncError::Config("retry.jitter_factor must be within 0.0..=1.0".into()));
        }
        if let Some(url) = &self.server_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(SyncError::Config(format!("unsupported server_url '{}'", url)));
            }
        }
        Ok(())
    }
}

/// 配置构建器
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn server_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.server_url = Some(url.into().trim_end_matches('/').to_string());
        self
    }

    pub fn device_id<S: Into<String>>(mut self, device_id: S) -> Self {
        self.config.device_id = Some(device_id.into());
        self
    }

    pub fn last_modified_by<S: Into<String>>(mut self, who: S) -> Self {
        self.config.last_modified_by = who.into();
        self
    }

    pub fn debounce_ms(mut self, ms: u64) -> Self {
        self.config.debounce_ms = ms;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn conflict_poll_interval_secs(mut self, secs: u64) -> Self {
        self.config.conflict_poll_interval_secs = secs;
        self
    }

    pub fn max_content_bytes(mut self, bytes: usize) -> Self {
        self.config.max_content_bytes = bytes;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn http_client_config(mut self, config: HttpClientConfig) -> Self {
        self.config.http = config;
        self
    }

    /// 构建并校验
    pub fn build(self) -> Result<SyncConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::builder().build().unwrap();
        assert_eq!(config.debounce(), Duration::from_secs(1));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.conflict_poll_interval(), Duration::from_secs(30));
        assert_eq!(config.retry.max_retries, 5);
    }

    #[test]
    fn test_builder_overrides() {
        let config = SyncConfig::builder()
            .data_dir("/tmp/sync")
            .server_url("https://api.example.com/")
            .device_id("dev1")
            .batch_size(3)
            .build()
            .unwrap();
        assert_eq!(config.server_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(config.database_path(), PathBuf::from("/tmp/sync/mirror.db"));
        assert_eq!(config.device_id.as_deref(), Some("dev1"));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(matches!(
            SyncConfig::builder().batch_size(0).build(),
            Err(SyncError::Config(_))
        ));
        assert!(SyncConfig::builder().debounce_ms(0).build().is_err());
        assert!(SyncConfig::builder().server_url("ftp://x").build().is_err());
    }

    #[test]
    fn test_serde_round_trip_keeps_fields() {
        let config = SyncConfig::builder().debounce_ms(250).build().unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back: SyncConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
