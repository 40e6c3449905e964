//! 错误类型
//!
//! 所有错误都挂在具体实体上（`sync_error` / 队列 `last_error`），不会阻塞其他实体的同步。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::entities::SyncStatus;

#[derive(Error, Debug)]
pub enum SyncError {
    /// 网络层错误（离线、5xx、超时），自动重试
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Offline")]
    Offline,

    /// 实体处于冲突中，需先通过 `ConflictResolver` 显式解决
    #[error("Version conflict: server is at version {server_version}")]
    VersionConflict { server_version: i64 },

    /// 载荷校验失败，有上限地重试
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// 传输后哈希回显不一致，按传输错误处理，整体重发
    #[error("Integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("Illegal sync status transition: {from} -> {to}")]
    IllegalTransition { from: SyncStatus, to: SyncStatus },

    #[error("Conflict resolution already in progress for {0}")]
    ResolutionInProgress(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("KV store error: {0}")]
    Kv(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// 归类为队列可持久化的失败原因
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SyncError::Transport(_) | SyncError::Offline | SyncError::IntegrityMismatch { .. } => {
                FailureKind::Transport
            }
            SyncError::Validation { .. } => FailureKind::Validation,
            SyncError::VersionConflict { .. } => FailureKind::Conflict,
            SyncError::Database(_) | SyncError::Kv(_) | SyncError::Json(_) | SyncError::Io(_) => {
                FailureKind::Storage
            }
            SyncError::NotFound(_)
            | SyncError::IllegalTransition { .. }
            | SyncError::ResolutionInProgress(_)
            | SyncError::Migration(_)
            | SyncError::Config(_) => FailureKind::Permanent,
        }
    }

    /// 网络类失败（含完整性回显不一致），重发即可能成功
    pub fn is_transport(&self) -> bool {
        self.failure_kind() == FailureKind::Transport
    }

    /// 请求没有到达服务端或没有拿到回执
    pub fn is_unreachable(&self) -> bool {
        matches!(self, SyncError::Offline | SyncError::Transport(_))
    }
}

impl From<sled::Error> for SyncError {
    fn from(error: sled::Error) -> Self {
        SyncError::Kv(error.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            SyncError::validation("response", error.to_string())
        } else {
            SyncError::Transport(error.to_string())
        }
    }
}

/// 失败分类，写入 `sync_queue.failure_kind`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transport,
    Validation,
    Conflict,
    /// 本地 SQLite / KV / IO 失败
    Storage,
    /// 重试不会改变结果（远端已删除、非法状态等），立即停放
    Permanent,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Transport => "transport",
            FailureKind::Validation => "validation",
            FailureKind::Conflict => "conflict",
            FailureKind::Storage => "storage",
            FailureKind::Permanent => "permanent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transport" => Some(FailureKind::Transport),
            "validation" => Some(FailureKind::Validation),
            "conflict" => Some(FailureKind::Conflict),
            "storage" => Some(FailureKind::Storage),
            "permanent" => Some(FailureKind::Permanent),
            _ => None,
        }
    }

    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureKind::Conflict | FailureKind::Permanent)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_classification() {
        assert_eq!(SyncError::Transport("timeout".into()).failure_kind(), FailureKind::Transport);
        assert_eq!(SyncError::Offline.failure_kind(), FailureKind::Transport);
        assert_eq!(
            SyncError::IntegrityMismatch { expected: "a".into(), actual: "b".into() }.failure_kind(),
            FailureKind::Transport
        );
        assert_eq!(SyncError::VersionConflict { server_version: 3 }.failure_kind(), FailureKind::Conflict);
        assert_eq!(SyncError::validation("title", "empty").failure_kind(), FailureKind::Validation);

        assert!(FailureKind::Transport.is_retryable());
        assert!(FailureKind::Validation.is_retryable());
        assert!(!FailureKind::Conflict.is_retryable());
    }

    #[test]
    fn test_non_network_errors_are_not_transport() {
        let gone = SyncError::NotFound("article 1".into());
        assert_eq!(gone.failure_kind(), FailureKind::Permanent);
        assert!(!gone.is_transport());
        assert!(!gone.is_unreachable());
        assert!(!FailureKind::Permanent.is_retryable());

        let illegal = SyncError::IllegalTransition {
            from: SyncStatus::Conflict,
            to: SyncStatus::Syncing,
        };
        assert_eq!(illegal.failure_kind(), FailureKind::Permanent);
        assert_eq!(SyncError::Config("bad".into()).failure_kind(), FailureKind::Permanent);

        let db = SyncError::Database(rusqlite::Error::QueryReturnedNoRows);
        assert_eq!(db.failure_kind(), FailureKind::Storage);
        assert!(!db.is_transport());
        assert!(FailureKind::Storage.is_retryable());

        assert!(SyncError::Offline.is_unreachable());
        assert!(!SyncError::IntegrityMismatch { expected: "a".into(), actual: "b".into() }.is_unreachable());
    }

    #[test]
    fn test_failure_kind_roundtrip_str() {
        for kind in [
            FailureKind::Transport,
            FailureKind::Validation,
            FailureKind::Conflict,
            FailureKind::Storage,
            FailureKind::Permanent,
        ] {
            assert_eq!(FailureKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(FailureKind::parse("bogus"), None);
    }
}
