//! 数据实体 - 与 migrations 中的表一一对应

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SyncError};
use crate::hasher::ContentHasher;

// ========== 同步状态机 ==========

/// 实体同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// 与服务端一致
    Synced,
    /// 有本地修改待上传
    Pending,
    /// 网络写入进行中
    Syncing,
    /// 版本冲突，等待用户处理
    Conflict,
    /// 传输或校验失败
    Error,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Error => "error",
        }
    }

    /// 状态转换表。冲突只能经由解决动作离开（-> synced 或 -> pending），
    /// 不允许直接 conflict -> syncing。
    pub fn can_transition_to(self, target: SyncStatus) -> bool {
        use SyncStatus::*;
        matches!(
            (self, target),
            (Pending, Pending)
                | (Pending, Syncing)
                | (Pending, Conflict)
                | (Syncing, Synced)
                | (Syncing, Conflict)
                | (Syncing, Error)
                | (Syncing, Pending)
                | (Synced, Synced)
                | (Synced, Pending)
                | (Synced, Syncing)
                | (Synced, Conflict)
                | (Error, Pending)
                | (Error, Syncing)
                | (Error, Conflict)
                | (Error, Error)
                | (Conflict, Conflict)
                | (Conflict, Synced)
                | (Conflict, Pending)
        )
    }

    /// 校验转换，非法时返回 `IllegalTransition`
    pub fn transition(self, target: SyncStatus) -> Result<SyncStatus> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(SyncError::IllegalTransition { from: self, to: target })
        }
    }

    /// 本地编辑后应进入的状态（冲突保持冲突）
    pub fn after_local_edit(self) -> SyncStatus {
        match self {
            SyncStatus::Conflict => SyncStatus::Conflict,
            _ => SyncStatus::Pending,
        }
    }

    /// 是否还有本地修改未被服务端确认
    pub fn is_dirty(self) -> bool {
        !matches!(self, SyncStatus::Synced)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "synced" => Ok(SyncStatus::Synced),
            "pending" => Ok(SyncStatus::Pending),
            "syncing" => Ok(SyncStatus::Syncing),
            "conflict" => Ok(SyncStatus::Conflict),
            "error" => Ok(SyncStatus::Error),
            other => Err(SyncError::validation("sync_status", format!("unknown status '{}'", other))),
        }
    }
}

// ========== 文章 ==========

/// 本地镜像中的文章
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalArticle {
    pub client_id: String,
    pub server_id: Option<i64>,
    pub title: String,
    pub content: String,
    pub summary: String,
    pub folder_id: Option<String>,
    /// 每次本地修改 +1
    pub local_version: i64,
    /// 服务端最后确认的版本，0 表示从未被接受
    pub remote_version: i64,
    pub content_hash: String,
    pub local_updated_at: i64,
    pub server_updated_at: Option<i64>,
    pub sync_status: SyncStatus,
    /// 仅在 `sync_status == Error` 时存在
    pub sync_error: Option<String>,
    pub has_conflict: bool,
    pub conflict_remote_content: Option<String>,
    pub conflict_detected_at: Option<i64>,
}

impl LocalArticle {
    /// 当前内容重新计算的指纹
    pub fn compute_hash(&self) -> String {
        ContentHasher::hash_article(&self.title, &self.content, &self.summary).into_string()
    }

    /// 已同步且没有未确认的本地版本
    pub fn is_clean(&self) -> bool {
        self.sync_status == SyncStatus::Synced && self.local_version == self.remote_version
    }

    /// 快照（写入队列 payload，仅作记录）
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "title": self.title,
            "summary": self.summary,
            "content_hash": self.content_hash,
            "local_version": self.local_version,
            "remote_version": self.remote_version,
        })
    }
}

/// 新建文章
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArticleDraft {
    pub title: String,
    pub content: String,
    pub summary: String,
    pub folder_id: Option<String>,
}

impl ArticleDraft {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_folder(mut self, folder_id: impl Into<String>) -> Self {
        self.folder_id = Some(folder_id.into());
        self
    }
}

/// 增量修改，`None` 字段保持不变
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArticlePatch {
    pub title: Option<String>,
    pub content: Option<String>,
    pub summary: Option<String>,
    /// `Some(None)` 表示移出文件夹
    pub folder_id: Option<Option<String>>,
}

impl ArticlePatch {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_folder(mut self, folder_id: Option<String>) -> Self {
        self.folder_id = Some(folder_id);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.content.is_none() && self.summary.is_none() && self.folder_id.is_none()
    }

    /// 合并到已有文章（不处理版本与状态）
    pub fn apply_to(&self, article: &mut LocalArticle) {
        if let Some(title) = &self.title {
            article.title = title.clone();
        }
        if let Some(content) = &self.content {
            article.content = content.clone();
        }
        if let Some(summary) = &self.summary {
            article.summary = summary.clone();
        }
        if let Some(folder_id) = &self.folder_id {
            article.folder_id = folder_id.clone();
        }
    }
}

// ========== 文件夹 ==========

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalFolder {
    pub client_id: String,
    pub server_id: Option<i64>,
    pub name: String,
    pub parent_id: Option<String>,
    pub local_version: i64,
    pub local_updated_at: i64,
    pub sync_status: SyncStatus,
    pub sync_error: Option<String>,
}

// ========== 同步队列 ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Article,
    Folder,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Article => "article",
            EntityKind::Folder => "folder",
        }
    }
}

impl FromStr for EntityKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "article" => Ok(EntityKind::Article),
            "folder" => Ok(EntityKind::Folder),
            other => Err(SyncError::validation("entity_type", format!("unknown entity type '{}'", other))),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl SyncAction {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncAction::Create => "create",
            SyncAction::Update => "update",
            SyncAction::Delete => "delete",
        }
    }
}

impl FromStr for SyncAction {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(SyncAction::Create),
            "update" => Ok(SyncAction::Update),
            "delete" => Ok(SyncAction::Delete),
            other => Err(SyncError::validation("action", format!("unknown action '{}'", other))),
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 队列项只表示"这个实体需要重新同步"，真正发送的内容总是在 flush 时从镜像重读
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: i64,
    pub entity_type: EntityKind,
    pub entity_client_id: String,
    pub entity_id: Option<i64>,
    pub action: SyncAction,
    pub payload: serde_json::Value,
    pub created_at: i64,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: i64,
    pub failure_kind: Option<crate::error::FailureKind>,
}
