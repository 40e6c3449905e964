//! 远端契约
//!
//! - `RemoteRequest` / `RemoteResponse`：按 `action` / `result` 标签区分的 JSON 消息
//! - `RemoteTransport`：可替换的传输层（HTTP、进程内服务端）
//! - `RemoteClient`：发送前校验、响应映射到 `SyncError`、完整性回显校验

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::hasher::{ContentHash, ContentHasher};
use crate::sync::resolution::Resolution;

pub mod http;
pub mod server;

pub use http::HttpTransport;
pub use server::{ArticleServer, ServerTransport};

// ========== 消息体 ==========

/// 文章内容载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticlePayload {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub folder_id: Option<String>,
    pub content_hash: String,
    pub last_modified_by: String,
}

impl ArticlePayload {
    /// 按载荷内容重新计算指纹
    pub fn computed_hash(&self) -> ContentHash {
        ContentHasher::hash_article(&self.title, &self.content, &self.summary)
    }
}

/// 服务端保存的文章
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteArticle {
    pub id: i64,
    pub client_id: String,
    pub title: String,
    pub content: String,
    pub summary: String,
    pub folder_id: Option<String>,
    pub version: i64,
    pub content_hash: String,
    pub updated_at: i64,
    pub last_modified_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RemoteRequest {
    /// 首次上传，按 client_id 幂等
    Create {
        client_id: String,
        local_version: i64,
        article: ArticlePayload,
    },
    /// 无条件覆盖（跳过冲突检测）
    Update {
        article_id: i64,
        local_version: i64,
        article: ArticlePayload,
    },
    /// 乐观并发写入：base_version 必须等于服务端当前版本
    SyncUpdate {
        article_id: i64,
        base_version: i64,
        local_version: i64,
        article: ArticlePayload,
    },
    /// 只取元数据的冲突探测
    CheckConflict {
        article_id: i64,
        base_version: i64,
        content_hash: String,
    },
    ResolveConflict {
        article_id: i64,
        resolution: Resolution,
        version: i64,
    },
    Fetch {
        article_id: i64,
    },
    Delete {
        article_id: i64,
    },
    /// 文件夹最后写入者胜出
    UpsertFolder {
        client_id: String,
        folder_id: Option<i64>,
        name: String,
        parent_id: Option<String>,
        local_version: i64,
    },
    DeleteFolder {
        folder_id: i64,
    },
}

impl RemoteRequest {
    pub fn action(&self) -> &'static str {
        match self {
            RemoteRequest::Create { .. } => "create",
            RemoteRequest::Update { .. } => "update",
            RemoteRequest::SyncUpdate { .. } => "sync_update",
            RemoteRequest::CheckConflict { .. } => "check_conflict",
            RemoteRequest::ResolveConflict { .. } => "resolve_conflict",
            RemoteRequest::Fetch { .. } => "fetch",
            RemoteRequest::Delete { .. } => "delete",
            RemoteRequest::UpsertFolder { .. } => "upsert_folder",
            RemoteRequest::DeleteFolder { .. } => "delete_folder",
        }
    }

    /// 发送前校验，任何一项不通过都不会发出请求
    pub fn validate(&self, max_content_bytes: usize) -> Result<()> {
        match self {
            RemoteRequest::Create {
                client_id,
                local_version,
                article,
            } => {
                require_non_empty("client_id", client_id)?;
                require_positive("local_version", *local_version)?;
                validate_payload(article, max_content_bytes)
            }
            RemoteRequest::Update {
                article_id,
                local_version,
                article,
            } => {
                require_positive("article_id", *article_id)?;
                require_positive("local_version", *local_version)?;
                validate_payload(article, max_content_bytes)
            }
            RemoteRequest::SyncUpdate {
                article_id,
                base_version,
                local_version,
                article,
            } => {
                require_positive("article_id", *article_id)?;
                require_positive("base_version", *base_version)?;
                require_positive("local_version", *local_version)?;
                if local_version <= base_version {
                    return Err(SyncError::validation(
                        "local_version",
                        format!("local_version {} must exceed base_version {}", local_version, base_version),
                    ));
                }
                validate_payload(article, max_content_bytes)
            }
            RemoteRequest::CheckConflict {
                article_id,
                base_version,
                content_hash,
            } => {
                require_positive("article_id", *article_id)?;
                require_positive("base_version", *base_version)?;
                require_hash(content_hash)
            }
            RemoteRequest::ResolveConflict { article_id, version, .. } => {
                require_positive("article_id", *article_id)?;
                require_positive("version", *version)
            }
            RemoteRequest::Fetch { article_id } | RemoteRequest::Delete { article_id } => {
                require_positive("article_id", *article_id)
            }
            RemoteRequest::UpsertFolder {
                client_id,
                folder_id,
                name,
                local_version,
                ..
            } => {
                require_non_empty("client_id", client_id)?;
                require_non_empty("name", name)?;
                if let Some(id) = folder_id {
                    require_positive("folder_id", *id)?;
                }
                require_positive("local_version", *local_version)
            }
            RemoteRequest::DeleteFolder { folder_id } => require_positive("folder_id", *folder_id),
        }
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(SyncError::validation(field, "must not be empty"));
    }
    Ok(())
}

fn require_positive(field: &str, value: i64) -> Result<()> {
    if value <= 0 {
        return Err(SyncError::validation(field, format!("must be positive, got {}", value)));
    }
    Ok(())
}

fn require_hash(hash: &str) -> Result<()> {
    if !ContentHash::is_well_formed(hash) {
        return Err(SyncError::validation("content_hash", format!("malformed hash '{}'", hash)));
    }
    Ok(())
}

fn validate_payload(article: &ArticlePayload, max_content_bytes: usize) -> Result<()> {
    require_hash(&article.content_hash)?;
    let size = article.title.len() + article.content.len() + article.summary.len();
    if size > max_content_bytes {
        return Err(SyncError::validation(
            "content",
            format!("{} bytes exceeds limit of {}", size, max_content_bytes),
        ));
    }
    require_non_empty("last_modified_by", &article.last_modified_by)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Validation,
    /// 服务端收到的内容与声明的指纹不一致
    Integrity,
    Unavailable,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RemoteResponse {
    CreateAck {
        id: i64,
        conflict: bool,
        server_version: i64,
        content_hash: String,
    },
    UpdateAck {
        id: i64,
        server_version: i64,
        content_hash: String,
    },
    SyncAck {
        conflict: bool,
        server_version: i64,
        #[serde(default)]
        content_hash: Option<String>,
    },
    ConflictCheck {
        has_conflict: bool,
        server_version: i64,
        remote_updated_at: i64,
        remote_content_hash: String,
    },
    Resolved {
        server_version: i64,
    },
    Article {
        article: RemoteArticle,
    },
    Deleted {
        existed: bool,
    },
    FolderAck {
        id: i64,
        server_version: i64,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl RemoteResponse {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        RemoteResponse::Error {
            code,
            message: message.into(),
        }
    }
}

// ========== 传输层 ==========

#[async_trait]
pub trait RemoteTransport: Send + Sync + std::fmt::Debug {
    async fn call(&self, request: RemoteRequest) -> Result<RemoteResponse>;
}

// ========== 类型化客户端 ==========

/// create / sync_update 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Accepted { server_id: i64, server_version: i64 },
    Conflict { server_id: i64, server_version: i64 },
}

/// 冲突探测结果（服务端元数据）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVersionCheck {
    pub has_conflict: bool,
    pub server_version: i64,
    pub remote_updated_at: i64,
    pub remote_content_hash: String,
}

#[derive(Debug, Clone)]
pub struct RemoteClient {
    transport: Arc<dyn RemoteTransport>,
    max_content_bytes: usize,
}

impl RemoteClient {
    pub fn new(transport: Arc<dyn RemoteTransport>, max_content_bytes: usize) -> Self {
        Self {
            transport,
            max_content_bytes,
        }
    }

    async fn send(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        request.validate(self.max_content_bytes)?;
        let action = request.action();
        tracing::trace!("→ {}", action);
        match self.transport.call(request).await? {
            RemoteResponse::Error { code, message } => Err(map_error(code, message)),
            response => Ok(response),
        }
    }

    pub async fn create(&self, client_id: &str, local_version: i64, article: ArticlePayload) -> Result<WriteOutcome> {
        let sent_hash = article.content_hash.clone();
        let request = RemoteRequest::Create {
            client_id: client_id.to_string(),
            local_version,
            article,
        };
        match self.send(request).await? {
            RemoteResponse::CreateAck {
                id,
                conflict: false,
                server_version,
                content_hash,
            } => {
                verify_echo(&sent_hash, &content_hash)?;
                Ok(WriteOutcome::Accepted {
                    server_id: id,
                    server_version,
                })
            }
            RemoteResponse::CreateAck {
                id,
                conflict: true,
                server_version,
                ..
            } => Ok(WriteOutcome::Conflict {
                server_id: id,
                server_version,
            }),
            other => Err(unexpected("create", &other)),
        }
    }

    pub async fn sync_update(
        &self,
        article_id: i64,
        base_version: i64,
        local_version: i64,
        article: ArticlePayload,
    ) -> Result<WriteOutcome> {
        let sent_hash = article.content_hash.clone();
        let request = RemoteRequest::SyncUpdate {
            article_id,
            base_version,
            local_version,
            article,
        };
        match self.send(request).await? {
            RemoteResponse::SyncAck {
                conflict: false,
                server_version,
                content_hash,
            } => {
                verify_echo(&sent_hash, content_hash.as_deref().unwrap_or_default())?;
                Ok(WriteOutcome::Accepted {
                    server_id: article_id,
                    server_version,
                })
            }
            RemoteResponse::SyncAck {
                conflict: true,
                server_version,
                ..
            } => Ok(WriteOutcome::Conflict {
                server_id: article_id,
                server_version,
            }),
            other => Err(unexpected("sync_update", &other)),
        }
    }

    /// 强制覆盖，返回 (server_id, server_version)
    pub async fn update(&self, article_id: i64, local_version: i64, article: ArticlePayload) -> Result<(i64, i64)> {
        let sent_hash = article.content_hash.clone();
        let request = RemoteRequest::Update {
            article_id,
            local_version,
            article,
        };
        match self.send(request).await? {
            RemoteResponse::UpdateAck {
                id,
                server_version,
                content_hash,
            } => {
                verify_echo(&sent_hash, &content_hash)?;
                Ok((id, server_version))
            }
            other => Err(unexpected("update", &other)),
        }
    }

    pub async fn check_conflict(&self, article_id: i64, base_version: i64, content_hash: &str) -> Result<RemoteVersionCheck> {
        let request = RemoteRequest::CheckConflict {
            article_id,
            base_version,
            content_hash: content_hash.to_string(),
        };
        match self.send(request).await? {
            RemoteResponse::ConflictCheck {
                has_conflict,
                server_version,
                remote_updated_at,
                remote_content_hash,
            } => Ok(RemoteVersionCheck {
                has_conflict,
                server_version,
                remote_updated_at,
                remote_content_hash,
            }),
            other => Err(unexpected("check_conflict", &other)),
        }
    }

    pub async fn resolve_conflict(&self, article_id: i64, resolution: Resolution, version: i64) -> Result<i64> {
        let request = RemoteRequest::ResolveConflict {
            article_id,
            resolution,
            version,
        };
        match self.send(request).await? {
            RemoteResponse::Resolved { server_version } => Ok(server_version),
            other => Err(unexpected("resolve_conflict", &other)),
        }
    }

    pub async fn fetch(&self, article_id: i64) -> Result<RemoteArticle> {
        match self.send(RemoteRequest::Fetch { article_id }).await? {
            RemoteResponse::Article { article } => Ok(article),
            other => Err(unexpected("fetch", &other)),
        }
    }

    /// 返回服务端是否存在该文章
    pub async fn delete(&self, article_id: i64) -> Result<bool> {
        match self.send(RemoteRequest::Delete { article_id }).await? {
            RemoteResponse::Deleted { existed } => Ok(existed),
            other => Err(unexpected("delete", &other)),
        }
    }

    pub async fn upsert_folder(
        &self,
        client_id: &str,
        folder_id: Option<i64>,
        name: &str,
        parent_id: Option<String>,
        local_version: i64,
    ) -> Result<(i64, i64)> {
        let request = RemoteRequest::UpsertFolder {
            client_id: client_id.to_string(),
            folder_id,
            name: name.to_string(),
            parent_id,
            local_version,
        };
        match self.send(request).await? {
            RemoteResponse::FolderAck { id, server_version } => Ok((id, server_version)),
            other => Err(unexpected("upsert_folder", &other)),
        }
    }

    pub async fn delete_folder(&self, folder_id: i64) -> Result<bool> {
        match self.send(RemoteRequest::DeleteFolder { folder_id }).await? {
            RemoteResponse::Deleted { existed } => Ok(existed),
            other => Err(unexpected("delete_folder", &other)),
        }
    }
}

fn verify_echo(sent: &str, echoed: &str) -> Result<()> {
    if sent != echoed {
        return Err(SyncError::IntegrityMismatch {
            expected: sent.to_string(),
            actual: echoed.to_string(),
        });
    }
    Ok(())
}

fn map_error(code: ErrorCode, message: String) -> SyncError {
    match code {
        ErrorCode::NotFound => SyncError::NotFound(message),
        ErrorCode::Validation => SyncError::validation("remote", message),
        ErrorCode::Integrity => SyncError::IntegrityMismatch {
            expected: "client hash".to_string(),
            actual: message,
        },
        ErrorCode::Unavailable | ErrorCode::Internal => SyncError::Transport(message),
    }
}

fn unexpected(action: &str, response: &RemoteResponse) -> SyncError {
    SyncError::validation("response", format!("unexpected response to {}: {:?}", action, response))
}
