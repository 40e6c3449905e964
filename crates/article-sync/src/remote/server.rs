//! 进程内权威存储
//!
//! 实现服务端一半的语义：乐观并发写入、按 client_id 幂等创建、元数据探测、
//! 文件夹最后写入者胜出。测试与需要本地后端的嵌入方都使用它。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use super::{ErrorCode, RemoteArticle, RemoteRequest, RemoteResponse, RemoteTransport};
use crate::error::{Result, SyncError};
use crate::hasher::ContentHasher;
use crate::sync::resolution::Resolution;
use crate::utils::Clock;

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFolder {
    pub id: i64,
    pub client_id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub version: i64,
    pub updated_at: i64,
}

#[derive(Debug, Default)]
struct ServerState {
    next_id: i64,
    articles: HashMap<i64, RemoteArticle>,
    by_client_id: HashMap<String, i64>,
    /// 最近一次 create 写入的版本；之后有其他写入则不再允许 create 覆盖
    created_version: HashMap<i64, i64>,
    folders: HashMap<i64, RemoteFolder>,
    folders_by_client_id: HashMap<String, i64>,
    resolutions: Vec<(i64, Resolution, i64)>,
}

impl ServerState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug)]
pub struct ArticleServer {
    state: Mutex<ServerState>,
    clock: Arc<dyn Clock>,
}

impl ArticleServer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(ServerState::default()),
            clock,
        }
    }

    /// 处理一个请求；永远返回响应，错误以 `RemoteResponse::Error` 表达
    pub fn handle(&self, request: RemoteRequest) -> RemoteResponse {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        match request {
            RemoteRequest::Create {
                client_id,
                local_version,
                article,
            } => {
                let hash = article.computed_hash().into_string();
                if hash != article.content_hash {
                    return integrity_error(&article.content_hash, &hash);
                }
                if let Some(&id) = state.by_client_id.get(&client_id) {
                    let stored_version = state.articles.get(&id).map(|a| a.version).unwrap_or_default();
                    let created = state.created_version.get(&id).copied().unwrap_or_default();
                    if stored_version != created {
                        return RemoteResponse::CreateAck {
                            id,
                            conflict: true,
                            server_version: stored_version,
                            content_hash: String::new(),
                        };
                    }
                    // 重发的 create：覆盖
                    let version = stored_version.max(local_version);
                    if let Some(stored) = state.articles.get_mut(&id) {
                        stored.title = article.title;
                        stored.content = article.content;
                        stored.summary = article.summary;
                        stored.folder_id = article.folder_id;
                        stored.version = version;
                        stored.content_hash = hash.clone();
                        stored.updated_at = now;
                        stored.last_modified_by = article.last_modified_by;
                    }
                    state.created_version.insert(id, version);
                    return RemoteResponse::CreateAck {
                        id,
                        conflict: false,
                        server_version: version,
                        content_hash: hash,
                    };
                }

                let id = state.allocate_id();
                state.articles.insert(
                    id,
                    RemoteArticle {
                        id,
                        client_id: client_id.clone(),
                        title: article.title,
                        content: article.content,
                        summary: article.summary,
                        folder_id: article.folder_id,
                        version: local_version,
                        content_hash: hash.clone(),
                        updated_at: now,
                        last_modified_by: article.last_modified_by,
                    },
                );
                state.by_client_id.insert(client_id, id);
                state.created_version.insert(id, local_version);
                RemoteResponse::CreateAck {
                    id,
                    conflict: false,
                    server_version: local_version,
                    content_hash: hash,
                }
            }

            RemoteRequest::Update {
                article_id,
                local_version,
                article,
            } => {
                let hash = article.computed_hash().into_string();
                if hash != article.content_hash {
                    return integrity_error(&article.content_hash, &hash);
                }
                let Some(stored) = state.articles.get_mut(&article_id) else {
                    return not_found(article_id);
                };
                stored.version = (stored.version + 1).max(local_version);
                stored.title = article.title;
                stored.content = article.content;
                stored.summary = article.summary;
                stored.folder_id = article.folder_id;
                stored.content_hash = hash.clone();
                stored.updated_at = now;
                stored.last_modified_by = article.last_modified_by;
                RemoteResponse::UpdateAck {
                    id: article_id,
                    server_version: stored.version,
                    content_hash: hash,
                }
            }

            RemoteRequest::SyncUpdate {
                article_id,
                base_version,
                local_version,
                article,
            } => {
                let hash = article.computed_hash().into_string();
                if hash != article.content_hash {
                    return integrity_error(&article.content_hash, &hash);
                }
                let Some(stored) = state.articles.get_mut(&article_id) else {
                    return not_found(article_id);
                };
                if stored.version == base_version {
                    stored.version = (stored.version + 1).max(local_version);
                    stored.title = article.title;
                    stored.content = article.content;
                    stored.summary = article.summary;
                    stored.folder_id = article.folder_id;
                    stored.content_hash = hash.clone();
                    stored.updated_at = now;
                    stored.last_modified_by = article.last_modified_by;
                    RemoteResponse::SyncAck {
                        conflict: false,
                        server_version: stored.version,
                        content_hash: Some(hash),
                    }
                } else if stored.version == local_version && stored.content_hash == hash {
                    // 回执丢失后的重发
                    RemoteResponse::SyncAck {
                        conflict: false,
                        server_version: stored.version,
                        content_hash: Some(hash),
                    }
                } else {
                    RemoteResponse::SyncAck {
                        conflict: true,
                        server_version: stored.version,
                        content_hash: None,
                    }
                }
            }

            RemoteRequest::CheckConflict {
                article_id,
                base_version,
                ..
            } => match state.articles.get(&article_id) {
                Some(stored) => RemoteResponse::ConflictCheck {
                    has_conflict: stored.version != base_version,
                    server_version: stored.version,
                    remote_updated_at: stored.updated_at,
                    remote_content_hash: stored.content_hash.clone(),
                },
                None => not_found(article_id),
            },

            RemoteRequest::ResolveConflict {
                article_id,
                resolution,
                version,
            } => {
                let Some(server_version) = state.articles.get(&article_id).map(|a| a.version) else {
                    return not_found(article_id);
                };
                state.resolutions.push((article_id, resolution, version));
                RemoteResponse::Resolved { server_version }
            }

            RemoteRequest::Fetch { article_id } => match state.articles.get(&article_id) {
                Some(stored) => RemoteResponse::Article {
                    article: stored.clone(),
                },
                None => not_found(article_id),
            },

            RemoteRequest::Delete { article_id } => {
                let removed = state.articles.remove(&article_id);
                if let Some(article) = &removed {
                    state.by_client_id.remove(&article.client_id);
                    state.created_version.remove(&article_id);
                }
                RemoteResponse::Deleted {
                    existed: removed.is_some(),
                }
            }

            RemoteRequest::UpsertFolder {
                client_id,
                folder_id,
                name,
                parent_id,
                ..
            } => {
                let existing = folder_id
                    .filter(|id| state.folders.contains_key(id))
                    .or_else(|| state.folders_by_client_id.get(&client_id).copied());
                let id = match existing {
                    Some(id) => id,
                    None => {
                        let id = state.allocate_id();
                        state.folders_by_client_id.insert(client_id.clone(), id);
                        id
                    }
                };
                let folder = state.folders.entry(id).or_insert_with(|| RemoteFolder {
                    id,
                    client_id,
                    name: String::new(),
                    parent_id: None,
                    version: 0,
                    updated_at: now,
                });
                folder.name = name;
                folder.parent_id = parent_id;
                folder.version += 1;
                folder.updated_at = now;
                RemoteResponse::FolderAck {
                    id,
                    server_version: folder.version,
                }
            }

            RemoteRequest::DeleteFolder { folder_id } => {
                let removed = state.folders.remove(&folder_id);
                if let Some(folder) = &removed {
                    state.folders_by_client_id.remove(&folder.client_id);
                }
                RemoteResponse::Deleted {
                    existed: removed.is_some(),
                }
            }
        }
    }

    // ========== 其他设备 / 检查用 ==========

    /// 模拟另一台设备的编辑，返回新版本
    pub fn remote_edit(&self, article_id: i64, content: &str, editor: &str) -> Option<i64> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        let stored = state.articles.get_mut(&article_id)?;
        stored.content = content.to_string();
        stored.version += 1;
        stored.content_hash = ContentHasher::hash_article(&stored.title, &stored.content, &stored.summary).into_string();
        stored.updated_at = now;
        stored.last_modified_by = editor.to_string();
        Some(stored.version)
    }

    /// 模拟另一台设备删除文章
    pub fn remote_delete(&self, article_id: i64) -> bool {
        let mut state = self.state.lock();
        match state.articles.remove(&article_id) {
            Some(article) => {
                state.by_client_id.remove(&article.client_id);
                state.created_version.remove(&article_id);
                true
            }
            None => false,
        }
    }

    pub fn article(&self, article_id: i64) -> Option<RemoteArticle> {
        self.state.lock().articles.get(&article_id).cloned()
    }

    pub fn article_by_client_id(&self, client_id: &str) -> Option<RemoteArticle> {
        let state = self.state.lock();
        let id = state.by_client_id.get(client_id)?;
        state.articles.get(id).cloned()
    }

    pub fn article_count(&self) -> usize {
        self.state.lock().articles.len()
    }

    pub fn folder_by_client_id(&self, client_id: &str) -> Option<RemoteFolder> {
        let state = self.state.lock();
        let id = state.folders_by_client_id.get(client_id)?;
        state.folders.get(id).cloned()
    }

    /// (article_id, resolution, version)
    pub fn resolutions(&self) -> Vec<(i64, Resolution, i64)> {
        self.state.lock().resolutions.clone()
    }
}

fn not_found(article_id: i64) -> RemoteResponse {
    RemoteResponse::error(ErrorCode::NotFound, format!("article {} not found", article_id))
}

fn integrity_error(declared: &str, computed: &str) -> RemoteResponse {
    RemoteResponse::error(
        ErrorCode::Integrity,
        format!("declared hash {} but content hashes to {}", declared, computed),
    )
}

// ========== 传输包装 ==========

/// 在 `call` 入口挂起某次调用，用于构造"飞行中"的时序
#[derive(Debug, Default)]
pub struct CallGate {
    entered: Notify,
    release: Notify,
}

impl CallGate {
    /// 等待被挂起的调用到达
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// 把 `ArticleServer` 包装成 `RemoteTransport`：JSON 往返、离线开关、调用计数、故障注入
#[derive(Debug)]
pub struct ServerTransport {
    server: Arc<ArticleServer>,
    offline: AtomicBool,
    calls: Mutex<HashMap<&'static str, usize>>,
    failures: Mutex<VecDeque<String>>,
    corrupt_echo: AtomicBool,
    gates: Mutex<HashMap<&'static str, Arc<CallGate>>>,
}

impl ServerTransport {
    pub fn new(server: Arc<ArticleServer>) -> Self {
        Self {
            server,
            offline: AtomicBool::new(false),
            calls: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            corrupt_echo: AtomicBool::new(false),
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn server(&self) -> &Arc<ArticleServer> {
        &self.server
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// 接下来 `count` 次调用返回传输错误
    pub fn fail_next(&self, count: usize, message: &str) {
        let mut failures = self.failures.lock();
        for _ in 0..count {
            failures.push_back(message.to_string());
        }
    }

    /// 下一次写入回执的哈希被篡改
    pub fn corrupt_next_echo(&self) {
        self.corrupt_echo.store(true, Ordering::SeqCst);
    }

    /// 挂起下一次 `action` 调用，直到 `CallGate::release`
    pub fn gate_next(&self, action: &'static str) -> Arc<CallGate> {
        let gate = Arc::new(CallGate::default());
        self.gates.lock().insert(action, gate.clone());
        gate
    }

    pub fn call_count(&self, action: &str) -> usize {
        self.calls.lock().get(action).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

#[async_trait]
impl RemoteTransport for ServerTransport {
    async fn call(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        let action = request.action();
        *self.calls.lock().entry(action).or_insert(0) += 1;

        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::Offline);
        }
        if let Some(message) = self.failures.lock().pop_front() {
            return Err(SyncError::Transport(message));
        }

        let gate = self.gates.lock().remove(action);
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        // 走一遍线上格式
        let wire = serde_json::to_vec(&request)?;
        let decoded: RemoteRequest = serde_json::from_slice(&wire)?;
        let mut response = self.server.handle(decoded);

        if self.corrupt_echo.swap(false, Ordering::SeqCst) {
            match &mut response {
                RemoteResponse::CreateAck { content_hash, .. } | RemoteResponse::UpdateAck { content_hash, .. } => {
                    *content_hash = "deadbeef".to_string();
                }
                RemoteResponse::SyncAck { content_hash, .. } => {
                    *content_hash = Some("deadbeef".to_string());
                }
                _ => {}
            }
        }

        let wire = serde_json::to_vec(&response)?;
        Ok(serde_json::from_slice(&wire)?)
    }
}
