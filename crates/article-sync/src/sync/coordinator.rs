//! 同步协调器
//!
//! 负责：
//! - 编辑后防抖推送（在线直接发送，离线入队）
//! - 队列 drain（同一时间只有一个）、失败退避、恢复联网后立即重放
//! - 冲突进入、远端删除、强制覆盖
//! - 启动恢复：残留的 syncing 拉回 pending，遗漏的脏实体补入队列
//!
//! 同一实体的网络写入由实体锁串行化；本地编辑不拿实体锁，只写镜像。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{EventManager, SyncEvent};
use crate::network::{NetworkMonitor, NetworkStatusEvent};
use crate::remote::{ArticlePayload, HttpTransport, RemoteClient, RemoteTransport, WriteOutcome};
use crate::storage::{
    AcceptOutcome, ArticleDraft, ArticlePatch, EntityKind, LocalArticle, LocalFolder, LocalMirrorStore,
    StorageManager, SyncAction, SyncQueue, SyncQueueItem, SyncStatus,
};
use crate::sync::conflict::ConflictDetector;
use crate::sync::debounce::{DebouncedEntity, Debouncer};
use crate::sync::resolution::ConflictResolver;
use crate::utils::{generate_device_id, ClientIdGenerator, Clock, IdGenerator, IdWatermark, SystemClock};

// ========== 依赖注入 ==========

/// 协调器的全部依赖，显式传入，没有全局状态
#[derive(Debug, Clone)]
pub struct SyncDeps {
    pub config: SyncConfig,
    pub storage: StorageManager,
    pub transport: Arc<dyn RemoteTransport>,
    pub network: NetworkMonitor,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub events: Arc<EventManager>,
}

impl SyncDeps {
    /// 按配置打开磁盘存储并创建 HTTP 传输
    pub async fn open(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let server_url = config
            .server_url
            .clone()
            .ok_or_else(|| SyncError::Config("server_url is required".to_string()))?;
        let storage = StorageManager::open(&config).await?;
        let transport: Arc<dyn RemoteTransport> = Arc::new(HttpTransport::new(&config.http, &server_url)?);
        Self::new(config, storage, transport, Arc::new(SystemClock))
    }

    /// 使用给定存储与传输组装；设备 ID 优先取配置，否则读取或生成并持久化。
    /// client_id 的高水位记在同一个 KV 里
    pub fn new(
        config: SyncConfig,
        storage: StorageManager,
        transport: Arc<dyn RemoteTransport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let device_id = match &config.device_id {
            Some(id) => id.clone(),
            None => storage.kv().device_id_or_init(generate_device_id)?,
        };
        let watermark: Arc<dyn IdWatermark> = Arc::new(storage.kv().clone());
        let ids: Arc<dyn IdGenerator> =
            Arc::new(ClientIdGenerator::with_watermark(device_id, clock.clone(), watermark)?);
        let events = Arc::new(EventManager::new(config.event_capacity));
        Ok(Self {
            config,
            storage,
            transport,
            network: NetworkMonitor::default(),
            clock,
            ids,
            events,
        })
    }

    pub fn with_network(mut self, network: NetworkMonitor) -> Self {
        self.network = network;
        self
    }
}

// ========== 报告 ==========

/// 一次 drain 的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub processed: usize,
    pub failed: usize,
    pub remaining: u64,
    /// 已有 drain 在运行，本次未执行
    pub skipped: bool,
}

/// 启动恢复的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub reset_syncing: usize,
    pub requeued: usize,
}

/// 状态概览
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub synced: u32,
    pub pending: u32,
    pub syncing: u32,
    pub conflict: u32,
    pub error: u32,
    pub queued: u64,
    pub exhausted: usize,
    pub last_successful_sync_at: Option<i64>,
}

#[derive(Debug)]
enum DebounceCommand {
    Schedule(EntityKind, String),
    Cancel(String),
}

#[derive(Debug, Default)]
struct RuntimeState {
    commands: Option<mpsc::UnboundedReceiver<DebounceCommand>>,
    handle: Option<JoinHandle<mpsc::UnboundedReceiver<DebounceCommand>>>,
}

struct Inner {
    config: SyncConfig,
    storage: StorageManager,
    mirror: LocalMirrorStore,
    queue: SyncQueue,
    remote: RemoteClient,
    network: NetworkMonitor,
    clock: Arc<dyn Clock>,
    events: Arc<EventManager>,
    /// 实体级锁：同一实体同时最多一个网络写入
    entity_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    drain_lock: Mutex<()>,
    /// 正在解决冲突的实体
    resolving: SyncMutex<HashSet<String>>,
    debounce_tx: mpsc::UnboundedSender<DebounceCommand>,
    runtime: SyncMutex<RuntimeState>,
    shutdown: Notify,
}

/// 同步协调器（可廉价克隆，克隆共享同一状态）
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("network", &self.inner.network.status())
            .field("data_dir", &self.inner.storage.data_dir())
            .finish()
    }
}

impl SyncCoordinator {
    pub fn new(deps: SyncDeps) -> Self {
        let SyncDeps {
            config,
            storage,
            transport,
            network,
            clock,
            ids,
            events,
        } = deps;

        let conn = storage.connection();
        let mirror = LocalMirrorStore::new(conn.clone(), clock.clone(), ids);
        let queue = SyncQueue::new(conn, clock.clone(), config.retry.max_retries);
        let remote = RemoteClient::new(transport, config.max_content_bytes);
        let (debounce_tx, debounce_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(Inner {
                config,
                storage,
                mirror,
                queue,
                remote,
                network,
                clock,
                events,
                entity_locks: RwLock::new(HashMap::new()),
                drain_lock: Mutex::new(()),
                resolving: SyncMutex::new(HashSet::new()),
                debounce_tx,
                runtime: SyncMutex::new(RuntimeState {
                    commands: Some(debounce_rx),
                    handle: None,
                }),
                shutdown: Notify::new(),
            }),
        }
    }

    // ========== 访问器 ==========

    pub fn mirror(&self) -> &LocalMirrorStore {
        &self.inner.mirror
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.inner.queue
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.inner.network
    }

    pub fn is_online(&self) -> bool {
        self.inner.network.is_online()
    }

    pub fn events(&self) -> Arc<EventManager> {
        self.inner.events.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// 网络状态变化（只广播真实变化）
    pub fn subscribe_connectivity(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.inner.network.subscribe()
    }

    pub fn conflict_detector(&self) -> ConflictDetector {
        ConflictDetector::new(self.clone())
    }

    pub fn resolver(&self) -> ConflictResolver {
        ConflictResolver::new(self.clone())
    }

    pub(crate) fn remote(&self) -> &RemoteClient {
        &self.inner.remote
    }

    pub(crate) fn resolving(&self) -> &SyncMutex<HashSet<String>> {
        &self.inner.resolving
    }

    pub(crate) fn now(&self) -> i64 {
        self.inner.clock.now_millis()
    }

    /// 获取实体锁（不存在则创建）
    pub(crate) async fn entity_lock(&self, client_id: &str) -> Arc<Mutex<()>> {
        {
            let locks = self.inner.entity_locks.read().await;
            if let Some(lock) = locks.get(client_id) {
                return lock.clone();
            }
        }
        let mut locks = self.inner.entity_locks.write().await;
        locks
            .entry(client_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ========== 生命周期 ==========

    /// 执行启动恢复并启动后台循环（防抖、网络变化、定时重试）
    pub async fn start(&self) -> Result<RecoveryReport> {
        let report = self.recover().await?;

        let Some(commands) = self.inner.runtime.lock().commands.take() else {
            warn!("同步协调器已在运行");
            return Ok(report);
        };
        let connectivity = self.inner.network.subscribe();
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_loop(commands, connectivity).await });
        self.inner.runtime.lock().handle = Some(handle);

        if self.is_online() {
            self.spawn_drain();
        }
        info!(
            "🚀 同步协调器已启动 (恢复 {} 个 syncing，补入队 {} 个)",
            report.reset_syncing, report.requeued
        );
        Ok(report)
    }

    /// 停止后台循环并刷盘。进行中的网络调用不会被取消
    pub async fn shutdown(&self) -> Result<()> {
        let handle = self.inner.runtime.lock().handle.take();
        if let Some(handle) = handle {
            self.inner.shutdown.notify_one();
            match handle.await {
                Ok(commands) => self.inner.runtime.lock().commands = Some(commands),
                Err(e) => error!("后台循环异常退出: {}", e),
            }
        }
        self.inner.storage.flush().await?;
        info!("🛑 同步协调器已停止");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.runtime.lock().handle.is_some()
    }

    async fn run_loop(
        self,
        mut commands: mpsc::UnboundedReceiver<DebounceCommand>,
        mut connectivity: broadcast::Receiver<NetworkStatusEvent>,
    ) -> mpsc::UnboundedReceiver<DebounceCommand> {
        let mut debouncer = Debouncer::new();
        let delay = self.inner.config.debounce();
        let mut retry_tick = tokio::time::interval(self.retry_tick_period());
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        retry_tick.tick().await;
        let mut connectivity_open = true;

        loop {
            tokio::select! {
                _ = self.inner.shutdown.notified() => break,
                Some(command) = commands.recv() => match command {
                    DebounceCommand::Schedule(kind, client_id) => debouncer.schedule(kind, &client_id, delay),
                    DebounceCommand::Cancel(client_id) => {
                        debouncer.cancel(&client_id);
                    }
                },
                entity = debouncer.expired() => {
                    let this = self.clone();
                    tokio::spawn(async move { this.on_debounce_fired(entity).await });
                }
                event = connectivity.recv(), if connectivity_open => match event {
                    Ok(event) => self.on_connectivity_changed(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("网络事件积压，丢弃 {} 条", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => connectivity_open = false,
                },
                _ = retry_tick.tick() => {
                    if self.is_online() {
                        self.spawn_drain();
                    }
                }
            }
        }

        if !debouncer.is_empty() {
            debug!("退出时丢弃 {} 个防抖计时，下次启动由恢复流程补入队列", debouncer.len());
        }
        commands
    }

    fn retry_tick_period(&self) -> Duration {
        Duration::from_millis(self.inner.config.retry.base_delay_ms.max(500))
    }

    async fn on_debounce_fired(&self, entity: DebouncedEntity) {
        let result = match entity.kind {
            EntityKind::Article => self.sync_to_server(&entity.client_id).await.map(|_| ()),
            EntityKind::Folder => self.sync_folder(&entity.client_id).await,
        };
        if let Err(e) = result {
            debug!("防抖同步 {} 未完成: {}", entity.client_id, e);
        }
    }

    async fn on_connectivity_changed(&self, event: NetworkStatusEvent) {
        self.inner
            .events
            .emit(SyncEvent::ConnectivityChanged {
                status: event.new_status,
                timestamp: event.timestamp,
            })
            .await;

        if event.new_status.is_online() && !event.old_status.is_online() {
            info!("🌐 网络恢复，重放同步队列");
            if let Err(e) = self.inner.queue.reset_backoff().await {
                warn!("重置退避失败: {}", e);
            }
            self.spawn_drain();
        }
    }

    fn spawn_drain(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.drain_queue().await {
                warn!("队列 drain 失败: {}", e);
            }
        });
    }

    fn schedule(&self, kind: EntityKind, client_id: &str) {
        // 接收端只在 shutdown 的瞬间不可用，此时实体仍是 pending，恢复流程会补入队列
        let _ = self
            .inner
            .debounce_tx
            .send(DebounceCommand::Schedule(kind, client_id.to_string()));
    }

    fn cancel_debounce(&self, client_id: &str) {
        let _ = self.inner.debounce_tx.send(DebounceCommand::Cancel(client_id.to_string()));
    }

    // ========== 文章：本地编辑 ==========

    pub async fn create_article(&self, draft: ArticleDraft) -> Result<LocalArticle> {
        let article = self.inner.mirror.create(draft).await?;
        info!("📝 新建文章 {}", article.client_id);
        self.schedule(EntityKind::Article, &article.client_id);
        Ok(article)
    }

    /// 写入镜像并重置防抖计时。冲突中的编辑只留在本地
    pub async fn edit_article(&self, client_id: &str, patch: ArticlePatch) -> Result<LocalArticle> {
        let old = self
            .inner
            .mirror
            .get_by_client_id(client_id)
            .await?
            .map(|a| a.sync_status);
        let article = self.inner.mirror.upsert(client_id, patch).await?;
        if let Some(old) = old {
            self.emit_status(EntityKind::Article, client_id, old, article.sync_status)
                .await;
        }
        if article.sync_status != SyncStatus::Conflict {
            self.schedule(EntityKind::Article, client_id);
        }
        Ok(article)
    }

    pub async fn get_article(&self, client_id: &str) -> Result<Option<LocalArticle>> {
        self.inner.mirror.get_by_client_id(client_id).await
    }

    pub async fn list_articles(&self) -> Result<Vec<LocalArticle>> {
        self.inner.mirror.list().await
    }

    /// 删除本地行与队列项，尽力删除远端副本（失败或离线时入队）
    #[instrument(skip(self), fields(client_id = %client_id))]
    pub async fn delete_article(&self, client_id: &str) -> Result<bool> {
        self.cancel_debounce(client_id);
        let lock = self.entity_lock(client_id).await;
        let _guard = lock.lock().await;

        let Some(article) = self.inner.mirror.get_by_client_id(client_id).await? else {
            return Ok(false);
        };
        self.inner.mirror.delete(client_id).await?;
        if let Some(server_id) = article.server_id {
            self.delete_remote(EntityKind::Article, client_id, server_id).await?;
        }
        info!("🗑️ 已删除文章 {}", client_id);
        Ok(true)
    }

    // ========== 文章：同步 ==========

    /// 推送一个实体。同一实体的并发调用排队等待
    #[instrument(skip(self), fields(client_id = %client_id))]
    pub async fn sync_to_server(&self, client_id: &str) -> Result<LocalArticle> {
        let lock = self.entity_lock(client_id).await;
        let _guard = lock.lock().await;
        self.sync_article_locked(client_id).await
    }

    /// 手动保存：跳过防抖与队列立即推送
    pub async fn sync_now(&self, client_id: &str) -> Result<LocalArticle> {
        self.cancel_debounce(client_id);
        self.sync_to_server(client_id).await
    }

    async fn sync_article_locked(&self, client_id: &str) -> Result<LocalArticle> {
        let mut article = self.inner.mirror.require(client_id).await?;
        match article.sync_status {
            SyncStatus::Conflict => {
                self.inner.queue.remove_for_entity(client_id).await?;
                debug!("⏸️ {} 处于冲突状态，跳过自动同步", client_id);
                return Ok(article);
            }
            SyncStatus::Synced if article.is_clean() => {
                self.inner.queue.remove_for_entity(client_id).await?;
                return Ok(article);
            }
            SyncStatus::Syncing => {
                // 上一个进程在飞行中退出
                article = self.inner.mirror.transition(client_id, SyncStatus::Pending).await?;
            }
            _ => {}
        }

        if !self.is_online() {
            self.enqueue_article(&article).await?;
            debug!("📴 离线，{} 已入队", client_id);
            return Ok(article);
        }

        let old = article.sync_status;
        let syncing = self.inner.mirror.mark_syncing(client_id).await?;
        self.emit_status(EntityKind::Article, client_id, old, SyncStatus::Syncing)
            .await;
        let sent_version = syncing.local_version;
        let payload = self.payload_for(&syncing);

        let result = match syncing.server_id {
            None => self.inner.remote.create(client_id, sent_version, payload).await,
            Some(server_id) => {
                self.inner
                    .remote
                    .sync_update(server_id, syncing.remote_version, sent_version, payload)
                    .await
            }
        };

        match result {
            Ok(WriteOutcome::Accepted {
                server_id,
                server_version,
            }) => {
                let outcome = self
                    .inner
                    .mirror
                    .apply_accept(client_id, sent_version, server_id, server_version)
                    .await?;
                self.finish_accept(client_id, server_id, server_version, outcome).await
            }
            Ok(WriteOutcome::Conflict {
                server_id,
                server_version,
            }) => {
                self.enter_conflict(client_id, SyncStatus::Syncing, server_id, server_version)
                    .await
            }
            Err(e) => {
                self.on_article_failure(&syncing, &e).await?;
                Err(e)
            }
        }
    }

    async fn finish_accept(
        &self,
        client_id: &str,
        server_id: i64,
        server_version: i64,
        outcome: AcceptOutcome,
    ) -> Result<LocalArticle> {
        match outcome {
            AcceptOutcome::Synced(article) => {
                self.inner.queue.remove_for_entity(client_id).await?;
                self.record_successful_sync();
                self.emit_status(EntityKind::Article, client_id, SyncStatus::Syncing, SyncStatus::Synced)
                    .await;
                info!("✅ {} 已同步 (v{})", client_id, server_version);
                Ok(article)
            }
            AcceptOutcome::Superseded(article) => {
                // 队列项保留，由下一次防抖或 drain 发送新版本
                self.emit_status(EntityKind::Article, client_id, SyncStatus::Syncing, article.sync_status)
                    .await;
                debug!(
                    "{} 回执 v{} 已过期，本地 v{} 待发送",
                    client_id, server_version, article.local_version
                );
                Ok(article)
            }
            AcceptOutcome::Missing => {
                warn!("{} 在飞行期间被删除，撤销远端副本 #{}", client_id, server_id);
                self.delete_remote(EntityKind::Article, client_id, server_id).await?;
                Err(SyncError::NotFound(format!("article {}", client_id)))
            }
        }
    }

    /// 进入冲突：清除队列项，拉取远端内容供用户对比
    pub(crate) async fn enter_conflict(
        &self,
        client_id: &str,
        old: SyncStatus,
        server_id: i64,
        server_version: i64,
    ) -> Result<LocalArticle> {
        let article = self
            .inner
            .mirror
            .mark_conflict(client_id, server_id, server_version)
            .await?;
        self.inner.queue.remove_for_entity(client_id).await?;
        warn!(
            "⚠️ {} 版本冲突：本地 v{}，服务端 v{}",
            client_id, article.local_version, server_version
        );
        self.emit_status(EntityKind::Article, client_id, old, SyncStatus::Conflict)
            .await;
        self.inner
            .events
            .emit(SyncEvent::ConflictDetected {
                client_id: client_id.to_string(),
                local_version: article.local_version,
                server_version,
                timestamp: self.now(),
            })
            .await;

        match self.inner.remote.fetch(server_id).await {
            Ok(remote) => self.inner.mirror.set_conflict_remote(client_id, remote.content).await,
            Err(e) => {
                // 冲突状态已落库，远端内容可稍后由探测补齐
                warn!("拉取 {} 的远端内容失败: {}", client_id, e);
                Ok(article)
            }
        }
    }

    async fn on_article_failure(&self, sent: &LocalArticle, err: &SyncError) -> Result<()> {
        let client_id = &sent.client_id;
        let message = err.to_string();
        let current = self.inner.mirror.mark_error(client_id, &message).await?;
        self.emit_status(EntityKind::Article, client_id, SyncStatus::Syncing, current.sync_status)
            .await;
        let item_id = self.enqueue_article(&current).await?;
        self.record_queue_failure(item_id, err).await?;
        warn!("❌ {} 同步失败 ({}): {}", client_id, err.failure_kind(), message);
        self.emit_failure(client_id, err).await;
        Ok(())
    }

    /// 强制覆盖服务端（不做冲突检测）。冲突中的实体需先解决
    #[instrument(skip(self), fields(client_id = %client_id))]
    pub async fn force_push(&self, client_id: &str) -> Result<LocalArticle> {
        if !self.is_online() {
            return Err(SyncError::Offline);
        }
        self.cancel_debounce(client_id);
        let lock = self.entity_lock(client_id).await;
        let _guard = lock.lock().await;

        let mut article = self.inner.mirror.require(client_id).await?;
        match article.sync_status {
            SyncStatus::Conflict => {
                return Err(SyncError::VersionConflict {
                    server_version: article.remote_version,
                })
            }
            SyncStatus::Syncing => {
                article = self.inner.mirror.transition(client_id, SyncStatus::Pending).await?;
            }
            _ => {}
        }
        let old = article.sync_status;
        let syncing = self.inner.mirror.mark_syncing(client_id).await?;
        self.emit_status(EntityKind::Article, client_id, old, SyncStatus::Syncing)
            .await;
        let sent_version = syncing.local_version;

        let result = match syncing.server_id {
            Some(server_id) => {
                self.inner
                    .remote
                    .update(server_id, sent_version, self.payload_for(&syncing))
                    .await
            }
            None => match self
                .inner
                .remote
                .create(client_id, sent_version, self.payload_for(&syncing))
                .await
            {
                Ok(WriteOutcome::Accepted {
                    server_id,
                    server_version,
                }) => Ok((server_id, server_version)),
                // 服务端已有同 client_id 的更新版本，直接覆盖
                Ok(WriteOutcome::Conflict { server_id, .. }) => {
                    self.inner
                        .remote
                        .update(server_id, sent_version, self.payload_for(&syncing))
                        .await
                }
                Err(e) => Err(e),
            },
        };

        match result {
            Ok((server_id, server_version)) => {
                let outcome = self
                    .inner
                    .mirror
                    .apply_forced(client_id, sent_version, server_id, server_version)
                    .await?;
                if matches!(outcome, AcceptOutcome::Synced(_)) {
                    warn!("⚡ {} 已强制覆盖服务端 (v{})", client_id, server_version);
                }
                self.finish_accept(client_id, server_id, server_version, outcome).await
            }
            Err(e) => {
                self.on_article_failure(&syncing, &e).await?;
                Err(e)
            }
        }
    }

    // ========== 文件夹 ==========

    pub async fn create_folder(&self, name: &str, parent_id: Option<String>) -> Result<LocalFolder> {
        let folder = self.inner.mirror.create_folder(name, parent_id).await?;
        self.schedule(EntityKind::Folder, &folder.client_id);
        Ok(folder)
    }

    pub async fn rename_folder(&self, client_id: &str, name: &str) -> Result<LocalFolder> {
        let folder = self
            .inner
            .mirror
            .update_folder(client_id, Some(name.to_string()), None)
            .await?;
        self.schedule(EntityKind::Folder, client_id);
        Ok(folder)
    }

    /// `parent_id = None` 移到根
    pub async fn move_folder(&self, client_id: &str, parent_id: Option<String>) -> Result<LocalFolder> {
        let folder = self
            .inner
            .mirror
            .update_folder(client_id, None, Some(parent_id))
            .await?;
        self.schedule(EntityKind::Folder, client_id);
        Ok(folder)
    }

    pub async fn list_folders(&self) -> Result<Vec<LocalFolder>> {
        self.inner.mirror.list_folders().await
    }

    #[instrument(skip(self), fields(client_id = %client_id))]
    pub async fn delete_folder(&self, client_id: &str) -> Result<bool> {
        self.cancel_debounce(client_id);
        let lock = self.entity_lock(client_id).await;
        let _guard = lock.lock().await;

        let Some(folder) = self.inner.mirror.get_folder(client_id).await? else {
            return Ok(false);
        };
        self.inner.mirror.delete_folder(client_id).await?;
        if let Some(server_id) = folder.server_id {
            self.delete_remote(EntityKind::Folder, client_id, server_id).await?;
        }
        info!("🗑️ 已删除文件夹 {} '{}'", client_id, folder.name);
        Ok(true)
    }

    /// 文件夹最后写入者胜出，没有冲突路径
    #[instrument(skip(self), fields(client_id = %client_id))]
    pub async fn sync_folder(&self, client_id: &str) -> Result<()> {
        let lock = self.entity_lock(client_id).await;
        let _guard = lock.lock().await;

        let Some(mut folder) = self.inner.mirror.get_folder(client_id).await? else {
            self.inner.queue.remove_for_entity(client_id).await?;
            return Ok(());
        };
        match folder.sync_status {
            SyncStatus::Synced => {
                self.inner.queue.remove_for_entity(client_id).await?;
                return Ok(());
            }
            SyncStatus::Syncing => {
                folder = self
                    .inner
                    .mirror
                    .transition_folder(client_id, SyncStatus::Pending)
                    .await?;
            }
            _ => {}
        }

        if !self.is_online() {
            self.enqueue_folder(&folder).await?;
            return Ok(());
        }

        let old = folder.sync_status;
        let syncing = self.inner.mirror.mark_folder_syncing(client_id).await?;
        self.emit_status(EntityKind::Folder, client_id, old, SyncStatus::Syncing)
            .await;

        let result = self
            .inner
            .remote
            .upsert_folder(
                client_id,
                syncing.server_id,
                &syncing.name,
                syncing.parent_id.clone(),
                syncing.local_version,
            )
            .await;

        match result {
            Ok((server_id, _)) => {
                if let Some(accepted) = self
                    .inner
                    .mirror
                    .apply_folder_accept(client_id, syncing.local_version, server_id)
                    .await?
                {
                    if accepted.sync_status == SyncStatus::Synced {
                        self.inner.queue.remove_for_entity(client_id).await?;
                        self.record_successful_sync();
                        info!("✅ 文件夹 {} 已同步", client_id);
                    }
                    self.emit_status(EntityKind::Folder, client_id, SyncStatus::Syncing, accepted.sync_status)
                        .await;
                }
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                let current = self.inner.mirror.mark_folder_error(client_id, &message).await?;
                self.emit_status(EntityKind::Folder, client_id, SyncStatus::Syncing, current.sync_status)
                    .await;
                let item_id = self.enqueue_folder(&current).await?;
                self.record_queue_failure(item_id, &e).await?;
                warn!("❌ 文件夹 {} 同步失败: {}", client_id, message);
                self.emit_failure(client_id, &e).await;
                Err(e)
            }
        }
    }

    // ========== 队列 ==========

    /// 按 FIFO 重放到期队列项；同一时间只有一个 drain，离线时停止
    #[instrument(skip(self))]
    pub async fn drain_queue(&self) -> Result<DrainReport> {
        let Ok(_running) = self.inner.drain_lock.try_lock() else {
            debug!("drain 已在进行中，跳过");
            return Ok(DrainReport {
                skipped: true,
                ..Default::default()
            });
        };

        let mut report = DrainReport::default();
        let mut seen = HashSet::new();
        'drain: while self.is_online() {
            // 同一实体在一轮 drain 中只处理一次，已处理的在查询里跳过
            let batch = self
                .inner
                .queue
                .next_batch_excluding(self.inner.config.batch_size, &seen)
                .await?;
            if batch.is_empty() {
                break;
            }
            let fresh: Vec<SyncQueueItem> = batch
                .into_iter()
                .filter(|item| seen.insert(item.entity_client_id.clone()))
                .collect();
            for item in fresh {
                if !self.is_online() {
                    debug!("drain 途中离线，停止");
                    break 'drain;
                }
                match self.dispatch(&item).await {
                    Ok(()) => report.processed += 1,
                    Err(e) => {
                        report.failed += 1;
                        debug!("队列项 #{} ({}) 失败: {}", item.id, item.entity_client_id, e);
                    }
                }
            }
        }

        report.remaining = self.inner.queue.len().await?;
        let now = self.now();
        if let Err(e) = self.inner.storage.kv().record_drain(now) {
            warn!("记录 drain 时间失败: {}", e);
        }
        if report.processed + report.failed > 0 {
            info!(
                "📤 队列 drain 完成：成功 {}，失败 {}，剩余 {}",
                report.processed, report.failed, report.remaining
            );
            self.inner
                .events
                .emit(SyncEvent::QueueDrained {
                    processed: report.processed,
                    remaining: report.remaining,
                    timestamp: now,
                })
                .await;
        }
        Ok(report)
    }

    async fn dispatch(&self, item: &SyncQueueItem) -> Result<()> {
        match (item.entity_type, item.action) {
            (kind, SyncAction::Delete) => self.replay_delete(item, kind).await,
            (EntityKind::Article, _) => {
                if self
                    .inner
                    .mirror
                    .get_by_client_id(&item.entity_client_id)
                    .await?
                    .is_none()
                {
                    self.inner.queue.remove_for_entity(&item.entity_client_id).await?;
                    return Ok(());
                }
                self.sync_to_server(&item.entity_client_id).await.map(|_| ())
            }
            (EntityKind::Folder, _) => self.sync_folder(&item.entity_client_id).await,
        }
    }

    async fn replay_delete(&self, item: &SyncQueueItem, kind: EntityKind) -> Result<()> {
        let Some(server_id) = item.entity_id else {
            self.inner.queue.remove(item.id).await?;
            return Ok(());
        };
        let result = match kind {
            EntityKind::Article => self.inner.remote.delete(server_id).await,
            EntityKind::Folder => self.inner.remote.delete_folder(server_id).await,
        };
        match result {
            Ok(_) | Err(SyncError::NotFound(_)) => {
                self.inner.queue.remove(item.id).await?;
                debug!("远端 {} #{} 已删除", kind, server_id);
                Ok(())
            }
            Err(e) => {
                self.record_queue_failure(item.id, &e).await?;
                Err(e)
            }
        }
    }

    async fn delete_remote(&self, kind: EntityKind, client_id: &str, server_id: i64) -> Result<()> {
        if !self.is_online() {
            self.inner
                .queue
                .enqueue(kind, client_id, Some(server_id), SyncAction::Delete, json!({}))
                .await?;
            return Ok(());
        }
        let result = match kind {
            EntityKind::Article => self.inner.remote.delete(server_id).await,
            EntityKind::Folder => self.inner.remote.delete_folder(server_id).await,
        };
        match result {
            Ok(_) | Err(SyncError::NotFound(_)) => Ok(()),
            Err(e) => {
                warn!("远端删除 {} #{} 失败，稍后重试: {}", kind, server_id, e);
                let item_id = self
                    .inner
                    .queue
                    .enqueue(kind, client_id, Some(server_id), SyncAction::Delete, json!({}))
                    .await?;
                self.record_queue_failure(item_id, &e).await
            }
        }
    }

    /// 按重试策略记录失败；超过上限的项停放到已耗尽
    async fn record_queue_failure(&self, item_id: i64, err: &SyncError) -> Result<()> {
        let Some(item) = self.inner.queue.get(item_id).await? else {
            return Ok(());
        };
        let kind = err.failure_kind();
        let now = self.now();
        let policy = &self.inner.config.retry;
        let attempts = item.retry_count + 1;
        let next_attempt_at = policy.next_attempt_at(now, item.retry_count, kind).unwrap_or(now);

        self.inner
            .queue
            .record_failure(item_id, &err.to_string(), kind, next_attempt_at)
            .await?;
        if policy.should_retry(attempts, kind) {
            debug!(
                "⏳ #{} {} 第 {} 次失败，{}ms 后重试",
                item_id,
                item.entity_client_id,
                attempts,
                next_attempt_at - now
            );
        } else {
            self.inner.queue.park(item_id).await?;
            error!(
                "🛑 #{} {} 重试耗尽 ({} 次, {})，等待人工重试",
                item_id, item.entity_client_id, attempts, kind
            );
        }
        Ok(())
    }

    async fn enqueue_article(&self, article: &LocalArticle) -> Result<i64> {
        let action = if article.server_id.is_some() {
            SyncAction::Update
        } else {
            SyncAction::Create
        };
        self.inner
            .queue
            .enqueue(
                EntityKind::Article,
                &article.client_id,
                article.server_id,
                action,
                article.snapshot(),
            )
            .await
    }

    async fn enqueue_folder(&self, folder: &LocalFolder) -> Result<i64> {
        let action = if folder.server_id.is_some() {
            SyncAction::Update
        } else {
            SyncAction::Create
        };
        self.inner
            .queue
            .enqueue(
                EntityKind::Folder,
                &folder.client_id,
                folder.server_id,
                action,
                json!({ "name": folder.name, "local_version": folder.local_version }),
            )
            .await
    }

    // ========== 恢复与人工干预 ==========

    /// 残留 syncing 拉回 pending；没有队列项的 pending / error 实体补入队列
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for article in self.inner.mirror.query_by_sync_status(SyncStatus::Syncing).await? {
            self.inner
                .mirror
                .transition(&article.client_id, SyncStatus::Pending)
                .await?;
            report.reset_syncing += 1;
        }
        for status in [SyncStatus::Pending, SyncStatus::Error] {
            for article in self.inner.mirror.query_by_sync_status(status).await? {
                if !self.inner.queue.contains(&article.client_id).await? {
                    self.enqueue_article(&article).await?;
                    report.requeued += 1;
                }
            }
        }

        for folder in self.inner.mirror.list_folders().await? {
            let folder = if folder.sync_status == SyncStatus::Syncing {
                report.reset_syncing += 1;
                self.inner
                    .mirror
                    .transition_folder(&folder.client_id, SyncStatus::Pending)
                    .await?
            } else {
                folder
            };
            if folder.sync_status.is_dirty() && !self.inner.queue.contains(&folder.client_id).await? {
                self.enqueue_folder(&folder).await?;
                report.requeued += 1;
            }
        }

        if report.reset_syncing + report.requeued > 0 {
            info!(
                "🔄 启动恢复：{} 个 syncing 回到 pending，{} 个实体补入队列",
                report.reset_syncing, report.requeued
            );
        }
        Ok(report)
    }

    /// 清零重试计数并立即尝试；返回被重置的队列项数
    #[instrument(skip(self), fields(client_id = %client_id))]
    pub async fn retry_failed(&self, client_id: &str) -> Result<usize> {
        let mut reset = self.inner.queue.reset_retries(client_id).await?;
        if reset == 0 {
            if let Some(article) = self.inner.mirror.get_by_client_id(client_id).await? {
                if matches!(article.sync_status, SyncStatus::Pending | SyncStatus::Error) {
                    self.enqueue_article(&article).await?;
                    reset = 1;
                }
            }
        }
        info!("🔁 人工重试 {}（{} 个队列项）", client_id, reset);
        if reset > 0 && self.is_online() {
            self.drain_queue().await?;
        }
        Ok(reset)
    }

    pub async fn summary(&self) -> Result<SyncSummary> {
        let mirror = &self.inner.mirror;
        Ok(SyncSummary {
            synced: mirror.count_by_status(SyncStatus::Synced).await?,
            pending: mirror.count_by_status(SyncStatus::Pending).await?,
            syncing: mirror.count_by_status(SyncStatus::Syncing).await?,
            conflict: mirror.count_by_status(SyncStatus::Conflict).await?,
            error: mirror.count_by_status(SyncStatus::Error).await?,
            queued: self.inner.queue.len().await?,
            exhausted: self.inner.queue.exhausted().await?.len(),
            last_successful_sync_at: self.inner.storage.kv().last_successful_sync_at()?,
        })
    }

    // ========== 内部工具 ==========

    pub(crate) fn payload_for(&self, article: &LocalArticle) -> ArticlePayload {
        ArticlePayload {
            title: article.title.clone(),
            content: article.content.clone(),
            summary: article.summary.clone(),
            folder_id: article.folder_id.clone(),
            content_hash: article.content_hash.clone(),
            last_modified_by: self.inner.config.last_modified_by.clone(),
        }
    }

    fn record_successful_sync(&self) {
        if let Err(e) = self.inner.storage.kv().record_successful_sync(self.now()) {
            warn!("记录同步时间失败: {}", e);
        }
    }

    pub(crate) async fn emit_status(&self, entity_type: EntityKind, client_id: &str, old: SyncStatus, new: SyncStatus) {
        if old == new {
            return;
        }
        self.inner
            .events
            .emit(SyncEvent::StatusChanged {
                entity_type,
                client_id: client_id.to_string(),
                old,
                new,
                timestamp: self.now(),
            })
            .await;
    }

    pub(crate) async fn emit(&self, event: SyncEvent) {
        self.inner.events.emit(event).await;
    }

    async fn emit_failure(&self, client_id: &str, err: &SyncError) {
        self.emit(SyncEvent::SyncFailed {
            client_id: client_id.to_string(),
            kind: err.failure_kind(),
            message: err.to_string(),
            timestamp: self.now(),
        })
        .await;
    }
}
