mod common;

use std::sync::Arc;

use article_sync::{
    ArticleDraft, ArticlePatch, ArticleServer, EntityKind, FailureKind, ManualClock, RetryPolicy,
    ServerTransport, StorageManager, SyncAction, SyncError, SyncEvent, SyncStatus,
};
use common::{config, env, env_on, env_with, START_MILLIS};

#[tokio::test]
async fn queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let transport = Arc::new(ServerTransport::new(Arc::new(ArticleServer::new(clock.clone()))));
    // 不固定 device_id：首次启动生成并持久化
    let config = article_sync::SyncConfig::builder()
        .data_dir(dir.path())
        .last_modified_by("tester")
        .build()
        .unwrap();

    let (client_id, device_prefix) = {
        let storage = StorageManager::open(&config).await.unwrap();
        let env = env_on(config.clone(), storage, transport.clone(), clock.clone());
        env.go_offline();
        let article = env
            .coordinator
            .create_article(ArticleDraft::new("offline", "written on a plane"))
            .await
            .unwrap();
        env.coordinator.sync_now(&article.client_id).await.unwrap();
        assert!(env.coordinator.queue().contains(&article.client_id).await.unwrap());
        env.coordinator.shutdown().await.unwrap();

        let prefix = article.client_id.rsplit_once('-').unwrap().0.to_string();
        (article.client_id, prefix)
    };
    assert_eq!(transport.total_calls(), 0);

    let storage = StorageManager::open(&config).await.unwrap();
    let env = env_on(config, storage, transport.clone(), clock);
    let items = env.coordinator.queue().items_for(&client_id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].action, SyncAction::Create);

    let report = env.coordinator.drain_queue().await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.remaining, 0);
    assert_eq!(
        transport.server().article_by_client_id(&client_id).unwrap().content,
        "written on a plane"
    );

    // 设备 ID 跨重启保持不变
    let next = env.coordinator.create_article(ArticleDraft::new("t", "x")).await.unwrap();
    assert!(next.client_id.starts_with(&format!("{device_prefix}-")));
}

#[tokio::test]
async fn client_ids_are_not_reused_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let transport = Arc::new(ServerTransport::new(Arc::new(ArticleServer::new(clock.clone()))));
    let config = article_sync::SyncConfig::builder()
        .data_dir(dir.path())
        .last_modified_by("tester")
        .build()
        .unwrap();

    // 同一毫秒内连续生成，序号向后借用
    let mut issued = Vec::new();
    {
        let storage = StorageManager::open(&config).await.unwrap();
        let env = env_on(config.clone(), storage, transport.clone(), clock.clone());
        env.go_offline();
        for title in ["a", "b"] {
            let article = env.coordinator.create_article(ArticleDraft::new(title, "x")).await.unwrap();
            issued.push(article.client_id);
        }
        let folder = env.coordinator.create_folder("drafts", None).await.unwrap();
        issued.push(folder.client_id);
        env.coordinator.shutdown().await.unwrap();
    }

    clock.advance(1);
    let storage = StorageManager::open(&config).await.unwrap();
    let env = env_on(config, storage, transport, clock);
    env.go_offline();
    let article = env.coordinator.create_article(ArticleDraft::new("c", "y")).await.unwrap();
    let folder = env.coordinator.create_folder("published", None).await.unwrap();
    assert!(!issued.contains(&article.client_id));
    assert!(!issued.contains(&folder.client_id));
    assert_ne!(article.client_id, folder.client_id);

    let folders = env.coordinator.list_folders().await.unwrap();
    assert_eq!(folders.len(), 2);
    let drafts = folders.iter().find(|f| f.client_id == issued[2]).unwrap();
    assert_eq!(drafts.name, "drafts");
    assert!(folders.iter().any(|f| f.name == "published"));
}

#[tokio::test]
async fn remote_delete_parks_update_without_retrying() {
    let env = env();
    let article = env.synced_article("t", "v1").await;
    env.coordinator
        .edit_article(&article.client_id, ArticlePatch::content("v2"))
        .await
        .unwrap();
    assert!(env.server().remote_delete(article.server_id.unwrap()));

    let err = env.coordinator.sync_now(&article.client_id).await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
    assert!(!err.is_transport());

    // 不可恢复的失败立即停放
    let parked = env.coordinator.queue().exhausted().await.unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].failure_kind, Some(FailureKind::Permanent));
    assert_eq!(env.article(&article.client_id).await.sync_status, SyncStatus::Error);

    let calls = env.transport.total_calls();
    env.clock.advance(3_600_000);
    assert_eq!(env.coordinator.drain_queue().await.unwrap().processed, 0);
    assert_eq!(env.transport.total_calls(), calls);
}

#[tokio::test]
async fn keep_local_on_remotely_deleted_article_stays_in_conflict() {
    let env = env();
    let article = env.synced_article("t", "v1").await;
    let server_id = article.server_id.unwrap();
    env.coordinator
        .edit_article(&article.client_id, ArticlePatch::content("mine"))
        .await
        .unwrap();
    env.server().remote_edit(server_id, "theirs", "other-device");
    let conflicted = env.coordinator.sync_now(&article.client_id).await.unwrap();
    assert_eq!(conflicted.sync_status, SyncStatus::Conflict);

    env.server().remote_delete(server_id);
    let err = env
        .coordinator
        .resolver()
        .use_local_version(&article.client_id)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
    let current = env.article(&article.client_id).await;
    assert_eq!(current.sync_status, SyncStatus::Conflict);
    assert_eq!(current.content, "mine");
}

#[tokio::test]
async fn drain_moves_past_failed_item_in_full_batch() {
    let policy = RetryPolicy {
        base_delay_ms: 0,
        jitter_factor: 0.0,
        ..RetryPolicy::default()
    };
    let env = env_with(config().batch_size(1).retry(policy).build().unwrap());
    env.go_offline();
    let first = env.coordinator.create_article(ArticleDraft::new("a", "x")).await.unwrap();
    env.clock.advance(1);
    let second = env.coordinator.create_article(ArticleDraft::new("b", "y")).await.unwrap();
    env.coordinator.sync_now(&first.client_id).await.unwrap();
    env.coordinator.sync_now(&second.client_id).await.unwrap();

    env.go_online();
    env.transport.fail_next(1, "503 service unavailable");
    let report = env.coordinator.drain_queue().await.unwrap();
    // 第一项失败后立即到期，但本轮不再重复处理
    assert_eq!(report.failed, 1);
    assert_eq!(report.processed, 1);
    assert_eq!(report.remaining, 1);
    assert!(env.server().article_by_client_id(&second.client_id).is_some());
    assert!(env.server().article_by_client_id(&first.client_id).is_none());
}

#[tokio::test]
async fn recover_resumes_interrupted_flight() -> anyhow::Result<()> {
    let env = env();
    let article = env.coordinator.create_article(ArticleDraft::new("t", "x")).await?;
    // 模拟进程在飞行中退出
    env.coordinator.mirror().mark_syncing(&article.client_id).await?;

    let report = env.coordinator.recover().await?;
    assert_eq!(report.reset_syncing, 1);
    assert_eq!(report.requeued, 1);
    assert_eq!(env.article(&article.client_id).await.sync_status, SyncStatus::Pending);

    // 第二次恢复不重复入队
    let again = env.coordinator.recover().await?;
    assert_eq!(again.requeued, 0);

    env.coordinator.drain_queue().await?;
    assert!(env.article(&article.client_id).await.is_clean());
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_are_parked_until_manual_retry() {
    let policy = RetryPolicy {
        max_retries: 2,
        ..RetryPolicy::default()
    };
    let env = env_with(config().retry(policy).build().unwrap());
    let article = env
        .coordinator
        .create_article(ArticleDraft::new("t", "x"))
        .await
        .unwrap();
    env.transport.fail_next(2, "503 service unavailable");

    tokio_test::assert_err!(env.coordinator.sync_now(&article.client_id).await);
    env.clock.advance(60_000);
    let report = tokio_test::assert_ok!(env.coordinator.drain_queue().await);
    assert_eq!(report.failed, 1);

    let parked = env.coordinator.queue().exhausted().await.unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].retry_count, 2);
    let failed = env.article(&article.client_id).await;
    assert_eq!(failed.sync_status, SyncStatus::Error);
    assert!(failed.sync_error.is_some());

    // 停放后不再自动重试
    let calls = env.transport.total_calls();
    env.clock.advance(3_600_000);
    assert_eq!(env.coordinator.drain_queue().await.unwrap().processed, 0);
    assert_eq!(env.transport.total_calls(), calls);

    assert_eq!(tokio_test::assert_ok!(env.coordinator.retry_failed(&article.client_id).await), 1);
    let synced = env.article(&article.client_id).await;
    assert_eq!(synced.sync_status, SyncStatus::Synced);
    assert!(env.coordinator.queue().is_empty().await.unwrap());
}

#[tokio::test]
async fn validation_failures_use_their_own_limit() {
    let policy = RetryPolicy {
        max_retries: 5,
        max_validation_retries: 1,
        ..RetryPolicy::default()
    };
    let env = env_with(config().retry(policy).max_content_bytes(8).build().unwrap());
    let article = env
        .coordinator
        .create_article(ArticleDraft::new("t", "far too long for the limit"))
        .await
        .unwrap();

    let err = env.coordinator.sync_now(&article.client_id).await.unwrap_err();
    assert!(matches!(err, SyncError::Validation { .. }));
    // 校验在本地失败，没有发出请求
    assert_eq!(env.transport.total_calls(), 0);
    assert_eq!(env.coordinator.queue().exhausted().await.unwrap().len(), 1);
}

#[tokio::test]
async fn delete_purges_queue_and_remote() {
    let env = env();
    env.go_offline();
    let draft = env
        .coordinator
        .create_article(ArticleDraft::new("t", "never synced"))
        .await
        .unwrap();
    env.coordinator.sync_now(&draft.client_id).await.unwrap();
    assert!(env.coordinator.queue().contains(&draft.client_id).await.unwrap());

    assert!(env.coordinator.delete_article(&draft.client_id).await.unwrap());
    assert!(env.coordinator.queue().is_empty().await.unwrap());
    assert!(!env.coordinator.delete_article(&draft.client_id).await.unwrap());

    // 已同步的文章离线删除：入队远端删除，联网后执行
    env.go_online();
    let synced = env.synced_article("t", "on server").await;
    let server_id = synced.server_id.unwrap();
    env.go_offline();
    env.coordinator.delete_article(&synced.client_id).await.unwrap();
    let items = env.coordinator.queue().items_for(&synced.client_id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].action, SyncAction::Delete);
    assert_eq!(items[0].entity_id, Some(server_id));
    assert_eq!(items[0].entity_type, EntityKind::Article);

    env.go_online();
    env.coordinator.drain_queue().await.unwrap();
    assert!(env.server().article(server_id).is_none());
    assert!(env.coordinator.queue().is_empty().await.unwrap());
}

#[tokio::test]
async fn stale_response_does_not_clobber_newer_edit() {
    let env = env();
    let article = env.synced_article("t", "v1").await;
    env.coordinator
        .edit_article(&article.client_id, ArticlePatch::content("v2"))
        .await
        .unwrap();

    let gate = env.transport.gate_next("sync_update");
    let flight = {
        let coordinator = env.coordinator.clone();
        let client_id = article.client_id.clone();
        tokio::spawn(async move { coordinator.sync_now(&client_id).await })
    };
    gate.wait_entered().await;
    assert_eq!(env.article(&article.client_id).await.sync_status, SyncStatus::Syncing);

    // 飞行期间的新编辑
    let newer = env
        .coordinator
        .edit_article(&article.client_id, ArticlePatch::content("v3"))
        .await
        .unwrap();
    assert_eq!(newer.local_version, 3);

    gate.release();
    let after_flight = flight.await.unwrap().unwrap();
    assert_eq!(after_flight.sync_status, SyncStatus::Pending);
    assert_eq!(after_flight.remote_version, 2);
    assert_eq!(after_flight.local_version, 3);
    assert_eq!(after_flight.content, "v3");

    let synced = env.coordinator.sync_now(&article.client_id).await.unwrap();
    assert!(synced.is_clean());
    let remote = env.server().article(article.server_id.unwrap()).unwrap();
    assert_eq!(remote.content, "v3");
    assert_eq!(remote.version, 3);
}

#[tokio::test]
async fn concurrent_triggers_are_single_flight() {
    let env = env();
    let article = env
        .coordinator
        .create_article(ArticleDraft::new("t", "x"))
        .await
        .unwrap();

    let gate = env.transport.gate_next("create");
    let first = {
        let coordinator = env.coordinator.clone();
        let client_id = article.client_id.clone();
        tokio::spawn(async move { coordinator.sync_now(&client_id).await })
    };
    gate.wait_entered().await;
    let second = {
        let coordinator = env.coordinator.clone();
        let client_id = article.client_id.clone();
        tokio::spawn(async move { coordinator.sync_to_server(&client_id).await })
    };
    tokio::task::yield_now().await;
    gate.release();

    assert!(first.await.unwrap().unwrap().is_clean());
    // 第二次触发在锁上等待，之后发现已干净，不再发送
    assert!(second.await.unwrap().unwrap().is_clean());
    assert_eq!(env.transport.total_calls(), 1);
}

#[tokio::test]
async fn lost_create_ack_is_idempotent() {
    let env = env();
    let article = env
        .coordinator
        .create_article(ArticleDraft::new("t", "hello"))
        .await
        .unwrap();

    // 服务端已写入，但回执哈希被篡改
    env.transport.corrupt_next_echo();
    let err = env.coordinator.sync_now(&article.client_id).await.unwrap_err();
    assert!(matches!(err, SyncError::IntegrityMismatch { .. }));
    let failed = env.article(&article.client_id).await;
    assert_eq!(failed.sync_status, SyncStatus::Error);
    assert_eq!(failed.server_id, None);

    env.clock.advance(60_000);
    env.coordinator.drain_queue().await.unwrap();
    let synced = env.article(&article.client_id).await;
    assert!(synced.is_clean());
    assert_eq!(env.server().article_count(), 1);
    assert_eq!(env.transport.call_count("create"), 2);
}

#[tokio::test]
async fn integrity_mismatch_on_update_is_retried() {
    let env = env();
    let article = env.synced_article("t", "v1").await;
    env.coordinator
        .edit_article(&article.client_id, ArticlePatch::content("v2"))
        .await
        .unwrap();

    env.transport.corrupt_next_echo();
    let err = env.coordinator.sync_now(&article.client_id).await.unwrap_err();
    assert!(err.is_transport());
    assert_eq!(env.article(&article.client_id).await.remote_version, 1);

    // 重发命中服务端的幂等分支，不会误报冲突
    env.clock.advance(60_000);
    env.coordinator.drain_queue().await.unwrap();
    let synced = env.article(&article.client_id).await;
    assert_eq!(synced.sync_status, SyncStatus::Synced);
    assert_eq!(synced.remote_version, 2);
}

#[tokio::test]
async fn illegal_transitions_are_rejected() -> anyhow::Result<()> {
    let env = env();
    let article = env.coordinator.create_article(ArticleDraft::new("t", "x")).await?;
    let mirror = env.coordinator.mirror();

    let err = mirror
        .transition(&article.client_id, SyncStatus::Synced)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::IllegalTransition {
            from: SyncStatus::Pending,
            to: SyncStatus::Synced
        }
    ));
    mirror.mark_conflict(&article.client_id, 1, 2).await?;
    assert!(mirror.mark_syncing(&article.client_id).await.is_err());
    assert_eq!(env.article(&article.client_id).await.sync_status, SyncStatus::Conflict);
    Ok(())
}

#[tokio::test]
async fn folders_sync_last_writer_wins() {
    let env = env();
    env.go_offline();
    let parent = env.coordinator.create_folder("work", None).await.unwrap();
    let child = env
        .coordinator
        .create_folder("drafts", Some(parent.client_id.clone()))
        .await
        .unwrap();
    env.coordinator.sync_folder(&parent.client_id).await.unwrap();
    env.coordinator.sync_folder(&child.client_id).await.unwrap();
    assert_eq!(env.coordinator.queue().len().await.unwrap(), 2);

    env.go_online();
    let report = env.coordinator.drain_queue().await.unwrap();
    assert_eq!(report.processed, 2);
    let remote_child = env.server().folder_by_client_id(&child.client_id).unwrap();
    assert_eq!(remote_child.parent_id.as_deref(), Some(parent.client_id.as_str()));

    env.coordinator.move_folder(&child.client_id, None).await.unwrap();
    env.coordinator.sync_folder(&child.client_id).await.unwrap();
    assert_eq!(env.server().folder_by_client_id(&child.client_id).unwrap().parent_id, None);
    let folders = env.coordinator.list_folders().await.unwrap();
    assert!(folders.iter().all(|f| f.sync_status == SyncStatus::Synced));
}

#[tokio::test]
async fn status_changes_are_broadcast_in_order() {
    let env = env();
    let mut events = env.coordinator.subscribe_events();
    let article = env
        .coordinator
        .create_article(ArticleDraft::new("t", "x"))
        .await
        .unwrap();
    env.coordinator.sync_now(&article.client_id).await.unwrap();
    env.coordinator
        .edit_article(&article.client_id, ArticlePatch::content("y"))
        .await
        .unwrap();

    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::StatusChanged {
            client_id, old, new, ..
        } = event
        {
            assert_eq!(client_id, article.client_id);
            transitions.push((old, new));
        }
    }
    assert_eq!(
        transitions,
        vec![
            (SyncStatus::Pending, SyncStatus::Syncing),
            (SyncStatus::Syncing, SyncStatus::Synced),
            (SyncStatus::Synced, SyncStatus::Pending),
        ]
    );
}
