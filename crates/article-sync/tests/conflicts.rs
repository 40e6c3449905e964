mod common;

use std::time::Duration;

use article_sync::{ArticlePatch, Resolution, SyncError, SyncEvent, SyncStatus};
use common::{env, TestEnv};

/// 建立一个冲突：本地 v2 与远端 v2 不同
async fn conflicted(env: &TestEnv) -> (String, i64) {
    let article = env.synced_article("notes", "shared v1").await;
    let server_id = article.server_id.unwrap();
    env.coordinator
        .edit_article(&article.client_id, ArticlePatch::content("mine v2"))
        .await
        .unwrap();
    env.server().remote_edit(server_id, "theirs v2", "other-device");
    let conflicted = env.coordinator.sync_now(&article.client_id).await.unwrap();
    assert_eq!(conflicted.sync_status, SyncStatus::Conflict);
    (article.client_id, server_id)
}

#[tokio::test]
async fn use_local_resyncs_and_acks() {
    let env = env();
    let (client_id, server_id) = conflicted(&env).await;

    let resolved = env.coordinator.resolver().use_local_version(&client_id).await.unwrap();
    assert_eq!(resolved.sync_status, SyncStatus::Synced);
    assert_eq!(resolved.content, "mine v2");
    assert_eq!(resolved.local_version, 3);
    assert_eq!(resolved.remote_version, 3);
    assert!(!resolved.has_conflict);

    let remote = env.server().article(server_id).unwrap();
    assert_eq!(remote.content, "mine v2");
    assert_eq!(remote.version, 3);
    assert_eq!(env.server().resolutions(), vec![(server_id, Resolution::UseLocal, 3)]);
}

#[tokio::test]
async fn resolving_twice_is_idempotent() {
    let env = env();
    let (client_id, _) = conflicted(&env).await;
    let resolver = env.coordinator.resolver();

    let first = resolver.use_remote_version(&client_id).await.unwrap();
    let calls = env.transport.total_calls();
    let second = resolver.use_remote_version(&client_id).await.unwrap();
    let third = resolver.use_local_version(&client_id).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first, third);
    assert_eq!(env.transport.total_calls(), calls);
    assert_eq!(env.server().resolutions().len(), 1);
}

#[tokio::test]
async fn concurrent_resolution_is_rejected() {
    let env = env();
    let (client_id, _) = conflicted(&env).await;

    let gate = env.transport.gate_next("fetch");
    let resolver = env.coordinator.resolver();
    let first = {
        let resolver = resolver.clone();
        let client_id = client_id.clone();
        tokio::spawn(async move { resolver.use_remote_version(&client_id).await })
    };
    gate.wait_entered().await;

    let err = resolver.use_local_version(&client_id).await.unwrap_err();
    assert!(matches!(err, SyncError::ResolutionInProgress(ref id) if id == &client_id));

    gate.release();
    let resolved = first.await.unwrap().unwrap();
    assert_eq!(resolved.sync_status, SyncStatus::Synced);
    assert_eq!(resolved.content, "theirs v2");
}

#[tokio::test]
async fn edits_during_conflict_stay_local() {
    let env = env();
    let (client_id, server_id) = conflicted(&env).await;

    let edited = env
        .coordinator
        .edit_article(&client_id, ArticlePatch::content("mine v3"))
        .await
        .unwrap();
    assert_eq!(edited.sync_status, SyncStatus::Conflict);
    assert_eq!(edited.local_version, 3);
    assert_eq!(edited.remote_version, 2);

    env.coordinator.drain_queue().await.unwrap();
    assert_eq!(env.server().article(server_id).unwrap().content, "theirs v2");

    // 保留本地时带上冲突期间的编辑
    let resolved = env.coordinator.resolver().use_local_version(&client_id).await.unwrap();
    assert_eq!(resolved.content, "mine v3");
    assert_eq!(resolved.local_version, 4);
    assert_eq!(env.server().article(server_id).unwrap().content, "mine v3");
}

#[tokio::test]
async fn force_push_requires_resolution_first() {
    let env = env();
    let (client_id, _) = conflicted(&env).await;
    let err = env.coordinator.force_push(&client_id).await.unwrap_err();
    assert!(matches!(err, SyncError::VersionConflict { server_version: 2 }));
    assert!(!err.failure_kind().is_retryable());
    assert_eq!(env.article(&client_id).await.sync_status, SyncStatus::Conflict);
}

#[tokio::test]
async fn check_fast_forwards_clean_article() {
    let env = env();
    let article = env.synced_article("notes", "v1").await;
    let server_id = article.server_id.unwrap();
    env.server().remote_edit(server_id, "remote v2", "other-device");
    let mut events = env.coordinator.subscribe_events();

    let check = env.coordinator.conflict_detector().check(&article.client_id).await.unwrap();
    assert!(!check.has_conflict);
    assert_eq!(check.sync_status, SyncStatus::Synced);

    let local = env.article(&article.client_id).await;
    assert_eq!(local.content, "remote v2");
    assert_eq!(local.local_version, 2);
    assert!(local.is_clean());
    assert!(matches!(
        events.try_recv().unwrap(),
        SyncEvent::RemoteUpdated { remote_version: 2, .. }
    ));
}

#[tokio::test]
async fn check_marks_conflict_when_local_is_dirty() {
    let env = env();
    let article = env.synced_article("notes", "v1").await;
    let server_id = article.server_id.unwrap();
    env.go_offline();
    env.coordinator
        .edit_article(&article.client_id, ArticlePatch::content("offline edit"))
        .await
        .unwrap();
    env.server().remote_edit(server_id, "remote v2", "other-device");
    env.go_online();

    let sync_updates = env.transport.call_count("sync_update");
    let check = env.coordinator.conflict_detector().check(&article.client_id).await.unwrap();
    assert!(check.has_conflict);
    assert_eq!(check.sync_status, SyncStatus::Conflict);
    // 探测只读元数据，不写入
    assert_eq!(env.transport.call_count("sync_update"), sync_updates);
    assert_eq!(env.transport.call_count("check_conflict"), 1);

    let local = env.article(&article.client_id).await;
    assert_eq!(local.content, "offline edit");
    assert_eq!(local.conflict_remote_content.as_deref(), Some("remote v2"));
}

#[tokio::test]
async fn check_without_remote_change_reports_clean() {
    let env = env();
    let article = env.synced_article("notes", "v1").await;
    let check = env.coordinator.conflict_detector().check(&article.client_id).await.unwrap();
    assert!(!check.has_conflict);
    assert!(check.remote_updated_at.is_some());

    // 从未同步的文章不做探测
    env.go_offline();
    let local_only = env
        .coordinator
        .create_article(article_sync::ArticleDraft::new("draft", "x"))
        .await
        .unwrap();
    let check = env.coordinator.conflict_detector().check(&local_only.client_id).await.unwrap();
    assert!(!check.has_conflict);
    assert_eq!(check.remote_updated_at, None);
}

#[tokio::test(start_paused = true)]
async fn watch_polls_until_dropped() {
    let env = env();
    let article = env.synced_article("notes", "v1").await;
    let server_id = article.server_id.unwrap();
    env.coordinator
        .edit_article(&article.client_id, ArticlePatch::content("mine"))
        .await
        .unwrap();
    env.server().remote_edit(server_id, "theirs", "other-device");

    let mut watch = env
        .coordinator
        .conflict_detector()
        .watch_every(&article.client_id, Duration::from_secs(5));
    assert!(watch.latest().is_none());
    let check = watch.changed().await.unwrap();
    assert!(check.has_conflict);

    drop(watch);
    let checks = env.transport.call_count("check_conflict");
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(env.transport.call_count("check_conflict"), checks);
}
