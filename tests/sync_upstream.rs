//! End-to-end sync over real HTTP against the fake upstream.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use azdo_harness::checkpoint::CursorSet;
use azdo_harness::config::{ConnectorConfig, HttpConfig};
use azdo_harness::credentials::StaticCredentialProvider;
use azdo_harness::models::{BuiltDocument, EntityType, LastModified};
use azdo_harness::sink::CollectingSink;
use azdo_harness::sync::{EntityStatus, SyncOrchestrator, SyncState};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

fn until() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn orchestrator(server: &common::FakeServer, token: &str) -> SyncOrchestrator {
    let connector = ConnectorConfig::new("org", "proj");
    let http = HttpConfig {
        base_url: server.base_url(),
        release_base_url: server.base_url(),
        base_delay_ms: 0,
        max_delay_ms: 0,
        timeout_secs: 5,
        ..HttpConfig::default()
    };
    SyncOrchestrator::new(connector, http, Arc::new(StaticCredentialProvider::new(token)))
        .with_window_end(until())
}

#[tokio::test]
async fn full_sync_skips_deleted_item_and_advances_cursor() {
    let server = common::start().await;
    let mut sink = CollectingSink::new();
    let outcome = orchestrator(&server, common::PAT)
        .full_sync(CursorSet::new(), &mut sink, &CancellationToken::new())
        .await;

    assert_eq!(outcome.state, SyncState::Completed, "{:?}", outcome.error);
    assert_eq!(
        sink.ids(),
        vec!["work_item:org:proj:1", "work_item:org:proj:3"]
    );
    let report = outcome.report(EntityType::WorkItem).unwrap();
    assert_eq!(report.status, EntityStatus::Succeeded);
    assert_eq!(report.warnings, vec!["work item 2 not found; skipped".to_string()]);
    assert_eq!(outcome.cursors.get(EntityType::WorkItem), Some(until()));

    let docs: Vec<&BuiltDocument> = sink.documents().collect();
    let BuiltDocument::Full(first) = docs[0] else {
        panic!("expected a full document");
    };
    assert_eq!(first.title, "Bug 1: Item 1");
    assert!(first.content.contains("Description:\nDetails for item 1"));
    assert!(first.content.contains("- Grace: Looks good for 1"));
    assert_eq!(first.metadata["tags"], "ui, regression");
    assert!(matches!(first.last_modified, LastModified::Known(_)));

    let BuiltDocument::Full(third) = docs[1] else {
        panic!("expected a full document");
    };
    assert_eq!(third.title, "Bug 3: Item 3 [Resolved]");
    assert_eq!(third.metadata["is_resolved"], "true");
}

#[tokio::test]
async fn repeated_full_sync_rebuilds_identical_documents() {
    let server = common::start().await;
    let mut first = CollectingSink::new();
    let mut second = CollectingSink::new();
    for sink in [&mut first, &mut second] {
        let outcome = orchestrator(&server, common::PAT)
            .full_sync(CursorSet::new(), sink, &CancellationToken::new())
            .await;
        assert_eq!(outcome.state, SyncState::Completed, "{:?}", outcome.error);
    }

    assert_eq!(first.ids(), second.ids());
    let first: Vec<&BuiltDocument> = first.documents().collect();
    let second: Vec<&BuiltDocument> = second.documents().collect();
    assert_eq!(first, second);
    for (a, b) in first.iter().zip(&second) {
        let (BuiltDocument::Full(a), BuiltDocument::Full(b)) = (a, b) else {
            panic!("expected full documents");
        };
        assert_eq!(a.content_hash, b.content_hash);
    }
}

#[tokio::test]
async fn slim_sync_shares_ids_and_drops_content() {
    let server = common::start().await;
    let mut full = CollectingSink::new();
    let mut slim = CollectingSink::new();
    orchestrator(&server, common::PAT)
        .full_sync(CursorSet::new(), &mut full, &CancellationToken::new())
        .await;
    orchestrator(&server, common::PAT)
        .slim_sync(CursorSet::new(), &mut slim, &CancellationToken::new())
        .await;

    assert_eq!(full.ids(), slim.ids());
    for doc in slim.documents() {
        let BuiltDocument::Slim(doc) = doc else {
            panic!("expected a slim document");
        };
        let keys: Vec<&str> = doc.metadata.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["area_path", "type"]);
    }
}

#[tokio::test]
async fn rate_limited_query_is_retried() {
    let server = common::start().await;
    server.upstream.throttle_wiql.store(2, Ordering::SeqCst);

    let mut sink = CollectingSink::new();
    let outcome = orchestrator(&server, common::PAT)
        .slim_sync(CursorSet::new(), &mut sink, &CancellationToken::new())
        .await;

    assert_eq!(outcome.state, SyncState::Completed, "{:?}", outcome.error);
    assert_eq!(server.upstream.wiql_calls.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.throttled_responses, 2);
    assert_eq!(sink.ids().len(), 2);
}

#[tokio::test]
async fn exhausted_retries_fail_only_the_entity_type() {
    let server = common::start().await;
    server.upstream.throttle_wiql.store(100, Ordering::SeqCst);

    let mut cursors = CursorSet::new();
    let earlier = until() - chrono::Duration::days(7);
    cursors.advance(EntityType::WorkItem, earlier);

    let outcome = orchestrator(&server, common::PAT)
        .slim_sync(cursors, &mut CollectingSink::new(), &CancellationToken::new())
        .await;

    assert_eq!(outcome.state, SyncState::Completed);
    assert!(matches!(
        outcome.report(EntityType::WorkItem).unwrap().status,
        EntityStatus::Failed(_)
    ));
    assert_eq!(server.upstream.wiql_calls.load(Ordering::SeqCst), 4);
    assert_eq!(outcome.cursors.get(EntityType::WorkItem), Some(earlier));
}

#[tokio::test]
async fn rejected_token_fails_the_run() {
    let server = common::start().await;
    let mut sink = CollectingSink::new();
    let outcome = orchestrator(&server, "wrong")
        .full_sync(CursorSet::new(), &mut sink, &CancellationToken::new())
        .await;

    assert_eq!(outcome.state, SyncState::Failed);
    assert!(outcome.error.as_deref().unwrap_or_default().contains("credential"));
    assert!(outcome.cursors.is_empty());
    assert_eq!(sink.documents().count(), 0);
    // 401 is never retried.
    assert_eq!(server.upstream.wiql_calls.load(Ordering::SeqCst), 0);
}
