use std::time::Duration;

use super::*;
use crate::sync::remote::DocumentPayload;
use crate::sync::testing::{FakeSink, FakeSource, WORKSPACE};

const T0: &str = "2024-03-01 10:00:00";
const T1: &str = "2024-03-01 11:00:00";

struct Harness {
    source: Arc<FakeSource>,
    sink: Arc<FakeSink>,
    engine: SyncEngine,
}

async fn harness(options: SyncOptions) -> Harness {
    let source = Arc::new(FakeSource::new());
    let sink = Arc::new(FakeSink::new());
    let ledger = LedgerStore::in_memory().await.unwrap();
    let engine = SyncEngine::new(source.clone(), sink.clone(), ledger)
        .with_retry(RetryPolicy::new(2, Duration::ZERO, Duration::ZERO, false))
        .with_options(options);
    Harness {
        source,
        sink,
        engine,
    }
}

fn root() -> SyncPair {
    SyncPair::new("General", "root")
}

fn recursive() -> SyncOptions {
    SyncOptions {
        recursive: true,
        ..SyncOptions::default()
    }
}

#[tokio::test]
async fn second_pass_without_changes_is_a_noop() {
    let h = harness(recursive()).await;
    h.source.put_file(WORKSPACE, None, "f1", "a.md", T0, "a");
    h.source.put_folder(WORKSPACE, None, "1", "Docs");
    h.source.put_file(WORKSPACE, Some("1"), "f2", "b.pdf", T0, "b");

    let first = h.engine.run_pair(&root()).await.unwrap();
    h.sink.clear_calls();
    let second = h.engine.run_pair(&root()).await.unwrap();

    assert_eq!(first.created, 2);
    assert_eq!(second.created + second.updated + second.deleted, 0);
    assert_eq!(second.unchanged, 2);
    assert!(second.reports.is_empty());
    assert!(h.sink.calls().is_empty());
}

#[tokio::test]
async fn ledger_fingerprints_match_enumeration_after_pass() {
    let h = harness(SyncOptions::default()).await;
    h.source.put_file(WORKSPACE, None, "f1", "a.md", T0, "a");
    h.source.put_file(WORKSPACE, None, "f2", "b.md", T1, "b");

    let summary = h.engine.run_pair(&root()).await.unwrap();
    let entries = h.engine.ledger().load_scope(&summary.scope).await.unwrap();

    assert_eq!(summary.scope, "100:root");
    assert_eq!(entries["f1"].last_synced_modified_at, Some(1_709_287_200_000));
    assert_eq!(entries["f2"].last_synced_modified_at, Some(1_709_290_800_000));
}

#[tokio::test]
async fn modified_file_is_replaced_in_place() {
    let h = harness(SyncOptions::default()).await;
    h.source.put_file(WORKSPACE, None, "f1", "a.md", T0, "v1");
    h.engine.run_pair(&root()).await.unwrap();

    h.source.put_file(WORKSPACE, None, "f1", "a.md", T1, "v2");
    let summary = h.engine.run_pair(&root()).await.unwrap();

    assert_eq!(summary.updated, 1);
    assert_eq!(h.sink.len(), 1);
    let entry = h.engine.ledger().get("100:root", "f1").await.unwrap().unwrap();
    let document = h.sink.document(&entry.sink_document_id).unwrap();
    assert_eq!(document.payload, DocumentPayload::File(b"v2".to_vec()));
}

#[tokio::test]
async fn removed_file_is_deleted_from_sink_and_ledger() {
    let h = harness(SyncOptions::default()).await;
    h.source.put_file(WORKSPACE, None, "f1", "a.md", T0, "a");
    h.engine.run_pair(&root()).await.unwrap();

    h.source.remove_file(WORKSPACE, None, "f1");
    let summary = h.engine.run_pair(&root()).await.unwrap();

    assert_eq!(summary.deleted, 1);
    assert_eq!(h.sink.len(), 0);
    assert!(h.engine.ledger().get("100:root", "f1").await.unwrap().is_none());
}

#[tokio::test]
async fn failing_file_does_not_block_others_and_is_retried_next_pass() {
    let h = harness(SyncOptions::default()).await;
    h.source.put_file(WORKSPACE, None, "f1", "a.md", T0, "a");
    h.source.put_file(WORKSPACE, None, "f2", "b.md", T0, "b");
    h.source
        .fail_download("f1", RemoteError::transient("reset by peer"));

    let first = h.engine.run_pair(&root()).await.unwrap();
    assert_eq!(first.created, 1);
    assert_eq!(first.failed, 1);

    h.source.heal_download("f1");
    let second = h.engine.run_pair(&root()).await.unwrap();
    assert_eq!(second.created, 1);
    assert_eq!(second.failed, 0);
    assert_eq!(h.sink.len(), 2);
}

#[tokio::test]
async fn unsupported_files_are_skipped_every_pass() {
    let h = harness(SyncOptions::default()).await;
    h.source.put_file(WORKSPACE, None, "f1", "deck.pptx", T0, "zip");

    let first = h.engine.run_pair(&root()).await.unwrap();
    let second = h.engine.run_pair(&root()).await.unwrap();

    assert_eq!(first.skipped, 1);
    assert_eq!(second.skipped, 1);
    assert_eq!(h.sink.len(), 0);
    assert_eq!(h.source.downloads(), 0);
}

#[tokio::test]
async fn lost_ledger_adopts_existing_documents() {
    let h = harness(SyncOptions::default()).await;
    h.sink.insert_document("legacy", "[100:root] a.md", 5);
    h.source.put_file(WORKSPACE, None, "f1", "a.md", T0, "a");

    let summary = h.engine.run_pair(&root()).await.unwrap();

    assert_eq!(summary.created, 1);
    assert_eq!(h.sink.len(), 1);
    assert_eq!(h.sink.calls(), vec!["replace:legacy".to_string()]);
}

#[tokio::test]
async fn pairs_use_separate_ledger_scopes() {
    let h = harness(SyncOptions::default()).await;
    h.source.put_folder(WORKSPACE, None, "1", "Docs");
    h.source.put_file(WORKSPACE, None, "f1", "a.md", T0, "a");
    h.source.put_file(WORKSPACE, Some("1"), "f2", "b.md", T0, "b");

    let report = h
        .engine
        .run(&[root(), SyncPair::new("General", "Docs")])
        .await
        .unwrap();

    assert_eq!(report.passes.len(), 2);
    assert_eq!(report.passes[0].scope, "100:root");
    assert_eq!(report.passes[1].scope, "100:1");
    let root_entries = h.engine.ledger().load_scope("100:root").await.unwrap();
    let docs_entries = h.engine.ledger().load_scope("100:1").await.unwrap();
    assert_eq!(root_entries.len(), 1);
    assert_eq!(docs_entries.len(), 1);
    assert!(!report.has_failures());
}

#[tokio::test]
async fn failing_pair_is_reported_and_next_pair_runs() {
    let h = harness(SyncOptions::default()).await;
    h.source.put_file(WORKSPACE, None, "f1", "a.md", T0, "a");

    let report = h
        .engine
        .run(&[SyncPair::new("General", "Nowhere"), root()])
        .await
        .unwrap();

    assert_eq!(report.failed_pairs.len(), 1);
    assert!(report.failed_pairs[0].error.contains("Nowhere"));
    assert_eq!(report.passes.len(), 1);
    assert_eq!(report.passes[0].created, 1);
    assert!(report.has_failures());
}

#[tokio::test]
async fn unknown_workspace_fails_only_that_pair() {
    let h = harness(SyncOptions::default()).await;

    let report = h
        .engine
        .run(&[SyncPair::new("Sales", "root"), root()])
        .await
        .unwrap();

    assert_eq!(report.failed_pairs.len(), 1);
    assert_eq!(report.passes.len(), 1);
}

#[tokio::test]
async fn remove_duplicates_runs_after_all_pairs() {
    let h = harness(SyncOptions {
        remove_duplicates: true,
        ..SyncOptions::default()
    })
    .await;
    h.source.put_file(WORKSPACE, None, "f1", "a.md", T0, "a");
    h.engine.run_pair(&root()).await.unwrap();
    h.sink.insert_document("stale", "[100:root] a.md", 1);

    let report = h.engine.run(&[root()]).await.unwrap();

    let dedup = report.dedup.unwrap();
    assert_eq!(dedup.groups, 1);
    assert_eq!(dedup.removed(), 1);
    assert!(h.sink.document("stale").is_none());
    assert_eq!(h.sink.len(), 1);
}

#[tokio::test]
async fn same_name_in_two_folders_stays_two_documents() {
    let h = harness(SyncOptions {
        recursive: true,
        remove_duplicates: true,
        ..SyncOptions::default()
    })
    .await;
    h.source.put_folder(WORKSPACE, None, "1", "A");
    h.source.put_folder(WORKSPACE, None, "2", "B");
    h.source.put_file(WORKSPACE, Some("1"), "fa", "report.md", T0, "from A");
    h.source.put_file(WORKSPACE, Some("2"), "fb", "report.md", T0, "from B");

    let first = h.engine.run(&[root()]).await.unwrap();
    let fa = h.engine.ledger().get("100:root", "fa").await.unwrap().unwrap();
    let fb = h.engine.ledger().get("100:root", "fb").await.unwrap().unwrap();

    assert_eq!(first.passes[0].created, 2);
    assert_eq!(first.dedup.unwrap().removed(), 0);
    assert_ne!(fa.sink_document_id, fb.sink_document_id);
    assert_eq!(h.sink.len(), 2);

    h.source.remove_file(WORKSPACE, Some("1"), "fa");
    let second = h.engine.run(&[root()]).await.unwrap();
    let third = h.engine.run(&[root()]).await.unwrap();

    assert_eq!(second.passes[0].deleted, 1);
    assert_eq!(third.passes[0].unchanged, 1);
    assert_eq!(h.sink.len(), 1);
    let kept = h.sink.document(&fb.sink_document_id).unwrap();
    assert_eq!(kept.name, "[100:root > B] report.md");
    assert_eq!(kept.payload, DocumentPayload::File(b"from B".to_vec()));
}

#[test]
fn summary_line_lists_every_counter() {
    let summary = PassSummary {
        pair: "General/root".into(),
        created: 2,
        unchanged: 3,
        failed: 1,
        ..PassSummary::default()
    };
    assert_eq!(
        summary.to_string(),
        "General/root: 2 created, 0 updated, 0 deleted, 3 unchanged, 0 skipped, 1 failed"
    );
}
