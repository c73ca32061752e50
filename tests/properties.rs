//! The engine's testable properties, checked end to end.

use std::sync::Arc;
use std::time::Duration;

use bayou_control::{
    BodyDelta, CancelToken, ComplexRegistry, Delta, DocComplex, DocStatus, EngineConfig,
    ErrorKind, MemoryStore, Snapshot,
};
use uuid::Uuid;

fn never() -> CancelToken {
    CancelToken::never()
}

async fn new_doc() -> (ComplexRegistry, Arc<DocComplex>) {
    let registry = ComplexRegistry::new(Arc::new(MemoryStore::new()), EngineConfig::default());
    let complex = registry.create(Uuid::new_v4(), None).await.unwrap();
    (registry, complex)
}

/// Append a few edits building "abcde", one character per revision.
async fn grow_body(complex: &DocComplex, chars: &str) {
    let body = complex.body();
    let mut len = 0u64;
    for (i, c) in chars.chars().enumerate() {
        let edit = BodyDelta::builder().retain(len).insert(&c.to_string()).build();
        body.apply_change(i as u64, edit, Some("author".to_string()), &never())
            .await
            .unwrap();
        len += 1;
    }
}

// ── Compose consistency ──────────────────────────────────────────────

#[tokio::test]
async fn snapshot_equals_composed_changes() {
    let (_r, complex) = new_doc().await;
    grow_body(&complex, "abcde").await;
    let body = complex.body();

    for rev in 0..=5u64 {
        let snapshot = body.get_snapshot(Some(rev)).await.unwrap();
        let composed = body
            .get_composed_changes(&BodyDelta::empty(), 0, rev + 1)
            .unwrap();
        assert_eq!(
            snapshot.contents, composed,
            "snapshot {rev} must equal the composition of changes 0..={rev}"
        );
    }
}

// ── Head monotonicity ────────────────────────────────────────────────

#[tokio::test]
async fn head_never_decreases() {
    let (_r, complex) = new_doc().await;
    let body = complex.body().clone();

    let writer = {
        let complex = complex.clone();
        tokio::spawn(async move { grow_body(&complex, "abcdefgh").await })
    };

    let mut last = 0;
    for _ in 0..50 {
        let head = body.current_rev_num().unwrap();
        assert!(head >= last, "head went backwards: {last} -> {head}");
        last = head;
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();
    assert_eq!(body.current_rev_num().unwrap(), 8);
}

// ── Correction law ───────────────────────────────────────────────────

#[tokio::test]
async fn correction_law_holds() {
    let (_r, complex) = new_doc().await;
    grow_body(&complex, "abc").await;
    let body = complex.body();

    // A stale edit against revision 1 while the head is at 3.
    let base_rev = 1;
    let stale = BodyDelta::builder().retain(1).insert("ZZ").build();

    let base: Snapshot<BodyDelta> = body.get_snapshot(Some(base_rev)).await.unwrap();
    let result = body
        .apply_change(base_rev, stale.clone(), Some("late".to_string()), &never())
        .await
        .unwrap();

    let head = body.get_snapshot(Some(result.rev_num)).await.unwrap();
    let reconciled = base
        .contents
        .compose(&stale)
        .unwrap()
        .compose(&result.delta)
        .unwrap();
    assert_eq!(
        reconciled, head.contents,
        "expected ∘ correction must equal the authoritative head"
    );
}

// ── No-op short-circuit ──────────────────────────────────────────────

#[tokio::test]
async fn empty_apply_does_not_grow_log() {
    let (_r, complex) = new_doc().await;
    grow_body(&complex, "ab").await;
    let body = complex.body();

    let head = body.current_rev_num().unwrap();
    let result = body
        .apply_change(head, BodyDelta::empty(), Some("a".to_string()), &never())
        .await
        .unwrap();
    assert_eq!(result.rev_num, head);
    assert!(result.delta.is_empty());
    assert_eq!(body.current_rev_num().unwrap(), head);
}

// ── At-most-once commit ──────────────────────────────────────────────

#[tokio::test]
async fn concurrent_appliers_never_share_a_revision() {
    let (_r, complex) = new_doc().await;
    let body = complex.body();

    // Eight tasks all basing edits on revision 0.
    let mut tasks = Vec::new();
    for i in 0..8 {
        let body = body.clone();
        tasks.push(tokio::spawn(async move {
            let edit = BodyDelta::builder().insert(&i.to_string()).build();
            body.apply_change(0, edit, Some(format!("a{i}")), &never())
                .await
                .unwrap()
                .rev_num
        }));
    }
    let mut revs = Vec::new();
    for task in tasks {
        revs.push(task.await.unwrap());
    }

    revs.sort_unstable();
    revs.dedup();
    assert_eq!(revs.len(), 8, "every commit must land a distinct revision");
    assert_eq!(body.current_rev_num().unwrap(), 8);

    // Each revision reads back exactly one stored change.
    for rev in 1..=8 {
        let change = body.get_change(rev).unwrap();
        assert_eq!(change.rev_num, rev);
    }
    // All eight inserted characters survive in the head.
    let text = body
        .get_snapshot(None)
        .await
        .unwrap()
        .contents
        .text()
        .unwrap();
    assert_eq!(text.len(), 8);
}

// ── Long-poll minimality ─────────────────────────────────────────────

#[tokio::test]
async fn change_after_returns_the_head_it_unblocked_on() {
    let (_r, complex) = new_doc().await;
    let body = complex.body();

    let waiter = {
        let body = body.clone();
        tokio::spawn(async move {
            body.get_change_after(0, Some(Duration::from_secs(10)), &never())
                .await
        })
    };
    tokio::task::yield_now().await;

    body.apply_change(0, BodyDelta::builder().insert("q").build(), None, &never())
        .await
        .unwrap();

    let change = waiter.await.unwrap().unwrap();
    assert!(change.rev_num > 0);
    assert_eq!(change.rev_num, body.current_rev_num().unwrap());
}

#[tokio::test]
async fn change_after_composes_the_whole_gap() {
    let (_r, complex) = new_doc().await;
    grow_body(&complex, "abcd").await;
    let body = complex.body();

    let change = body
        .get_change_after(1, Some(Duration::from_secs(1)), &never())
        .await
        .unwrap();
    assert_eq!(change.rev_num, 4);

    let base = body.get_snapshot(Some(1)).await.unwrap();
    let caught_up = base.contents.compose(&change.delta).unwrap();
    assert_eq!(caught_up.text().unwrap(), "abcd");
}

// ── Idle reaping ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn idle_carets_eventually_disappear() {
    let (_r, complex) = new_doc().await;
    let session = complex
        .make_new_session("alice".to_string(), &never())
        .await
        .unwrap();
    session.update_caret(1, 0, 0, &never()).await.unwrap();

    // The background reaper alone must remove the caret once idle.
    tokio::time::sleep(Duration::from_secs(12 * 60)).await;

    let carets = complex.caret().carets(None).await.unwrap();
    assert!(!carets.contains_key(session.caret_id()));
}

#[tokio::test(start_paused = true)]
async fn active_carets_survive_the_reaper() {
    let (_r, complex) = new_doc().await;
    let session = complex
        .make_new_session("alice".to_string(), &never())
        .await
        .unwrap();

    // Keep touching the caret more often than the threshold.
    for _ in 0..15 {
        tokio::time::sleep(Duration::from_secs(60)).await;
        session.update_caret(1, 0, 0, &never()).await.unwrap();
    }

    let carets = complex.caret().carets(None).await.unwrap();
    assert!(carets.contains_key(session.caret_id()));
}

// ── Format-version gating ────────────────────────────────────────────

#[tokio::test]
async fn format_version_mismatch_opens_as_migrate() {
    let source = Arc::new(MemoryStore::new());
    let doc_id = Uuid::new_v4();

    {
        let old_engine = ComplexRegistry::new(
            source.clone(),
            EngineConfig {
                format_version: "0".to_string(),
                ..EngineConfig::default()
            },
        );
        old_engine.create(doc_id, None).await.unwrap();
    }

    let engine = ComplexRegistry::new(source, EngineConfig::default());
    let outcome = engine.open(doc_id).await;
    assert_eq!(outcome.status, DocStatus::Migrate);
    assert!(
        outcome.complex.is_none(),
        "a migrate-status document must expose no mutable surface"
    );
}

// ── Error taxonomy spot checks ───────────────────────────────────────

#[tokio::test]
async fn out_of_range_reads_fail_cleanly() {
    let (_r, complex) = new_doc().await;
    let body = complex.body();

    let err = body.get_snapshot(Some(3)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RevisionNotAvailable);
    assert_eq!(err.kind().as_str(), "revision_not_available");

    let err = body.get_change(9).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RevisionNotAvailable);

    let err = body
        .apply_change(7, BodyDelta::builder().insert("x").build(), None, &never())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RevisionNotAvailable);
}

#[tokio::test(start_paused = true)]
async fn long_poll_times_out_with_timed_out() {
    let (_r, complex) = new_doc().await;
    let err = complex
        .body()
        .get_change_after(0, Some(Duration::from_secs(30)), &never())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);
}
