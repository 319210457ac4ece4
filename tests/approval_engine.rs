use std::sync::Arc;
use std::time::Duration;

use affiliate_network::approval::{ApprovalEngine, FetchOutcome};
use affiliate_network::config::EngineSettings;
use affiliate_network::error::EngineError;
use affiliate_network::ledger::CommissionScope;
use affiliate_network::memory::MemoryStore;
use affiliate_network::source::CommissionSource;
use affiliate_network::types::CommissionStatus;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

fn store_with_pending(count: usize) -> (Arc<MemoryStore>, Vec<Uuid>) {
    let store = Arc::new(MemoryStore::new());
    store.add_affiliate(1, "ALICE", "Alice", None);
    store.add_affiliate(2, "BOB", "Bob", Some(1));
    store.add_affiliate(3, "CAROL", "Carol", Some(2));
    let ids = (0..count)
        .map(|i| {
            let beneficiary = if i % 2 == 0 { 1 } else { 2 };
            store.add_commission(beneficiary, 3, 1, 1_000 * (i as i64 + 1))
        })
        .collect();
    (store, ids)
}

fn engine(store: &Arc<MemoryStore>) -> Arc<ApprovalEngine> {
    Arc::new(ApprovalEngine::new(store.clone(), EngineSettings::default()))
}

#[tokio::test]
async fn second_approval_of_same_record_conflicts() {
    let (store, ids) = store_with_pending(1);
    let engine = engine(&store);
    assert_ok!(engine.fetch_grouped(&CommissionScope::all()).await);

    let report = assert_ok!(engine.approve(ids[0], Some("checked")).await);
    assert_eq!(report.id, ids[0]);

    let err = assert_err!(engine.approve(ids[0], None).await);
    assert!(matches!(err, EngineError::Conflict(_)), "got {err:?}");

    let record = store.commission(ids[0]).unwrap();
    assert_eq!(record.status, CommissionStatus::Approved);
    assert_eq!(record.note.as_deref(), Some("checked"));
    assert!(record.approved_at.is_some());
}

#[tokio::test]
async fn unknown_commission_is_not_found() {
    let (store, _) = store_with_pending(1);
    let engine = engine(&store);
    let err = assert_err!(engine.approve(Uuid::new_v4(), None).await);
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn reject_requires_reason_and_is_terminal() {
    let (store, ids) = store_with_pending(1);
    let engine = engine(&store);

    let err = assert_err!(engine.reject(ids[0], "   ").await);
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(store.commission(ids[0]).unwrap().status, CommissionStatus::Pending);

    assert_ok!(engine.reject(ids[0], "duplicate order").await);
    let record = store.commission(ids[0]).unwrap();
    assert_eq!(record.status, CommissionStatus::Rejected);
    assert_eq!(record.rejection_reason.as_deref(), Some("duplicate order"));

    let err = assert_err!(engine.approve(ids[0], None).await);
    assert!(matches!(err, EngineError::Conflict(_)));
}

#[tokio::test]
async fn batch_reports_each_commission() {
    let (store, ids) = store_with_pending(5);
    let engine = engine(&store);
    assert_ok!(store.approve_commission(ids[2], None).await);
    assert_ok!(engine.fetch_grouped(&CommissionScope::all()).await);

    let report = assert_ok!(engine.batch_approve(&ids).await);
    assert_eq!(report.succeeded.len(), 4);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].id, ids[2]);
    assert!(matches!(report.failed[0].error, EngineError::Conflict(_)));
    assert_eq!(report.message, "4 commission(s) approved, 1 failed");

    for id in &ids {
        assert_eq!(store.commission(*id).unwrap().status, CommissionStatus::Approved);
    }
    assert_eq!(engine.summary().unwrap().total_pending_count, 0);
}

#[tokio::test]
async fn empty_batch_is_rejected_without_calling_the_source() {
    let (store, _) = store_with_pending(2);
    let engine = engine(&store);
    let err = assert_err!(engine.batch_approve(&[]).await);
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(store.grouped_fetch_count(), 0);
}

#[tokio::test]
async fn mutation_refetches_instead_of_patching_totals() {
    let (store, ids) = store_with_pending(4);
    let engine = engine(&store);
    assert_ok!(engine.fetch_grouped(&CommissionScope::all()).await);
    assert_eq!(store.grouped_fetch_count(), 1);

    // Another admin acts behind the engine's back.
    assert_ok!(store.reject_commission(ids[3], "fraud").await);

    assert_ok!(engine.approve(ids[0], None).await);
    assert_eq!(store.grouped_fetch_count(), 2);

    let expected = assert_ok!(store.pending_grouped(&CommissionScope::all()).await);
    assert_eq!(engine.summary(), Some(expected.summary));
    assert_eq!(expected.summary.total_pending_count, 2);
    assert_eq!(expected.summary.total_pending_amount, 2_000 + 3_000);
}

#[tokio::test]
async fn mutation_invalidates_every_cached_scope() {
    let (store, ids) = store_with_pending(2);
    let engine = engine(&store);
    let bob = CommissionScope::all().with_search("bob");
    assert_ok!(engine.fetch_grouped(&bob).await);
    assert_eq!(engine.summary().unwrap().total_pending_count, 1);
    assert_ok!(engine.fetch_grouped(&CommissionScope::all()).await);

    // Bob's commission is approved while another scope is on screen.
    assert_ok!(engine.approve(ids[1], None).await);

    assert_eq!(assert_ok!(engine.fetch_grouped(&bob).await), FetchOutcome::Fetched);
    let expected = assert_ok!(store.pending_grouped(&bob).await);
    assert_eq!(expected.summary.total_pending_count, 0);
    assert_eq!(engine.summary(), Some(expected.summary));
    assert!(engine.toggle_selection(ids[1]).is_err());
}

#[tokio::test(start_paused = true)]
async fn concurrent_approval_of_same_record_is_refused() {
    let (store, ids) = store_with_pending(1);
    store.set_write_latency(Duration::from_secs(1));
    let engine = engine(&store);
    assert_ok!(engine.fetch_grouped(&CommissionScope::all()).await);

    let (first, second) = tokio::join!(engine.approve(ids[0], None), engine.approve(ids[0], None));
    assert_ok!(first);
    let err = assert_err!(second);
    assert!(matches!(err, EngineError::Busy(_)), "got {err:?}");
    assert!(!engine.is_submitting(ids[0]));
    assert_eq!(store.commission(ids[0]).unwrap().status, CommissionStatus::Approved);
}

#[tokio::test]
async fn selections_of_vanished_records_are_dropped() {
    let (store, ids) = store_with_pending(5);
    let engine = engine(&store);
    assert_ok!(engine.fetch_grouped(&CommissionScope::all()).await);
    assert_eq!(engine.select_all(), 5);

    assert_ok!(store.approve_commission(ids[0], None).await);
    assert_ok!(store.approve_commission(ids[1], None).await);
    assert_ok!(engine.refresh().await);

    let mut selected = engine.selected_ids();
    selected.sort();
    let mut expected = ids[2..].to_vec();
    expected.sort();
    assert_eq!(selected, expected);
    assert_eq!(engine.selected_total_amount(), 3_000 + 4_000 + 5_000);

    let report = assert_ok!(engine.approve_selected().await);
    assert!(report.is_complete_success());
    assert!(engine.selected_ids().is_empty());
}

#[tokio::test]
async fn selection_requires_loaded_records() {
    let (store, ids) = store_with_pending(3);
    let engine = engine(&store);
    let err = assert_err!(engine.toggle_selection(ids[0]));
    assert!(matches!(err, EngineError::NotFound(_)));

    assert_ok!(engine.fetch_grouped(&CommissionScope::all()).await);
    assert!(assert_ok!(engine.toggle_selection(ids[0])));
    assert!(!assert_ok!(engine.toggle_selection(ids[0])));

    assert_eq!(assert_ok!(engine.select_group(2)), 1);
    assert_eq!(engine.selected_ids(), vec![ids[1]]);
    assert!(engine.select_group(42).is_err());

    engine.clear_selection();
    assert!(engine.selected_ids().is_empty());
}

#[tokio::test]
async fn cached_view_is_served_within_staleness() {
    let (store, _) = store_with_pending(2);
    let engine = engine(&store);
    let scope = CommissionScope::all();
    assert_eq!(assert_ok!(engine.fetch_grouped(&scope).await), FetchOutcome::Fetched);
    assert_eq!(assert_ok!(engine.fetch_grouped(&scope).await), FetchOutcome::Cached);
    assert_eq!(assert_ok!(engine.reload(&scope).await), FetchOutcome::Fetched);
    assert_eq!(store.grouped_fetch_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn stale_cache_is_refetched() {
    let (store, _) = store_with_pending(2);
    let engine = engine(&store);
    let scope = CommissionScope::all();
    assert_ok!(engine.fetch_grouped(&scope).await);

    tokio::time::advance(Duration::from_secs(301)).await;
    assert_eq!(assert_ok!(engine.fetch_grouped(&scope).await), FetchOutcome::Fetched);
    assert_eq!(store.grouped_fetch_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn rapid_search_input_issues_one_query_with_final_text() {
    let (store, _) = store_with_pending(4);
    let engine = engine(&store);
    assert_ok!(engine.fetch_grouped(&CommissionScope::all()).await);

    let input = engine.search_input();
    for text in ["b", "bo", "bob", "bo", "bob"] {
        input.push(text.to_string());
        tokio::time::sleep(Duration::from_millis(80)).await;
    }
    assert_eq!(store.grouped_fetch_count(), 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    input.flush().await;

    let scopes = store.grouped_fetch_scopes();
    assert_eq!(scopes.len(), 2);
    assert_eq!(scopes[1].search.as_deref(), Some("bob"));

    let view = engine.grouped().unwrap();
    assert_eq!(view.affiliates.len(), 1);
    assert_eq!(view.affiliates[0].referral_code, "BOB");
}

#[tokio::test(start_paused = true)]
async fn duplicate_fetch_while_one_is_running_is_skipped() {
    let (store, _) = store_with_pending(2);
    store.set_latency(Duration::from_secs(1));
    let engine = engine(&store);
    let scope = CommissionScope::all();

    let (first, second) = tokio::join!(engine.fetch_grouped(&scope), engine.fetch_grouped(&scope));
    assert_eq!(assert_ok!(first), FetchOutcome::Fetched);
    assert_eq!(assert_ok!(second), FetchOutcome::InFlight);
    assert_eq!(store.grouped_fetch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn older_response_is_discarded_when_newer_fetch_was_issued() {
    let (store, _) = store_with_pending(2);
    store.set_latency(Duration::from_secs(1));
    let engine = engine(&store);
    let scope = CommissionScope::all();

    let (first, forced) = tokio::join!(engine.fetch_grouped(&scope), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.refresh().await
    });
    assert_eq!(assert_ok!(first), FetchOutcome::Superseded);
    assert_eq!(assert_ok!(forced), FetchOutcome::Fetched);
    assert_eq!(store.grouped_fetch_count(), 2);
    assert!(engine.grouped().is_some());
    assert!(!engine.is_fetching());
}

#[tokio::test]
async fn failed_fetch_clears_view_and_selection() {
    let (store, _) = store_with_pending(3);
    let engine = engine(&store);
    assert_ok!(engine.fetch_grouped(&CommissionScope::all()).await);
    engine.select_all();

    store.fail_next_fetch(EngineError::Transport("connection reset".into()));
    let err = assert_err!(engine.refresh().await);
    assert!(matches!(err, EngineError::Transport(_)));

    assert!(engine.grouped().is_none());
    assert!(engine.selected_ids().is_empty());
    assert_eq!(engine.last_error(), Some(err));

    assert_ok!(engine.refresh().await);
    assert!(engine.last_error().is_none());
    assert_eq!(engine.summary().unwrap().total_pending_count, 3);
}

#[tokio::test(start_paused = true)]
async fn slow_source_times_out() {
    let (store, _) = store_with_pending(1);
    store.set_latency(Duration::from_secs(30));
    let engine = engine(&store);

    let err = assert_err!(engine.fetch_grouped(&CommissionScope::all()).await);
    assert_eq!(err, EngineError::Timeout(Duration::from_secs(10)));
    assert!(engine.grouped().is_none());
    assert!(!engine.is_fetching());
}
