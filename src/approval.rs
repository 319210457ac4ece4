//! Admin review of pending commissions.
//!
//! The engine owns the displayed grouped view, the selection and the fetch
//! bookkeeping. Every successful mutation is followed by a forced re-fetch;
//! totals are never patched locally.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{Debouncer, FetchGate, QueryCache, lock};
use crate::config::EngineSettings;
use crate::error::EngineError;
use crate::guard::{SubmitClaims, with_timeout};
use crate::ledger::{CommissionScope, GroupedCommissions, GroupedSummary, Selection};
use crate::source::{BatchItem, CommissionSource};
use crate::types::AffiliateId;

/// What a fetch call ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchOutcome {
    /// Loaded from the source and applied.
    Fetched,
    /// Served from a fresh cache entry.
    Cached,
    /// Another fetch for the scope is running; nothing was done.
    InFlight,
    /// A newer fetch was issued while this one ran; its result was dropped.
    Superseded,
}

/// Result of a single-record mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionReport {
    pub id: Uuid,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub id: Uuid,
    pub error: EngineError,
}

/// Per-id outcome of a batch approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: Vec<Uuid>,
    pub failed: Vec<BatchFailure>,
    pub message: String,
}

impl BatchReport {
    fn from_items(requested: &[Uuid], items: Vec<BatchItem>) -> Self {
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        let mut reported = HashSet::new();
        for item in items {
            if !requested.contains(&item.id) || !reported.insert(item.id) {
                continue;
            }
            match item.outcome {
                Ok(()) => succeeded.push(item.id),
                Err(error) => failed.push(BatchFailure { id: item.id, error }),
            }
        }
        for id in requested.iter().filter(|id| !reported.contains(*id)) {
            failed.push(BatchFailure {
                id: *id,
                error: EngineError::Transport("no result reported for this commission".into()),
            });
        }
        let message = format!(
            "{} commission(s) approved, {} failed",
            succeeded.len(),
            failed.len()
        );
        Self {
            succeeded,
            failed,
            message,
        }
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    scope: CommissionScope,
    view: Option<GroupedCommissions>,
    error: Option<EngineError>,
    selection: Selection,
}

pub struct ApprovalEngine {
    source: Arc<dyn CommissionSource>,
    settings: EngineSettings,
    cache: Mutex<QueryCache<CommissionScope, GroupedCommissions>>,
    gate: FetchGate<CommissionScope>,
    claims: SubmitClaims,
    state: Mutex<LedgerState>,
}

impl ApprovalEngine {
    pub fn new(source: Arc<dyn CommissionSource>, settings: EngineSettings) -> Self {
        Self {
            source,
            settings,
            cache: Mutex::new(QueryCache::new(settings.staleness)),
            gate: FetchGate::new(),
            claims: SubmitClaims::default(),
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Loads the grouped view for `scope`, from cache while it is fresh.
    pub async fn fetch_grouped(&self, scope: &CommissionScope) -> Result<FetchOutcome, EngineError> {
        self.load(scope, false).await
    }

    /// Loads `scope` regardless of cache age.
    pub async fn reload(&self, scope: &CommissionScope) -> Result<FetchOutcome, EngineError> {
        self.load(scope, true).await
    }

    /// Re-fetches the current scope regardless of cache age.
    pub async fn refresh(&self) -> Result<FetchOutcome, EngineError> {
        let scope = self.scope();
        self.load(&scope, true).await
    }

    async fn load(&self, scope: &CommissionScope, force: bool) -> Result<FetchOutcome, EngineError> {
        if !force {
            let cached = lock(&self.cache).get_fresh(scope).cloned();
            if let Some(view) = cached {
                self.apply(scope, view);
                return Ok(FetchOutcome::Cached);
            }
        }

        let Some(ticket) = self.gate.try_begin(scope, force) else {
            debug!(?scope, "grouped fetch already in flight, ignoring");
            return Ok(FetchOutcome::InFlight);
        };

        let result = with_timeout(self.settings.fetch_timeout, self.source.pending_grouped(scope)).await;
        if !ticket.is_current() {
            debug!(?scope, "discarding superseded grouped fetch");
            return Ok(FetchOutcome::Superseded);
        }

        match result {
            Ok(view) => {
                debug!(
                    ?scope,
                    affiliates = view.summary.total_affiliates,
                    pending = view.summary.total_pending_count,
                    "grouped commissions fetched"
                );
                lock(&self.cache).insert(scope.clone(), view.clone());
                self.apply(scope, view);
                Ok(FetchOutcome::Fetched)
            }
            Err(err) => {
                warn!(?scope, error = %err, "grouped fetch failed, clearing view");
                lock(&self.cache).invalidate(scope);
                let mut state = lock(&self.state);
                state.scope = scope.clone();
                state.view = None;
                state.selection.clear();
                state.error = Some(err.clone());
                Err(err)
            }
        }
    }

    fn apply(&self, scope: &CommissionScope, view: GroupedCommissions) {
        let mut state = lock(&self.state);
        if state.view.as_ref() != Some(&view) {
            let dropped = state.selection.retain_loaded(&view);
            if !dropped.is_empty() {
                debug!(count = dropped.len(), "dropped stale selections");
            }
        }
        state.scope = scope.clone();
        state.view = Some(view);
        state.error = None;
    }

    /// Drops every cached scope and re-fetches the current one. Any scope may
    /// hold a record that just changed.
    pub async fn refresh_all(&self) -> Result<FetchOutcome, EngineError> {
        lock(&self.cache).clear();
        self.refresh().await
    }

    async fn refresh_after_mutation(&self) {
        if let Err(err) = self.refresh_all().await {
            warn!(error = %err, "re-fetch after mutation failed");
        }
    }

    pub async fn approve(&self, id: Uuid, note: Option<&str>) -> Result<ActionReport, EngineError> {
        let note = note.map(str::trim).filter(|n| !n.is_empty());
        let _claim = self.claims.claim(&[id])?;

        let record = with_timeout(
            self.settings.fetch_timeout,
            self.source.approve_commission(id, note),
        )
        .await
        .inspect_err(|err| warn!(%id, error = %err, "commission approval failed"))?;
        info!(%id, amount = record.amount, beneficiary = record.beneficiary_affiliate_id, "commission approved");

        lock(&self.state).selection.remove_all(&[id]);
        self.refresh_after_mutation().await;
        Ok(ActionReport {
            id,
            message: format!("commission approved ({} credited)", record.amount),
        })
    }

    pub async fn reject(&self, id: Uuid, reason: &str) -> Result<ActionReport, EngineError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EngineError::Validation(
                "rejection reason must not be empty".into(),
            ));
        }
        let _claim = self.claims.claim(&[id])?;

        with_timeout(
            self.settings.fetch_timeout,
            self.source.reject_commission(id, reason),
        )
        .await
        .inspect_err(|err| warn!(%id, error = %err, "commission rejection failed"))?;
        info!(%id, reason, "commission rejected");

        lock(&self.state).selection.remove_all(&[id]);
        self.refresh_after_mutation().await;
        Ok(ActionReport {
            id,
            message: "commission rejected".into(),
        })
    }

    /// Approves each distinct id once and reports every outcome.
    pub async fn batch_approve(&self, ids: &[Uuid]) -> Result<BatchReport, EngineError> {
        let mut seen = HashSet::new();
        let unique: Vec<Uuid> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        if unique.is_empty() {
            return Err(EngineError::Validation("no commissions selected".into()));
        }
        let _claim = self.claims.claim(&unique)?;

        let items = with_timeout(
            self.settings.fetch_timeout,
            self.source.batch_approve_commissions(&unique),
        )
        .await
        .inspect_err(|err| warn!(count = unique.len(), error = %err, "batch approval failed"))?;

        let report = BatchReport::from_items(&unique, items);
        for failure in &report.failed {
            warn!(id = %failure.id, error = %failure.error, "commission in batch not approved");
        }
        info!(
            approved = report.succeeded.len(),
            failed = report.failed.len(),
            "batch approval finished"
        );

        lock(&self.state).selection.remove_all(&report.succeeded);
        if !report.succeeded.is_empty() {
            self.refresh_after_mutation().await;
        }
        Ok(report)
    }

    pub async fn approve_selected(&self) -> Result<BatchReport, EngineError> {
        let ids = self.selected_ids();
        self.batch_approve(&ids).await
    }

    /// Returns a debounced search box; each settled value re-scopes and fetches.
    pub fn search_input(self: &Arc<Self>) -> Debouncer<String> {
        let engine = Arc::clone(self);
        Debouncer::spawn(self.settings.debounce, move |text: String| {
            let engine = Arc::clone(&engine);
            async move {
                let scope = engine.scope().with_search(&text);
                if let Err(err) = engine.fetch_grouped(&scope).await {
                    warn!(search = %text, error = %err, "search fetch failed");
                }
            }
        })
    }

    pub fn toggle_selection(&self, id: Uuid) -> Result<bool, EngineError> {
        let mut state = lock(&self.state);
        let loaded = state.view.as_ref().is_some_and(|v| v.find(id).is_some());
        if !loaded {
            return Err(EngineError::NotFound(format!("commission {id} is not loaded")));
        }
        Ok(state.selection.toggle(id))
    }

    /// Selects every loaded record. Returns how many are selected.
    pub fn select_all(&self) -> usize {
        let mut state = lock(&self.state);
        let ids: Vec<Uuid> = state
            .view
            .as_ref()
            .map(|v| v.records().map(|r| r.id).collect())
            .unwrap_or_default();
        state.selection.select_all(ids);
        state.selection.ids().len()
    }

    /// Selects the loaded records of one beneficiary.
    pub fn select_group(&self, affiliate_id: AffiliateId) -> Result<usize, EngineError> {
        let mut state = lock(&self.state);
        let ids: Vec<Uuid> = state
            .view
            .as_ref()
            .and_then(|v| v.group(affiliate_id))
            .map(|g| g.commissions.iter().map(|c| c.id).collect())
            .ok_or_else(|| {
                EngineError::NotFound(format!("affiliate {affiliate_id} has no loaded commissions"))
            })?;
        let count = ids.len();
        state.selection.select_all(ids);
        Ok(count)
    }

    pub fn clear_selection(&self) {
        lock(&self.state).selection.clear();
    }

    pub fn selected_ids(&self) -> Vec<Uuid> {
        lock(&self.state).selection.ids().iter().copied().collect()
    }

    pub fn selected_total_amount(&self) -> i64 {
        let state = lock(&self.state);
        state
            .view
            .as_ref()
            .map(|v| state.selection.total_amount(v))
            .unwrap_or(0)
    }

    pub fn grouped(&self) -> Option<GroupedCommissions> {
        lock(&self.state).view.clone()
    }

    /// The loaded view, only if it answers `scope`.
    pub fn grouped_for(&self, scope: &CommissionScope) -> Option<GroupedCommissions> {
        let state = lock(&self.state);
        state.view.clone().filter(|_| state.scope == *scope)
    }

    pub fn summary(&self) -> Option<GroupedSummary> {
        lock(&self.state).view.as_ref().map(|v| v.summary)
    }

    pub fn last_error(&self) -> Option<EngineError> {
        lock(&self.state).error.clone()
    }

    pub fn scope(&self) -> CommissionScope {
        lock(&self.state).scope.clone()
    }

    pub fn is_fetching(&self) -> bool {
        self.gate.is_in_flight(&self.scope())
    }

    pub fn is_submitting(&self, id: Uuid) -> bool {
        self.claims.is_held(id)
    }
}
