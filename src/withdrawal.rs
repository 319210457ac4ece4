//! Withdrawal requests: state machine, balance floor and the admin engine.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::approval::{ActionReport, FetchOutcome};
use crate::cache::{FetchGate, QueryCache, lock};
use crate::config::EngineSettings;
use crate::error::EngineError;
use crate::guard::{SubmitClaims, with_timeout};
use crate::ledger::require_text;
use crate::source::{WithdrawalPage, WithdrawalSource};
use crate::types::{BalanceSnapshot, WithdrawalRequest, WithdrawalStatus};

impl WithdrawalStatus {
    pub fn can_transition_to(self, next: WithdrawalStatus) -> bool {
        matches!(
            (self, next),
            (WithdrawalStatus::Pending, WithdrawalStatus::Approved)
                | (WithdrawalStatus::Pending, WithdrawalStatus::Rejected)
                | (WithdrawalStatus::Approved, WithdrawalStatus::Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WithdrawalStatus::Rejected | WithdrawalStatus::Completed)
    }

    /// Whether a request in this status counts against the balance.
    pub fn is_committed(self) -> bool {
        matches!(self, WithdrawalStatus::Approved | WithdrawalStatus::Completed)
    }
}

impl WithdrawalRequest {
    fn transition(&mut self, next: WithdrawalStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::Conflict(format!(
                "withdrawal {} is {}, cannot move to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn approve(&mut self, notes: Option<&str>, at: DateTime<Utc>) -> Result<(), EngineError> {
        self.transition(WithdrawalStatus::Approved)?;
        self.approved_at = Some(at);
        self.admin_note = notes.map(str::to_owned);
        Ok(())
    }

    pub fn reject(&mut self, reason: &str, at: DateTime<Utc>) -> Result<(), EngineError> {
        require_text("rejection reason", reason)?;
        self.transition(WithdrawalStatus::Rejected)?;
        self.rejected_at = Some(at);
        self.rejection_reason = Some(reason.trim().to_owned());
        Ok(())
    }

    pub fn complete(&mut self, transfer_reference: &str, at: DateTime<Utc>) -> Result<(), EngineError> {
        require_text("transfer reference", transfer_reference)?;
        self.transition(WithdrawalStatus::Completed)?;
        self.completed_at = Some(at);
        self.transfer_reference = Some(transfer_reference.trim().to_owned());
        Ok(())
    }
}

/// Fails unless `requested` leaves at least `floor` of the available balance.
pub fn check_balance_floor(
    snapshot: &BalanceSnapshot,
    requested: i64,
    floor: i64,
) -> Result<(), EngineError> {
    if requested <= 0 {
        return Err(EngineError::Validation(
            "withdrawal amount must be positive".into(),
        ));
    }
    let available = snapshot.available();
    let remaining = available.checked_sub(requested);
    if remaining.is_none_or(|rest| rest < floor) {
        return Err(EngineError::InsufficientBalance {
            available,
            requested,
            floor,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTotal {
    pub count: u64,
    pub amount: i64,
}

/// Count and amount per withdrawal status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalStats {
    pub pending: StatusTotal,
    pub approved: StatusTotal,
    pub completed: StatusTotal,
    pub rejected: StatusTotal,
}

impl WithdrawalStats {
    pub fn from_requests<'a>(requests: impl IntoIterator<Item = &'a WithdrawalRequest>) -> Self {
        let mut stats = Self::default();
        for request in requests {
            let total = stats.for_status_mut(request.status);
            total.count += 1;
            total.amount += request.amount;
        }
        stats
    }

    pub fn for_status(&self, status: WithdrawalStatus) -> StatusTotal {
        match status {
            WithdrawalStatus::Pending => self.pending,
            WithdrawalStatus::Approved => self.approved,
            WithdrawalStatus::Completed => self.completed,
            WithdrawalStatus::Rejected => self.rejected,
        }
    }

    fn for_status_mut(&mut self, status: WithdrawalStatus) -> &mut StatusTotal {
        match status {
            WithdrawalStatus::Pending => &mut self.pending,
            WithdrawalStatus::Approved => &mut self.approved,
            WithdrawalStatus::Completed => &mut self.completed,
            WithdrawalStatus::Rejected => &mut self.rejected,
        }
    }
}

impl WithdrawalPage {
    /// Server stats when the page carried them, otherwise derived from the list.
    pub fn effective_stats(&self) -> WithdrawalStats {
        self.stats
            .unwrap_or_else(|| WithdrawalStats::from_requests(&self.withdrawals))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WithdrawalQuery {
    pub page: u32,
    pub limit: u32,
}

impl Default for WithdrawalQuery {
    fn default() -> Self {
        Self { page: 1, limit: 20 }
    }
}

#[derive(Debug, Default)]
struct WithdrawalState {
    query: WithdrawalQuery,
    page: Option<WithdrawalPage>,
    error: Option<EngineError>,
}

pub struct WithdrawalEngine {
    source: Arc<dyn WithdrawalSource>,
    settings: EngineSettings,
    cache: Mutex<QueryCache<WithdrawalQuery, WithdrawalPage>>,
    gate: FetchGate<WithdrawalQuery>,
    claims: SubmitClaims,
    state: Mutex<WithdrawalState>,
}

impl WithdrawalEngine {
    pub fn new(source: Arc<dyn WithdrawalSource>, settings: EngineSettings) -> Self {
        Self {
            source,
            settings,
            cache: Mutex::new(QueryCache::new(settings.staleness)),
            gate: FetchGate::new(),
            claims: SubmitClaims::default(),
            state: Mutex::new(WithdrawalState::default()),
        }
    }

    pub fn minimum_retention_floor(&self) -> i64 {
        self.settings.minimum_retention_floor
    }

    pub async fn fetch(&self, query: WithdrawalQuery) -> Result<FetchOutcome, EngineError> {
        self.load(query, false).await
    }

    pub async fn reload(&self, query: WithdrawalQuery) -> Result<FetchOutcome, EngineError> {
        self.load(query, true).await
    }

    pub async fn refresh(&self) -> Result<FetchOutcome, EngineError> {
        let query = lock(&self.state).query;
        self.load(query, true).await
    }

    async fn load(&self, query: WithdrawalQuery, force: bool) -> Result<FetchOutcome, EngineError> {
        if query.page == 0 || query.limit == 0 {
            return Err(EngineError::Validation(
                "page and limit must be at least 1".into(),
            ));
        }
        if !force {
            let cached = lock(&self.cache).get_fresh(&query).cloned();
            if let Some(page) = cached {
                self.apply(query, page);
                return Ok(FetchOutcome::Cached);
            }
        }

        let Some(ticket) = self.gate.try_begin(&query, force) else {
            debug!(?query, "withdrawal fetch already in flight, ignoring");
            return Ok(FetchOutcome::InFlight);
        };
        let result = with_timeout(
            self.settings.fetch_timeout,
            self.source.withdrawals_page(query.page, query.limit),
        )
        .await;
        if !ticket.is_current() {
            debug!(?query, "discarding superseded withdrawal fetch");
            return Ok(FetchOutcome::Superseded);
        }

        match result {
            Ok(page) => {
                debug!(?query, loaded = page.withdrawals.len(), "withdrawals fetched");
                lock(&self.cache).insert(query, page.clone());
                self.apply(query, page);
                Ok(FetchOutcome::Fetched)
            }
            Err(err) => {
                warn!(?query, error = %err, "withdrawal fetch failed, clearing list");
                lock(&self.cache).invalidate(&query);
                let mut state = lock(&self.state);
                state.query = query;
                state.page = None;
                state.error = Some(err.clone());
                Err(err)
            }
        }
    }

    fn apply(&self, query: WithdrawalQuery, page: WithdrawalPage) {
        let mut state = lock(&self.state);
        state.query = query;
        state.page = Some(page);
        state.error = None;
    }

    fn loaded(&self, id: Uuid) -> Result<WithdrawalRequest, EngineError> {
        lock(&self.state)
            .page
            .as_ref()
            .and_then(|p| p.withdrawals.iter().find(|w| w.id == id))
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("withdrawal {id} is not loaded")))
    }

    fn expect_status(request: &WithdrawalRequest, next: WithdrawalStatus) -> Result<(), EngineError> {
        if request.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(EngineError::Conflict(format!(
                "withdrawal {} is {}, cannot move to {}",
                request.id, request.status, next
            )))
        }
    }

    /// Server-wide stats ride on every cached page, so all pages go.
    async fn refresh_after_mutation(&self) {
        lock(&self.cache).clear();
        if let Err(err) = self.refresh().await {
            warn!(error = %err, "re-fetch after withdrawal mutation failed");
        }
    }

    pub async fn approve(&self, id: Uuid, notes: Option<&str>) -> Result<ActionReport, EngineError> {
        let notes = notes.map(str::trim).filter(|n| !n.is_empty());
        let _claim = self.claims.claim(&[id])?;
        let request = self.loaded(id)?;
        Self::expect_status(&request, WithdrawalStatus::Approved)?;

        let floor = self.settings.minimum_retention_floor;
        let snapshot = with_timeout(
            self.settings.fetch_timeout,
            self.source.balance(request.affiliate_id),
        )
        .await?;
        check_balance_floor(&snapshot, request.amount, floor).inspect_err(|err| {
            warn!(%id, affiliate = request.affiliate_id, error = %err, "withdrawal over balance floor");
        })?;

        let updated = with_timeout(
            self.settings.fetch_timeout,
            self.source.approve_withdrawal(id, notes, floor),
        )
        .await
        .inspect_err(|err| warn!(%id, error = %err, "withdrawal approval failed"))?;
        info!(%id, affiliate = updated.affiliate_id, amount = updated.amount, "withdrawal approved");

        self.refresh_after_mutation().await;
        Ok(ActionReport {
            id,
            message: format!("withdrawal of {} approved", updated.amount),
        })
    }

    pub async fn reject(&self, id: Uuid, reason: &str) -> Result<ActionReport, EngineError> {
        let reason = reason.trim();
        require_text("rejection reason", reason)?;
        let _claim = self.claims.claim(&[id])?;
        let request = self.loaded(id)?;
        Self::expect_status(&request, WithdrawalStatus::Rejected)?;

        with_timeout(
            self.settings.fetch_timeout,
            self.source.reject_withdrawal(id, reason),
        )
        .await
        .inspect_err(|err| warn!(%id, error = %err, "withdrawal rejection failed"))?;
        info!(%id, reason, "withdrawal rejected");

        self.refresh_after_mutation().await;
        Ok(ActionReport {
            id,
            message: "withdrawal rejected".into(),
        })
    }

    pub async fn complete(&self, id: Uuid, transfer_reference: &str) -> Result<ActionReport, EngineError> {
        let transfer_reference = transfer_reference.trim();
        require_text("transfer reference", transfer_reference)?;
        let _claim = self.claims.claim(&[id])?;
        let request = self.loaded(id)?;
        Self::expect_status(&request, WithdrawalStatus::Completed)?;

        with_timeout(
            self.settings.fetch_timeout,
            self.source.complete_withdrawal(id, transfer_reference),
        )
        .await
        .inspect_err(|err| warn!(%id, error = %err, "withdrawal completion failed"))?;
        info!(%id, transfer_reference, "withdrawal completed");

        self.refresh_after_mutation().await;
        Ok(ActionReport {
            id,
            message: format!("withdrawal completed with reference {transfer_reference}"),
        })
    }

    /// Server stats when the page carried them, otherwise derived from the list.
    pub fn stats(&self) -> WithdrawalStats {
        let state = lock(&self.state);
        state
            .page
            .as_ref()
            .map(WithdrawalPage::effective_stats)
            .unwrap_or_default()
    }

    pub fn derived_stats(&self) -> WithdrawalStats {
        lock(&self.state)
            .page
            .as_ref()
            .map(|p| WithdrawalStats::from_requests(&p.withdrawals))
            .unwrap_or_default()
    }

    pub fn page(&self) -> Option<WithdrawalPage> {
        lock(&self.state).page.clone()
    }

    pub fn withdrawals(&self) -> Vec<WithdrawalRequest> {
        lock(&self.state)
            .page
            .as_ref()
            .map(|p| p.withdrawals.clone())
            .unwrap_or_default()
    }

    pub fn last_error(&self) -> Option<EngineError> {
        lock(&self.state).error.clone()
    }

    /// The query the loaded page (or the last failure) belongs to.
    pub fn query(&self) -> WithdrawalQuery {
        lock(&self.state).query
    }

    /// The loaded page, only if it answers `query`.
    pub fn page_for(&self, query: WithdrawalQuery) -> Option<WithdrawalPage> {
        let state = lock(&self.state);
        state.page.clone().filter(|_| state.query == query)
    }

    pub fn is_fetching(&self) -> bool {
        let query = lock(&self.state).query;
        self.gate.is_in_flight(&query)
    }

    pub fn is_submitting(&self, id: Uuid) -> bool {
        self.claims.is_held(id)
    }
}
