//! Collaborators the engines read from and write through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::graph::NetworkPayload;
use crate::ledger::{CommissionScope, GroupedCommissions};
use crate::responses::Pagination;
use crate::types::{AffiliateId, BalanceSnapshot, CommissionRecord, WithdrawalRequest};
use crate::withdrawal::WithdrawalStats;

/// Outcome for one id of a batch approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub id: Uuid,
    pub outcome: Result<(), EngineError>,
}

/// One page of withdrawal requests, optionally with server-side stats.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalPage {
    pub withdrawals: Vec<WithdrawalRequest>,
    pub pagination: Pagination,
    pub stats: Option<WithdrawalStats>,
}

#[async_trait]
pub trait GraphSource: Send + Sync {
    /// The downstream network of `affiliate_id` in whatever shape the source keeps it.
    async fn downstream_network(&self, affiliate_id: AffiliateId)
    -> Result<NetworkPayload, EngineError>;
}

#[async_trait]
pub trait CommissionSource: Send + Sync {
    async fn pending_grouped(
        &self,
        scope: &CommissionScope,
    ) -> Result<GroupedCommissions, EngineError>;

    /// Every record credited to `beneficiary`, any status.
    async fn commissions_for(
        &self,
        beneficiary: AffiliateId,
    ) -> Result<Vec<CommissionRecord>, EngineError>;

    async fn approve_commission(
        &self,
        id: Uuid,
        note: Option<&str>,
    ) -> Result<CommissionRecord, EngineError>;

    async fn reject_commission(
        &self,
        id: Uuid,
        reason: &str,
    ) -> Result<CommissionRecord, EngineError>;

    /// Approves each id independently; one failure never undoes another success.
    async fn batch_approve_commissions(&self, ids: &[Uuid]) -> Result<Vec<BatchItem>, EngineError>;
}

#[async_trait]
pub trait WithdrawalSource: Send + Sync {
    async fn withdrawals_page(&self, page: u32, limit: u32) -> Result<WithdrawalPage, EngineError>;

    async fn balance(&self, affiliate_id: AffiliateId) -> Result<BalanceSnapshot, EngineError>;

    /// Approves under the source's own balance check against `floor`.
    async fn approve_withdrawal(
        &self,
        id: Uuid,
        notes: Option<&str>,
        floor: i64,
    ) -> Result<WithdrawalRequest, EngineError>;

    async fn reject_withdrawal(
        &self,
        id: Uuid,
        reason: &str,
    ) -> Result<WithdrawalRequest, EngineError>;

    async fn complete_withdrawal(
        &self,
        id: Uuid,
        transfer_reference: &str,
    ) -> Result<WithdrawalRequest, EngineError>;
}
