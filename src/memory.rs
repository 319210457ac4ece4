//! In-process store implementing every source, with the same transition
//! rules as the Postgres store. Used by tests and local runs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::cache::lock;
use crate::error::EngineError;
use crate::graph::{NetworkPayload, RawNode};
use crate::ledger::{CommissionScope, GroupedCommissions};
use crate::plan::CommissionPlan;
use crate::responses::Pagination;
use crate::source::{BatchItem, CommissionSource, GraphSource, WithdrawalPage, WithdrawalSource};
use crate::types::{
    Affiliate, AffiliateId, AffiliateStatus, BalanceSnapshot, BankDetails, CommissionRecord,
    CommissionStatus, WithdrawalRequest, WithdrawalStatus,
};
use crate::withdrawal::{WithdrawalStats, check_balance_floor};

#[derive(Default)]
struct Inner {
    affiliates: HashMap<AffiliateId, Affiliate>,
    commissions: Vec<CommissionRecord>,
    withdrawals: Vec<WithdrawalRequest>,
    latency: Duration,
    write_latency: Duration,
    fail_next_fetch: Option<EngineError>,
    server_stats: bool,
    grouped_scopes: Vec<CommissionScope>,
    withdrawal_fetches: usize,
    network_fetches: usize,
}

impl Inner {
    fn balance(&self, affiliate_id: AffiliateId) -> BalanceSnapshot {
        let approved_commission_total = self
            .commissions
            .iter()
            .filter(|c| c.beneficiary_affiliate_id == affiliate_id)
            .filter(|c| matches!(c.status, CommissionStatus::Approved | CommissionStatus::Paid))
            .map(|c| c.amount)
            .sum();
        let committed_withdrawals = self
            .withdrawals
            .iter()
            .filter(|w| w.affiliate_id == affiliate_id && w.status.is_committed())
            .map(|w| w.amount)
            .sum();
        BalanceSnapshot {
            affiliate_id,
            approved_commission_total,
            committed_withdrawals,
        }
    }

    fn commission_mut(&mut self, id: Uuid) -> Result<&mut CommissionRecord, EngineError> {
        self.commissions
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| EngineError::NotFound(format!("commission {id}")))
    }

    fn withdrawal_mut(&mut self, id: Uuid) -> Result<&mut WithdrawalRequest, EngineError> {
        self.withdrawals
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or_else(|| EngineError::NotFound(format!("withdrawal {id}")))
    }

    fn in_scope(&self, record: &CommissionRecord, scope: &CommissionScope) -> bool {
        match self.affiliates.get(&record.beneficiary_affiliate_id) {
            Some(affiliate) => scope.matches(affiliate),
            None => {
                scope.search.is_none()
                    && scope
                        .beneficiary
                        .is_none_or(|id| id == record.beneficiary_affiliate_id)
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_affiliate(
        &self,
        id: AffiliateId,
        code: &str,
        name: &str,
        parent_id: Option<AffiliateId>,
    ) -> Affiliate {
        let affiliate = Affiliate {
            id,
            referral_code: code.to_owned(),
            name: name.to_owned(),
            status: AffiliateStatus::Active,
            parent_id,
            created_at: Some(Utc::now()),
        };
        lock(&self.inner).affiliates.insert(id, affiliate.clone());
        affiliate
    }

    pub fn set_affiliate_status(&self, id: AffiliateId, status: AffiliateStatus) {
        if let Some(affiliate) = lock(&self.inner).affiliates.get_mut(&id) {
            affiliate.status = status;
        }
    }

    /// Inserts a `PENDING` commission as the transaction processor would.
    pub fn add_commission(
        &self,
        beneficiary: AffiliateId,
        source: AffiliateId,
        level: u32,
        amount: i64,
    ) -> Uuid {
        let record = CommissionRecord {
            id: Uuid::new_v4(),
            transaction_id: Uuid::new_v4(),
            source_affiliate_id: source,
            beneficiary_affiliate_id: beneficiary,
            level,
            amount,
            status: CommissionStatus::Pending,
            created_at: Utc::now(),
            approved_at: None,
            rejected_at: None,
            paid_at: None,
            note: None,
            rejection_reason: None,
        };
        let id = record.id;
        lock(&self.inner).commissions.push(record);
        id
    }

    /// Cascades a purchase by `buyer` up the active referrer chain.
    pub fn record_purchase(&self, buyer: AffiliateId, amount: i64, plan: &CommissionPlan) -> Vec<Uuid> {
        let mut inner = lock(&self.inner);
        let mut chain = Vec::new();
        let mut current = inner.affiliates.get(&buyer).and_then(|a| a.parent_id);
        while let Some(referrer) = current {
            if chain.len() >= plan.levels() as usize {
                break;
            }
            match inner.affiliates.get(&referrer) {
                Some(a) if a.status == AffiliateStatus::Active => {
                    chain.push(referrer);
                    current = a.parent_id;
                }
                _ => break,
            }
        }

        let transaction_id = Uuid::new_v4();
        let now = Utc::now();
        let mut ids = Vec::new();
        for planned in plan.plan_commissions(transaction_id, buyer, &chain, amount) {
            let id = Uuid::new_v4();
            inner.commissions.push(CommissionRecord {
                id,
                transaction_id: planned.transaction_id,
                source_affiliate_id: planned.source_affiliate_id,
                beneficiary_affiliate_id: planned.beneficiary_affiliate_id,
                level: planned.level,
                amount: planned.amount,
                status: CommissionStatus::Pending,
                created_at: now,
                approved_at: None,
                rejected_at: None,
                paid_at: None,
                note: None,
                rejection_reason: None,
            });
            ids.push(id);
        }
        ids
    }

    /// Payout collaborator: `APPROVED` to `PAID`.
    pub fn mark_paid(&self, id: Uuid) -> Result<(), EngineError> {
        lock(&self.inner).commission_mut(id)?.mark_paid(Utc::now())
    }

    /// Affiliate-facing collaborator: creates a `PENDING` withdrawal.
    pub fn insert_withdrawal(
        &self,
        affiliate_id: AffiliateId,
        amount: i64,
        bank: BankDetails,
        floor: i64,
    ) -> Result<Uuid, EngineError> {
        let mut inner = lock(&self.inner);
        if !inner.affiliates.contains_key(&affiliate_id) {
            return Err(EngineError::NotFound(format!("affiliate {affiliate_id}")));
        }
        check_balance_floor(&inner.balance(affiliate_id), amount, floor)?;
        let id = Uuid::new_v4();
        inner.withdrawals.push(WithdrawalRequest {
            id,
            affiliate_id,
            amount,
            status: WithdrawalStatus::Pending,
            bank,
            admin_note: None,
            rejection_reason: None,
            transfer_reference: None,
            created_at: Utc::now(),
            approved_at: None,
            rejected_at: None,
            completed_at: None,
        });
        Ok(id)
    }

    pub fn commission(&self, id: Uuid) -> Option<CommissionRecord> {
        lock(&self.inner).commissions.iter().find(|c| c.id == id).cloned()
    }

    pub fn withdrawal(&self, id: Uuid) -> Option<WithdrawalRequest> {
        lock(&self.inner).withdrawals.iter().find(|w| w.id == id).cloned()
    }

    pub fn balance_of(&self, affiliate_id: AffiliateId) -> BalanceSnapshot {
        lock(&self.inner).balance(affiliate_id)
    }

    /// Delay applied to every fetch.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.inner).latency = latency;
    }

    /// Delay applied to every status change.
    pub fn set_write_latency(&self, latency: Duration) {
        lock(&self.inner).write_latency = latency;
    }

    pub fn fail_next_fetch(&self, err: EngineError) {
        lock(&self.inner).fail_next_fetch = Some(err);
    }

    /// Whether withdrawal pages carry server-side stats.
    pub fn set_server_stats(&self, enabled: bool) {
        lock(&self.inner).server_stats = enabled;
    }

    pub fn grouped_fetch_count(&self) -> usize {
        lock(&self.inner).grouped_scopes.len()
    }

    pub fn grouped_fetch_scopes(&self) -> Vec<CommissionScope> {
        lock(&self.inner).grouped_scopes.clone()
    }

    pub fn withdrawal_fetch_count(&self) -> usize {
        lock(&self.inner).withdrawal_fetches
    }

    pub fn network_fetch_count(&self) -> usize {
        lock(&self.inner).network_fetches
    }

    async fn write_delay(&self) {
        let latency = lock(&self.inner).write_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    async fn fetch_delay(&self) -> Result<(), EngineError> {
        let (latency, failure) = {
            let mut inner = lock(&self.inner);
            (inner.latency, inner.fail_next_fetch.take())
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl GraphSource for MemoryStore {
    async fn downstream_network(
        &self,
        affiliate_id: AffiliateId,
    ) -> Result<NetworkPayload, EngineError> {
        lock(&self.inner).network_fetches += 1;
        self.fetch_delay().await?;
        let inner = lock(&self.inner);

        let mut children: HashMap<AffiliateId, Vec<&Affiliate>> = HashMap::new();
        for affiliate in inner.affiliates.values() {
            if let Some(parent) = affiliate.parent_id {
                children.entry(parent).or_default().push(affiliate);
            }
        }

        let mut nodes = Vec::new();
        let mut visited = HashSet::from([affiliate_id]);
        let mut queue = VecDeque::from([affiliate_id]);
        while let Some(parent) = queue.pop_front() {
            let mut direct = children.get(&parent).cloned().unwrap_or_default();
            direct.sort_by_key(|a| a.id);
            for child in direct {
                if !visited.insert(child.id) {
                    continue;
                }
                let mut node = RawNode::new(child.id, child.referral_code.clone(), child.name.clone())
                    .with_parent(parent);
                node.status = child.status;
                node.registered_at = child.created_at;
                nodes.push(node);
                queue.push_back(child.id);
            }
        }
        Ok(NetworkPayload::List(nodes))
    }
}

#[async_trait]
impl CommissionSource for MemoryStore {
    async fn pending_grouped(
        &self,
        scope: &CommissionScope,
    ) -> Result<GroupedCommissions, EngineError> {
        lock(&self.inner).grouped_scopes.push(scope.clone());
        self.fetch_delay().await?;
        let inner = lock(&self.inner);
        let records = inner
            .commissions
            .iter()
            .filter(|c| c.status == CommissionStatus::Pending && inner.in_scope(c, scope))
            .cloned();
        Ok(GroupedCommissions::from_records(records, &inner.affiliates))
    }

    async fn commissions_for(
        &self,
        beneficiary: AffiliateId,
    ) -> Result<Vec<CommissionRecord>, EngineError> {
        self.fetch_delay().await?;
        Ok(lock(&self.inner)
            .commissions
            .iter()
            .filter(|c| c.beneficiary_affiliate_id == beneficiary)
            .cloned()
            .collect())
    }

    async fn approve_commission(
        &self,
        id: Uuid,
        note: Option<&str>,
    ) -> Result<CommissionRecord, EngineError> {
        self.write_delay().await;
        let mut inner = lock(&self.inner);
        let record = inner.commission_mut(id)?;
        record.approve(note, Utc::now())?;
        Ok(record.clone())
    }

    async fn reject_commission(
        &self,
        id: Uuid,
        reason: &str,
    ) -> Result<CommissionRecord, EngineError> {
        self.write_delay().await;
        let mut inner = lock(&self.inner);
        let record = inner.commission_mut(id)?;
        record.reject(reason, Utc::now())?;
        Ok(record.clone())
    }

    async fn batch_approve_commissions(&self, ids: &[Uuid]) -> Result<Vec<BatchItem>, EngineError> {
        self.write_delay().await;
        let mut inner = lock(&self.inner);
        let now = Utc::now();
        Ok(ids
            .iter()
            .map(|&id| BatchItem {
                id,
                outcome: inner
                    .commission_mut(id)
                    .and_then(|record| record.approve(None, now)),
            })
            .collect())
    }
}

#[async_trait]
impl WithdrawalSource for MemoryStore {
    async fn withdrawals_page(&self, page: u32, limit: u32) -> Result<WithdrawalPage, EngineError> {
        lock(&self.inner).withdrawal_fetches += 1;
        self.fetch_delay().await?;
        let inner = lock(&self.inner);
        let offset = (page.saturating_sub(1) as usize).saturating_mul(limit as usize);
        let withdrawals: Vec<WithdrawalRequest> = inner
            .withdrawals
            .iter()
            .skip(offset)
            .take(limit as usize)
            .cloned()
            .collect();
        let stats = inner
            .server_stats
            .then(|| WithdrawalStats::from_requests(&inner.withdrawals));
        Ok(WithdrawalPage {
            withdrawals,
            pagination: Pagination::new(page, limit, inner.withdrawals.len() as u64),
            stats,
        })
    }

    async fn balance(&self, affiliate_id: AffiliateId) -> Result<BalanceSnapshot, EngineError> {
        let inner = lock(&self.inner);
        if !inner.affiliates.contains_key(&affiliate_id) {
            return Err(EngineError::NotFound(format!("affiliate {affiliate_id}")));
        }
        Ok(inner.balance(affiliate_id))
    }

    async fn approve_withdrawal(
        &self,
        id: Uuid,
        notes: Option<&str>,
        floor: i64,
    ) -> Result<WithdrawalRequest, EngineError> {
        self.write_delay().await;
        let mut inner = lock(&self.inner);
        let (affiliate_id, amount, status) = {
            let request = inner.withdrawal_mut(id)?;
            (request.affiliate_id, request.amount, request.status)
        };
        if status == WithdrawalStatus::Pending {
            check_balance_floor(&inner.balance(affiliate_id), amount, floor)?;
        }
        let request = inner.withdrawal_mut(id)?;
        request.approve(notes, Utc::now())?;
        Ok(request.clone())
    }

    async fn reject_withdrawal(
        &self,
        id: Uuid,
        reason: &str,
    ) -> Result<WithdrawalRequest, EngineError> {
        self.write_delay().await;
        let mut inner = lock(&self.inner);
        let request = inner.withdrawal_mut(id)?;
        request.reject(reason, Utc::now())?;
        Ok(request.clone())
    }

    async fn complete_withdrawal(
        &self,
        id: Uuid,
        transfer_reference: &str,
    ) -> Result<WithdrawalRequest, EngineError> {
        self.write_delay().await;
        let mut inner = lock(&self.inner);
        let request = inner.withdrawal_mut(id)?;
        request.complete(transfer_reference, Utc::now())?;
        Ok(request.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purchase_cascade_stops_at_inactive_referrer() {
        let store = MemoryStore::new();
        store.add_affiliate(1, "ROOT", "root", None);
        store.add_affiliate(2, "MID", "mid", Some(1));
        store.add_affiliate(3, "LOW", "low", Some(2));
        store.add_affiliate(4, "BUYER", "buyer", Some(3));
        let plan = CommissionPlan::new(vec![1_000, 500, 250]);

        let ids = store.record_purchase(4, 10_000, &plan);
        assert_eq!(ids.len(), 3);
        let levels: Vec<_> = ids
            .iter()
            .map(|id| {
                let c = store.commission(*id).unwrap();
                (c.beneficiary_affiliate_id, c.level, c.amount)
            })
            .collect();
        assert_eq!(levels, vec![(3, 1, 1_000), (2, 2, 500), (1, 3, 250)]);

        store.set_affiliate_status(2, AffiliateStatus::Suspended);
        assert_eq!(store.record_purchase(4, 10_000, &plan).len(), 1);
    }

    #[tokio::test]
    async fn network_payload_lists_descendants_only() {
        let store = MemoryStore::new();
        store.add_affiliate(1, "ROOT", "root", None);
        store.add_affiliate(2, "A", "a", Some(1));
        store.add_affiliate(3, "B", "b", Some(2));
        store.add_affiliate(9, "OTHER", "other", None);

        let payload = store.downstream_network(1).await.unwrap();
        let NetworkPayload::List(nodes) = payload else {
            panic!("expected a flat list");
        };
        let ids: Vec<_> = nodes.iter().map(|n| (n.id, n.parent_id)).collect();
        assert_eq!(ids, vec![(2, Some(1)), (3, Some(2))]);
        assert_eq!(store.network_fetch_count(), 1);
    }

    #[tokio::test]
    async fn withdrawal_creation_respects_floor() {
        let store = MemoryStore::new();
        store.add_affiliate(1, "A", "a", None);
        let c = store.add_commission(1, 2, 1, 50_000);
        store.approve_commission(c, None).await.unwrap();

        let err = store
            .insert_withdrawal(1, 45_000, BankDetails::default(), 10_000)
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientBalance { .. }));
        assert!(store
            .insert_withdrawal(1, 40_000, BankDetails::default(), 10_000)
            .is_ok());
    }
}
