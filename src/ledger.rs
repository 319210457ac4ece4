//! Commission records, their state machine and the grouped review view.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::types::{Affiliate, AffiliateId, CommissionRecord, CommissionStatus};

impl CommissionStatus {
    pub fn can_transition_to(self, next: CommissionStatus) -> bool {
        matches!(
            (self, next),
            (CommissionStatus::Pending, CommissionStatus::Approved)
                | (CommissionStatus::Pending, CommissionStatus::Rejected)
                | (CommissionStatus::Approved, CommissionStatus::Paid)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CommissionStatus::Rejected | CommissionStatus::Paid)
    }
}

impl CommissionRecord {
    fn transition(&mut self, next: CommissionStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::Conflict(format!(
                "commission {} is {}, cannot move to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn approve(&mut self, note: Option<&str>, at: DateTime<Utc>) -> Result<(), EngineError> {
        self.transition(CommissionStatus::Approved)?;
        self.approved_at = Some(at);
        self.note = note.map(str::to_owned);
        Ok(())
    }

    pub fn reject(&mut self, reason: &str, at: DateTime<Utc>) -> Result<(), EngineError> {
        require_text("rejection reason", reason)?;
        self.transition(CommissionStatus::Rejected)?;
        self.rejected_at = Some(at);
        self.rejection_reason = Some(reason.trim().to_owned());
        Ok(())
    }

    /// Recorded by the payout collaborator once the money has moved.
    pub fn mark_paid(&mut self, at: DateTime<Utc>) -> Result<(), EngineError> {
        self.transition(CommissionStatus::Paid)?;
        self.paid_at = Some(at);
        Ok(())
    }
}

pub(crate) fn require_text(field: &str, value: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Which pending commissions a grouped fetch covers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommissionScope {
    /// Restrict to one beneficiary; `None` is the cross-affiliate admin view.
    pub beneficiary: Option<AffiliateId>,
    /// Case-insensitive match on beneficiary code or name.
    pub search: Option<String>,
}

impl CommissionScope {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_search(mut self, text: &str) -> Self {
        let text = text.trim();
        self.search = (!text.is_empty()).then(|| text.to_owned());
        self
    }

    pub fn matches(&self, affiliate: &Affiliate) -> bool {
        if let Some(id) = self.beneficiary {
            if affiliate.id != id {
                return false;
            }
        }
        match &self.search {
            Some(text) => {
                let needle = text.to_lowercase();
                affiliate.referral_code.to_lowercase().contains(&needle)
                    || affiliate.name.to_lowercase().contains(&needle)
            }
            None => true,
        }
    }
}

/// Pending commissions of one beneficiary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffiliateGroup {
    pub affiliate_id: AffiliateId,
    pub referral_code: String,
    pub name: String,
    pub commissions: Vec<CommissionRecord>,
    pub pending_count: u64,
    pub pending_amount: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupedSummary {
    pub total_affiliates: u64,
    pub total_pending_count: u64,
    pub total_pending_amount: i64,
}

/// The admin review view: pending commissions grouped by beneficiary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupedCommissions {
    pub affiliates: Vec<AffiliateGroup>,
    pub summary: GroupedSummary,
}

impl GroupedCommissions {
    /// Groups the `PENDING` records among `records` by beneficiary.
    ///
    /// Groups are ordered by affiliate id, records by creation time. Records
    /// whose beneficiary is not in `affiliates` are grouped under an empty
    /// code and name.
    pub fn from_records(
        records: impl IntoIterator<Item = CommissionRecord>,
        affiliates: &HashMap<AffiliateId, Affiliate>,
    ) -> Self {
        let mut by_beneficiary: BTreeMap<AffiliateId, Vec<CommissionRecord>> = BTreeMap::new();
        for record in records
            .into_iter()
            .filter(|r| r.status == CommissionStatus::Pending)
        {
            by_beneficiary
                .entry(record.beneficiary_affiliate_id)
                .or_default()
                .push(record);
        }

        let mut summary = GroupedSummary::default();
        let groups = by_beneficiary
            .into_iter()
            .map(|(affiliate_id, mut commissions)| {
                commissions.sort_by_key(|c| (c.created_at, c.id));
                let pending_count = commissions.len() as u64;
                let pending_amount = commissions.iter().map(|c| c.amount).sum();
                summary.total_affiliates += 1;
                summary.total_pending_count += pending_count;
                summary.total_pending_amount += pending_amount;
                let (referral_code, name) = affiliates
                    .get(&affiliate_id)
                    .map(|a| (a.referral_code.clone(), a.name.clone()))
                    .unwrap_or_default();
                AffiliateGroup {
                    affiliate_id,
                    referral_code,
                    name,
                    commissions,
                    pending_count,
                    pending_amount,
                }
            })
            .collect();

        Self {
            affiliates: groups,
            summary,
        }
    }

    pub fn find(&self, id: Uuid) -> Option<&CommissionRecord> {
        self.records().find(|r| r.id == id)
    }

    pub fn records(&self) -> impl Iterator<Item = &CommissionRecord> {
        self.affiliates.iter().flat_map(|g| g.commissions.iter())
    }

    pub fn group(&self, affiliate_id: AffiliateId) -> Option<&AffiliateGroup> {
        self.affiliates.iter().find(|g| g.affiliate_id == affiliate_id)
    }
}

/// Commission ids picked for a batch action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    ids: BTreeSet<Uuid>,
}

impl Selection {
    pub fn ids(&self) -> &BTreeSet<Uuid> {
        &self.ids
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.ids.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Returns whether `id` is selected afterwards.
    pub fn toggle(&mut self, id: Uuid) -> bool {
        if self.ids.remove(&id) {
            false
        } else {
            self.ids.insert(id);
            true
        }
    }

    pub fn select_all(&mut self, ids: impl IntoIterator<Item = Uuid>) {
        self.ids.extend(ids);
    }

    pub fn remove_all(&mut self, ids: &[Uuid]) {
        for id in ids {
            self.ids.remove(id);
        }
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// Keeps only ids present in `view`. Returns the dropped ids.
    pub fn retain_loaded(&mut self, view: &GroupedCommissions) -> Vec<Uuid> {
        let dropped: Vec<Uuid> = self
            .ids
            .iter()
            .copied()
            .filter(|id| view.find(*id).is_none())
            .collect();
        for id in &dropped {
            self.ids.remove(id);
        }
        dropped
    }

    pub fn total_amount(&self, view: &GroupedCommissions) -> i64 {
        view.records()
            .filter(|r| self.ids.contains(&r.id))
            .map(|r| r.amount)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AffiliateStatus;
    use chrono::Duration;

    fn record(beneficiary: AffiliateId, amount: i64, minutes: i64) -> CommissionRecord {
        CommissionRecord {
            id: Uuid::new_v4(),
            transaction_id: Uuid::new_v4(),
            source_affiliate_id: 99,
            beneficiary_affiliate_id: beneficiary,
            level: 1,
            amount,
            status: CommissionStatus::Pending,
            created_at: DateTime::<Utc>::UNIX_EPOCH + Duration::minutes(minutes),
            approved_at: None,
            rejected_at: None,
            paid_at: None,
            note: None,
            rejection_reason: None,
        }
    }

    fn affiliate(id: AffiliateId, code: &str, name: &str) -> Affiliate {
        Affiliate {
            id,
            referral_code: code.into(),
            name: name.into(),
            status: AffiliateStatus::Active,
            parent_id: None,
            created_at: None,
        }
    }

    #[test]
    fn state_machine_allows_only_forward_moves() {
        use CommissionStatus::*;
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Approved.can_transition_to(Paid));
        assert!(!Approved.can_transition_to(Approved));
        assert!(!Rejected.can_transition_to(Approved));
        assert!(!Paid.can_transition_to(Rejected));
        assert!(!Pending.can_transition_to(Paid));
        assert!(Rejected.is_terminal() && Paid.is_terminal());
    }

    #[test]
    fn approve_sets_timestamp_once_and_refuses_repeat() {
        let mut r = record(1, 100, 0);
        let at = Utc::now();
        r.approve(Some("ok"), at).unwrap();
        assert_eq!(r.approved_at, Some(at));
        assert_eq!(r.note.as_deref(), Some("ok"));

        let err = r.approve(None, Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
        assert_eq!(r.approved_at, Some(at));
        assert_eq!(r.note.as_deref(), Some("ok"));
    }

    #[test]
    fn reject_requires_reason_and_pending_state() {
        let mut r = record(1, 100, 0);
        assert!(matches!(
            r.reject("   ", Utc::now()),
            Err(EngineError::Validation(_))
        ));
        assert_eq!(r.status, CommissionStatus::Pending);
        r.reject(" duplicate order ", Utc::now()).unwrap();
        assert_eq!(r.rejection_reason.as_deref(), Some("duplicate order"));
        assert!(r.approve(None, Utc::now()).is_err());
        assert!(r.mark_paid(Utc::now()).is_err());
    }

    #[test]
    fn grouping_builds_subtotals_and_summary() {
        let affiliates = HashMap::from([(1, affiliate(1, "ALPHA", "Alpha")), (2, affiliate(2, "BETA", "Beta"))]);
        let mut approved = record(2, 10_000, 0);
        approved.status = CommissionStatus::Approved;
        let view = GroupedCommissions::from_records(
            vec![record(2, 300, 5), record(1, 100, 1), record(2, 200, 2), approved],
            &affiliates,
        );
        assert_eq!(view.summary.total_affiliates, 2);
        assert_eq!(view.summary.total_pending_count, 3);
        assert_eq!(view.summary.total_pending_amount, 600);
        let beta = view.group(2).unwrap();
        assert_eq!(beta.referral_code, "BETA");
        assert_eq!(beta.pending_count, 2);
        assert_eq!(beta.pending_amount, 500);
        assert_eq!(beta.commissions[0].amount, 200);
    }

    #[test]
    fn scope_matches_code_or_name_case_insensitively() {
        let a = affiliate(1, "ALPHA01", "Alice Smith");
        assert!(CommissionScope::all().with_search("alice").matches(&a));
        assert!(CommissionScope::all().with_search("pha0").matches(&a));
        assert!(!CommissionScope::all().with_search("bob").matches(&a));
        assert_eq!(CommissionScope::all().with_search("  ").search, None);
        let scoped = CommissionScope {
            beneficiary: Some(2),
            search: None,
        };
        assert!(!scoped.matches(&a));
    }

    #[test]
    fn selection_drops_ids_missing_from_refreshed_view() {
        let affiliates = HashMap::new();
        let keep = record(1, 100, 0);
        let gone = record(1, 250, 1);
        let before = GroupedCommissions::from_records(vec![keep.clone(), gone.clone()], &affiliates);

        let mut selection = Selection::default();
        selection.select_all(before.records().map(|r| r.id));
        assert_eq!(selection.total_amount(&before), 350);

        let after = GroupedCommissions::from_records(vec![keep.clone()], &affiliates);
        let dropped = selection.retain_loaded(&after);
        assert_eq!(dropped, vec![gone.id]);
        assert!(selection.contains(keep.id));
        assert_eq!(selection.total_amount(&after), 100);
    }
}
