use std::collections::HashSet;

use uuid::Uuid;

use crate::types::AffiliateId;

/// Deepest level that earns commission.
pub const MAX_COMMISSION_LEVEL: u32 = 10;

/// Per-level commission rates in basis points, level 1 first.
///
/// Pricing is a business rule supplied from outside; this only applies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommissionPlan {
    rates_bps: Vec<u32>,
}

/// A commission to be inserted at `PENDING`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCommission {
    pub transaction_id: Uuid,
    pub source_affiliate_id: AffiliateId,
    pub beneficiary_affiliate_id: AffiliateId,
    pub level: u32,
    pub amount: i64,
}

impl CommissionPlan {
    pub fn new(mut rates_bps: Vec<u32>) -> Self {
        rates_bps.truncate(MAX_COMMISSION_LEVEL as usize);
        Self { rates_bps }
    }

    pub fn levels(&self) -> u32 {
        self.rates_bps.len() as u32
    }

    pub fn rate_for(&self, level: u32) -> Option<u32> {
        level
            .checked_sub(1)
            .and_then(|i| self.rates_bps.get(i as usize))
            .copied()
    }

    /// Splits `amount` over the referrer chain of `source`.
    ///
    /// `chain[0]` is the direct referrer (level 1). The walk stops at the
    /// plan's depth or at the first affiliate seen twice.
    pub fn plan_commissions(
        &self,
        transaction_id: Uuid,
        source: AffiliateId,
        chain: &[AffiliateId],
        amount: i64,
    ) -> Vec<NewCommission> {
        let mut seen = HashSet::from([source]);
        let mut out = Vec::new();
        for (i, &beneficiary) in chain.iter().enumerate() {
            let level = i as u32 + 1;
            let Some(rate) = self.rate_for(level) else {
                break;
            };
            if !seen.insert(beneficiary) {
                break;
            }
            let amt = bps_of(amount, rate);
            if amt > 0 {
                out.push(NewCommission {
                    transaction_id,
                    source_affiliate_id: source,
                    beneficiary_affiliate_id: beneficiary,
                    level,
                    amount: amt,
                });
            }
        }
        out
    }
}

pub fn bps_of(amount: i64, bps: u32) -> i64 {
    ((amount as i128 * bps as i128) / 10_000) as i64
}
