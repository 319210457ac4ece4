use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Affiliates are keyed by the numeric user id.
pub type AffiliateId = i64;

macro_rules! status_strings {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = EngineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_uppercase().as_str() {
                    $($text => Ok($ty::$variant),)+
                    other => Err(EngineError::DataIntegrity(format!(
                        "unknown {} `{}`",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }
    };
}

/// Lifecycle status of an affiliate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AffiliateStatus {
    Pending,
    Active,
    Suspended,
    Inactive,
}

status_strings!(AffiliateStatus {
    Pending => "PENDING",
    Active => "ACTIVE",
    Suspended => "SUSPENDED",
    Inactive => "INACTIVE",
});

/// A network participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Affiliate {
    /// The ID of the affiliate.
    pub id: AffiliateId,
    /// The unique referral code.
    pub referral_code: String,
    /// The display name.
    pub name: String,
    /// The lifecycle status.
    pub status: AffiliateStatus,
    /// The affiliate who recruited this one. `None` for roots.
    pub parent_id: Option<AffiliateId>,
    /// The timestamp when the affiliate registered.
    pub created_at: Option<DateTime<Utc>>,
}

/// Lifecycle status of a commission record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommissionStatus {
    Pending,
    Approved,
    Rejected,
    Paid,
}

status_strings!(CommissionStatus {
    Pending => "PENDING",
    Approved => "APPROVED",
    Rejected => "REJECTED",
    Paid => "PAID",
});

/// One ledger entry crediting a beneficiary for one level of one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionRecord {
    /// The ID of the commission.
    pub id: Uuid,
    /// The transaction that produced it.
    pub transaction_id: Uuid,
    /// The affiliate who transacted.
    pub source_affiliate_id: AffiliateId,
    /// The affiliate who earns the commission.
    pub beneficiary_affiliate_id: AffiliateId,
    /// The level of the beneficiary above the source, 1 to 10.
    pub level: u32,
    /// The amount in the smallest currency unit.
    pub amount: i64,
    pub status: CommissionStatus,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    /// Admin note recorded on approval.
    pub note: Option<String>,
    pub rejection_reason: Option<String>,
}

/// Lifecycle status of a withdrawal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WithdrawalStatus {
    Pending,
    Approved,
    Rejected,
    Completed,
}

status_strings!(WithdrawalStatus {
    Pending => "PENDING",
    Approved => "APPROVED",
    Rejected => "REJECTED",
    Completed => "COMPLETED",
});

/// Where the withdrawn funds are sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankDetails {
    pub bank_name: String,
    pub account_number: String,
    pub account_holder: String,
}

/// An affiliate's request to withdraw approved commission balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub id: Uuid,
    pub affiliate_id: AffiliateId,
    /// The requested amount. Always positive.
    pub amount: i64,
    pub status: WithdrawalStatus,
    pub bank: BankDetails,
    pub admin_note: Option<String>,
    pub rejection_reason: Option<String>,
    /// Set only when the transfer is completed.
    pub transfer_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Balance figures of one affiliate at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub affiliate_id: AffiliateId,
    /// Sum of commissions in `APPROVED` or `PAID`.
    pub approved_commission_total: i64,
    /// Sum of withdrawals in `APPROVED` or `COMPLETED`.
    pub committed_withdrawals: i64,
}

impl BalanceSnapshot {
    pub fn available(&self) -> i64 {
        self.approved_commission_total - self.committed_withdrawals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_parse_case_insensitively() {
        assert_eq!(
            "approved".parse::<CommissionStatus>().unwrap(),
            CommissionStatus::Approved
        );
        assert_eq!(
            "COMPLETED".parse::<WithdrawalStatus>().unwrap(),
            WithdrawalStatus::Completed
        );
        assert!("ARCHIVED".parse::<AffiliateStatus>().is_err());
    }

    #[test]
    fn statuses_serialize_screaming() {
        let json = serde_json::to_string(&CommissionStatus::Paid).unwrap();
        assert_eq!(json, "\"PAID\"");
    }

    #[test]
    fn available_balance_subtracts_committed_withdrawals() {
        let snapshot = BalanceSnapshot {
            affiliate_id: 7,
            approved_commission_total: 100_000,
            committed_withdrawals: 30_000,
        };
        assert_eq!(snapshot.available(), 70_000);
    }
}
