//! Postgres-backed sources.
//!
//! Every status transition runs as a single guarded `UPDATE ... WHERE status = ...`
//! or inside a transaction holding `FOR UPDATE` row locks, so concurrent
//! admins cannot both move the same record.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::graph::{NetworkPayload, RawNode};
use crate::ledger::{CommissionScope, GroupedCommissions, require_text};
use crate::plan::{CommissionPlan, NewCommission};
use crate::responses::Pagination;
use crate::source::{BatchItem, CommissionSource, GraphSource, WithdrawalPage, WithdrawalSource};
use crate::types::{
    Affiliate, AffiliateId, AffiliateStatus, BalanceSnapshot, BankDetails, CommissionRecord,
    CommissionStatus, WithdrawalRequest, WithdrawalStatus,
};
use crate::withdrawal::{StatusTotal, WithdrawalStats, check_balance_floor};

pub const PAYMENT_STATUS_CAPTURED: &str = "captured";

const UNIQUE_VIOLATION: &str = "23505";

/// Downstream rows of `$1`. Each row carries its ancestry so a corrupted
/// parent cycle stops where it would revisit an affiliate; depth is
/// otherwise unbounded.
const DOWNSTREAM_NETWORK_SQL: &str = "WITH RECURSIVE network AS ( \
       SELECT id, referral_code, name, status, parent_id, created_at, 1 AS level, \
              ARRAY[$1::BIGINT, id] AS path \
         FROM affiliates WHERE parent_id = $1 \
       UNION ALL \
       SELECT a.id, a.referral_code, a.name, a.status, a.parent_id, a.created_at, n.level + 1, \
              n.path || a.id \
         FROM affiliates a JOIN network n ON a.parent_id = n.id \
        WHERE NOT a.id = ANY(n.path) \
     ) \
     SELECT DISTINCT ON (id) id, referral_code, name, status, parent_id, created_at, level \
       FROM network ORDER BY id, level";

macro_rules! commission_columns {
    () => {
        "c.id, c.transaction_id, c.source_affiliate_id, c.beneficiary_affiliate_id, c.level, \
         c.amount, c.status, c.created_at, c.approved_at, c.rejected_at, c.paid_at, c.note, \
         c.rejection_reason"
    };
}

macro_rules! withdrawal_columns {
    () => {
        "w.id, w.affiliate_id, w.amount, w.status, w.bank_name, w.account_number, \
         w.account_holder, w.admin_note, w.rejection_reason, w.transfer_reference, \
         w.created_at, w.approved_at, w.rejected_at, w.completed_at"
    };
}

#[derive(sqlx::FromRow)]
struct CommissionRow {
    id: Uuid,
    transaction_id: Uuid,
    source_affiliate_id: i64,
    beneficiary_affiliate_id: i64,
    level: i32,
    amount: i64,
    status: String,
    created_at: DateTime<Utc>,
    approved_at: Option<DateTime<Utc>>,
    rejected_at: Option<DateTime<Utc>>,
    paid_at: Option<DateTime<Utc>>,
    note: Option<String>,
    rejection_reason: Option<String>,
}

impl TryFrom<CommissionRow> for CommissionRecord {
    type Error = EngineError;

    fn try_from(row: CommissionRow) -> Result<Self, Self::Error> {
        let level = u32::try_from(row.level).map_err(|_| {
            EngineError::DataIntegrity(format!("commission {} has level {}", row.id, row.level))
        })?;
        Ok(CommissionRecord {
            id: row.id,
            transaction_id: row.transaction_id,
            source_affiliate_id: row.source_affiliate_id,
            beneficiary_affiliate_id: row.beneficiary_affiliate_id,
            level,
            amount: row.amount,
            status: row.status.parse()?,
            created_at: row.created_at,
            approved_at: row.approved_at,
            rejected_at: row.rejected_at,
            paid_at: row.paid_at,
            note: row.note,
            rejection_reason: row.rejection_reason,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PendingRow {
    #[sqlx(flatten)]
    commission: CommissionRow,
    referral_code: String,
    name: String,
    affiliate_status: String,
}

#[derive(sqlx::FromRow)]
struct WithdrawalRow {
    id: Uuid,
    affiliate_id: i64,
    amount: i64,
    status: String,
    bank_name: String,
    account_number: String,
    account_holder: String,
    admin_note: Option<String>,
    rejection_reason: Option<String>,
    transfer_reference: Option<String>,
    created_at: DateTime<Utc>,
    approved_at: Option<DateTime<Utc>>,
    rejected_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<WithdrawalRow> for WithdrawalRequest {
    type Error = EngineError;

    fn try_from(row: WithdrawalRow) -> Result<Self, Self::Error> {
        Ok(WithdrawalRequest {
            id: row.id,
            affiliate_id: row.affiliate_id,
            amount: row.amount,
            status: row.status.parse()?,
            bank: BankDetails {
                bank_name: row.bank_name,
                account_number: row.account_number,
                account_holder: row.account_holder,
            },
            admin_note: row.admin_note,
            rejection_reason: row.rejection_reason,
            transfer_reference: row.transfer_reference,
            created_at: row.created_at,
            approved_at: row.approved_at,
            rejected_at: row.rejected_at,
            completed_at: row.completed_at,
        })
    }
}

/// A purchase to record before it is processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPurchase {
    pub id: Uuid,
    pub affiliate_id: AffiliateId,
    pub amount: i64,
    pub status: String,
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn create_purchase(&self, purchase: &NewPurchase) -> Result<(), EngineError> {
        if purchase.amount < 0 {
            return Err(EngineError::Validation("amount must be >= 0".into()));
        }
        sqlx::query("INSERT INTO purchases (id, affiliate_id, amount, status) VALUES ($1, $2, $3, $4)")
            .bind(purchase.id)
            .bind(purchase.affiliate_id)
            .bind(purchase.amount)
            .bind(&purchase.status)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(db_err) = &e {
                    if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
                        return EngineError::Conflict(format!(
                            "purchase {} already exists",
                            purchase.id
                        ));
                    }
                }
                EngineError::from(e)
            })?;
        info!(purchase_id = %purchase.id, affiliate_id = purchase.affiliate_id, "purchase recorded");
        Ok(())
    }

    /// Creates `PENDING` commissions for a captured purchase up the active
    /// referrer chain. Reprocessing is a no-op. Returns the number of
    /// commissions inserted.
    pub async fn process_purchase(
        &self,
        purchase_id: Uuid,
        plan: &CommissionPlan,
    ) -> Result<usize, EngineError> {
        let mut tx = self.pool.begin().await?;

        let rec = sqlx::query("SELECT affiliate_id, amount, status FROM purchases WHERE id = $1 FOR UPDATE")
            .bind(purchase_id)
            .fetch_optional(tx.as_mut())
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("purchase {purchase_id}")))?;

        let status: String = rec.try_get("status")?;
        if status != PAYMENT_STATUS_CAPTURED {
            tx.commit().await?;
            debug!(%purchase_id, %status, "purchase not captured, nothing to distribute");
            return Ok(0);
        }

        let buyer_id: i64 = rec.try_get("affiliate_id")?;
        let amount: i64 = rec.try_get("amount")?;

        let mut chain = Vec::new();
        let mut current = buyer_id;
        while chain.len() < plan.levels() as usize {
            match active_referrer(&mut tx, current).await? {
                Some(referrer) if referrer != buyer_id && !chain.contains(&referrer) => {
                    chain.push(referrer);
                    current = referrer;
                }
                _ => break,
            }
        }

        let mut inserted = 0;
        for commission in plan.plan_commissions(purchase_id, buyer_id, &chain, amount) {
            if insert_commission(&mut tx, &commission).await? {
                inserted += 1;
            }
        }

        tx.commit().await?;
        info!(%purchase_id, buyer_id, levels = chain.len(), inserted, "purchase processed");
        Ok(inserted)
    }

    /// Creates a `PENDING` withdrawal that leaves at least `floor` available.
    pub async fn create_withdrawal(
        &self,
        affiliate_id: AffiliateId,
        amount: i64,
        bank: &BankDetails,
        floor: i64,
    ) -> Result<WithdrawalRequest, EngineError> {
        require_text("bank_name", &bank.bank_name)?;
        require_text("account_number", &bank.account_number)?;
        require_text("account_holder", &bank.account_holder)?;

        let mut tx = self.pool.begin().await?;
        lock_affiliate(&mut tx, affiliate_id).await?;
        let snapshot = balance_in(tx.as_mut(), affiliate_id).await?;
        check_balance_floor(&snapshot, amount, floor)?;

        let row = sqlx::query_as::<_, WithdrawalRow>(concat!(
            "INSERT INTO withdrawals AS w (id, affiliate_id, amount, status, bank_name, account_number, account_holder) \
             VALUES ($1, $2, $3, 'PENDING', $4, $5, $6) RETURNING ",
            withdrawal_columns!()
        ))
        .bind(Uuid::new_v4())
        .bind(affiliate_id)
        .bind(amount)
        .bind(bank.bank_name.trim())
        .bind(bank.account_number.trim())
        .bind(bank.account_holder.trim())
        .fetch_one(tx.as_mut())
        .await?;
        tx.commit().await?;

        let request = WithdrawalRequest::try_from(row)?;
        info!(withdrawal_id = %request.id, affiliate_id, amount, "withdrawal requested");
        Ok(request)
    }

    async fn explain_commission(&self, id: Uuid, wanted: CommissionStatus) -> EngineError {
        explain_commission_in(&self.pool, id, wanted).await
    }

    async fn explain_withdrawal(&self, id: Uuid, wanted: WithdrawalStatus) -> EngineError {
        let found = sqlx::query("SELECT status FROM withdrawals WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await;
        match found {
            Ok(Some(row)) => match row.try_get::<String, _>("status") {
                Ok(status) => EngineError::Conflict(format!(
                    "withdrawal {id} is {status}, cannot move to {wanted}"
                )),
                Err(e) => e.into(),
            },
            Ok(None) => EngineError::NotFound(format!("withdrawal {id}")),
            Err(e) => e.into(),
        }
    }
}

async fn explain_commission_in<'e, E>(executor: E, id: Uuid, wanted: CommissionStatus) -> EngineError
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let found = sqlx::query("SELECT status FROM commissions WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await;
    match found {
        Ok(Some(row)) => match row.try_get::<String, _>("status") {
            Ok(status) => EngineError::Conflict(format!(
                "commission {id} is {status}, cannot move to {wanted}"
            )),
            Err(e) => e.into(),
        },
        Ok(None) => EngineError::NotFound(format!("commission {id}")),
        Err(e) => e.into(),
    }
}

async fn active_referrer(
    tx: &mut Transaction<'_, Postgres>,
    affiliate_id: AffiliateId,
) -> Result<Option<AffiliateId>, EngineError> {
    let row = sqlx::query(
        "SELECT p.id, p.status FROM affiliates a JOIN affiliates p ON p.id = a.parent_id WHERE a.id = $1",
    )
    .bind(affiliate_id)
    .fetch_optional(tx.as_mut())
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let status: AffiliateStatus = row.try_get::<String, _>("status")?.parse()?;
    if status != AffiliateStatus::Active {
        return Ok(None);
    }
    Ok(Some(row.try_get("id")?))
}

async fn insert_commission(
    tx: &mut Transaction<'_, Postgres>,
    commission: &NewCommission,
) -> Result<bool, EngineError> {
    let res = sqlx::query(
        "INSERT INTO commissions (id, transaction_id, source_affiliate_id, beneficiary_affiliate_id, level, amount, status) \
         VALUES ($1, $2, $3, $4, $5, $6, 'PENDING') \
         ON CONFLICT (transaction_id, beneficiary_affiliate_id, level) DO NOTHING",
    )
    .bind(Uuid::new_v4())
    .bind(commission.transaction_id)
    .bind(commission.source_affiliate_id)
    .bind(commission.beneficiary_affiliate_id)
    .bind(commission.level as i32)
    .bind(commission.amount)
    .execute(tx.as_mut())
    .await?;

    Ok(res.rows_affected() == 1)
}

/// Serializes balance-affecting writes of one affiliate.
async fn lock_affiliate(
    tx: &mut Transaction<'_, Postgres>,
    affiliate_id: AffiliateId,
) -> Result<(), EngineError> {
    sqlx::query("SELECT id FROM affiliates WHERE id = $1 FOR UPDATE")
        .bind(affiliate_id)
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("affiliate {affiliate_id}")))?;
    Ok(())
}

async fn balance_in(
    conn: &mut PgConnection,
    affiliate_id: AffiliateId,
) -> Result<BalanceSnapshot, EngineError> {
    let row = sqlx::query(
        "SELECT \
           (SELECT COALESCE(SUM(amount), 0)::BIGINT FROM commissions \
             WHERE beneficiary_affiliate_id = $1 AND status IN ('APPROVED', 'PAID')) AS approved_commission_total, \
           (SELECT COALESCE(SUM(amount), 0)::BIGINT FROM withdrawals \
             WHERE affiliate_id = $1 AND status IN ('APPROVED', 'COMPLETED')) AS committed_withdrawals",
    )
    .bind(affiliate_id)
    .fetch_one(conn)
    .await?;

    Ok(BalanceSnapshot {
        affiliate_id,
        approved_commission_total: row.try_get("approved_commission_total")?,
        committed_withdrawals: row.try_get("committed_withdrawals")?,
    })
}

/// Escapes `LIKE` wildcards so search text matches literally.
fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[async_trait]
impl GraphSource for PgStore {
    async fn downstream_network(
        &self,
        affiliate_id: AffiliateId,
    ) -> Result<NetworkPayload, EngineError> {
        let rows = sqlx::query(DOWNSTREAM_NETWORK_SQL)
            .bind(affiliate_id)
            .fetch_all(&self.pool)
            .await?;

        let mut nodes = Vec::with_capacity(rows.len());
        for row in rows {
            let level: i32 = row.try_get("level")?;
            let status = row
                .try_get::<String, _>("status")?
                .parse()
                .unwrap_or(AffiliateStatus::Active);
            let code: String = row.try_get("referral_code")?;
            let name: String = row.try_get("name")?;
            let mut node = RawNode::new(row.try_get("id")?, code, name).with_level(level.max(1) as u32);
            node.status = status;
            node.registered_at = row.try_get("created_at")?;
            node.parent_id = row.try_get("parent_id")?;
            nodes.push(node);
        }
        debug!(affiliate_id, members = nodes.len(), "downstream network queried");
        Ok(NetworkPayload::List(nodes))
    }
}

#[async_trait]
impl CommissionSource for PgStore {
    async fn pending_grouped(
        &self,
        scope: &CommissionScope,
    ) -> Result<GroupedCommissions, EngineError> {
        let rows = sqlx::query_as::<_, PendingRow>(concat!(
            "SELECT ",
            commission_columns!(),
            ", a.referral_code, a.name, a.status AS affiliate_status \
             FROM commissions c JOIN affiliates a ON a.id = c.beneficiary_affiliate_id \
             WHERE c.status = 'PENDING' \
               AND ($1::BIGINT IS NULL OR c.beneficiary_affiliate_id = $1) \
               AND ($2::TEXT IS NULL \
                    OR a.referral_code ILIKE '%' || $2 || '%' ESCAPE '\\' \
                    OR a.name ILIKE '%' || $2 || '%' ESCAPE '\\') \
             ORDER BY c.beneficiary_affiliate_id, c.created_at"
        ))
        .bind(scope.beneficiary)
        .bind(scope.search.as_deref().map(escape_like))
        .fetch_all(&self.pool)
        .await?;

        let mut affiliates = HashMap::new();
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let record = CommissionRecord::try_from(row.commission)?;
            affiliates
                .entry(record.beneficiary_affiliate_id)
                .or_insert_with(|| Affiliate {
                    id: record.beneficiary_affiliate_id,
                    referral_code: row.referral_code,
                    name: row.name,
                    status: row.affiliate_status.parse().unwrap_or(AffiliateStatus::Active),
                    parent_id: None,
                    created_at: None,
                });
            records.push(record);
        }
        Ok(GroupedCommissions::from_records(records, &affiliates))
    }

    async fn commissions_for(
        &self,
        beneficiary: AffiliateId,
    ) -> Result<Vec<CommissionRecord>, EngineError> {
        let rows = sqlx::query_as::<_, CommissionRow>(concat!(
            "SELECT ",
            commission_columns!(),
            " FROM commissions c WHERE c.beneficiary_affiliate_id = $1 ORDER BY c.created_at, c.id"
        ))
        .bind(beneficiary)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CommissionRecord::try_from).collect()
    }

    async fn approve_commission(
        &self,
        id: Uuid,
        note: Option<&str>,
    ) -> Result<CommissionRecord, EngineError> {
        let row = sqlx::query_as::<_, CommissionRow>(concat!(
            "UPDATE commissions AS c SET status = 'APPROVED', approved_at = now(), note = $2 \
             WHERE c.id = $1 AND c.status = 'PENDING' RETURNING ",
            commission_columns!()
        ))
        .bind(id)
        .bind(note.map(str::trim).filter(|n| !n.is_empty()))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                info!(commission_id = %id, "commission approved");
                CommissionRecord::try_from(row)
            }
            None => Err(self.explain_commission(id, CommissionStatus::Approved).await),
        }
    }

    async fn reject_commission(
        &self,
        id: Uuid,
        reason: &str,
    ) -> Result<CommissionRecord, EngineError> {
        require_text("rejection reason", reason)?;
        let row = sqlx::query_as::<_, CommissionRow>(concat!(
            "UPDATE commissions AS c SET status = 'REJECTED', rejected_at = now(), rejection_reason = $2 \
             WHERE c.id = $1 AND c.status = 'PENDING' RETURNING ",
            commission_columns!()
        ))
        .bind(id)
        .bind(reason.trim())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                info!(commission_id = %id, "commission rejected");
                CommissionRecord::try_from(row)
            }
            None => Err(self.explain_commission(id, CommissionStatus::Rejected).await),
        }
    }

    async fn batch_approve_commissions(&self, ids: &[Uuid]) -> Result<Vec<BatchItem>, EngineError> {
        let mut tx = self.pool.begin().await?;
        let mut items = Vec::with_capacity(ids.len());
        for &id in ids {
            let updated = sqlx::query(
                "UPDATE commissions SET status = 'APPROVED', approved_at = now() \
                 WHERE id = $1 AND status = 'PENDING'",
            )
            .bind(id)
            .execute(tx.as_mut())
            .await?;

            let outcome = if updated.rows_affected() == 1 {
                Ok(())
            } else {
                Err(explain_commission_in(tx.as_mut(), id, CommissionStatus::Approved).await)
            };
            items.push(BatchItem { id, outcome });
        }
        tx.commit().await?;

        let approved = items.iter().filter(|i| i.outcome.is_ok()).count();
        if approved < items.len() {
            warn!(approved, failed = items.len() - approved, "batch approval partially failed");
        } else {
            info!(approved, "batch approval applied");
        }
        Ok(items)
    }
}

#[async_trait]
impl WithdrawalSource for PgStore {
    async fn withdrawals_page(&self, page: u32, limit: u32) -> Result<WithdrawalPage, EngineError> {
        let page = page.max(1);
        let limit = limit.max(1);
        let offset = i64::from(page - 1) * i64::from(limit);

        let rows = sqlx::query_as::<_, WithdrawalRow>(concat!(
            "SELECT ",
            withdrawal_columns!(),
            " FROM withdrawals w ORDER BY w.created_at DESC, w.id LIMIT $1 OFFSET $2"
        ))
        .bind(i64::from(limit))
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        let withdrawals = rows
            .into_iter()
            .map(WithdrawalRequest::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let totals = sqlx::query(
            "SELECT status, COUNT(*) AS count, COALESCE(SUM(amount), 0)::BIGINT AS amount \
             FROM withdrawals GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = WithdrawalStats::default();
        let mut total = 0u64;
        for row in totals {
            let status: WithdrawalStatus = row.try_get::<String, _>("status")?.parse()?;
            let entry = StatusTotal {
                count: to_u64(row.try_get("count")?),
                amount: row.try_get("amount")?,
            };
            total += entry.count;
            match status {
                WithdrawalStatus::Pending => stats.pending = entry,
                WithdrawalStatus::Approved => stats.approved = entry,
                WithdrawalStatus::Completed => stats.completed = entry,
                WithdrawalStatus::Rejected => stats.rejected = entry,
            }
        }

        Ok(WithdrawalPage {
            withdrawals,
            pagination: Pagination::new(page, limit, total),
            stats: Some(stats),
        })
    }

    async fn balance(&self, affiliate_id: AffiliateId) -> Result<BalanceSnapshot, EngineError> {
        let mut conn = self.pool.acquire().await?;
        let exists = sqlx::query("SELECT id FROM affiliates WHERE id = $1")
            .bind(affiliate_id)
            .fetch_optional(&mut *conn)
            .await?;
        if exists.is_none() {
            return Err(EngineError::NotFound(format!("affiliate {affiliate_id}")));
        }
        balance_in(&mut conn, affiliate_id).await
    }

    async fn approve_withdrawal(
        &self,
        id: Uuid,
        notes: Option<&str>,
        floor: i64,
    ) -> Result<WithdrawalRequest, EngineError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT affiliate_id, amount, status FROM withdrawals WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(tx.as_mut())
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("withdrawal {id}")))?;

        let status: WithdrawalStatus = row.try_get::<String, _>("status")?.parse()?;
        if !status.can_transition_to(WithdrawalStatus::Approved) {
            return Err(EngineError::Conflict(format!(
                "withdrawal {id} is {status}, cannot move to APPROVED"
            )));
        }
        let affiliate_id: i64 = row.try_get("affiliate_id")?;
        let amount: i64 = row.try_get("amount")?;

        lock_affiliate(&mut tx, affiliate_id).await?;
        let snapshot = balance_in(tx.as_mut(), affiliate_id).await?;
        check_balance_floor(&snapshot, amount, floor)?;

        let updated = sqlx::query_as::<_, WithdrawalRow>(concat!(
            "UPDATE withdrawals AS w SET status = 'APPROVED', approved_at = now(), admin_note = $2 \
             WHERE w.id = $1 RETURNING ",
            withdrawal_columns!()
        ))
        .bind(id)
        .bind(notes.map(str::trim).filter(|n| !n.is_empty()))
        .fetch_one(tx.as_mut())
        .await?;
        tx.commit().await?;

        info!(withdrawal_id = %id, affiliate_id, amount, floor, "withdrawal approved");
        WithdrawalRequest::try_from(updated)
    }

    async fn reject_withdrawal(
        &self,
        id: Uuid,
        reason: &str,
    ) -> Result<WithdrawalRequest, EngineError> {
        require_text("rejection reason", reason)?;
        let row = sqlx::query_as::<_, WithdrawalRow>(concat!(
            "UPDATE withdrawals AS w SET status = 'REJECTED', rejected_at = now(), rejection_reason = $2 \
             WHERE w.id = $1 AND w.status = 'PENDING' RETURNING ",
            withdrawal_columns!()
        ))
        .bind(id)
        .bind(reason.trim())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                info!(withdrawal_id = %id, "withdrawal rejected");
                WithdrawalRequest::try_from(row)
            }
            None => Err(self.explain_withdrawal(id, WithdrawalStatus::Rejected).await),
        }
    }

    async fn complete_withdrawal(
        &self,
        id: Uuid,
        transfer_reference: &str,
    ) -> Result<WithdrawalRequest, EngineError> {
        require_text("transfer reference", transfer_reference)?;
        let row = sqlx::query_as::<_, WithdrawalRow>(concat!(
            "UPDATE withdrawals AS w SET status = 'COMPLETED', completed_at = now(), transfer_reference = $2 \
             WHERE w.id = $1 AND w.status = 'APPROVED' RETURNING ",
            withdrawal_columns!()
        ))
        .bind(id)
        .bind(transfer_reference.trim())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                info!(withdrawal_id = %id, "withdrawal completed");
                WithdrawalRequest::try_from(row)
            }
            None => Err(self.explain_withdrawal(id, WithdrawalStatus::Completed).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_query_has_no_depth_cap() {
        assert!(DOWNSTREAM_NETWORK_SQL.contains("NOT a.id = ANY(n.path)"));
        assert!(!DOWNSTREAM_NETWORK_SQL.contains("$2"));
        assert!(!DOWNSTREAM_NETWORK_SQL.contains("n.level <"));
    }

    #[test]
    fn like_wildcards_in_search_text_are_escaped() {
        assert_eq!(escape_like("bob"), "bob");
        assert_eq!(escape_like("50%_off"), "50\\%\\_off");
        assert_eq!(escape_like("a\\b"), "a\\\\b");
    }
}
