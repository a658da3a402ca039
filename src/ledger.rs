//! Commission ledger and approval/payout state machine
//!
//! Converts qualifying payment events into permanent commission records and
//! keeps the affiliate balance buckets in step: pending -> approved -> paid,
//! with cancellation reachable from pending or approved for the
//! refund/chargeback path.
//!
//! Every mutation runs inside a single database transaction so the effects
//! appear atomic to concurrent readers; failures roll back without touching
//! the aggregates. The conservation invariant across the whole chain is that
//! `pending + approved + paid` always equals the summed commission of the
//! affiliate's non-cancelled transactions.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    database::Database,
    models::*,
};

/// Domain failures surfaced by ledger operations
///
/// All are locally recoverable; the caller decides whether to log, retry, or
/// surface to an operator. The ledger itself never retries.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Affiliate {0} not found")]
    AffiliateNotFound(Uuid),

    #[error("Affiliate {0} is not active")]
    AffiliateInactive(Uuid),

    #[error("Transaction kind {0:?} cannot be recorded as commission")]
    InvalidTransactionType(TransactionKind),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Storage write failed: {0}")]
    StorageWriteFailed(#[from] anyhow::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Selects the affiliate's configured commission value for a transaction kind
///
/// The rate is affiliate-owned configuration looked up at processing time,
/// never an input frozen earlier.
pub fn rate_for(affiliate: &Affiliate, kind: TransactionKind) -> LedgerResult<Decimal> {
    match kind {
        TransactionKind::Initial => Ok(affiliate.commission_initial),
        TransactionKind::Rebill => Ok(affiliate.commission_rebill),
        TransactionKind::Unlock => Ok(affiliate.commission_unlock),
        TransactionKind::Refund => Err(LedgerError::InvalidTransactionType(kind)),
    }
}

/// Computes the commission owed for a gross amount under a commission scheme
pub fn commission_for(kind: CommissionKind, rate: Decimal, gross_amount: Decimal) -> Decimal {
    match kind {
        CommissionKind::Percentage => (gross_amount * rate / Decimal::ONE_HUNDRED).round_dp(2),
        CommissionKind::Flat => rate,
    }
}

/// Commission ledger service
#[derive(Clone)]
pub struct LedgerService {
    database: Arc<Database>,
}

impl LedgerService {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }

    /// Records one qualifying payment event as a pending commission
    ///
    /// Inserts the transaction, bumps the affiliate aggregates, accrues promo
    /// code usage, and marks the originating click converted (exactly once),
    /// all within one database transaction.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_commission(
        &self,
        affiliate_id: Uuid,
        user_id: &str,
        kind: TransactionKind,
        external_txn_id: &str,
        plan_id: &str,
        gross_amount: Decimal,
        promo_code_id: Option<Uuid>,
        click_id: Option<Uuid>,
    ) -> LedgerResult<AffiliateTransaction> {
        if !kind.is_recordable() {
            return Err(LedgerError::InvalidTransactionType(kind));
        }

        let mut tx = self.database.begin_transaction().await?;

        let affiliate = self
            .database
            .get_affiliate_by_id_tx(&mut tx, affiliate_id)
            .await?
            .ok_or(LedgerError::AffiliateNotFound(affiliate_id))?;

        if affiliate.status != AffiliateStatus::Active {
            return Err(LedgerError::AffiliateInactive(affiliate_id));
        }

        let rate = rate_for(&affiliate, kind)?;
        let commission_amount = commission_for(affiliate.commission_kind, rate, gross_amount);

        let txn = self
            .database
            .insert_transaction(
                &mut tx,
                affiliate.id,
                promo_code_id,
                click_id,
                user_id,
                kind,
                external_txn_id,
                plan_id,
                gross_amount,
                affiliate.commission_kind,
                rate,
                commission_amount,
            )
            .await?;

        self.database
            .apply_commission_aggregates(&mut tx, affiliate.id, kind, gross_amount, commission_amount)
            .await?;

        if let Some(promo_id) = promo_code_id {
            self.database
                .apply_promo_usage(&mut tx, promo_id, gross_amount, commission_amount)
                .await?;
        }

        if let Some(click_id) = click_id {
            let converted = self
                .database
                .mark_click_converted(&mut tx, click_id, kind, gross_amount)
                .await?;
            if !converted {
                debug!("Click {} already converted, conversion left untouched", click_id);
            }
        }

        tx.commit()
            .await
            .map_err(|e| LedgerError::StorageWriteFailed(e.into()))?;

        info!(
            "Recorded {:?} commission {} for affiliate {} (txn {})",
            kind, commission_amount, affiliate.code, txn.id
        );

        Ok(txn)
    }

    /// Approves a pending commission, moving it to the approved bucket
    pub async fn approve(&self, txn_id: Uuid) -> LedgerResult<AffiliateTransaction> {
        let mut tx = self.database.begin_transaction().await?;

        let txn = self
            .database
            .transition_transaction(
                &mut tx,
                txn_id,
                TransactionStatus::Pending,
                TransactionStatus::Approved,
            )
            .await?
            .ok_or_else(|| {
                LedgerError::InvalidState(format!("Transaction {} is not pending", txn_id))
            })?;

        self.database
            .move_pending_to_approved(&mut tx, txn.affiliate_id, txn.commission_amount)
            .await?;

        tx.commit()
            .await
            .map_err(|e| LedgerError::StorageWriteFailed(e.into()))?;

        info!("Approved transaction {} ({})", txn.id, txn.commission_amount);
        Ok(txn)
    }

    /// Cancels a pending or approved commission (refund/chargeback path)
    ///
    /// Removes the commission amount from whichever bucket it currently
    /// occupies, preserving the conservation invariant.
    pub async fn cancel(&self, txn_id: Uuid) -> LedgerResult<AffiliateTransaction> {
        let current = self
            .database
            .get_transaction_by_id(txn_id)
            .await?
            .ok_or_else(|| LedgerError::InvalidState(format!("Transaction {} not found", txn_id)))?;

        if !matches!(
            current.status,
            TransactionStatus::Pending | TransactionStatus::Approved
        ) {
            return Err(LedgerError::InvalidState(format!(
                "Transaction {} cannot be cancelled from {:?}",
                txn_id, current.status
            )));
        }

        let mut tx = self.database.begin_transaction().await?;

        // Re-check the status under the transaction; a concurrent transition loses
        let txn = self
            .database
            .transition_transaction(&mut tx, txn_id, current.status, TransactionStatus::Cancelled)
            .await?
            .ok_or_else(|| {
                LedgerError::InvalidState(format!(
                    "Transaction {} changed state concurrently",
                    txn_id
                ))
            })?;

        self.database
            .remove_from_bucket(&mut tx, txn.affiliate_id, current.status, txn.commission_amount)
            .await?;

        tx.commit()
            .await
            .map_err(|e| LedgerError::StorageWriteFailed(e.into()))?;

        warn!(
            "Cancelled transaction {} ({} removed from {:?} bucket)",
            txn.id, txn.commission_amount, current.status
        );
        Ok(txn)
    }

    /// Settles an affiliate's entire approved balance into a payout batch
    ///
    /// Gated on the affiliate's payout threshold. Captures the full approved
    /// balance, zeroes it, adds it to the paid bucket, and marks every
    /// approved transaction paid in one shot. The period bounds are recorded
    /// on the payout but do not filter which transactions settle (see
    /// DESIGN.md).
    ///
    /// The settlement read locks the affiliate row, so a concurrent payout
    /// or approval waits and then sees the settled balance; the same amount
    /// can never be captured twice.
    pub async fn create_payout(
        &self,
        affiliate_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> LedgerResult<Payout> {
        let mut tx = self.database.begin_transaction().await?;

        let affiliate = self
            .database
            .get_affiliate_for_settlement(&mut tx, affiliate_id)
            .await?
            .ok_or(LedgerError::AffiliateNotFound(affiliate_id))?;

        if affiliate.approved_commission < affiliate.payout_threshold {
            return Err(LedgerError::InvalidState(format!(
                "Approved commission {} is below the payout threshold {}",
                affiliate.approved_commission, affiliate.payout_threshold
            )));
        }

        let amount = affiliate.approved_commission;

        let payout = self
            .database
            .insert_payout(&mut tx, affiliate.id, amount, period_start, period_end)
            .await?;

        let settled = self
            .database
            .mark_approved_transactions_paid(&mut tx, affiliate.id)
            .await?;

        self.database
            .settle_approved_balance(&mut tx, affiliate.id, amount)
            .await?;

        tx.commit()
            .await
            .map_err(|e| LedgerError::StorageWriteFailed(e.into()))?;

        info!(
            "Created payout {} for affiliate {}: {} across {} transactions",
            payout.id, affiliate.code, amount, settled
        );
        Ok(payout)
    }

    /// Advances a payout through its settlement lifecycle
    ///
    /// Allowed edges: pending -> processing, processing -> completed|failed.
    pub async fn update_payout_status(
        &self,
        payout_id: Uuid,
        to: PayoutStatus,
        reference: Option<&str>,
    ) -> LedgerResult<Payout> {
        let from = match to {
            PayoutStatus::Processing => PayoutStatus::Pending,
            PayoutStatus::Completed | PayoutStatus::Failed => PayoutStatus::Processing,
            PayoutStatus::Pending => {
                return Err(LedgerError::InvalidState(
                    "A payout cannot return to pending".to_string(),
                ))
            }
        };

        self.database
            .transition_payout(payout_id, from, to, reference)
            .await?
            .ok_or_else(|| {
                LedgerError::InvalidState(format!(
                    "Payout {} is not in {:?} state",
                    payout_id, from
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn test_affiliate(kind: CommissionKind) -> Affiliate {
        Affiliate {
            id: Uuid::new_v4(),
            code: "partner".to_string(),
            name: "Partner".to_string(),
            email: None,
            status: AffiliateStatus::Active,
            commission_kind: kind,
            commission_initial: dec!(25),
            commission_rebill: dec!(10),
            commission_unlock: dec!(15),
            payout_threshold: dec!(100),
            total_clicks: 0,
            total_signups: 0,
            total_rebills: 0,
            total_unlocks: 0,
            total_revenue: Decimal::ZERO,
            pending_commission: Decimal::ZERO,
            approved_commission: Decimal::ZERO,
            paid_commission: Decimal::ZERO,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_rate_lookup_per_kind() {
        let affiliate = test_affiliate(CommissionKind::Percentage);

        assert_eq!(rate_for(&affiliate, TransactionKind::Initial).unwrap(), dec!(25));
        assert_eq!(rate_for(&affiliate, TransactionKind::Rebill).unwrap(), dec!(10));
        assert_eq!(rate_for(&affiliate, TransactionKind::Unlock).unwrap(), dec!(15));
        assert!(matches!(
            rate_for(&affiliate, TransactionKind::Refund),
            Err(LedgerError::InvalidTransactionType(_))
        ));
    }

    #[test]
    fn test_percentage_commission_computation() {
        // A rebill of 100 at 10% yields exactly 10.00
        assert_eq!(
            commission_for(CommissionKind::Percentage, dec!(10), dec!(100)),
            dec!(10.00)
        );
        assert_eq!(
            commission_for(CommissionKind::Percentage, dec!(25), dec!(29.95)),
            dec!(7.49)
        );
        assert_eq!(
            commission_for(CommissionKind::Percentage, dec!(0), dec!(100)),
            dec!(0.00)
        );
    }

    #[test]
    fn test_flat_commission_ignores_gross() {
        assert_eq!(commission_for(CommissionKind::Flat, dec!(5), dec!(100)), dec!(5));
        assert_eq!(commission_for(CommissionKind::Flat, dec!(5), dec!(9.95)), dec!(5));
    }

    #[test]
    fn test_commission_rounding_is_two_places() {
        // 33.33% of 9.99 = 3.329667, banker's rounding to 3.33
        assert_eq!(
            commission_for(CommissionKind::Percentage, dec!(33.33), dec!(9.99)),
            dec!(3.33)
        );
    }

    mod db {
        //! End-to-end ledger properties against a live database

        use super::*;
        use crate::config::Config;
        use crate::database::Database;

        async fn setup() -> (Arc<Database>, LedgerService) {
            let config = Config::load().unwrap();
            let db = Arc::new(Database::new(&config.database_url, 2).await.unwrap());
            db.migrate().await.unwrap();
            let ledger = LedgerService::new(db.clone());
            (db, ledger)
        }

        async fn seed_affiliate(db: &Database, status: AffiliateStatus) -> Affiliate {
            db.create_affiliate(
                CreateAffiliateRequest {
                    code: format!("ledger-{}", Uuid::new_v4().simple()),
                    name: "Ledger Partner".to_string(),
                    email: None,
                    status: Some(status),
                    commission_kind: Some(CommissionKind::Percentage),
                    commission_initial: Some(dec!(25)),
                    commission_rebill: Some(dec!(10)),
                    commission_unlock: Some(dec!(15)),
                    payout_threshold: Some(dec!(100)),
                },
                dec!(100),
            )
            .await
            .unwrap()
        }

        async fn assert_conserved(db: &Database, affiliate_id: Uuid) {
            let affiliate = db.get_affiliate_by_id(affiliate_id).await.unwrap().unwrap();
            let ledger_total = db.sum_ledger_commission(affiliate_id).await.unwrap();
            let buckets = affiliate.pending_commission
                + affiliate.approved_commission
                + affiliate.paid_commission;
            assert_eq!(buckets, ledger_total, "balance buckets drifted from ledger");
        }

        #[tokio::test]
        #[ignore] // Requires database connection
        async fn test_balance_conservation_across_chain() {
            let (db, ledger) = setup().await;
            let affiliate = seed_affiliate(&db, AffiliateStatus::Active).await;

            let t1 = ledger
                .record_commission(
                    affiliate.id, "user-1", TransactionKind::Initial,
                    "ext-1", "plan-monthly", dec!(400), None, None,
                )
                .await
                .unwrap();
            let t2 = ledger
                .record_commission(
                    affiliate.id, "user-2", TransactionKind::Rebill,
                    "ext-2", "plan-monthly", dec!(200), None, None,
                )
                .await
                .unwrap();
            assert_conserved(&db, affiliate.id).await;

            ledger.approve(t1.id).await.unwrap();
            ledger.approve(t2.id).await.unwrap();
            assert_conserved(&db, affiliate.id).await;

            ledger
                .create_payout(
                    affiliate.id,
                    NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
                    NaiveDate::from_ymd_opt(2026, 8, 31).unwrap(),
                )
                .await
                .unwrap();
            assert_conserved(&db, affiliate.id).await;

            let settled = db.get_affiliate_by_id(affiliate.id).await.unwrap().unwrap();
            assert_eq!(settled.approved_commission, Decimal::ZERO);
            assert_eq!(settled.paid_commission, dec!(120)); // 25% of 400 + 10% of 200
        }

        #[tokio::test]
        #[ignore] // Requires database connection
        async fn test_inactive_affiliate_rejected_without_side_effects() {
            let (db, ledger) = setup().await;
            let affiliate = seed_affiliate(&db, AffiliateStatus::Suspended).await;

            let result = ledger
                .record_commission(
                    affiliate.id, "user-1", TransactionKind::Initial,
                    "ext-x", "plan-monthly", dec!(100), None, None,
                )
                .await;
            assert!(matches!(result, Err(LedgerError::AffiliateInactive(_))));

            let after = db.get_affiliate_by_id(affiliate.id).await.unwrap().unwrap();
            assert_eq!(after.total_signups, 0);
            assert_eq!(after.total_revenue, Decimal::ZERO);
            assert_eq!(after.pending_commission, Decimal::ZERO);
            assert_eq!(db.sum_ledger_commission(affiliate.id).await.unwrap(), Decimal::ZERO);
        }

        #[tokio::test]
        #[ignore] // Requires database connection
        async fn test_payout_threshold_gate() {
            let (db, ledger) = setup().await;
            let affiliate = seed_affiliate(&db, AffiliateStatus::Active).await;
            let period_start = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
            let period_end = NaiveDate::from_ymd_opt(2026, 8, 31).unwrap();

            // 25% of 200 = 50 approved, below the 100 threshold
            let t1 = ledger
                .record_commission(
                    affiliate.id, "user-1", TransactionKind::Initial,
                    "ext-1", "plan", dec!(200), None, None,
                )
                .await
                .unwrap();
            ledger.approve(t1.id).await.unwrap();

            let below = ledger.create_payout(affiliate.id, period_start, period_end).await;
            assert!(matches!(below, Err(LedgerError::InvalidState(_))));
            assert!(db
                .list_payouts(affiliate.id, Pagination { limit: None, offset: None })
                .await
                .unwrap()
                .is_empty());

            // Another 25% of 400 = 100 brings the balance to 150
            let t2 = ledger
                .record_commission(
                    affiliate.id, "user-2", TransactionKind::Initial,
                    "ext-2", "plan", dec!(400), None, None,
                )
                .await
                .unwrap();
            ledger.approve(t2.id).await.unwrap();

            let payout = ledger
                .create_payout(affiliate.id, period_start, period_end)
                .await
                .unwrap();
            assert_eq!(payout.amount, dec!(150));

            let after = db.get_affiliate_by_id(affiliate.id).await.unwrap().unwrap();
            assert_eq!(after.approved_commission, Decimal::ZERO);
            assert_eq!(after.paid_commission, dec!(150));

            for txn in db
                .list_transactions(affiliate.id, Pagination { limit: None, offset: None })
                .await
                .unwrap()
            {
                assert_eq!(txn.status, TransactionStatus::Paid);
            }
            assert_conserved(&db, affiliate.id).await;
        }

        #[tokio::test]
        #[ignore] // Requires database connection
        async fn test_concurrent_payouts_capture_balance_once() {
            let (db, ledger) = setup().await;
            let affiliate = seed_affiliate(&db, AffiliateStatus::Active).await;
            let period_start = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
            let period_end = NaiveDate::from_ymd_opt(2026, 8, 31).unwrap();

            // 25% of 600 = 150 approved, above the 100 threshold
            let txn = ledger
                .record_commission(
                    affiliate.id, "user-1", TransactionKind::Initial,
                    "ext-1", "plan", dec!(600), None, None,
                )
                .await
                .unwrap();
            ledger.approve(txn.id).await.unwrap();

            // Double submit: the loser waits on the row lock, then sees the
            // settled balance and fails the threshold gate
            let (first, second) = tokio::join!(
                ledger.create_payout(affiliate.id, period_start, period_end),
                ledger.create_payout(affiliate.id, period_start, period_end),
            );
            assert!(
                first.is_ok() != second.is_ok(),
                "exactly one of two simultaneous payout submissions may settle"
            );
            let loser = if first.is_ok() { second } else { first };
            assert!(matches!(loser, Err(LedgerError::InvalidState(_))));

            let payouts = db
                .list_payouts(affiliate.id, Pagination { limit: None, offset: None })
                .await
                .unwrap();
            assert_eq!(payouts.len(), 1);
            assert_eq!(payouts[0].amount, dec!(150));

            let after = db.get_affiliate_by_id(affiliate.id).await.unwrap().unwrap();
            assert_eq!(after.approved_commission, Decimal::ZERO);
            assert_eq!(after.paid_commission, dec!(150));
            assert_conserved(&db, affiliate.id).await;
        }

        #[tokio::test]
        #[ignore] // Requires database connection
        async fn test_double_approve_rejected() {
            let (db, ledger) = setup().await;
            let affiliate = seed_affiliate(&db, AffiliateStatus::Active).await;

            let txn = ledger
                .record_commission(
                    affiliate.id, "user-1", TransactionKind::Unlock,
                    "ext-1", "ppv-42", dec!(19.95), None, None,
                )
                .await
                .unwrap();

            ledger.approve(txn.id).await.unwrap();
            let second = ledger.approve(txn.id).await;
            assert!(matches!(second, Err(LedgerError::InvalidState(_))));
            assert_conserved(&db, affiliate.id).await;
        }

        #[tokio::test]
        #[ignore] // Requires database connection
        async fn test_cancel_preserves_conservation() {
            let (db, ledger) = setup().await;
            let affiliate = seed_affiliate(&db, AffiliateStatus::Active).await;

            let txn = ledger
                .record_commission(
                    affiliate.id, "user-1", TransactionKind::Rebill,
                    "ext-1", "plan", dec!(100), None, None,
                )
                .await
                .unwrap();

            ledger.cancel(txn.id).await.unwrap();

            let after = db.get_affiliate_by_id(affiliate.id).await.unwrap().unwrap();
            assert_eq!(after.pending_commission, Decimal::ZERO);
            assert_conserved(&db, affiliate.id).await;

            // A cancelled transaction is terminal
            let again = ledger.cancel(txn.id).await;
            assert!(matches!(again, Err(LedgerError::InvalidState(_))));
        }
    }
}
