//! Database operations and connection management
//!
//! Provides the database layer for the affiliate service, handling PostgreSQL
//! connections, migrations, and all CRUD operations for affiliates, promo
//! codes, clicks, the commission transaction ledger, and payouts.
//!
//! Every aggregate mutation is an atomic SQL increment (`SET col = col + $n`)
//! executed inside a caller-supplied transaction; aggregates are never
//! read-modify-written in application code.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    Postgres, Transaction,
};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::models::*;

const AFFILIATE_COLUMNS: &str = "id, code, name, email, status, commission_kind, \
     commission_initial, commission_rebill, commission_unlock, payout_threshold, \
     total_clicks, total_signups, total_rebills, total_unlocks, total_revenue, \
     pending_commission, approved_commission, paid_commission, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, affiliate_id, promo_code_id, click_id, user_id, \
     kind, status, external_txn_id, plan_id, gross_amount, commission_kind, \
     commission_rate, commission_amount, created_at, updated_at";

const CLICK_COLUMNS: &str = "id, affiliate_id, promo_code_id, ip_address, user_agent, \
     referrer, landing_page, converted, conversion_kind, conversion_value, \
     converted_at, created_at";

const PAYOUT_COLUMNS: &str = "id, affiliate_id, amount, period_start, period_end, \
     status, reference, created_at, updated_at";

const PROMO_COLUMNS: &str = "id, code, description, is_active, usage_count, \
     total_revenue, total_commission, created_at, updated_at";

/// Main database service with connection pooling
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Creates a new database connection with optimized pool settings
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        info!("Connected to database with {} max connections", max_connections);

        Ok(Self { pool })
    }

    /// Runs pending database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Verifies database connectivity
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Database health check failed")?;
        Ok(())
    }

    /// Starts a database transaction for atomic operations
    pub async fn begin_transaction(&self) -> Result<Transaction<'_, Postgres>> {
        self.pool.begin().await.context("Failed to begin transaction")
    }

    // === Affiliate management ===

    /// Creates a new affiliate account
    pub async fn create_affiliate(
        &self,
        request: CreateAffiliateRequest,
        default_threshold: Decimal,
    ) -> Result<Affiliate> {
        let affiliate = sqlx::query_as::<_, Affiliate>(&format!(
            r#"
            INSERT INTO affiliates (code, name, email, status, commission_kind,
                                    commission_initial, commission_rebill, commission_unlock,
                                    payout_threshold)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {AFFILIATE_COLUMNS}
            "#
        ))
        .bind(&request.code)
        .bind(&request.name)
        .bind(&request.email)
        .bind(request.status.unwrap_or_default())
        .bind(request.commission_kind.unwrap_or_default())
        .bind(request.commission_initial.unwrap_or_default())
        .bind(request.commission_rebill.unwrap_or_default())
        .bind(request.commission_unlock.unwrap_or_default())
        .bind(request.payout_threshold.unwrap_or(default_threshold))
        .fetch_one(&self.pool)
        .await
        .context("Failed to create affiliate")?;

        info!("Created affiliate {} (ID: {})", affiliate.code, affiliate.id);
        Ok(affiliate)
    }

    /// Retrieves an affiliate by its unique ID
    pub async fn get_affiliate_by_id(&self, affiliate_id: Uuid) -> Result<Option<Affiliate>> {
        let affiliate = sqlx::query_as::<_, Affiliate>(&format!(
            "SELECT {AFFILIATE_COLUMNS} FROM affiliates WHERE id = $1"
        ))
        .bind(affiliate_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get affiliate by ID")?;

        Ok(affiliate)
    }

    /// Finds an affiliate by its referral code
    pub async fn get_affiliate_by_code(&self, code: &str) -> Result<Option<Affiliate>> {
        let affiliate = sqlx::query_as::<_, Affiliate>(&format!(
            "SELECT {AFFILIATE_COLUMNS} FROM affiliates WHERE code = $1"
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get affiliate by code")?;

        Ok(affiliate)
    }

    /// Retrieves an affiliate inside an open transaction
    pub async fn get_affiliate_by_id_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        affiliate_id: Uuid,
    ) -> Result<Option<Affiliate>> {
        let affiliate = sqlx::query_as::<_, Affiliate>(&format!(
            "SELECT {AFFILIATE_COLUMNS} FROM affiliates WHERE id = $1"
        ))
        .bind(affiliate_id)
        .fetch_optional(&mut **tx)
        .await
        .context("Failed to get affiliate by ID")?;

        Ok(affiliate)
    }

    /// Retrieves an affiliate with its row locked until the transaction ends
    ///
    /// For settlement reads whose value feeds later writes in the same
    /// transaction: the `FOR UPDATE` lock keeps a concurrent settlement or
    /// bucket move from reading the same balance.
    pub async fn get_affiliate_for_settlement(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        affiliate_id: Uuid,
    ) -> Result<Option<Affiliate>> {
        let affiliate = sqlx::query_as::<_, Affiliate>(&format!(
            "SELECT {AFFILIATE_COLUMNS} FROM affiliates WHERE id = $1 FOR UPDATE"
        ))
        .bind(affiliate_id)
        .fetch_optional(&mut **tx)
        .await
        .context("Failed to get affiliate for settlement")?;

        Ok(affiliate)
    }

    /// Updates affiliate profile and commission configuration
    pub async fn update_affiliate(
        &self,
        affiliate_id: Uuid,
        request: UpdateAffiliateRequest,
    ) -> Result<Affiliate> {
        let affiliate = sqlx::query_as::<_, Affiliate>(&format!(
            r#"
            UPDATE affiliates SET
                name = COALESCE($2, name),
                email = COALESCE($3, email),
                status = COALESCE($4, status),
                commission_kind = COALESCE($5, commission_kind),
                commission_initial = COALESCE($6, commission_initial),
                commission_rebill = COALESCE($7, commission_rebill),
                commission_unlock = COALESCE($8, commission_unlock),
                payout_threshold = COALESCE($9, payout_threshold),
                updated_at = $10
            WHERE id = $1
            RETURNING {AFFILIATE_COLUMNS}
            "#
        ))
        .bind(affiliate_id)
        .bind(request.name)
        .bind(request.email)
        .bind(request.status)
        .bind(request.commission_kind)
        .bind(request.commission_initial)
        .bind(request.commission_rebill)
        .bind(request.commission_unlock)
        .bind(request.payout_threshold)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("Failed to update affiliate")?;

        Ok(affiliate)
    }

    /// Lists affiliates with pagination support
    pub async fn list_affiliates(&self, pagination: Pagination) -> Result<Vec<Affiliate>> {
        let affiliates = sqlx::query_as::<_, Affiliate>(&format!(
            r#"
            SELECT {AFFILIATE_COLUMNS}
            FROM affiliates
            ORDER BY created_at DESC
            LIMIT $1 OFFSET $2
            "#
        ))
        .bind(pagination.limit.unwrap_or(100))
        .bind(pagination.offset.unwrap_or(0))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list affiliates")?;

        Ok(affiliates)
    }

    /// Atomically bumps an affiliate's click counter by 1
    pub async fn increment_click_count(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        affiliate_id: Uuid,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE affiliates SET total_clicks = total_clicks + 1, updated_at = $2 WHERE id = $1",
        )
        .bind(affiliate_id)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await
        .context("Failed to increment click count")?;

        Ok(())
    }

    /// Applies the aggregate effects of a newly recorded commission
    ///
    /// Bumps revenue, pending commission, and exactly one of the per-kind
    /// event counters, all as atomic SQL increments.
    pub async fn apply_commission_aggregates(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        affiliate_id: Uuid,
        kind: TransactionKind,
        gross_amount: Decimal,
        commission_amount: Decimal,
    ) -> Result<()> {
        let counter = match kind {
            TransactionKind::Initial => "total_signups",
            TransactionKind::Rebill => "total_rebills",
            TransactionKind::Unlock => "total_unlocks",
            TransactionKind::Refund => {
                anyhow::bail!("Refunds do not accrue commission aggregates")
            }
        };

        sqlx::query(&format!(
            r#"
            UPDATE affiliates SET
                total_revenue = total_revenue + $2,
                pending_commission = pending_commission + $3,
                {counter} = {counter} + 1,
                updated_at = $4
            WHERE id = $1
            "#
        ))
        .bind(affiliate_id)
        .bind(gross_amount)
        .bind(commission_amount)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await
        .context("Failed to apply commission aggregates")?;

        Ok(())
    }

    /// Moves a commission amount from the pending bucket to the approved bucket
    pub async fn move_pending_to_approved(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        affiliate_id: Uuid,
        amount: Decimal,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE affiliates SET
                pending_commission = pending_commission - $2,
                approved_commission = approved_commission + $2,
                updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(affiliate_id)
        .bind(amount)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await
        .context("Failed to move commission to approved")?;

        Ok(())
    }

    /// Removes a cancelled commission amount from the bucket it occupies
    pub async fn remove_from_bucket(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        affiliate_id: Uuid,
        from_status: TransactionStatus,
        amount: Decimal,
    ) -> Result<()> {
        let column = match from_status {
            TransactionStatus::Pending => "pending_commission",
            TransactionStatus::Approved => "approved_commission",
            other => anyhow::bail!("Cannot remove commission from {:?} bucket", other),
        };

        sqlx::query(&format!(
            "UPDATE affiliates SET {column} = {column} - $2, updated_at = $3 WHERE id = $1"
        ))
        .bind(affiliate_id)
        .bind(amount)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await
        .context("Failed to remove cancelled commission from bucket")?;

        Ok(())
    }

    /// Settles an affiliate's approved balance into the paid bucket
    pub async fn settle_approved_balance(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        affiliate_id: Uuid,
        amount: Decimal,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE affiliates SET
                approved_commission = approved_commission - $2,
                paid_commission = paid_commission + $2,
                updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(affiliate_id)
        .bind(amount)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await
        .context("Failed to settle approved balance")?;

        Ok(())
    }

    // === Promo codes ===

    /// Creates a new promo code
    pub async fn create_promo_code(&self, request: CreatePromoCodeRequest) -> Result<PromoCode> {
        let promo = sqlx::query_as::<_, PromoCode>(&format!(
            r#"
            INSERT INTO promo_codes (code, description, is_active)
            VALUES ($1, $2, $3)
            RETURNING {PROMO_COLUMNS}
            "#
        ))
        .bind(&request.code)
        .bind(&request.description)
        .bind(request.is_active.unwrap_or(true))
        .fetch_one(&self.pool)
        .await
        .context("Failed to create promo code")?;

        info!("Created promo code {} (ID: {})", promo.code, promo.id);
        Ok(promo)
    }

    /// Retrieves a promo code by ID
    pub async fn get_promo_code_by_id(&self, promo_id: Uuid) -> Result<Option<PromoCode>> {
        let promo = sqlx::query_as::<_, PromoCode>(&format!(
            "SELECT {PROMO_COLUMNS} FROM promo_codes WHERE id = $1"
        ))
        .bind(promo_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get promo code by ID")?;

        Ok(promo)
    }

    /// Finds an active promo code by its code string
    pub async fn get_active_promo_code(&self, code: &str) -> Result<Option<PromoCode>> {
        let promo = sqlx::query_as::<_, PromoCode>(&format!(
            "SELECT {PROMO_COLUMNS} FROM promo_codes WHERE code = $1 AND is_active = true"
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get promo code by code")?;

        Ok(promo)
    }

    /// Lists promo codes with pagination support
    pub async fn list_promo_codes(&self, pagination: Pagination) -> Result<Vec<PromoCode>> {
        let promos = sqlx::query_as::<_, PromoCode>(&format!(
            r#"
            SELECT {PROMO_COLUMNS}
            FROM promo_codes
            ORDER BY created_at DESC
            LIMIT $1 OFFSET $2
            "#
        ))
        .bind(pagination.limit.unwrap_or(100))
        .bind(pagination.offset.unwrap_or(0))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list promo codes")?;

        Ok(promos)
    }

    /// Accrues one use and its revenue/commission onto a promo code
    pub async fn apply_promo_usage(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        promo_id: Uuid,
        revenue: Decimal,
        commission: Decimal,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE promo_codes SET
                usage_count = usage_count + 1,
                total_revenue = total_revenue + $2,
                total_commission = total_commission + $3,
                updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(promo_id)
        .bind(revenue)
        .bind(commission)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await
        .context("Failed to apply promo code usage")?;

        Ok(())
    }

    // === Click tracking ===

    /// Persists a single inbound click
    pub async fn create_click(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        affiliate_id: Uuid,
        promo_code_id: Option<Uuid>,
        meta: &RequestMeta,
    ) -> Result<Click> {
        let click = sqlx::query_as::<_, Click>(&format!(
            r#"
            INSERT INTO clicks (affiliate_id, promo_code_id, ip_address, user_agent,
                                referrer, landing_page)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {CLICK_COLUMNS}
            "#
        ))
        .bind(affiliate_id)
        .bind(promo_code_id)
        .bind(&meta.ip_address)
        .bind(&meta.user_agent)
        .bind(&meta.referrer)
        .bind(&meta.landing_page)
        .fetch_one(&mut **tx)
        .await
        .context("Failed to create click")?;

        Ok(click)
    }

    /// Retrieves a click by ID
    pub async fn get_click_by_id(&self, click_id: Uuid) -> Result<Option<Click>> {
        let click = sqlx::query_as::<_, Click>(&format!(
            "SELECT {CLICK_COLUMNS} FROM clicks WHERE id = $1"
        ))
        .bind(click_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get click by ID")?;

        Ok(click)
    }

    /// Marks a click as converted, exactly once
    ///
    /// Guarded by the current conversion flag; a click that is already
    /// converted is left untouched and `false` is returned.
    pub async fn mark_click_converted(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        click_id: Uuid,
        kind: TransactionKind,
        value: Decimal,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE clicks SET
                converted = true,
                conversion_kind = $2,
                conversion_value = $3,
                converted_at = $4
            WHERE id = $1 AND converted = false
            "#,
        )
        .bind(click_id)
        .bind(kind)
        .bind(value)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await
        .context("Failed to mark click converted")?;

        Ok(result.rows_affected() == 1)
    }

    // === Commission transactions ===

    /// Inserts a new commission record in `pending` state
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_transaction(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        affiliate_id: Uuid,
        promo_code_id: Option<Uuid>,
        click_id: Option<Uuid>,
        user_id: &str,
        kind: TransactionKind,
        external_txn_id: &str,
        plan_id: &str,
        gross_amount: Decimal,
        commission_kind: CommissionKind,
        commission_rate: Decimal,
        commission_amount: Decimal,
    ) -> Result<AffiliateTransaction> {
        let txn = sqlx::query_as::<_, AffiliateTransaction>(&format!(
            r#"
            INSERT INTO transactions (affiliate_id, promo_code_id, click_id, user_id, kind,
                                      status, external_txn_id, plan_id, gross_amount,
                                      commission_kind, commission_rate, commission_amount)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(affiliate_id)
        .bind(promo_code_id)
        .bind(click_id)
        .bind(user_id)
        .bind(kind)
        .bind(TransactionStatus::Pending)
        .bind(external_txn_id)
        .bind(plan_id)
        .bind(gross_amount)
        .bind(commission_kind)
        .bind(commission_rate)
        .bind(commission_amount)
        .fetch_one(&mut **tx)
        .await
        .context("Failed to insert transaction")?;

        Ok(txn)
    }

    /// Retrieves a commission transaction by ID
    pub async fn get_transaction_by_id(&self, txn_id: Uuid) -> Result<Option<AffiliateTransaction>> {
        let txn = sqlx::query_as::<_, AffiliateTransaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1"
        ))
        .bind(txn_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get transaction by ID")?;

        Ok(txn)
    }

    /// Lists an affiliate's commission transactions, newest first
    pub async fn list_transactions(
        &self,
        affiliate_id: Uuid,
        pagination: Pagination,
    ) -> Result<Vec<AffiliateTransaction>> {
        let txns = sqlx::query_as::<_, AffiliateTransaction>(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM transactions
            WHERE affiliate_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(affiliate_id)
        .bind(pagination.limit.unwrap_or(100))
        .bind(pagination.offset.unwrap_or(0))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list transactions")?;

        Ok(txns)
    }

    /// Transitions a transaction between statuses, guarded by the current status
    ///
    /// Returns the updated record, or `None` if the transaction was not in
    /// the expected source status (the state machine treats that as an
    /// invalid transition, with no mutation performed).
    pub async fn transition_transaction(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        txn_id: Uuid,
        from: TransactionStatus,
        to: TransactionStatus,
    ) -> Result<Option<AffiliateTransaction>> {
        let txn = sqlx::query_as::<_, AffiliateTransaction>(&format!(
            r#"
            UPDATE transactions SET status = $3, updated_at = $4
            WHERE id = $1 AND status = $2
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(txn_id)
        .bind(from)
        .bind(to)
        .bind(Utc::now())
        .fetch_optional(&mut **tx)
        .await
        .context("Failed to transition transaction status")?;

        Ok(txn)
    }

    /// Marks every approved transaction for an affiliate as paid, in one shot
    ///
    /// Returns the number of settled transactions. Deliberately not scoped to
    /// a payout period; see DESIGN.md.
    pub async fn mark_approved_transactions_paid(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        affiliate_id: Uuid,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE transactions SET status = $3, updated_at = $4
            WHERE affiliate_id = $1 AND status = $2
            "#,
        )
        .bind(affiliate_id)
        .bind(TransactionStatus::Approved)
        .bind(TransactionStatus::Paid)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await
        .context("Failed to mark approved transactions paid")?;

        Ok(result.rows_affected())
    }

    /// Recomputes the total non-cancelled commission for an affiliate
    ///
    /// Used by reconciliation to verify the denormalized balance buckets
    /// against the ledger itself.
    pub async fn sum_ledger_commission(&self, affiliate_id: Uuid) -> Result<Decimal> {
        let total = sqlx::query_scalar::<_, Decimal>(
            r#"
            SELECT COALESCE(SUM(commission_amount), 0)
            FROM transactions
            WHERE affiliate_id = $1 AND status != $2
            "#,
        )
        .bind(affiliate_id)
        .bind(TransactionStatus::Cancelled)
        .fetch_one(&self.pool)
        .await
        .context("Failed to sum ledger commission")?;

        Ok(total)
    }

    // === Payouts ===

    /// Inserts a payout record capturing a settled balance
    pub async fn insert_payout(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        affiliate_id: Uuid,
        amount: Decimal,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Payout> {
        let payout = sqlx::query_as::<_, Payout>(&format!(
            r#"
            INSERT INTO payouts (affiliate_id, amount, period_start, period_end)
            VALUES ($1, $2, $3, $4)
            RETURNING {PAYOUT_COLUMNS}
            "#
        ))
        .bind(affiliate_id)
        .bind(amount)
        .bind(period_start)
        .bind(period_end)
        .fetch_one(&mut **tx)
        .await
        .context("Failed to insert payout")?;

        Ok(payout)
    }

    /// Retrieves a payout by ID
    pub async fn get_payout_by_id(&self, payout_id: Uuid) -> Result<Option<Payout>> {
        let payout = sqlx::query_as::<_, Payout>(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM payouts WHERE id = $1"
        ))
        .bind(payout_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get payout by ID")?;

        Ok(payout)
    }

    /// Lists an affiliate's payouts, newest first
    pub async fn list_payouts(
        &self,
        affiliate_id: Uuid,
        pagination: Pagination,
    ) -> Result<Vec<Payout>> {
        let payouts = sqlx::query_as::<_, Payout>(&format!(
            r#"
            SELECT {PAYOUT_COLUMNS}
            FROM payouts
            WHERE affiliate_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(affiliate_id)
        .bind(pagination.limit.unwrap_or(100))
        .bind(pagination.offset.unwrap_or(0))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list payouts")?;

        Ok(payouts)
    }

    /// Transitions a payout between statuses, guarded by the current status
    pub async fn transition_payout(
        &self,
        payout_id: Uuid,
        from: PayoutStatus,
        to: PayoutStatus,
        reference: Option<&str>,
    ) -> Result<Option<Payout>> {
        let payout = sqlx::query_as::<_, Payout>(&format!(
            r#"
            UPDATE payouts SET status = $3, reference = COALESCE($4, reference), updated_at = $5
            WHERE id = $1 AND status = $2
            RETURNING {PAYOUT_COLUMNS}
            "#
        ))
        .bind(payout_id)
        .bind(from)
        .bind(to)
        .bind(reference)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to transition payout status")?;

        Ok(payout)
    }
}
