//! Database models and schema definitions
//!
//! Complete data model for the FlexPress affiliate program: affiliate
//! accounts, promo codes, click tracking, the commission transaction ledger,
//! and payout batches. All models are designed for PostgreSQL with proper
//! serialization support.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use uuid::Uuid;

// Affiliates

/// Affiliate partner account with commission configuration and running aggregates
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Affiliate {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub email: Option<String>,
    pub status: AffiliateStatus,
    pub commission_kind: CommissionKind,
    pub commission_initial: Decimal,
    pub commission_rebill: Decimal,
    pub commission_unlock: Decimal,
    pub payout_threshold: Decimal,
    pub total_clicks: i64,
    pub total_signups: i64,
    pub total_rebills: i64,
    pub total_unlocks: i64,
    pub total_revenue: Decimal,
    pub pending_commission: Decimal,
    pub approved_commission: Decimal,
    pub paid_commission: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Affiliate account lifecycle; only `active` affiliates accrue clicks or commission
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq)]
#[sqlx(type_name = "affiliate_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AffiliateStatus {
    Pending,
    Active,
    Suspended,
}

/// How an affiliate's per-kind commission values are interpreted
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq)]
#[sqlx(type_name = "commission_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CommissionKind {
    /// Value is a percentage of the gross transaction amount
    Percentage,
    /// Value is a flat amount per transaction
    Flat,
}

/// Request payload for creating new affiliate accounts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAffiliateRequest {
    pub code: String,
    pub name: String,
    pub email: Option<String>,
    pub status: Option<AffiliateStatus>,
    pub commission_kind: Option<CommissionKind>,
    pub commission_initial: Option<Decimal>,
    pub commission_rebill: Option<Decimal>,
    pub commission_unlock: Option<Decimal>,
    pub payout_threshold: Option<Decimal>,
}

/// Request payload for updating existing affiliate accounts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateAffiliateRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub status: Option<AffiliateStatus>,
    pub commission_kind: Option<CommissionKind>,
    pub commission_initial: Option<Decimal>,
    pub commission_rebill: Option<Decimal>,
    pub commission_unlock: Option<Decimal>,
    pub payout_threshold: Option<Decimal>,
}

// Promo codes

/// Admin-managed promo code; referenced by clicks and transactions for reporting
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PromoCode {
    pub id: Uuid,
    pub code: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub usage_count: i64,
    pub total_revenue: Decimal,
    pub total_commission: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePromoCodeRequest {
    pub code: String,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

// Click tracking

/// One recorded inbound visit attributed to an affiliate
///
/// Immutable once written except for the single conversion update performed
/// by the commission ledger.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Click {
    pub id: Uuid,
    pub affiliate_id: Uuid,
    pub promo_code_id: Option<Uuid>,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    pub landing_page: String,
    pub converted: bool,
    pub conversion_kind: Option<TransactionKind>,
    pub conversion_value: Option<Decimal>,
    pub converted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Request metadata captured when recording a click
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMeta {
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    pub landing_page: String,
}

// Commission ledger

/// One qualifying monetizable event with its commission computation
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AffiliateTransaction {
    pub id: Uuid,
    pub affiliate_id: Uuid,
    pub promo_code_id: Option<Uuid>,
    pub click_id: Option<Uuid>,
    pub user_id: String,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub external_txn_id: String,
    pub plan_id: String,
    pub gross_amount: Decimal,
    pub commission_kind: CommissionKind,
    pub commission_rate: Decimal,
    pub commission_amount: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Kinds of monetizable events the ledger recognizes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq)]
#[sqlx(type_name = "transaction_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Initial,
    Rebill,
    Unlock,
    Refund,
}

/// Commission record lifecycle: pending -> approved -> paid, or cancelled
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq)]
#[sqlx(type_name = "transaction_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Approved,
    Paid,
    Cancelled,
}

/// Payment-provider confirmation delivered to the webhook endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub affiliate_id: Option<Uuid>,
    pub user_id: String,
    pub kind: TransactionKind,
    pub external_txn_id: String,
    pub plan_id: String,
    pub amount: Decimal,
    pub promo_code_id: Option<Uuid>,
    pub click_id: Option<Uuid>,
    /// Attribution cookie value, used to resolve the triple when explicit ids are absent
    pub attribution_token: Option<String>,
}

// Payouts

/// Batch settlement of one affiliate's approved commission for a period
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payout {
    pub id: Uuid,
    pub affiliate_id: Uuid,
    pub amount: Decimal,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub status: PayoutStatus,
    pub reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payout settlement lifecycle: pending -> processing -> completed or failed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq)]
#[sqlx(type_name = "payout_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePayoutRequest {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePayoutStatusRequest {
    pub status: PayoutStatus,
    pub reference: Option<String>,
}

// Reporting

/// Per-affiliate dashboard statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffiliateStats {
    pub affiliate_id: Uuid,
    pub code: String,
    pub total_clicks: i64,
    pub total_signups: i64,
    pub total_rebills: i64,
    pub total_unlocks: i64,
    pub conversion_rate: f64,
    pub total_revenue: Decimal,
    pub pending_commission: Decimal,
    pub approved_commission: Decimal,
    pub paid_commission: Decimal,
}

/// Result of recomputing an affiliate's ledger balance from the transaction table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub affiliate_id: Uuid,
    pub pending_commission: Decimal,
    pub approved_commission: Decimal,
    pub paid_commission: Decimal,
    pub balance_total: Decimal,
    pub ledger_total: Decimal,
    pub balanced: bool,
}

// Pagination

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

// Default implementations

impl Default for AffiliateStatus {
    fn default() -> Self {
        AffiliateStatus::Pending
    }
}

impl Default for CommissionKind {
    fn default() -> Self {
        CommissionKind::Percentage
    }
}

impl Default for TransactionStatus {
    fn default() -> Self {
        TransactionStatus::Pending
    }
}

impl Default for PayoutStatus {
    fn default() -> Self {
        PayoutStatus::Pending
    }
}

impl TransactionKind {
    /// Whether this kind may be recorded as a new commission event
    pub fn is_recordable(&self) -> bool {
        matches!(
            self,
            TransactionKind::Initial | TransactionKind::Rebill | TransactionKind::Unlock
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recordable_kinds() {
        assert!(TransactionKind::Initial.is_recordable());
        assert!(TransactionKind::Rebill.is_recordable());
        assert!(TransactionKind::Unlock.is_recordable());
        assert!(!TransactionKind::Refund.is_recordable());
    }

    #[test]
    fn test_status_defaults() {
        assert_eq!(AffiliateStatus::default(), AffiliateStatus::Pending);
        assert_eq!(TransactionStatus::default(), TransactionStatus::Pending);
        assert_eq!(PayoutStatus::default(), PayoutStatus::Pending);
        assert_eq!(CommissionKind::default(), CommissionKind::Percentage);
    }
}
