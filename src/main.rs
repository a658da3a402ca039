//! FlexPress affiliate service
//!
//! Affiliate attribution and commission ledger backend for the FlexPress
//! platform: records referral clicks, carries attribution through a signed
//! cookie, converts payment-provider webhooks into commission records, and
//! runs the approval/payout state machine behind an admin API.

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Json, Redirect},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

mod attribution;
mod config;
mod database;
mod error;
mod ledger;
mod middleware_auth;
mod models;
mod reporting;
mod tracker;

use attribution::AttributionService;
use config::Config;
use database::Database;
use error::{AppError, AppResult};
use ledger::LedgerService;
use models::*;
use reporting::ReportingService;
use tracker::TrackerService;

/// Shared application state containing all service instances
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub database: Arc<Database>,
    pub attribution: Arc<AttributionService>,
    pub tracker: Arc<TrackerService>,
    pub ledger: Arc<LedgerService>,
    pub reporting: Arc<ReportingService>,
}

/// Standard API response wrapper for consistent JSON responses
#[derive(Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T> ApiResponse<T> {
    /// Creates a successful API response with data
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Query parameters for the click tracking endpoint
#[derive(Deserialize)]
struct TrackQuery {
    /// Affiliate referral code
    aff: String,
    /// Optional promo code
    promo: Option<String>,
    /// Landing path to redirect to
    to: Option<String>,
}

/// Health check response with system status information
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    timestamp: chrono::DateTime<chrono::Utc>,
    database: bool,
}

/// Main entry point for the affiliate service
#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::load()?);

    // Initialize tracing, with RUST_LOG taking precedence over the configured level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.monitoring.log_level)),
        )
        .init();

    info!("Starting FlexPress affiliate service");
    info!("Configuration loaded successfully");

    // Initialize services
    let database = Arc::new(Database::new(&config.database_url, 10).await?);
    database.migrate().await?;
    info!("Database connection established");

    let attribution = Arc::new(AttributionService::new(&config)?);
    let tracker = Arc::new(TrackerService::new(database.clone(), attribution.clone()));
    let ledger = Arc::new(LedgerService::new(database.clone()));
    let reporting = Arc::new(ReportingService::new(database.clone()));

    info!("All services initialized successfully");

    let state = AppState {
        config: config.clone(),
        database,
        attribution,
        tracker,
        ledger,
        reporting,
    };

    // Admin routes sit behind the API-key middleware
    let admin = Router::new()
        .route("/admin/affiliates", get(list_affiliates).post(create_affiliate))
        .route("/admin/affiliates/:id", get(get_affiliate).put(update_affiliate))
        .route("/admin/affiliates/:id/stats", get(get_affiliate_stats))
        .route("/admin/affiliates/:id/reconciliation", get(reconcile_affiliate))
        .route("/admin/affiliates/:id/transactions", get(list_affiliate_transactions))
        .route(
            "/admin/affiliates/:id/payouts",
            get(list_affiliate_payouts).post(create_payout),
        )
        .route("/admin/transactions/:id/approve", post(approve_transaction))
        .route("/admin/transactions/:id/cancel", post(cancel_transaction))
        .route("/admin/payouts/:id", get(get_payout))
        .route("/admin/payouts/:id/status", put(update_payout_status))
        .route("/admin/promo-codes", get(list_promo_codes).post(create_promo_code))
        .route("/admin/promo-codes/:id", get(get_promo_code))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            middleware_auth::admin_auth_middleware,
        ));

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/track", get(track_click))
        .route("/attribution/clear", get(clear_attribution))
        .route("/webhooks/payment", post(payment_webhook))
        .merge(admin)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let listener = TcpListener::bind(&config.server_address).await?;
    info!("Server listening on {}", config.server_address);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Returns the current health status of the service
async fn health_check(State(state): State<AppState>) -> AppResult<Json<ApiResponse<HealthResponse>>> {
    let db_status = state.database.health_check().await.is_ok();

    let response = HealthResponse {
        status: if db_status { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now(),
        database: db_status,
    };

    Ok(Json(ApiResponse::success(response)))
}

/// Records a referral click and redirects the visitor to the landing page
///
/// Always redirects; attribution failure is silent and never blocks the
/// visitor-facing response.
async fn track_click(
    State(state): State<AppState>,
    Query(query): Query<TrackQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let destination = sanitize_landing_path(query.to.as_deref());
    let meta = request_meta(&headers, &destination);
    let existing_token = cookie_value(&headers, &state.config.attribution.cookie_name);

    let mut response_headers = HeaderMap::new();

    match state
        .tracker
        .record_click(
            &query.aff,
            query.promo.as_deref(),
            existing_token.as_deref(),
            &meta,
        )
        .await
    {
        Ok(Some(recorded)) => {
            let cookie = state
                .attribution
                .cookie(&state.config.attribution.cookie_name, &recorded.token);
            if let Ok(value) = cookie.parse() {
                response_headers.insert(header::SET_COOKIE, value);
            }
        }
        Ok(None) => {}
        Err(err) => {
            // Fail open: log and let the visitor through unattributed
            tracing::error!("Click recording failed: {}", err);
        }
    }

    (response_headers, Redirect::temporary(&destination))
}

/// Clears the attribution cookie
async fn clear_attribution(State(state): State<AppState>) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    let cookie = state
        .attribution
        .clear_cookie(&state.config.attribution.cookie_name);
    if let Ok(value) = cookie.parse() {
        headers.insert(header::SET_COOKIE, value);
    }
    (headers, StatusCode::NO_CONTENT)
}

/// Converts a payment-provider confirmation into a commission record
///
/// The affiliate/promo/click triple may arrive as explicit ids or be
/// resolved from the visitor's attribution token; explicit ids win.
async fn payment_webhook(
    State(state): State<AppState>,
    Json(event): Json<PaymentEvent>,
) -> AppResult<Json<ApiResponse<AffiliateTransaction>>> {
    let attribution = event
        .attribution_token
        .as_deref()
        .and_then(|token| state.attribution.decode(token));

    let affiliate_id = event
        .affiliate_id
        .or_else(|| attribution.as_ref().map(|a| a.affiliate_id))
        .ok_or_else(|| {
            AppError::Validation("Payment event carries no affiliate attribution".to_string())
        })?;
    let promo_code_id = event
        .promo_code_id
        .or_else(|| attribution.as_ref().and_then(|a| a.promo_code_id));
    let click_id = event
        .click_id
        .or_else(|| attribution.as_ref().map(|a| a.click_id));

    let txn = state
        .ledger
        .record_commission(
            affiliate_id,
            &event.user_id,
            event.kind,
            &event.external_txn_id,
            &event.plan_id,
            event.amount,
            promo_code_id,
            click_id,
        )
        .await?;

    Ok(Json(ApiResponse::success(txn)))
}

// === Admin: affiliates ===

/// Lists affiliate accounts with pagination
async fn list_affiliates(
    State(state): State<AppState>,
    Query(pagination): Query<Pagination>,
) -> AppResult<Json<ApiResponse<Vec<Affiliate>>>> {
    let affiliates = state.database.list_affiliates(pagination).await?;
    Ok(Json(ApiResponse::success(affiliates)))
}

/// Creates a new affiliate account
async fn create_affiliate(
    State(state): State<AppState>,
    Json(payload): Json<CreateAffiliateRequest>,
) -> AppResult<Json<ApiResponse<Affiliate>>> {
    if payload.code.trim().is_empty() {
        return Err(AppError::Validation("Affiliate code cannot be empty".to_string()));
    }

    let default_threshold = state
        .config
        .payouts
        .default_threshold
        .parse()
        .map_err(|_| AppError::Internal("Invalid default payout threshold".to_string()))?;

    let affiliate = state.database.create_affiliate(payload, default_threshold).await?;
    Ok(Json(ApiResponse::success(affiliate)))
}

/// Retrieves a single affiliate account
async fn get_affiliate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<Affiliate>>> {
    let affiliate = state
        .database
        .get_affiliate_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Affiliate {} not found", id)))?;
    Ok(Json(ApiResponse::success(affiliate)))
}

/// Updates affiliate profile and commission configuration
async fn update_affiliate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateAffiliateRequest>,
) -> AppResult<Json<ApiResponse<Affiliate>>> {
    state
        .database
        .get_affiliate_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Affiliate {} not found", id)))?;

    let affiliate = state.database.update_affiliate(id, payload).await?;
    Ok(Json(ApiResponse::success(affiliate)))
}

/// Provides dashboard statistics for an affiliate
async fn get_affiliate_stats(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<AffiliateStats>>> {
    let stats = state.reporting.affiliate_stats(id).await?;
    Ok(Json(ApiResponse::success(stats)))
}

/// Verifies the balance conservation invariant for an affiliate
async fn reconcile_affiliate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<ReconciliationReport>>> {
    let report = state.reporting.reconcile(id).await?;
    Ok(Json(ApiResponse::success(report)))
}

/// Lists an affiliate's commission transactions
async fn list_affiliate_transactions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(pagination): Query<Pagination>,
) -> AppResult<Json<ApiResponse<Vec<AffiliateTransaction>>>> {
    let txns = state.database.list_transactions(id, pagination).await?;
    Ok(Json(ApiResponse::success(txns)))
}

// === Admin: ledger state machine ===

/// Approves a pending commission transaction
async fn approve_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<AffiliateTransaction>>> {
    let txn = state.ledger.approve(id).await?;
    Ok(Json(ApiResponse::success(txn)))
}

/// Cancels a pending or approved commission transaction
async fn cancel_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<AffiliateTransaction>>> {
    let txn = state.ledger.cancel(id).await?;
    Ok(Json(ApiResponse::success(txn)))
}

// === Admin: payouts ===

/// Lists an affiliate's payout batches
async fn list_affiliate_payouts(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(pagination): Query<Pagination>,
) -> AppResult<Json<ApiResponse<Vec<Payout>>>> {
    let payouts = state.database.list_payouts(id, pagination).await?;
    Ok(Json(ApiResponse::success(payouts)))
}

/// Settles an affiliate's approved balance into a payout batch
async fn create_payout(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CreatePayoutRequest>,
) -> AppResult<Json<ApiResponse<Payout>>> {
    if payload.period_end < payload.period_start {
        return Err(AppError::Validation("Payout period end precedes start".to_string()));
    }

    let payout = state
        .ledger
        .create_payout(id, payload.period_start, payload.period_end)
        .await?;
    Ok(Json(ApiResponse::success(payout)))
}

/// Retrieves a single payout batch
async fn get_payout(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<Payout>>> {
    let payout = state
        .database
        .get_payout_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Payout {} not found", id)))?;
    Ok(Json(ApiResponse::success(payout)))
}

/// Advances a payout through its settlement lifecycle
async fn update_payout_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdatePayoutStatusRequest>,
) -> AppResult<Json<ApiResponse<Payout>>> {
    let payout = state
        .ledger
        .update_payout_status(id, payload.status, payload.reference.as_deref())
        .await?;
    Ok(Json(ApiResponse::success(payout)))
}

// === Admin: promo codes ===

/// Lists promo codes with pagination
async fn list_promo_codes(
    State(state): State<AppState>,
    Query(pagination): Query<Pagination>,
) -> AppResult<Json<ApiResponse<Vec<PromoCode>>>> {
    let promos = state.database.list_promo_codes(pagination).await?;
    Ok(Json(ApiResponse::success(promos)))
}

/// Retrieves a single promo code
async fn get_promo_code(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<PromoCode>>> {
    let promo = state
        .database
        .get_promo_code_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Promo code {} not found", id)))?;
    Ok(Json(ApiResponse::success(promo)))
}

/// Creates a new promo code
async fn create_promo_code(
    State(state): State<AppState>,
    Json(payload): Json<CreatePromoCodeRequest>,
) -> AppResult<Json<ApiResponse<PromoCode>>> {
    if payload.code.trim().is_empty() {
        return Err(AppError::Validation("Promo code cannot be empty".to_string()));
    }

    let promo = state.database.create_promo_code(payload).await?;
    Ok(Json(ApiResponse::success(promo)))
}

// === Request helpers ===

/// Captures request metadata for a click record
fn request_meta(headers: &HeaderMap, landing_page: &str) -> RequestMeta {
    let header_str =
        |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);

    // Honor the proxy-forwarded client address when present
    let ip_address = header_str("x-forwarded-for")
        .map(|chain| chain.split(',').next().unwrap_or("").trim().to_string())
        .filter(|ip| !ip.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    RequestMeta {
        ip_address,
        user_agent: header_str("user-agent"),
        referrer: header_str("referer"),
        landing_page: landing_page.to_string(),
    }
}

/// Extracts a named cookie value from the Cookie header
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

/// Restricts redirect targets to local paths
fn sanitize_landing_path(to: Option<&str>) -> String {
    match to {
        Some(path) if path.starts_with('/') && !path.starts_with("//") => path.to_string(),
        _ => "/".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_value_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "session=abc; fp_aff=tok123; other=x".parse().unwrap(),
        );

        assert_eq!(cookie_value(&headers, "fp_aff"), Some("tok123".to_string()));
        assert_eq!(cookie_value(&headers, "missing"), None);
        assert_eq!(cookie_value(&HeaderMap::new(), "fp_aff"), None);
    }

    #[test]
    fn test_landing_path_sanitization() {
        assert_eq!(sanitize_landing_path(Some("/join")), "/join");
        assert_eq!(sanitize_landing_path(Some("/episodes/42")), "/episodes/42");
        // Open-redirect attempts collapse to the site root
        assert_eq!(sanitize_landing_path(Some("https://evil.example")), "/");
        assert_eq!(sanitize_landing_path(Some("//evil.example")), "/");
        assert_eq!(sanitize_landing_path(None), "/");
    }

    #[test]
    fn test_request_meta_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "198.51.100.9, 10.0.0.1".parse().unwrap(),
        );
        headers.insert("user-agent", "test-agent".parse().unwrap());

        let meta = request_meta(&headers, "/join");
        assert_eq!(meta.ip_address, "198.51.100.9");
        assert_eq!(meta.user_agent, Some("test-agent".to_string()));
        assert_eq!(meta.landing_page, "/join");

        let bare = request_meta(&HeaderMap::new(), "/");
        assert_eq!(bare.ip_address, "unknown");
    }
}
