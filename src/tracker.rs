//! Click recorder
//!
//! Captures inbound referral visits: validates the affiliate code, persists a
//! click record, bumps the affiliate's click counter, and issues the signed
//! attribution token for the visit.
//!
//! The policy is fail-open to no attribution: an unknown, inactive, or
//! otherwise unattributable visit is silently ignored and the visitor-facing
//! redirect always succeeds.

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    attribution::AttributionService,
    database::Database,
    models::*,
};

/// A successfully recorded click and the token carrying its attribution
#[derive(Debug, Clone)]
pub struct RecordedClick {
    pub click_id: uuid::Uuid,
    pub token: String,
}

/// Click recording service
#[derive(Clone)]
pub struct TrackerService {
    database: Arc<Database>,
    attribution: Arc<AttributionService>,
}

impl TrackerService {
    pub fn new(database: Arc<Database>, attribution: Arc<AttributionService>) -> Self {
        Self {
            database,
            attribution,
        }
    }

    /// Records one inbound visit for an affiliate code
    ///
    /// Returns `None` when the code does not resolve to an active affiliate
    /// or the promo code is unknown-but-tolerated; no error ever reaches the
    /// visitor. If the request already carries a valid attribution token for
    /// the same affiliate, the existing attribution is re-issued instead of
    /// recording a second click.
    pub async fn record_click(
        &self,
        affiliate_code: &str,
        promo_code: Option<&str>,
        existing_token: Option<&str>,
        meta: &RequestMeta,
    ) -> Result<Option<RecordedClick>> {
        let affiliate = match self.database.get_affiliate_by_code(affiliate_code).await? {
            Some(affiliate) if affiliate.status == AffiliateStatus::Active => affiliate,
            Some(affiliate) => {
                debug!(
                    "Ignoring click for non-active affiliate {} ({:?})",
                    affiliate.code, affiliate.status
                );
                return Ok(None);
            }
            None => {
                debug!("Ignoring click for unknown affiliate code {:?}", affiliate_code);
                return Ok(None);
            }
        };

        // An existing valid attribution for the same affiliate wins; never
        // record the same visit twice.
        if let Some(attribution) = existing_token.and_then(|t| self.attribution.decode(t)) {
            if attribution.affiliate_id == affiliate.id {
                debug!(
                    "Visit already attributed to affiliate {} via click {}",
                    affiliate.code, attribution.click_id
                );
                let token = self.attribution.issue(
                    attribution.affiliate_id,
                    attribution.promo_code_id,
                    attribution.click_id,
                )?;
                return Ok(Some(RecordedClick {
                    click_id: attribution.click_id,
                    token,
                }));
            }
        }

        let promo = match promo_code {
            Some(code) => self.database.get_active_promo_code(code).await?,
            None => None,
        };
        let promo_code_id = promo.as_ref().map(|p| p.id);

        let mut tx = self.database.begin_transaction().await?;
        let click = self
            .database
            .create_click(&mut tx, affiliate.id, promo_code_id, meta)
            .await?;
        self.database
            .increment_click_count(&mut tx, affiliate.id)
            .await?;
        tx.commit().await?;

        let token = self
            .attribution
            .issue(affiliate.id, promo_code_id, click.id)?;

        info!(
            "Recorded click {} for affiliate {} (promo: {:?})",
            click.id,
            affiliate.code,
            promo.map(|p| p.code)
        );

        Ok(Some(RecordedClick {
            click_id: click.id,
            token,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    async fn setup() -> (Arc<Database>, TrackerService) {
        let config = Config::load().unwrap();
        let db = Arc::new(Database::new(&config.database_url, 2).await.unwrap());
        db.migrate().await.unwrap();
        let attribution = Arc::new(AttributionService::new(&config).unwrap());
        let tracker = TrackerService::new(db.clone(), attribution);
        (db, tracker)
    }

    fn meta() -> RequestMeta {
        RequestMeta {
            ip_address: "198.51.100.23".to_string(),
            user_agent: Some("Mozilla/5.0 (test)".to_string()),
            referrer: Some("https://blog.example.com/review".to_string()),
            landing_page: "/join".to_string(),
        }
    }

    #[tokio::test]
    #[ignore] // Requires database connection
    async fn test_click_recorded_and_counted_once() {
        let (db, tracker) = setup().await;

        let affiliate = db
            .create_affiliate(
                crate::models::CreateAffiliateRequest {
                    code: format!("trk-{}", uuid::Uuid::new_v4().simple()),
                    name: "Tracker Partner".to_string(),
                    email: None,
                    status: Some(AffiliateStatus::Active),
                    commission_kind: None,
                    commission_initial: None,
                    commission_rebill: None,
                    commission_unlock: None,
                    payout_threshold: None,
                },
                rust_decimal::Decimal::new(100, 0),
            )
            .await
            .unwrap();

        let recorded = tracker
            .record_click(&affiliate.code, None, None, &meta())
            .await
            .unwrap()
            .unwrap();

        let click = db.get_click_by_id(recorded.click_id).await.unwrap().unwrap();
        assert_eq!(click.affiliate_id, affiliate.id);
        assert!(!click.converted);

        let after = db.get_affiliate_by_id(affiliate.id).await.unwrap().unwrap();
        assert_eq!(after.total_clicks, affiliate.total_clicks + 1);

        // A revisit carrying the issued token is not recorded again
        let revisit = tracker
            .record_click(&affiliate.code, None, Some(&recorded.token), &meta())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(revisit.click_id, recorded.click_id);

        let unchanged = db.get_affiliate_by_id(affiliate.id).await.unwrap().unwrap();
        assert_eq!(unchanged.total_clicks, after.total_clicks);
    }

    #[tokio::test]
    #[ignore] // Requires database connection
    async fn test_unknown_and_inactive_codes_fail_open() {
        let (db, tracker) = setup().await;

        assert!(tracker
            .record_click("no-such-code", None, None, &meta())
            .await
            .unwrap()
            .is_none());

        let pending = db
            .create_affiliate(
                crate::models::CreateAffiliateRequest {
                    code: format!("pend-{}", uuid::Uuid::new_v4().simple()),
                    name: "Pending Partner".to_string(),
                    email: None,
                    status: Some(AffiliateStatus::Pending),
                    commission_kind: None,
                    commission_initial: None,
                    commission_rebill: None,
                    commission_unlock: None,
                    payout_threshold: None,
                },
                rust_decimal::Decimal::new(100, 0),
            )
            .await
            .unwrap();

        assert!(tracker
            .record_click(&pending.code, None, None, &meta())
            .await
            .unwrap()
            .is_none());

        let unchanged = db.get_affiliate_by_id(pending.id).await.unwrap().unwrap();
        assert_eq!(unchanged.total_clicks, 0);
    }
}
