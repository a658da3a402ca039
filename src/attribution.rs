//! Attribution token service
//!
//! Carries the affiliate/promo/click association from first visit to the
//! point of conversion without server-side session state. The token is an
//! HMAC-signed claims blob (HS256) handed to the visitor as a cookie and
//! verified on every read.
//!
//! Validity is a sliding window over the issue time, not an embedded expiry:
//! `now - issued_at > window` is re-checked on each decode against the
//! currently configured window, so shortening the window retroactively
//! invalidates old tokens.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::config::Config;

const ISSUER: &str = "flexpress-affiliates";

/// Signed claims binding a visitor to an affiliate/promo/click triple
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionClaims {
    pub affiliate_id: Uuid,
    pub promo_code_id: Option<Uuid>,
    pub click_id: Uuid,
    pub iat: i64,
    pub iss: String,
}

/// Decoded attribution handed to the commission ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribution {
    pub affiliate_id: Uuid,
    pub promo_code_id: Option<Uuid>,
    pub click_id: Uuid,
}

/// Issues and verifies attribution tokens
#[derive(Clone)]
pub struct AttributionService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    window: Duration,
}

impl AttributionService {
    pub fn new(config: &Config) -> Result<Self> {
        let secret = config.attribution.token_secret.as_bytes();

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            window: Duration::days(config.attribution.window_days),
        })
    }

    /// Issues a token for a freshly recorded click
    pub fn issue(
        &self,
        affiliate_id: Uuid,
        promo_code_id: Option<Uuid>,
        click_id: Uuid,
    ) -> Result<String> {
        let claims = AttributionClaims {
            affiliate_id,
            promo_code_id,
            click_id,
            iat: Utc::now().timestamp(),
            iss: ISSUER.to_string(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .context("Failed to sign attribution token")
    }

    /// Decodes a token, returning the attribution triple or `None`
    ///
    /// Missing, malformed, tampered, or out-of-window tokens all collapse to
    /// `None`; attribution is fail-open and never surfaces an error to the
    /// visitor-facing path.
    pub fn decode(&self, token: &str) -> Option<Attribution> {
        let claims = self.decode_claims(token)?;

        let age = Utc::now().timestamp() - claims.iat;
        if age < 0 || age > self.window.num_seconds() {
            debug!("Attribution token outside validity window (age {}s)", age);
            return None;
        }

        Some(Attribution {
            affiliate_id: claims.affiliate_id,
            promo_code_id: claims.promo_code_id,
            click_id: claims.click_id,
        })
    }

    /// Verifies the signature and issuer without the window check
    pub fn decode_claims(&self, token: &str) -> Option<AttributionClaims> {
        // The token carries no exp claim; the window is enforced in decode()
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.validate_exp = false;
        validation.required_spec_claims = Default::default();

        match decode::<AttributionClaims>(token, &self.decoding_key, &validation) {
            Ok(data) => Some(data.claims),
            Err(err) => {
                debug!("Attribution token rejected: {}", err);
                None
            }
        }
    }

    /// Builds the Set-Cookie value carrying an attribution token
    pub fn cookie(&self, name: &str, token: &str) -> String {
        format!(
            "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
            name,
            token,
            self.window.num_seconds()
        )
    }

    /// Builds the Set-Cookie value that clears the attribution cookie
    pub fn clear_cookie(&self, name: &str) -> String {
        format!("{}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax", name)
    }
}
