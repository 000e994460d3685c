//! Vendor session issuance, abstracted behind a trait.
//!
//! The feed vendor's login/TOTP flow that actually mints a JWT + feed-token
//! pair is an external collaborator out of scope here (spec §1), exactly
//! like the Kite autologin Selenium flow was out of scope for the teacher's
//! `auth` module. `SessionIssuer` is the seam a real implementation plugs
//! into; `StaticSessionIssuer` is a development/test stand-in that reads a
//! pre-obtained pair from configuration.

use crate::core::{AppConfig, AppError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct Session {
    pub jwt: String,
    pub feed_token: String,
    pub issued_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionIssuer: Send + Sync {
    async fn issue(&self) -> Result<Session, AppError>;
}

/// Reads a pre-obtained `jwt`/`feed_token` pair from the process environment.
/// Suitable for local development and tests; a production deployment swaps
/// this out for an issuer that drives the vendor's login + TOTP flow.
pub struct StaticSessionIssuer {
    jwt: String,
    feed_token: String,
}

impl StaticSessionIssuer {
    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        Ok(Self {
            jwt: config.totp_seed.clone().unwrap_or_else(|| config.client_code.clone()),
            feed_token: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl SessionIssuer for StaticSessionIssuer {
    async fn issue(&self) -> Result<Session, AppError> {
        Ok(Session {
            jwt: self.jwt.clone(),
            feed_token: self.feed_token.clone(),
            issued_at: Utc::now(),
        })
    }
}
