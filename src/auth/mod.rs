//! Authentication — API credentials and message signing.
//!
//! ## Security Model
//!
//! - [`Credentials`] are immutable once constructed and shared (`Arc`) between
//!   the REST helper and the WebSocket client. Nothing in the SDK mutates them.
//! - The signing secret and passphrase are NEVER printed: `Debug` redacts them.
//! - Every REST request and every WebSocket subscribe frame carries a fresh
//!   timestamp and signature. Signatures are never cached or reused.
//!
//! ## Signing
//!
//! Both surfaces use HMAC-SHA256 over a fixed field concatenation, base64
//! encoded. See [`signer`] for the exact payload layouts.

pub mod signer;

use std::fmt;

use serde::Deserialize;

pub use signer::{rest_headers, sign_request, sign_stream, RestHeaders};

/// API credentials for a single service account.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    /// Access key, sent in clear on every request.
    #[serde(rename = "accessKey", alias = "access_key")]
    pub access_key: String,
    /// HMAC signing secret.
    #[serde(rename = "signingKey", alias = "signing_key")]
    signing_key: String,
    passphrase: String,
    /// Service account id (`api_key_id` on the wire).
    #[serde(rename = "svcAccountId", alias = "svc_account_id")]
    pub svc_account_id: String,
    /// Default portfolio id.
    #[serde(rename = "portfolioId", alias = "portfolio_id")]
    pub portfolio_id: String,
}

impl Credentials {
    pub fn new(
        access_key: impl Into<String>,
        signing_key: impl Into<String>,
        passphrase: impl Into<String>,
        svc_account_id: impl Into<String>,
        portfolio_id: impl Into<String>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            signing_key: signing_key.into(),
            passphrase: passphrase.into(),
            svc_account_id: svc_account_id.into(),
            portfolio_id: portfolio_id.into(),
        }
    }

    pub(crate) fn signing_key(&self) -> &str {
        &self.signing_key
    }

    pub(crate) fn passphrase(&self) -> &str {
        &self.passphrase
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("signing_key", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .field("svc_account_id", &self.svc_account_id)
            .field("portfolio_id", &self.portfolio_id)
            .finish()
    }
}
