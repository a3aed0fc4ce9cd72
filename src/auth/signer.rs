//! HMAC-SHA256 signing for REST requests and WebSocket subscriptions.
//!
//! Payload layouts (plain concatenation, no delimiters):
//!
//! ```text
//! REST:   {timestamp}{METHOD}{path}{body}
//! Stream: {channel}{access_key}{svc_account_id}{timestamp}{portfolio_id}{product_id...}
//! ```
//!
//! `path` is the request URL's path as sent, without the query string
//! (e.g. `/v1/portfolios/p1/orders`). Product ids are signed in
//! the order given, so the caller must send them in that same order.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::auth::Credentials;

type HmacSha256 = Hmac<Sha256>;

/// `User-Agent` sent with every REST request.
pub const USER_AGENT: &str = concat!("prime-sdk-rust/", env!("CARGO_PKG_VERSION"));

fn hmac_base64(secret: &str, payload: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Sign a REST request.
///
/// `timestamp` is Unix seconds, formatted exactly as sent in
/// `X-CB-ACCESS-TIMESTAMP`.
pub fn sign_request(method: &str, path: &str, timestamp: &str, secret: &str, body: &str) -> String {
    let payload = format!("{}{}{}{}", timestamp, method, path, body);
    hmac_base64(secret, &payload)
}

/// Sign a WebSocket subscribe frame.
///
/// `timestamp` is the RFC 3339 string placed in the frame's `timestamp` field.
pub fn sign_stream<S: AsRef<str>>(
    channel: &str,
    portfolio_id: &str,
    svc_account_id: &str,
    timestamp: &str,
    access_key: &str,
    secret: &str,
    product_ids: &[S],
) -> String {
    let mut payload = String::with_capacity(
        channel.len() + access_key.len() + svc_account_id.len() + timestamp.len() + 64,
    );
    payload.push_str(channel);
    payload.push_str(access_key);
    payload.push_str(svc_account_id);
    payload.push_str(timestamp);
    payload.push_str(portfolio_id);
    for id in product_ids {
        payload.push_str(id.as_ref());
    }
    hmac_base64(secret, &payload)
}

/// Authentication headers for one REST request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestHeaders {
    pub access_key: String,
    pub passphrase: String,
    pub signature: String,
    pub timestamp: String,
    pub user_agent: String,
}

impl RestHeaders {
    /// Header name/value pairs in the order they are attached.
    pub fn pairs(&self) -> [(&'static str, &str); 6] {
        [
            ("Accept", "application/json"),
            ("X-CB-ACCESS-KEY", &self.access_key),
            ("X-CB-ACCESS-PASSPHRASE", &self.passphrase),
            ("X-CB-ACCESS-SIGNATURE", &self.signature),
            ("X-CB-ACCESS-TIMESTAMP", &self.timestamp),
            ("User-Agent", &self.user_agent),
        ]
    }
}

/// Build the signed headers for a REST request issued at `unix_secs`.
pub fn rest_headers(
    credentials: &Credentials,
    method: &str,
    path: &str,
    body: &str,
    unix_secs: i64,
) -> RestHeaders {
    let timestamp = unix_secs.to_string();
    let signature = sign_request(method, path, &timestamp, credentials.signing_key(), body);
    RestHeaders {
        access_key: credentials.access_key.clone(),
        passphrase: credentials.passphrase().to_string(),
        signature,
        timestamp,
        user_agent: USER_AGENT.to_string(),
    }
}
