//! High-level client — `PrimeClient`.
//!
//! Owns the shared credentials, the signed HTTP helper and the WebSocket
//! configuration. WebSocket clients are created on demand; their lifetimes
//! belong to the application.

use crate::auth::Credentials;
use crate::error::SdkError;
use crate::http::PrimeHttp;
use crate::ws::WsConfig;

use std::sync::Arc;
use std::time::Duration;

/// The primary entry point for the Prime SDK.
#[derive(Clone, Debug)]
pub struct PrimeClient {
    pub(crate) http: PrimeHttp,
    pub(crate) credentials: Arc<Credentials>,
    pub(crate) ws_config: WsConfig,
}

impl PrimeClient {
    pub fn builder(credentials: Credentials) -> PrimeClientBuilder {
        PrimeClientBuilder::new(credentials)
    }

    /// Signed REST helper.
    pub fn http(&self) -> &PrimeHttp {
        &self.http
    }

    pub fn credentials(&self) -> &Arc<Credentials> {
        &self.credentials
    }

    pub fn ws_config(&self) -> &WsConfig {
        &self.ws_config
    }

    /// Create a new WebSocket client that delivers events to `sink`.
    ///
    /// The client is idle until [`connect`](crate::ws::WsClient::connect) or
    /// the first subscribe.
    #[cfg(feature = "ws-native")]
    pub fn websocket(&self, sink: Arc<dyn crate::ws::EventSink>) -> crate::ws::WsClient {
        crate::ws::WsClient::new(self.credentials.clone(), self.ws_config.clone(), sink)
    }
}

// ═════════════════════════════════════════════════════════════════════════════
// Builder
// ═════════════════════════════════════════════════════════════════════════════

pub struct PrimeClientBuilder {
    credentials: Credentials,
    base_url: String,
    ws_url: String,
    timeout: Duration,
    ws_config: WsConfig,
}

impl PrimeClientBuilder {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            base_url: crate::network::DEFAULT_API_URL.to_string(),
            ws_url: crate::network::DEFAULT_WS_URL.to_string(),
            timeout: Duration::from_secs(30),
            ws_config: WsConfig::default(),
        }
    }

    pub fn base_url(mut self, url: &str) -> Self {
        self.base_url = url.to_string();
        self
    }

    pub fn ws_url(mut self, url: &str) -> Self {
        self.ws_url = url.to_string();
        self
    }

    /// Per-request HTTP timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// WebSocket dialer and reconnect settings. `ws_url` wins over the
    /// dialer URL in this config.
    pub fn ws_config(mut self, config: WsConfig) -> Self {
        self.ws_config = config;
        self
    }

    pub fn build(self) -> Result<PrimeClient, SdkError> {
        let credentials = Arc::new(self.credentials);
        let http = PrimeHttp::new(&self.base_url, credentials.clone(), self.timeout)?;

        #[cfg(feature = "ws-native")]
        let ws_config = self.ws_config.with_url(self.ws_url);
        #[cfg(not(feature = "ws-native"))]
        let ws_config = {
            let _ = self.ws_url;
            self.ws_config
        };

        Ok(PrimeClient {
            http,
            credentials,
            ws_config,
        })
    }
}
