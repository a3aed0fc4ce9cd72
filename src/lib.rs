//! # Prime SDK
//!
//! A Rust SDK for the Prime trading API: signed REST requests and an
//! authenticated, self-healing real-time WebSocket feed.
//!
//! ## Architecture
//!
//! The SDK is organized in layers:
//!
//! 1. **Core** — Credentials, signing, errors, wire types (always available)
//! 2. **HTTP API** — `PrimeHttp`, a thin signed request helper
//! 3. **WebSocket** — `WsClient` over `tokio-tungstenite` with subscription
//!    tracking, heartbeat coordination and automatic reconnect
//! 4. **High-Level Client** — `PrimeClient` tying the two together
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use prime_sdk::prelude::*;
//!
//! let client = PrimeClient::builder(credentials).build()?;
//!
//! let (sink, mut events) = QueueSink::new(1024);
//! let ws = client.websocket(Arc::new(sink));
//! ws.subscribe_level2(vec!["BTC-USD".into()]).await?;
//!
//! while let Some(event) = events.recv().await {
//!     // ...
//! }
//! ```

// ── Layer 1: Core ────────────────────────────────────────────────────────────

/// Shared serde helpers.
pub mod shared;

/// Unified SDK error types.
pub mod error;

/// Network URL constants.
pub mod network;

/// Credentials and request/stream signing.
pub mod auth;

// ── Layer 2: HTTP API ────────────────────────────────────────────────────────

/// Signed HTTP request helper.
#[cfg(feature = "http")]
pub mod http;

// ── Layer 3: WebSocket ───────────────────────────────────────────────────────

/// WebSocket client: frames, subscriptions, heartbeats, dispatch.
pub mod ws;

// ── Layer 4: High-Level Client ───────────────────────────────────────────────

/// `PrimeClient` — the primary entry point.
#[cfg(feature = "http")]
pub mod client;

// ── Prelude ──────────────────────────────────────────────────────────────────

pub mod prelude {
    // Auth
    pub use crate::auth::{sign_request, sign_stream, Credentials};

    // Errors
    pub use crate::error::{HttpError, SdkError, WsError};

    // Network
    pub use crate::network::{DEFAULT_API_URL, DEFAULT_WS_URL};

    // HTTP client
    #[cfg(feature = "http")]
    pub use crate::client::{PrimeClient, PrimeClientBuilder};
    #[cfg(feature = "http")]
    pub use crate::http::PrimeHttp;

    // WebSocket types
    pub use crate::ws::messages::{
        EventKind, HeartbeatMessage, Level2Message, OrderStatus, OrdersMessage, Side,
        SubscriptionsMessage,
    };
    pub use crate::ws::{
        ActiveSubscription, Channel, ConnectionState, EventSink, InboundEvent, ReconnectPolicy,
        Scope, SubscriptionStatus, WsConfig,
    };
    #[cfg(feature = "ws-native")]
    pub use crate::ws::{DialerConfig, QueueSink, QueuedEvent, WsClient};
}
