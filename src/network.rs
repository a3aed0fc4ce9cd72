//! Network URL constants for the Prime SDK.

/// Default REST API base URL.
pub const DEFAULT_API_URL: &str = "https://api.prime.coinbase.com/v1";

/// Default WebSocket URL.
pub const DEFAULT_WS_URL: &str = "wss://ws-feed.prime.coinbase.com";
