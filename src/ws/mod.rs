//! WebSocket layer: subscriptions, frames, dispatch and the client.
//!
//! Module map:
//! - [`messages`]: outbound frames and inbound payloads
//! - [`subscriptions`]: channels, scopes and the active-subscription registry
//! - [`heartbeat`]: heartbeat membership derived from the other channels
//! - [`dispatch`]: the [`EventSink`] contract and sequence checking
//! - `queue`: bounded-queue [`EventSink`] adapter (`ws-native` feature)
//! - `transport`: the dial seam (`ws-native` feature)
//! - `native`: [`WsClient`] (`ws-native` feature)

pub mod dispatch;
pub mod heartbeat;
pub mod messages;
pub mod subscriptions;

#[cfg(feature = "ws-native")]
pub mod native;
#[cfg(feature = "ws-native")]
pub mod queue;
#[cfg(feature = "ws-native")]
pub mod transport;

use std::time::Duration;

use rand::Rng;

pub use dispatch::{EventSink, NoopSink};
pub use heartbeat::HeartbeatCoordinator;
pub use messages::InboundEvent;
pub use subscriptions::{ActiveSubscription, Channel, Scope, SubscriptionStatus};

#[cfg(feature = "ws-native")]
pub use native::WsClient;
#[cfg(feature = "ws-native")]
pub use queue::{QueueSink, QueuedEvent};
#[cfg(feature = "ws-native")]
pub use transport::{Connector, DialerConfig, TungsteniteConnector};

/// Connection lifecycle.
///
/// `Disconnected -> Connecting -> Connected -> Disconnected`; `Closed` is
/// terminal and only reached through [`WsClient::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Closed = 3,
}

impl From<u8> for ConnectionState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Closed,
            _ => Self::Disconnected,
        }
    }
}

/// When and how fast to redial after an unexpected close.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// `None` retries until the client is closed.
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: Some(10),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Whether attempt number `attempt` (1-based) may run.
    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| attempt <= max)
    }

    /// Upper bound of the wait before `attempt`: `base * 2^(attempt-1)`, capped.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Full jitter: uniform in `0..=ceiling(attempt)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}

/// Configuration for [`WsClient`].
#[derive(Debug, Clone)]
pub struct WsConfig {
    #[cfg(feature = "ws-native")]
    pub dialer: DialerConfig,
    pub reconnect: ReconnectPolicy,
    /// Longest silence tolerated while heartbeats are subscribed before the
    /// connection is treated as dead. `None` disables the check.
    pub idle_timeout: Option<Duration>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            #[cfg(feature = "ws-native")]
            dialer: DialerConfig::default(),
            reconnect: ReconnectPolicy::default(),
            idle_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl WsConfig {
    #[cfg(feature = "ws-native")]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.dialer.url = url.into();
        self
    }

    #[cfg(feature = "ws-native")]
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dialer.dial_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }
}
