//! Wire types for the subscription feed.
//!
//! Outbound frames are built through [`MessageOut`]; every subscribe frame is
//! signed at construction with a fresh timestamp. Inbound frames are decoded
//! by [`decode_frame`], which routes on `type` (errors) and then `channel`.

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::auth::{sign_stream, Credentials};
use crate::error::WsError;
use crate::shared::serde_util;
use crate::ws::subscriptions::{Channel, Scope};

// ─── Outbound messages ───────────────────────────────────────────────────────

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum MessageOut {
    #[serde(rename = "subscribe")]
    Subscribe(SubscribeFrame),
    #[serde(rename = "unsubscribe")]
    Unsubscribe(UnsubscribeFrame),
}

impl MessageOut {
    pub fn to_json(&self) -> Result<String, WsError> {
        serde_json::to_string(self).map_err(|e| WsError::SendFailed(e.to_string()))
    }
}

/// A signed subscribe request for one channel.
#[derive(Clone, Serialize)]
pub struct SubscribeFrame {
    pub channel: String,
    pub access_key: String,
    pub api_key_id: String,
    pub timestamp: String,
    passphrase: String,
    pub signature: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub portfolio_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub product_ids: Vec<String>,
}

impl std::fmt::Debug for SubscribeFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeFrame")
            .field("channel", &self.channel)
            .field("timestamp", &self.timestamp)
            .field("portfolio_id", &self.portfolio_id)
            .field("product_ids", &self.product_ids)
            .finish_non_exhaustive()
    }
}

impl SubscribeFrame {
    /// Build and sign a subscribe frame at `now`.
    ///
    /// Product ids are written and signed in the order given.
    pub fn signed(
        credentials: &Credentials,
        channel: Channel,
        portfolio_id: &str,
        product_ids: &[String],
        now: DateTime<Utc>,
    ) -> Self {
        let timestamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
        let signature = sign_stream(
            channel.as_str(),
            portfolio_id,
            &credentials.svc_account_id,
            &timestamp,
            &credentials.access_key,
            credentials.signing_key(),
            product_ids,
        );
        Self {
            channel: channel.as_str().to_string(),
            access_key: credentials.access_key.clone(),
            api_key_id: credentials.svc_account_id.clone(),
            timestamp,
            passphrase: credentials.passphrase().to_string(),
            signature,
            portfolio_id: portfolio_id.to_string(),
            product_ids: product_ids.to_vec(),
        }
    }

    /// Subscribe frame for an orders or level-2 scope.
    ///
    /// Orders are signed for the scope's portfolio; level-2 for the account's
    /// default portfolio.
    pub fn for_scope(
        credentials: &Credentials,
        channel: Channel,
        scope: &Scope,
        now: DateTime<Utc>,
    ) -> Self {
        let portfolio_id = scope.portfolio_id().unwrap_or(&credentials.portfolio_id);
        Self::signed(credentials, channel, portfolio_id, scope.product_ids(), now)
    }

    /// Subscribe frame for the heartbeat channel.
    pub fn heartbeats(credentials: &Credentials, product_ids: &[String], now: DateTime<Utc>) -> Self {
        Self::signed(
            credentials,
            Channel::Heartbeats,
            &credentials.portfolio_id,
            product_ids,
            now,
        )
    }
}

/// Unsubscribe request. Carries channel names only.
#[derive(Debug, Clone, Serialize)]
pub struct UnsubscribeFrame {
    pub channels: Vec<String>,
}

impl UnsubscribeFrame {
    pub fn new(channel: Channel) -> Self {
        Self {
            channels: vec![channel.as_str().to_string()],
        }
    }
}

// ─── Inbound messages ────────────────────────────────────────────────────────

/// Fields shared by every frame; used to route before full decoding.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    channel: Option<String>,
}

/// Whether a feed event is a full snapshot or an incremental update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Snapshot,
    Update,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    #[serde(alias = "ask")]
    Offer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Open,
    Filled,
    Cancelled,
    Expired,
    Failed,
    #[serde(other)]
    Unknown,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Expired | Self::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HeartbeatMessage {
    pub channel: String,
    pub timestamp: String,
    pub sequence_num: u64,
    #[serde(default, deserialize_with = "serde_util::null_as_empty::deserialize")]
    pub events: Vec<HeartbeatEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HeartbeatEvent {
    #[serde(default)]
    pub subscriptions: Option<HeartbeatSubscriptions>,
    #[serde(default)]
    pub current_time: Option<String>,
    #[serde(default)]
    pub heartbeat_counter: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HeartbeatSubscriptions {
    #[serde(default, deserialize_with = "serde_util::null_as_empty::deserialize")]
    pub heartbeats: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OrdersMessage {
    pub channel: String,
    pub timestamp: String,
    pub sequence_num: u64,
    #[serde(default, deserialize_with = "serde_util::null_as_empty::deserialize")]
    pub events: Vec<OrdersEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OrdersEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, deserialize_with = "serde_util::null_as_empty::deserialize")]
    pub orders: Vec<OrderUpdate>,
}

/// State of one order as reported by the orders channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OrderUpdate {
    pub order_id: String,
    #[serde(default)]
    pub client_order_id: String,
    #[serde(default, with = "serde_util::decimal_opt")]
    pub cum_qty: Option<Decimal>,
    #[serde(default, with = "serde_util::decimal_opt")]
    pub leaves_qty: Option<Decimal>,
    #[serde(default, with = "serde_util::decimal_opt")]
    pub avg_px: Option<Decimal>,
    #[serde(default, with = "serde_util::decimal_opt")]
    pub fees: Option<Decimal>,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Level2Message {
    pub channel: String,
    pub timestamp: String,
    pub sequence_num: u64,
    #[serde(default, deserialize_with = "serde_util::null_as_empty::deserialize")]
    pub events: Vec<Level2Event>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Level2Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub product_id: String,
    #[serde(default, deserialize_with = "serde_util::null_as_empty::deserialize")]
    pub updates: Vec<Level2Update>,
}

/// One price level change.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Level2Update {
    pub side: Side,
    pub event_time: String,
    pub px: Decimal,
    pub qty: Decimal,
}

/// Server acknowledgement listing what is currently subscribed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionsMessage {
    pub channel: String,
    pub timestamp: String,
    pub sequence_num: u64,
    #[serde(default, deserialize_with = "serde_util::null_as_empty::deserialize")]
    pub events: Vec<SubscriptionsEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionsEvent {
    pub subscriptions: SubscriptionsPayload,
}

/// Acked ids per channel: portfolio ids for orders, product ids otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubscriptionsPayload {
    #[serde(default)]
    pub orders: Option<Vec<String>>,
    #[serde(default)]
    pub l2_data: Option<Vec<String>>,
    #[serde(default)]
    pub heartbeats: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorMessage {
    #[serde(default)]
    pub message: String,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Heartbeat(HeartbeatMessage),
    Orders(OrdersMessage),
    Level2(Level2Message),
    Subscriptions(SubscriptionsMessage),
    Error(ErrorMessage),
}

impl InboundEvent {
    /// Channel name the frame arrived on; `None` for server errors.
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::Heartbeat(m) => Some(&m.channel),
            Self::Orders(m) => Some(&m.channel),
            Self::Level2(m) => Some(&m.channel),
            Self::Subscriptions(m) => Some(&m.channel),
            Self::Error(_) => None,
        }
    }

    pub fn sequence_num(&self) -> Option<u64> {
        match self {
            Self::Heartbeat(m) => Some(m.sequence_num),
            Self::Orders(m) => Some(m.sequence_num),
            Self::Level2(m) => Some(m.sequence_num),
            Self::Subscriptions(m) => Some(m.sequence_num),
            Self::Error(_) => None,
        }
    }
}

/// Channel name the server uses for subscription acks.
pub const SUBSCRIPTIONS_CHANNEL: &str = "subscriptions";

/// Decode one text frame.
///
/// Frames with `"type": "error"` become [`InboundEvent::Error`]; everything
/// else is routed by `channel`. Unknown channels and malformed payloads are
/// reported as [`WsError::UnknownFrame`].
pub fn decode_frame(text: &str) -> Result<InboundEvent, WsError> {
    let envelope: Envelope = serde_json::from_str(text)?;

    if envelope.kind.as_deref() == Some("error") {
        return Ok(InboundEvent::Error(serde_json::from_str(text)?));
    }

    let Some(channel) = envelope.channel else {
        return Err(WsError::UnknownFrame(truncate(text)));
    };

    let event = match channel.as_str() {
        SUBSCRIPTIONS_CHANNEL => InboundEvent::Subscriptions(serde_json::from_str(text)?),
        name => match Channel::from_name(name) {
            Some(Channel::Heartbeats) => InboundEvent::Heartbeat(serde_json::from_str(text)?),
            Some(Channel::Orders) => InboundEvent::Orders(serde_json::from_str(text)?),
            Some(Channel::Level2) => InboundEvent::Level2(serde_json::from_str(text)?),
            None => return Err(WsError::UnknownFrame(format!("unknown channel {}", name))),
        },
    };
    Ok(event)
}

fn truncate(text: &str) -> String {
    const MAX: usize = 128;
    match text.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
