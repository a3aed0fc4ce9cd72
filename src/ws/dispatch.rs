//! Inbound event delivery.
//!
//! # Backpressure
//!
//! Each connection has one reader task. It calls the [`EventSink`] methods
//! directly and in frame order, so a slow callback stalls every frame behind
//! it on that connection. Callbacks must return promptly. To hand events to
//! worker tasks instead, register a `QueueSink` and drain its receiver.
//!
//! The reader never holds the client's lock while calling into the sink, so
//! callbacks may call back into the client (e.g. to unsubscribe).

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::WsError;
use crate::ws::messages::{
    decode_frame, HeartbeatMessage, InboundEvent, Level2Message, OrdersMessage,
    SubscriptionsMessage,
};
use crate::ws::ConnectionState;

/// Receives decoded events, errors and connection state changes.
///
/// Every method has a no-op default; implement only what you need.
#[allow(unused_variables)]
pub trait EventSink: Send + Sync + 'static {
    fn on_heartbeat(&self, msg: &HeartbeatMessage) {}

    fn on_orders(&self, msg: &OrdersMessage) {}

    fn on_level2(&self, msg: &Level2Message) {}

    /// Subscription acks, after they have been reconciled.
    fn on_subscriptions(&self, msg: &SubscriptionsMessage) {}

    /// Asynchronous errors: integrity problems on the feed, server error
    /// frames and connection failures.
    fn on_error(&self, err: &WsError) {}

    fn on_state_change(&self, state: ConnectionState) {}
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {}

/// Outcome of checking one sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    InOrder,
    /// Frames were skipped; the event itself is still valid.
    Gap { expected: u64, received: u64 },
    /// Already seen on this connection.
    Stale { last: u64 },
}

/// Last sequence number seen per channel. Scoped to one connection.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: HashMap<String, u64>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, channel: &str, seq: u64) -> SequenceCheck {
        let Some(last) = self.last.get_mut(channel) else {
            self.last.insert(channel.to_string(), seq);
            return SequenceCheck::InOrder;
        };

        if seq <= *last {
            return SequenceCheck::Stale { last: *last };
        }

        let expected = *last + 1;
        *last = seq;
        if seq == expected {
            SequenceCheck::InOrder
        } else {
            SequenceCheck::Gap {
                expected,
                received: seq,
            }
        }
    }

    pub fn last(&self, channel: &str) -> Option<u64> {
        self.last.get(channel).copied()
    }
}

/// Decodes frames, enforces sequence order and routes events to the sink.
pub struct Dispatcher {
    sink: Arc<dyn EventSink>,
    sequences: SequenceTracker,
}

impl Dispatcher {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            sequences: SequenceTracker::new(),
        }
    }

    /// Decode one frame and check its sequence number.
    ///
    /// Returns the event if it should be delivered. Undecodable frames are
    /// reported as `UnknownFrame`; duplicates are dropped; gaps are reported
    /// and the event is still returned.
    pub fn accept(&mut self, text: &str) -> Option<InboundEvent> {
        let event = match decode_frame(text) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!("Dropping frame: {}", err);
                self.sink.on_error(&err);
                return None;
            }
        };

        let (Some(channel), Some(seq)) = (event.channel().map(str::to_owned), event.sequence_num())
        else {
            return Some(event);
        };

        match self.sequences.check(&channel, seq) {
            SequenceCheck::InOrder => {}
            SequenceCheck::Gap { expected, received } => {
                tracing::warn!(
                    "Sequence gap on {}: expected {}, received {}",
                    channel,
                    expected,
                    received
                );
                self.sink.on_error(&WsError::SequenceGap {
                    channel: channel.to_string(),
                    expected,
                    received,
                });
            }
            SequenceCheck::Stale { last } => {
                tracing::debug!(
                    "Dropping stale frame on {}: seq {} <= {}",
                    channel,
                    seq,
                    last
                );
                return None;
            }
        }

        Some(event)
    }

    /// Invoke the one sink method for this event.
    pub fn deliver(&self, event: &InboundEvent) {
        match event {
            InboundEvent::Heartbeat(msg) => self.sink.on_heartbeat(msg),
            InboundEvent::Orders(msg) => self.sink.on_orders(msg),
            InboundEvent::Level2(msg) => self.sink.on_level2(msg),
            InboundEvent::Subscriptions(msg) => self.sink.on_subscriptions(msg),
            InboundEvent::Error(msg) => {
                tracing::warn!("Server error: {}", msg.message);
                self.sink.on_error(&WsError::Server(msg.message.clone()))
            }
        }
    }

    pub fn report(&self, err: &WsError) {
        self.sink.on_error(err);
    }
}
