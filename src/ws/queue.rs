//! Bounded-queue adapter for [`EventSink`].

use tokio::sync::mpsc;

use crate::error::WsError;
use crate::ws::dispatch::EventSink;
use crate::ws::messages::{
    HeartbeatMessage, InboundEvent, Level2Message, OrdersMessage, SubscriptionsMessage,
};
use crate::ws::ConnectionState;

/// Item delivered through a [`QueueSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedEvent {
    Event(InboundEvent),
    Error(WsError),
    State(ConnectionState),
}

/// [`EventSink`] that forwards into a bounded channel.
///
/// Never blocks the reader: when the queue is full the newest item is
/// dropped and a warning is logged.
#[derive(Debug, Clone)]
pub struct QueueSink {
    tx: mpsc::Sender<QueuedEvent>,
}

impl QueueSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<QueuedEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    fn push(&self, item: QueuedEvent) {
        match self.tx.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(item)) => {
                tracing::warn!("Event queue full, dropping {:?}", kind_of(&item));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Event queue receiver dropped");
            }
        }
    }
}

fn kind_of(item: &QueuedEvent) -> &'static str {
    match item {
        QueuedEvent::Event(InboundEvent::Heartbeat(_)) => "heartbeat",
        QueuedEvent::Event(InboundEvent::Orders(_)) => "orders",
        QueuedEvent::Event(InboundEvent::Level2(_)) => "l2_data",
        QueuedEvent::Event(InboundEvent::Subscriptions(_)) => "subscriptions",
        QueuedEvent::Event(InboundEvent::Error(_)) => "server error",
        QueuedEvent::Error(_) => "error",
        QueuedEvent::State(_) => "state change",
    }
}

impl EventSink for QueueSink {
    fn on_heartbeat(&self, msg: &HeartbeatMessage) {
        self.push(QueuedEvent::Event(InboundEvent::Heartbeat(msg.clone())));
    }

    fn on_orders(&self, msg: &OrdersMessage) {
        self.push(QueuedEvent::Event(InboundEvent::Orders(msg.clone())));
    }

    fn on_level2(&self, msg: &Level2Message) {
        self.push(QueuedEvent::Event(InboundEvent::Level2(msg.clone())));
    }

    fn on_subscriptions(&self, msg: &SubscriptionsMessage) {
        self.push(QueuedEvent::Event(InboundEvent::Subscriptions(msg.clone())));
    }

    fn on_error(&self, err: &WsError) {
        self.push(QueuedEvent::Error(err.clone()));
    }

    fn on_state_change(&self, state: ConnectionState) {
        self.push(QueuedEvent::State(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_sink_drops_when_full() {
        let (sink, mut rx) = QueueSink::new(1);
        sink.on_state_change(ConnectionState::Connecting);
        sink.on_state_change(ConnectionState::Connected);

        assert_eq!(
            rx.try_recv().unwrap(),
            QueuedEvent::State(ConnectionState::Connecting)
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_queue_sink_survives_dropped_receiver() {
        let (sink, rx) = QueueSink::new(4);
        drop(rx);
        sink.on_error(&WsError::Closed);
    }
}
