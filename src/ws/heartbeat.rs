//! Heartbeat membership derived from orders/level-2 subscriptions.
//!
//! Heartbeats are never subscribed directly. Their product scope is the union
//! of product ids on the active orders and level-2 subscriptions, recomputed
//! after every subscribe/unsubscribe on those channels.

use std::collections::BTreeSet;

use crate::error::WsError;
use crate::ws::subscriptions::{Channel, SubscriptionStatus};

/// Frame the client must write to move the heartbeat channel to a new scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatAction {
    Subscribe(Vec<String>),
    Unsubscribe,
}

/// Owns the heartbeat channel's current scope.
#[derive(Debug)]
pub struct HeartbeatCoordinator {
    current: BTreeSet<String>,
    status: SubscriptionStatus,
}

impl Default for HeartbeatCoordinator {
    fn default() -> Self {
        Self {
            current: BTreeSet::new(),
            status: SubscriptionStatus::Pending,
        }
    }
}

impl HeartbeatCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current heartbeat product ids, sorted.
    pub fn scope(&self) -> Vec<String> {
        self.current.iter().cloned().collect()
    }

    pub fn is_active(&self) -> bool {
        !self.current.is_empty()
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status
    }

    /// Move to `required` and return the frames needed to get there.
    ///
    /// Returns nothing when the scope is unchanged. A scope is immutable on
    /// the wire, so a change on a live subscription is unsubscribe then
    /// subscribe.
    pub fn plan(&mut self, required: BTreeSet<String>) -> Vec<HeartbeatAction> {
        if required == self.current {
            return Vec::new();
        }

        let mut actions = Vec::with_capacity(2);
        if !self.current.is_empty() {
            actions.push(HeartbeatAction::Unsubscribe);
        }
        if !required.is_empty() {
            actions.push(HeartbeatAction::Subscribe(required.iter().cloned().collect()));
        }

        tracing::debug!(
            from = ?self.current,
            to = ?required,
            "Heartbeat scope changed"
        );
        self.current = required;
        self.status = SubscriptionStatus::Pending;
        actions
    }

    /// Frame needed to restore the current scope on a fresh connection.
    pub fn resubscribe(&mut self) -> Option<HeartbeatAction> {
        if self.current.is_empty() {
            return None;
        }
        self.status = SubscriptionStatus::Pending;
        Some(HeartbeatAction::Subscribe(self.scope()))
    }

    pub(crate) fn reconcile_ack(&mut self, acked: &[String]) -> Option<WsError> {
        if self.current.is_empty() {
            return None;
        }
        let acked: BTreeSet<String> = acked.iter().cloned().collect();
        if acked == self.current {
            self.status = SubscriptionStatus::Confirmed;
            None
        } else {
            self.status = SubscriptionStatus::Degraded;
            Some(WsError::AckMismatch {
                channel: Channel::Heartbeats.to_string(),
                expected: self.scope(),
                acknowledged: acked.into_iter().collect(),
            })
        }
    }
}
