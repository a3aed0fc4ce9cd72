//! Channel subscriptions — scope rules, tracking, and ack reconciliation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::WsError;
use crate::ws::heartbeat::HeartbeatCoordinator;
use crate::ws::messages::SubscriptionsMessage;

/// A subscribable channel on the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "orders")]
    Orders,
    #[serde(rename = "l2_data")]
    Level2,
    #[serde(rename = "heartbeats")]
    Heartbeats,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orders => "orders",
            Self::Level2 => "l2_data",
            Self::Heartbeats => "heartbeats",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "orders" => Some(Self::Orders),
            "l2_data" => Some(Self::Level2),
            "heartbeats" => Some(Self::Heartbeats),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a channel subscription applies to.
///
/// Product ids keep the caller's order: that order is part of the signed
/// payload. Two scopes with the same ids in a different order are still
/// the same scope.
#[derive(Debug, Clone)]
pub enum Scope {
    /// Orders channel: one portfolio, optionally narrowed to products.
    Portfolio {
        portfolio_id: String,
        product_ids: Vec<String>,
    },
    /// Level-2 channel: a set of products.
    Products(Vec<String>),
}

impl Scope {
    pub fn portfolio(portfolio_id: impl Into<String>) -> Self {
        Self::Portfolio {
            portfolio_id: portfolio_id.into(),
            product_ids: Vec::new(),
        }
    }

    pub fn products<I, S>(product_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Products(product_ids.into_iter().map(Into::into).collect())
    }

    /// Narrow a portfolio scope to the given products. No-op on `Products`.
    pub fn with_products<I, S>(self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match self {
            Self::Portfolio { portfolio_id, .. } => Self::Portfolio {
                portfolio_id,
                product_ids: ids.into_iter().map(Into::into).collect(),
            },
            other => other,
        }
    }

    pub fn portfolio_id(&self) -> Option<&str> {
        match self {
            Self::Portfolio { portfolio_id, .. } => Some(portfolio_id),
            Self::Products(_) => None,
        }
    }

    pub fn product_ids(&self) -> &[String] {
        match self {
            Self::Portfolio { product_ids, .. } => product_ids,
            Self::Products(ids) => ids,
        }
    }

    fn product_set(&self) -> BTreeSet<&str> {
        self.product_ids().iter().map(String::as_str).collect()
    }

    /// The ids the server echoes back in a subscription ack.
    fn acked_ids(&self) -> BTreeSet<String> {
        match self {
            Self::Portfolio { portfolio_id, .. } => BTreeSet::from([portfolio_id.clone()]),
            Self::Products(ids) => ids.iter().cloned().collect(),
        }
    }

    /// Check this scope is usable for `channel`.
    pub fn validate(&self, channel: Channel) -> Result<(), WsError> {
        let invalid = |reason: &str| WsError::InvalidScope {
            channel: channel.to_string(),
            reason: reason.to_string(),
        };
        match (channel, self) {
            (Channel::Orders, Self::Portfolio { portfolio_id, .. }) => {
                if portfolio_id.is_empty() {
                    return Err(invalid("portfolio id is empty"));
                }
            }
            (Channel::Orders, Self::Products(_)) => {
                return Err(invalid("orders requires a portfolio scope"));
            }
            (Channel::Level2, Self::Products(ids)) => {
                if ids.is_empty() {
                    return Err(invalid("no product ids"));
                }
            }
            (Channel::Level2, Self::Portfolio { .. }) => {
                return Err(invalid("l2_data requires a product scope"));
            }
            (Channel::Heartbeats, _) => {
                return Err(invalid("heartbeat membership is derived"));
            }
        }
        if self.product_ids().iter().any(String::is_empty) {
            return Err(invalid("empty product id"));
        }
        Ok(())
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Portfolio { portfolio_id: a, .. },
                Self::Portfolio { portfolio_id: b, .. },
            ) => a == b && self.product_set() == other.product_set(),
            (Self::Products(_), Self::Products(_)) => self.product_set() == other.product_set(),
            _ => false,
        }
    }
}

impl Eq for Scope {}

/// Server confirmation state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Frame written, no ack seen yet on this connection.
    Pending,
    /// Ack matched the requested scope.
    Confirmed,
    /// Ack disagreed with the requested scope.
    Degraded,
}

/// Snapshot of one active subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSubscription {
    pub channel: Channel,
    pub scope: Scope,
    pub status: SubscriptionStatus,
}

/// Result of checking a subscribe request against the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Not subscribed yet; a frame must be sent.
    New,
    /// Already subscribed with the same scope; nothing to send.
    AlreadyActive,
}

/// Tracks active orders/level-2 subscriptions and the derived heartbeat scope.
///
/// Pure bookkeeping: the client decides when frames are written and calls
/// in here under its lock.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    active: BTreeMap<Channel, ActiveSubscription>,
    heartbeats: HeartbeatCoordinator,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a subscribe request without changing anything.
    pub fn admit(&self, channel: Channel, scope: &Scope) -> Result<Admission, WsError> {
        scope.validate(channel)?;
        match self.active.get(&channel) {
            None => Ok(Admission::New),
            Some(existing) if existing.scope == *scope => Ok(Admission::AlreadyActive),
            Some(_) => Err(WsError::ScopeConflict {
                channel: channel.to_string(),
            }),
        }
    }

    /// Record a subscription whose frame has been written.
    pub fn insert(&mut self, channel: Channel, scope: Scope) {
        self.active.insert(
            channel,
            ActiveSubscription {
                channel,
                scope,
                status: SubscriptionStatus::Pending,
            },
        );
    }

    pub fn remove(&mut self, channel: Channel) -> Option<ActiveSubscription> {
        self.active.remove(&channel)
    }

    pub fn get(&self, channel: Channel) -> Option<&ActiveSubscription> {
        self.active.get(&channel)
    }

    /// All active orders/level-2 subscriptions, orders first.
    pub fn active(&self) -> impl Iterator<Item = &ActiveSubscription> {
        self.active.values()
    }

    /// Union of product ids across active orders and level-2 subscriptions.
    pub fn required_heartbeat_scope(&self) -> BTreeSet<String> {
        self.active
            .values()
            .flat_map(|sub| sub.scope.product_ids().iter().cloned())
            .collect()
    }

    pub fn heartbeats(&self) -> &HeartbeatCoordinator {
        &self.heartbeats
    }

    pub fn heartbeats_mut(&mut self) -> &mut HeartbeatCoordinator {
        &mut self.heartbeats
    }

    /// Every subscription goes back to `Pending` (new connection, no acks yet).
    pub fn mark_all_pending(&mut self) {
        for sub in self.active.values_mut() {
            sub.status = SubscriptionStatus::Pending;
        }
    }

    /// Compare a server ack against what was requested.
    ///
    /// Returns one `AckMismatch` per disagreeing channel; those channels are
    /// marked `Degraded`, matching ones `Confirmed`. Channels listed in the ack
    /// that are not active locally are ignored: an unsubscribe may be in flight.
    pub fn reconcile_ack(&mut self, ack: &SubscriptionsMessage) -> Vec<WsError> {
        let mut mismatches = Vec::new();

        for event in &ack.events {
            let subs = &event.subscriptions;
            for (channel, acked) in [
                (Channel::Orders, subs.orders.as_ref()),
                (Channel::Level2, subs.l2_data.as_ref()),
            ] {
                let Some(acked) = acked else { continue };
                let Some(active) = self.active.get_mut(&channel) else {
                    tracing::debug!("Ignoring ack for inactive channel {}", channel);
                    continue;
                };
                let acked: BTreeSet<String> = acked.iter().cloned().collect();
                let expected = active.scope.acked_ids();
                if acked == expected {
                    active.status = SubscriptionStatus::Confirmed;
                } else {
                    active.status = SubscriptionStatus::Degraded;
                    mismatches.push(WsError::AckMismatch {
                        channel: channel.to_string(),
                        expected: expected.into_iter().collect(),
                        acknowledged: acked.into_iter().collect(),
                    });
                }
            }

            if let Some(acked) = subs.heartbeats.as_ref() {
                if let Some(err) = self.heartbeats.reconcile_ack(acked) {
                    mismatches.push(err);
                }
            }
        }

        mismatches
    }
}
