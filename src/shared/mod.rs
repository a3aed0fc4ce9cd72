//! Shared utilities used across the REST and WebSocket layers.

pub mod serde_util;
