//! HTTP client layer — `PrimeHttp`, a signed request helper.

pub mod client;

pub use client::PrimeHttp;
