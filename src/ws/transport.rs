//! Frame transport: dialing a socket and exposing it as text frames.
//!
//! The client only ever sees a [`FrameSink`] / [`FrameStream`] pair, so the
//! socket implementation can be swapped through [`Connector`] (tests use an
//! in-memory one).

use std::pin::Pin;
use std::time::Duration;

use futures_util::future::{ready, BoxFuture};
use futures_util::stream::Stream;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::error::WsError;

/// Outbound half of a connection: accepts serialized JSON frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = WsError> + Send>>;

/// Inbound half of a connection: yields text frames until the socket ends.
///
/// A close frame from the server surfaces as `Err(WsError::ConnectionLost)`.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, WsError>> + Send>>;

/// How to reach the feed.
#[derive(Debug, Clone)]
pub struct DialerConfig {
    pub url: String,
    /// Upper bound on the TCP + TLS + upgrade handshake.
    pub dial_timeout: Duration,
    pub disable_nagle: bool,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            url: crate::network::DEFAULT_WS_URL.to_string(),
            dial_timeout: Duration::from_secs(5),
            disable_nagle: true,
        }
    }
}

/// Opens connections for the client.
pub trait Connector: Send + Sync + 'static {
    fn dial<'a>(
        &'a self,
        config: &'a DialerConfig,
    ) -> BoxFuture<'a, Result<(FrameSink, FrameStream), WsError>>;
}

/// [`Connector`] backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

impl Connector for TungsteniteConnector {
    fn dial<'a>(
        &'a self,
        config: &'a DialerConfig,
    ) -> BoxFuture<'a, Result<(FrameSink, FrameStream), WsError>> {
        Box::pin(async move {
            let handshake = connect_async_with_config(config.url.as_str(), None, config.disable_nagle);
            let (ws_stream, _) = tokio::time::timeout(config.dial_timeout, handshake)
                .await
                .map_err(|_| {
                    WsError::DialFailure(format!(
                        "Handshake timed out after {}ms",
                        config.dial_timeout.as_millis()
                    ))
                })?
                .map_err(|e| match WsError::from(e) {
                    err @ WsError::InvalidUrl(_) => err,
                    other => WsError::DialFailure(other.to_string()),
                })?;

            let (sink, stream) = ws_stream.split();

            let sink: FrameSink =
                Box::pin(sink.with(|text: String| ready(Ok::<_, WsError>(Message::text(text)))));

            let stream: FrameStream = Box::pin(stream.filter_map(|msg| {
                ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = extract_close(frame.as_ref());
                        Some(Err(WsError::ConnectionLost {
                            code: Some(code),
                            reason,
                        }))
                    }
                    // Pings are answered by tungstenite; binary frames are not used by the feed.
                    Ok(_) => None,
                    Err(e) => Some(Err(WsError::from(e))),
                })
            }));

            Ok((sink, stream))
        })
    }
}

/// Extract close code and reason from an optional CloseFrame.
fn extract_close(frame: Option<&CloseFrame>) -> (u16, String) {
    match frame {
        Some(f) => (f.code.into(), f.reason.to_string()),
        None => (1005, "No close frame".into()),
    }
}
