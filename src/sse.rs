//! Reply plumbing between the admission pipeline and the HTTP handler.
//!
//! The pipeline runs detached from the axum handler so it can keep a
//! streaming connection alive with ping frames while a request waits for a
//! slot. The handler blocks on a single [`Decision`]; once the decision is a
//! stream, everything else flows through the body channel.

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const BODY_CHANNEL_CAPACITY: usize = 64;

/// Keep-alive frame flavor, per provider protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PingFormat {
    /// Named ping event understood by Claude clients.
    Claude,
    /// Bare SSE comment line for clients without a ping event type.
    Comment,
    /// Provider protocol has no keep-alive concept; waits stay silent.
    None,
}

impl PingFormat {
    pub fn frame(self) -> Option<&'static [u8]> {
        match self {
            PingFormat::Claude => Some(b"data: {\"type\": \"ping\"}\n\n"),
            PingFormat::Comment => Some(b":\n\n"),
            PingFormat::None => None,
        }
    }
}

/// What the HTTP handler should send: either a buffered JSON response or the
/// start of a streaming body.
#[derive(Debug)]
pub enum Decision {
    Json {
        status: StatusCode,
        body: serde_json::Value,
    },
    Stream {
        status: StatusCode,
        headers: HeaderMap,
    },
}

/// The client went away; nothing more can be delivered.
#[derive(Debug, Error)]
#[error("client disconnected")]
pub struct ClientGone;

pub struct ReplyReceiver {
    pub decision: oneshot::Receiver<Decision>,
    pub body: mpsc::Receiver<Bytes>,
}

/// Pipeline-side writer. At most one decision is ever sent; ping frames and
/// upstream chunks are only valid after the channel switched to stream mode.
pub struct ReplyChannel {
    decision: Option<oneshot::Sender<Decision>>,
    body: mpsc::Sender<Bytes>,
    ping_format: PingFormat,
    is_stream: bool,
    stream_started: bool,
}

impl ReplyChannel {
    pub fn pair(is_stream: bool, ping_format: PingFormat) -> (ReplyChannel, ReplyReceiver) {
        let (decision_tx, decision_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        (
            ReplyChannel {
                decision: Some(decision_tx),
                body: body_tx,
                ping_format,
                is_stream,
                stream_started: false,
            },
            ReplyReceiver {
                decision: decision_rx,
                body: body_rx,
            },
        )
    }

    pub fn is_stream(&self) -> bool {
        self.is_stream
    }

    pub fn stream_started(&self) -> bool {
        self.stream_started
    }

    /// A sender clone whose `closed()` future resolves when the client side
    /// drops the response; used to derive the request cancel token.
    pub fn disconnect_signal(&self) -> mpsc::Sender<Bytes> {
        self.body.clone()
    }

    /// Emit one keep-alive frame. The first ping commits the response to SSE
    /// mode: headers go out and the status is locked to 200.
    pub async fn write_ping(&mut self) -> Result<(), ClientGone> {
        let Some(frame) = self.ping_format.frame() else {
            return Ok(());
        };
        self.ensure_sse_started()?;
        self.body.send(Bytes::from_static(frame)).await.map_err(|_| ClientGone)
    }

    /// Switch to stream mode with upstream-provided status and headers.
    /// A no-op when a ping already started the stream.
    pub fn begin_stream(&mut self, status: StatusCode, headers: HeaderMap) -> Result<(), ClientGone> {
        if self.stream_started {
            return Ok(());
        }
        self.send_decision(Decision::Stream { status, headers })?;
        self.stream_started = true;
        Ok(())
    }

    pub async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), ClientGone> {
        debug_assert!(self.stream_started, "chunk before stream start");
        self.body.send(chunk).await.map_err(|_| ClientGone)
    }

    /// Deliver a buffered JSON response. Must not be used once streaming
    /// started; errors after that point go through [`ReplyChannel::send_error`].
    pub fn send_json(&mut self, status: StatusCode, body: serde_json::Value) -> Result<(), ClientGone> {
        self.send_decision(Decision::Json { status, body })
    }

    /// Streaming-aware error delivery: before any bytes went out this is a
    /// plain JSON error response; afterwards the error becomes a terminal SSE
    /// `error` event on the open stream.
    pub async fn send_error(
        &mut self,
        status: StatusCode,
        error_type: &str,
        message: &str,
    ) -> Result<(), ClientGone> {
        let payload = json!({
            "type": "error",
            "error": {
                "type": error_type,
                "message": message,
            },
        });
        if self.stream_started {
            let frame = format!("data: {payload}\n\n");
            return self.body.send(Bytes::from(frame)).await.map_err(|_| ClientGone);
        }
        self.send_json(status, payload)
    }

    fn ensure_sse_started(&mut self) -> Result<(), ClientGone> {
        if self.stream_started {
            return Ok(());
        }
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        // Tells fronting nginx-style proxies to pass frames through unbuffered.
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
        self.send_decision(Decision::Stream {
            status: StatusCode::OK,
            headers,
        })?;
        self.stream_started = true;
        Ok(())
    }

    fn send_decision(&mut self, decision: Decision) -> Result<(), ClientGone> {
        let Some(sender) = self.decision.take() else {
            return Err(ClientGone);
        };
        sender.send(decision).map_err(|_| ClientGone)
    }
}
