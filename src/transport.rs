//! `text/event-stream` transport for stream sessions.

use async_trait::async_trait;
use axum::response::sse;
use std::convert::Infallible;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::models::Event;
use crate::session::EventSink;

pub type SseItem = Result<sse::Event, Infallible>;

/// Sink feeding an axum SSE response body through a bounded channel.
///
/// When the response body is dropped (client gone) the receiver goes with
/// it and the next write fails with [`TransportError::Closed`].
pub struct SseSink {
    tx: mpsc::Sender<SseItem>,
}

impl SseSink {
    pub fn new(tx: mpsc::Sender<SseItem>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EventSink for SseSink {
    async fn send(&mut self, event: &Event) -> Result<(), TransportError> {
        let frame = sse::Event::default().data(frame_data(event));
        self.tx.send(Ok(frame)).await.map_err(|_| TransportError::Closed)
    }
}

/// Payload text with every line ending normalised to `\n`.
///
/// axum splits on `\n` into one `data:` line each and rejects bare `\r`.
pub fn frame_data(event: &Event) -> String {
    let text = event.payload_text();
    if !text.contains('\r') {
        return text.into_owned();
    }
    text.replace("\r\n", "\n").replace('\r', "\n")
}
