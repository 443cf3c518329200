//! Command-line client: publish events and follow a topic's stream.

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::Published;
use crate::models::Topic;

/// Reconnect delay used until the server sends a `retry:` field.
pub const DEFAULT_RETRY: Duration = Duration::from_secs(3);

/// Longest line the parser buffers while waiting for its terminator.
pub const MAX_LINE_LEN: usize = 1 << 20;

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessage {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` parser.
///
/// Accepts LF, CR, and CRLF line endings, including a CRLF split across
/// two chunks. Comment lines (leading `:`) are skipped. A line that grows
/// past [`MAX_LINE_LEN`] is discarded up to its terminator.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    /// A chunk ended in `\r`; a leading `\n` in the next one belongs to it.
    pending_cr: bool,
    /// Skipping the rest of an over-long line.
    discarding: bool,
    id: Option<String>,
    event: Option<String>,
    data: Vec<String>,
    last_event_id: Option<String>,
    retry: Option<Duration>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the last dispatched event that carried one.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Reconnect delay most recently requested by the server.
    pub fn retry(&self) -> Option<Duration> {
        self.retry
    }

    /// Feed a chunk of bytes; returns every event it completes.
    pub fn feed(&mut self, mut chunk: &[u8]) -> Vec<SseMessage> {
        if self.pending_cr {
            self.pending_cr = false;
            if chunk.first() == Some(&b'\n') {
                chunk = &chunk[1..];
            }
        }
        self.buffer.extend_from_slice(chunk);

        let mut messages = Vec::new();
        let mut start = 0;
        let mut i = 0;
        while i < self.buffer.len() {
            let b = self.buffer[i];
            if b != b'\n' && b != b'\r' {
                i += 1;
                continue;
            }
            let line = String::from_utf8_lossy(&self.buffer[start..i]).into_owned();
            if b == b'\r' {
                match self.buffer.get(i + 1) {
                    Some(b'\n') => i += 1,
                    Some(_) => {}
                    None => self.pending_cr = true,
                }
            }
            i += 1;
            start = i;
            if self.discarding {
                self.discarding = false;
                continue;
            }
            if let Some(message) = self.process_line(&line) {
                messages.push(message);
            }
        }
        self.buffer.drain(..start);

        if self.buffer.len() > MAX_LINE_LEN {
            if !self.discarding {
                warn!("Discarding SSE line longer than {} bytes", MAX_LINE_LEN);
            }
            self.buffer.clear();
            self.discarding = true;
        }
        messages
    }

    fn process_line(&mut self, line: &str) -> Option<SseMessage> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" => self.id = Some(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.trim().parse::<u64>() {
                    self.retry = Some(Duration::from_millis(ms));
                }
            }
            other => debug!("Ignoring unknown SSE field {:?}", other),
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseMessage> {
        let id = self.id.take();
        let event = self.event.take();
        if id.is_some() {
            self.last_event_id = id.clone();
        }
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseMessage { id, event, data })
    }
}

fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?)
}

/// Publish `data` to `topic` and return the assigned sequence number.
pub async fn publish(base_url: &str, topic: &str, data: String) -> Result<u64> {
    let topic = Topic::parse(topic)?;
    let url = format!("{}/api/v1/topics/{}/events", base_url.trim_end_matches('/'), topic);

    let response = http_client()?
        .post(&url)
        .body(data)
        .send()
        .await
        .with_context(|| format!("failed to reach {}", url))?;
    let status = response.status();
    let body: serde_json::Value = response.json().await?;

    if !status.is_success() {
        let message = body
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error");
        bail!("publish failed ({}): {}", status, message);
    }
    let published: Published = serde_json::from_value(body["data"].clone())?;
    Ok(published.sequence)
}

/// Follow `topic`, printing each event's data to stdout, until Ctrl-C.
///
/// The connection is reopened after errors or server-side closes, waiting
/// for the server-supplied `retry:` interval.
pub async fn listen(base_url: &str, topic: &str) -> Result<()> {
    let topic = Topic::parse(topic)?;
    let url = format!("{}/api/v1/topics/{}/stream", base_url.trim_end_matches('/'), topic);
    let client = http_client()?;

    let mut parser = SseParser::new();
    loop {
        tokio::select! {
            result = follow(&client, &url, &mut parser) => {
                if let Err(e) = result {
                    warn!("Stream {} interrupted: {:#}", url, e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Stopped listening to {}", topic);
                return Ok(());
            }
        }

        let delay = parser.retry().unwrap_or(DEFAULT_RETRY);
        info!("Reconnecting to {} in {:?}", url, delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn follow(client: &reqwest::Client, url: &str, parser: &mut SseParser) -> Result<()> {
    let mut request = client
        .get(url)
        .header(reqwest::header::ACCEPT, "text/event-stream");
    if let Some(id) = parser.last_event_id() {
        request = request.header("Last-Event-ID", id);
    }

    let response = request.send().await?.error_for_status()?;
    info!("Connected to {}", url);

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        for message in parser.feed(&chunk?) {
            println!("{}", message.data);
        }
    }
    bail!("server closed the stream")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_lf_frames() {
        let mut parser = SseParser::new();
        let messages = parser.feed(b"data: one\n\ndata: two\n\n");
        let data: Vec<_> = messages.iter().map(|m| m.data.as_str()).collect();
        assert_eq!(data, ["one", "two"]);
    }

    #[test]
    fn test_parses_cr_and_crlf_frames() {
        let mut parser = SseParser::new();
        let mut messages = parser.feed(b"data: cr\r\r");
        messages.extend(parser.feed(b"data: crlf\r\n\r\n"));
        let data: Vec<_> = messages.iter().map(|m| m.data.as_str()).collect();
        assert_eq!(data, ["cr", "crlf"]);
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"da").is_empty());
        assert!(parser.feed(b"ta: hel").is_empty());
        assert!(parser.feed(b"lo\r").is_empty());
        let messages = parser.feed(b"\n\r");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data, "hello");
        // The trailing LF completes the CRLF, not another blank line.
        assert!(parser.feed(b"\n").is_empty());
        assert!(parser.feed(b"data: next\n\n").len() == 1);
    }

    #[test]
    fn test_fields_comments_and_multiline_data() {
        let mut parser = SseParser::new();
        let messages = parser.feed(
            b": keep-alive\n\nid: 7\nevent: update\ndata: line one\ndata:line two\nretry: 1500\n\n",
        );
        assert_eq!(
            messages,
            vec![SseMessage {
                id: Some("7".to_string()),
                event: Some("update".to_string()),
                data: "line one\nline two".to_string(),
            }]
        );
        assert_eq!(parser.last_event_id(), Some("7"));
        assert_eq!(parser.retry(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_event_without_data_is_not_dispatched() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"id: 3\n\n").is_empty());
        assert_eq!(parser.last_event_id(), Some("3"));
        assert!(parser.feed(b"retry: nope\n\n").is_empty());
        assert_eq!(parser.retry(), None);
    }

    #[test]
    fn test_unterminated_line_is_capped() {
        let mut parser = SseParser::new();
        let mut chunk = b"data: ".to_vec();
        chunk.resize(MAX_LINE_LEN + 10, b'x');
        assert!(parser.feed(&chunk).is_empty());
        assert!(parser.buffer.is_empty());

        // The tail of the discarded line, its terminator included, is ignored.
        assert!(parser.feed(b"xxxx").is_empty());
        assert!(parser.feed(b"xx\n").is_empty());
        let messages = parser.feed(b"data: ok\n\n");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data, "ok");
    }

    #[tokio::test]
    async fn test_publish_rejects_bad_topic_before_sending() {
        let result = publish("http://127.0.0.1:9", "no spaces", String::new()).await;
        assert!(result.is_err());
    }
}
