//! Data models for the broadcast hub.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::HubError;

/// Longest accepted topic name, in bytes.
pub const MAX_TOPIC_LEN: usize = 128;

/// A validated topic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(Arc<str>);

impl Topic {
    /// Validate and wrap a topic name.
    pub fn parse(name: &str) -> Result<Self, HubError> {
        if name.is_empty() || name.len() > MAX_TOPIC_LEN {
            return Err(HubError::InvalidTopic(name.to_string()));
        }
        let valid = name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'-'));
        if !valid {
            return Err(HubError::InvalidTopic(name.to_string()));
        }
        Ok(Self(Arc::from(name)))
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Topic {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Topic::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// A published event. Immutable once created; shared between queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub topic: Topic,
    pub payload: Vec<u8>,
    /// Hub-assigned, per topic, starting at 1.
    pub sequence: u64,
}

impl Event {
    pub fn new(topic: Topic, payload: Vec<u8>, sequence: u64) -> Self {
        Self {
            topic,
            payload,
            sequence,
        }
    }

    /// Payload as text, replacing invalid UTF-8.
    pub fn payload_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// What to do when a subscriber queue is full and a new event arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the longest-buffered event and keep the new one.
    #[default]
    DropOldest,
    /// Keep the buffered events and discard the new one.
    DropNewest,
}

impl std::fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverflowPolicy::DropOldest => write!(f, "drop_oldest"),
            OverflowPolicy::DropNewest => write!(f, "drop_newest"),
        }
    }
}

/// Per-topic snapshot returned by the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TopicStats {
    pub topic: Topic,
    pub subscribers: usize,
    pub last_sequence: u64,
    pub dropped: u64,
}

/// Snapshot of the whole hub.
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub topics: Vec<TopicStats>,
    pub total_subscribers: usize,
    pub shutting_down: bool,
}
