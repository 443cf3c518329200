//! Stream sessions: one per connected client.
//!
//! A session subscribes to a topic, then drains its queue into a transport
//! sink until the client goes away or the hub shuts down.
//! Sessions never reopen themselves; the transport creates a fresh one per
//! connection.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{HubError, TransportError};
use crate::hub::{Hub, Subscription};
use crate::models::{Event, Topic};
use crate::queue::Popped;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnect,
    ServerShutdown,
    Error,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::ClientDisconnect => write!(f, "client_disconnect"),
            CloseReason::ServerShutdown => write!(f, "server_shutdown"),
            CloseReason::Error => write!(f, "error"),
        }
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Subscribed,
    Streaming,
    Closed(CloseReason),
}

/// Where a session writes delivered events.
#[async_trait]
pub trait EventSink: Send {
    /// Write one event. [`TransportError::Closed`] means the client is gone.
    async fn send(&mut self, event: &Event) -> Result<(), TransportError>;
}

/// External handle used by the transport to end a session.
#[derive(Clone, Debug)]
pub struct SessionControl {
    cancel: CancellationToken,
    subscription: Arc<Subscription>,
}

impl SessionControl {
    /// Cancel the session. Its queue is out of the hub registry by the time
    /// this returns; the session task wakes and closes on its own.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.subscription.unsubscribe();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Unsubscribes on every exit from [`StreamSession::run`], including a
/// dropped future.
struct UnsubscribeGuard(Arc<Subscription>);

impl Drop for UnsubscribeGuard {
    fn drop(&mut self) {
        self.0.unsubscribe();
    }
}

pub struct StreamSession {
    id: Uuid,
    hub: Hub,
    topic: Topic,
    capacity: usize,
    state: SessionState,
    cancel: CancellationToken,
    subscription: Option<Arc<Subscription>>,
}

impl StreamSession {
    pub fn new(hub: Hub, topic: Topic, capacity: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            hub,
            topic,
            capacity,
            state: SessionState::Connecting,
            cancel: CancellationToken::new(),
            subscription: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Register this session's queue with the hub.
    ///
    /// Calling it again once subscribed returns the same control handle.
    pub fn subscribe(&mut self) -> Result<SessionControl, HubError> {
        if let Some(subscription) = &self.subscription {
            return Ok(SessionControl {
                cancel: self.cancel.clone(),
                subscription: subscription.clone(),
            });
        }

        match self.hub.subscribe(&self.topic, self.capacity) {
            Ok(subscription) => {
                let subscription = Arc::new(subscription);
                debug!(
                    "Session {} subscribed to {} as subscriber {}",
                    self.id,
                    self.topic,
                    subscription.id()
                );
                self.subscription = Some(subscription.clone());
                self.state = SessionState::Subscribed;
                Ok(SessionControl {
                    cancel: self.cancel.clone(),
                    subscription,
                })
            }
            Err(e) => {
                self.state = SessionState::Closed(match e {
                    HubError::SubscribeAfterShutdown => CloseReason::ServerShutdown,
                    _ => CloseReason::Error,
                });
                Err(e)
            }
        }
    }

    /// Stream events into `sink` until the session closes.
    ///
    /// Subscribes first if [`subscribe`](Self::subscribe) was not called.
    pub async fn run<S: EventSink + ?Sized>(mut self, sink: &mut S) -> CloseReason {
        if let SessionState::Closed(reason) = self.state {
            return reason;
        }
        if self.subscription.is_none() {
            if let Err(e) = self.subscribe() {
                warn!("Session {} could not subscribe to {}: {}", self.id, self.topic, e);
                return match self.state {
                    SessionState::Closed(reason) => reason,
                    _ => CloseReason::Error,
                };
            }
        }
        let Some(subscription) = self.subscription.clone() else {
            return CloseReason::Error;
        };
        let _guard = UnsubscribeGuard(subscription.clone());

        self.state = SessionState::Streaming;
        let mut delivered = 0u64;

        let reason = loop {
            let event = match subscription.pop(&self.cancel).await {
                Popped::Event(event) => event,
                Popped::Cancelled => break CloseReason::ClientDisconnect,
                Popped::Closed if self.hub.is_shutting_down() => break CloseReason::ServerShutdown,
                Popped::Closed => break CloseReason::ClientDisconnect,
            };

            let written = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(TransportError::Closed),
                result = sink.send(&event) => result,
            };
            match written {
                Ok(()) => delivered += 1,
                Err(TransportError::Closed) => break CloseReason::ClientDisconnect,
            }
        };

        subscription.unsubscribe();
        self.state = SessionState::Closed(reason);
        debug!(
            "Session {} on {} closed ({}): {} delivered, {} dropped",
            self.id,
            self.topic,
            reason,
            delivered,
            subscription.dropped_count()
        );
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Forwards payloads to a channel; fails once the receiver is gone.
    struct ChannelSink(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl EventSink for ChannelSink {
        async fn send(&mut self, event: &Event) -> Result<(), TransportError> {
            self.0
                .send(event.payload_text().into_owned())
                .map_err(|_| TransportError::Closed)
        }
    }

    fn topic(name: &str) -> Topic {
        Topic::parse(name).unwrap()
    }

    #[tokio::test]
    async fn test_session_streams_in_order() {
        let hub = Hub::default();
        let t = topic("events");
        let mut session = StreamSession::new(hub.clone(), t.clone(), 8);
        assert_eq!(session.state(), SessionState::Connecting);
        let control = session.subscribe().unwrap();
        assert_eq!(session.state(), SessionState::Subscribed);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move { session.run(&mut ChannelSink(tx)).await });

        for p in ["one", "two", "three"] {
            hub.publish(&t, p).unwrap();
        }
        for p in ["one", "two", "three"] {
            assert_eq!(rx.recv().await.as_deref(), Some(p));
        }

        control.cancel();
        assert_eq!(task.await.unwrap(), CloseReason::ClientDisconnect);
    }

    #[tokio::test]
    async fn test_cancel_unsubscribes_before_returning() {
        let hub = Hub::default();
        let t = topic("events");
        let mut session = StreamSession::new(hub.clone(), t.clone(), 8);
        let control = session.subscribe().unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move { session.run(&mut ChannelSink(tx)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hub.subscriber_count(&t), 1);

        control.cancel();
        assert_eq!(hub.subscriber_count(&t), 0);
        assert!(control.token().is_cancelled());

        let reason = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, CloseReason::ClientDisconnect);
    }

    #[tokio::test]
    async fn test_write_failure_closes_and_unsubscribes() {
        let hub = Hub::default();
        let t = topic("events");
        let session = StreamSession::new(hub.clone(), t.clone(), 8);

        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let task = tokio::spawn(async move { session.run(&mut ChannelSink(tx)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hub.subscriber_count(&t), 1);

        hub.publish(&t, "nobody listening").unwrap();
        assert_eq!(task.await.unwrap(), CloseReason::ClientDisconnect);
        assert_eq!(hub.subscriber_count(&t), 0);
    }

    #[tokio::test]
    async fn test_invalid_capacity_closes_with_error() {
        let hub = Hub::default();
        let mut session = StreamSession::new(hub.clone(), topic("events"), 0);
        assert_eq!(session.subscribe().unwrap_err(), HubError::InvalidCapacity);
        assert_eq!(session.state(), SessionState::Closed(CloseReason::Error));

        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(session.run(&mut ChannelSink(tx)).await, CloseReason::Error);
        assert_eq!(hub.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_ends_session() {
        let hub = Hub::default();
        let t = topic("events");
        let session = StreamSession::new(hub.clone(), t.clone(), 8);
        let (tx, _rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move { session.run(&mut ChannelSink(tx)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        hub.shutdown();
        let reason = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, CloseReason::ServerShutdown);
    }

    #[tokio::test]
    async fn test_subscribe_after_shutdown_closes_immediately() {
        let hub = Hub::default();
        hub.shutdown();
        let mut session = StreamSession::new(hub, topic("events"), 8);
        assert_eq!(session.subscribe().unwrap_err(), HubError::SubscribeAfterShutdown);
        assert_eq!(session.state(), SessionState::Closed(CloseReason::ServerShutdown));

        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(session.run(&mut ChannelSink(tx)).await, CloseReason::ServerShutdown);
    }

    #[tokio::test]
    async fn test_aborted_session_still_unsubscribes() {
        let hub = Hub::default();
        let t = topic("events");
        let mut session = StreamSession::new(hub.clone(), t.clone(), 8);
        let control = session.subscribe().unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move { session.run(&mut ChannelSink(tx)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(hub.subscriber_count(&t), 0);
        assert!(!control.token().is_cancelled());
    }
}
