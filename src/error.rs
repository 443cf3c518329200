//! Error types for the hub and stream transports.

use thiserror::Error;

/// Errors returned by hub operations.
///
/// Queue overflow is not an error: it is counted on the queue and never
/// reported to the publisher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("invalid topic name: {0:?}")]
    InvalidTopic(String),

    #[error("subscriber capacity must be at least 1")]
    InvalidCapacity,

    #[error("hub is shutting down; subscribe rejected")]
    SubscribeAfterShutdown,

    #[error("hub is shutting down; publish rejected")]
    ShuttingDown,
}

/// Failure writing to a session's transport sink.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The client went away.
    #[error("transport closed")]
    Closed,
}
