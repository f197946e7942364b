//! Error types for the bridge service.

use thiserror::Error;

/// Bridge errors.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration loading or validation failed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket accept, read, or write failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol violation on a session.
    #[error("framing error: {0}")]
    Frame(#[from] portway_proto::FrameError),

    /// Database operation failed.
    #[error("storage error: {0}")]
    Store(#[from] portway_store::StoreError),

    /// Payload validation or conversion failed.
    #[error("transform error: {0}")]
    Transform(String),

    /// Upstream request failed at the transport level after all retries.
    #[error("upstream request failed: {0}")]
    UpstreamTransport(String),

    /// Upstream answered with a non-2xx status after all retries.
    #[error("upstream returned status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    /// Upstream 2xx reply body could not be parsed.
    #[error("upstream reply unparseable: {0}")]
    UpstreamBody(String),

    /// A port is already registered.
    #[error("port {0} already registered")]
    DuplicatePort(u16),

    /// No live connection for the routing target.
    #[error("no connection registered for port {0}")]
    RouteMissing(u16),

    /// The framed write to the client failed; the entry was evicted.
    #[error("write to port {port} failed: {reason}")]
    RouteWriteFailed { port: u16, reason: String },

    /// The worker pool queue is full; backpressure signal to the poller.
    #[error("worker queue is full")]
    QueueFull,

    /// Per-job deadline expired.
    #[error("processing deadline exceeded")]
    DeadlineExceeded,

    /// Operation aborted by cancellation.
    #[error("aborted by shutdown")]
    Shutdown,
}
