use hub_wire::WireError;
use thiserror::Error;

/// Errors that can occur during hub operation.
#[derive(Debug, Error)]
pub enum HubError {
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Frame encoding or decoding error.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    /// The outbound queue of a connection is full.
    #[error("outbound queue full")]
    Backpressure,
    /// The connection was closed by the remote peer or by shutdown.
    #[error("connection closed")]
    ConnectionClosed,
    /// No live connection with the given id.
    #[error("conn not found: {0}")]
    ConnNotFound(String),
    /// A connection with the same id is already registered.
    #[error("conn exists: {0}")]
    ConnExists(String),
    /// A handler is already registered for the sub-protocol.
    #[error("sub proto {0} already registered")]
    DuplicateSubProto(u8),
    /// The sub-protocol selector does not fit in 6 bits.
    #[error("sub proto {0} out of range")]
    SubProtoOutOfRange(u8),
    /// The server was started twice.
    #[error("server already started")]
    AlreadyStarted,
    /// Shutdown did not complete within the caller's deadline.
    #[error("stop deadline exceeded")]
    StopTimeout,
    /// Device store failure.
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    /// Rejected configuration value.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}
