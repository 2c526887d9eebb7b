/// Errors that can occur on a channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Transport-level error (socket I/O or ancillary-data violation).
    #[error("transport error: {0}")]
    Transport(#[from] fdmsg_transport::TransportError),

    /// Frame-level error (oversize payload, truncated stream).
    #[error("frame error: {0}")]
    Frame(#[from] fdmsg_frame::FrameError),

    /// An inbound message matched no reply slot and no registered handler.
    #[error("channel {channel}: no handler registered for message type {msg_type}")]
    UnhandledType { channel: String, msg_type: u32 },

    /// The channel is dead; the operation cannot complete.
    #[error("channel disconnected")]
    Disconnected,

    /// `dispatch` was called more than once on the same channel.
    #[error("dispatcher already started")]
    AlreadyDispatched,

    /// Typed-payload serialization or deserialization failed.
    #[error("payload codec error: {0}")]
    Payload(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ChannelError>;
