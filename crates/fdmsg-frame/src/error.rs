/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload exceeds what the 2-byte size field can carry alongside
    /// the header.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The stream ended with a partial frame left in the buffer.
    #[error("stream closed mid-frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
}

pub type Result<T> = std::result::Result<T, FrameError>;
