//! Fixed-size header framing for fdmsg.
//!
//! Every message is framed with a 31-byte big-endian header:
//! a 16-byte message id, a 4-byte application type tag, a 2-byte payload
//! length, a 1-byte descriptor flag, and two informational 4-byte process
//! id fields. The payload follows contiguously on the stream.
//!
//! Encoding never splits a frame; decoding is incremental — the reader
//! feeds received bytes into a buffer and drains complete frames, which
//! copes with both coalesced writes and short reads.

pub mod codec;
pub mod error;

pub use codec::{decode_frame, encode_frame, Frame, Header, HEADER_SIZE, MAX_PAYLOAD};
pub use error::{FrameError, Result};
