//! Socket endpoint layer for fdmsg.
//!
//! Wraps one end of a connected `AF_UNIX`/`SOCK_STREAM` socket and exposes
//! the two kernel primitives the channel needs: a single-`sendmsg` write
//! that may attach one file descriptor as `SCM_RIGHTS` ancillary data, and
//! a single-`recvmsg` read that may yield one.
//!
//! This is the lowest layer of fdmsg. It does not frame, queue, or spawn
//! anything — the [`MsgSocket`] is consumed by the channel layer, which
//! owns the reader and writer loops.

pub mod error;
pub mod socket;

pub use error::{Result, TransportError};
pub use socket::MsgSocket;
