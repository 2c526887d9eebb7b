//! The fdmsg channel: typed request/reply messaging over a connected
//! UNIX socket pair, with single-descriptor passing.
//!
//! A [`Channel`] wraps one end of an already-connected
//! `AF_UNIX`/`SOCK_STREAM` socket and runs three cooperating threads:
//!
//! - the **writer** drains the outbound queue, emitting one `sendmsg`
//!   per frame and attaching the message's descriptor as `SCM_RIGHTS`
//!   ancillary data when present;
//! - the **reader** blocks on `recvmsg`, reassembles coalesced frames,
//!   and hands decoded messages to the dispatcher;
//! - the **dispatcher** (started by [`Channel::dispatch`]) routes each
//!   inbound message to the reply slot registered under its id, or to
//!   the handler registered for its type.
//!
//! The channel is an atomic resource: it is healthy or dead. Any
//! transport, framing, or dispatch failure records a first fault, shuts
//! the socket down, and surfaces through the [`Done`] signal.

pub mod channel;
pub mod error;
pub mod message;

mod reader;
mod writer;

pub use channel::{Channel, ChannelConfig, Done};
pub use error::{ChannelError, Result};
pub use message::Message;
