//! Typed request/reply IPC between cooperating UNIX processes, with
//! single-descriptor passing over `SCM_RIGHTS`.
//!
//! fdmsg is built for the parent/child pattern: a long-lived process
//! forks a privileged or sandboxed child, hands it one end of a
//! pre-created socket pair on a known descriptor slot, and thereafter
//! exchanges tagged messages — including open file descriptors whose
//! ownership transfers across the process boundary.
//!
//! # Crate Structure
//!
//! - [`transport`] — Connected-socket endpoint; `sendmsg`/`recvmsg`
//!   with `SCM_RIGHTS`
//! - [`frame`] — Fixed 31-byte header framing
//! - [`channel`] — The channel: writer/reader/dispatcher, request/reply
//!   correlation, handlers
//!
//! # Example
//!
//! ```no_run
//! use fdmsg::channel::Channel;
//! use fdmsg::transport::MsgSocket;
//!
//! const PING: u32 = 1;
//! const PONG: u32 = 2;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (ours, theirs) = MsgSocket::pair()?;
//! let peer_pid = theirs.peer_pid().unwrap_or(0);
//! // `theirs` goes to the child on a known descriptor slot…
//!
//! let channel = Channel::new("parent<->child", peer_pid, ours);
//! channel.handler(PING, |channel, msg| {
//!     let _ = channel.reply(&msg, PONG, "PONG !", None);
//! });
//! let done = channel.dispatch();
//!
//! let reply = channel.query(PING, "PING ?", None)?;
//! assert_eq!(reply.payload(), b"PONG !");
//!
//! done.wait()?;
//! # Ok(())
//! # }
//! ```

/// Re-export transport types.
pub mod transport {
    pub use fdmsg_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use fdmsg_frame::*;
}

/// Re-export channel types.
pub mod channel {
    pub use fdmsg_channel::*;
}
