use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use bytes::Bytes;
use fdmsg_frame::Header;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::Result;

/// A message travelling over a channel: header, opaque payload bytes,
/// and optionally one owned file descriptor.
///
/// An outbound descriptor is owned by the message and closed by the
/// writer once the frame is on the wire. An inbound descriptor is owned
/// by the message and released when the message (or the descriptor taken
/// out of it) is dropped — the channel never closes it behind the
/// recipient's back.
#[derive(Debug)]
pub struct Message {
    pub(crate) header: Header,
    pub(crate) payload: Bytes,
    pub(crate) fd: Option<OwnedFd>,
}

impl Message {
    /// Create a message with a fresh id.
    pub fn new(msg_type: u32, payload: impl Into<Bytes>, fd: Option<OwnedFd>) -> Self {
        let payload = payload.into();
        let header = Header {
            id: Uuid::new_v4(),
            msg_type,
            size: payload.len() as u16,
            has_fd: fd.is_some(),
            peer_pid: 0,
            pid: 0,
        };
        Self {
            header,
            payload,
            fd,
        }
    }

    /// Create a reply: same as [`new`](Self::new) but the id is copied
    /// from the originating message so the peer can correlate it.
    pub fn reply_to(
        original: &Message,
        msg_type: u32,
        payload: impl Into<Bytes>,
        fd: Option<OwnedFd>,
    ) -> Self {
        let mut msg = Self::new(msg_type, payload, fd);
        msg.header.id = original.header.id;
        msg
    }

    pub(crate) fn from_parts(header: Header, payload: Bytes, fd: Option<OwnedFd>) -> Self {
        Self {
            header,
            payload,
            fd,
        }
    }

    pub(crate) fn stamp(&mut self, peer_pid: u32, pid: u32) {
        self.header.peer_pid = peer_pid;
        self.header.pid = pid;
    }

    /// The message identifier.
    pub fn id(&self) -> Uuid {
        self.header.id
    }

    /// The application type tag.
    pub fn msg_type(&self) -> u32 {
        self.header.msg_type
    }

    /// The payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether the sender flagged a descriptor on this message.
    ///
    /// This reflects the wire header. An inbound message can report
    /// `true` while [`fd`](Self::fd) is `None`: the sender coalesced
    /// several descriptor-carrying frames into one transport datagram
    /// and only the first one received the descriptor.
    pub fn has_fd(&self) -> bool {
        self.header.has_fd
    }

    /// Borrow the attached descriptor, if one is present.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    /// Take ownership of the attached descriptor.
    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        self.fd.take()
    }

    /// Peer process id, as seen by the local side of the channel.
    pub fn peer_pid(&self) -> u32 {
        self.header.peer_pid
    }

    /// Local process id. Informational, like [`peer_pid`](Self::peer_pid).
    pub fn pid(&self) -> u32 {
        self.header.pid
    }

    /// Deserialize the payload as JSON into `T`.
    ///
    /// Companion to the `*_typed` sending operations on the channel; the
    /// wire itself stays opaque bytes.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}
