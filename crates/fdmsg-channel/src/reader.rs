use std::os::fd::OwnedFd;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use bytes::BytesMut;
use fdmsg_frame::{decode_frame, FrameError};
use tracing::{trace, warn};

use crate::channel::Inner;
use crate::message::Message;

/// Reader loop: block on `recvmsg`, reassemble frames, deliver messages.
///
/// Each receive supplies an ancillary buffer sized for one descriptor.
/// Received bytes feed an accumulation buffer so both coalesced writes
/// and short reads decode correctly. A received descriptor attaches to
/// the first `has_fd` frame that completes; further flagged frames in
/// the same batch carry no descriptor.
///
/// Exits on peer EOF (closing the inbound queue) or on the first
/// transport/framing failure, which is fatal to the channel.
pub(crate) fn run(inner: Arc<Inner>, inbound: Sender<Message>, recv_buffer_size: usize) {
    let mut chunk = vec![0u8; recv_buffer_size];
    let mut buf = BytesMut::new();
    let mut pending_fd: Option<OwnedFd> = None;

    loop {
        let (received, fd) = match inner.socket.recv_with_fd(&mut chunk) {
            Ok(pair) => pair,
            Err(err) => {
                inner.fail(err.into());
                return;
            }
        };

        if received == 0 {
            if !buf.is_empty() {
                inner.fail(FrameError::Truncated { buffered: buf.len() }.into());
            }
            trace!(channel = %inner.name, "peer closed");
            return;
        }

        if let Some(fd) = fd {
            if pending_fd.replace(fd).is_some() {
                // The previous descriptor's frame never completed before
                // another arrived; the unclaimed one is closed here.
                warn!(channel = %inner.name, "discarding unclaimed descriptor");
            }
        }

        buf.extend_from_slice(&chunk[..received]);

        loop {
            match decode_frame(&mut buf) {
                Ok(Some(frame)) => {
                    let mut header = frame.header;
                    header.peer_pid = inner.peer_pid;
                    header.pid = inner.pid;

                    let fd = if header.has_fd { pending_fd.take() } else { None };
                    if header.has_fd && fd.is_none() {
                        // Descriptor exhaustion: the sender coalesced
                        // several flagged frames into this batch.
                        warn!(
                            channel = %inner.name,
                            msg_type = header.msg_type,
                            "flagged frame arrived without a descriptor"
                        );
                    }

                    trace!(
                        channel = %inner.name,
                        msg_type = header.msg_type,
                        size = header.size,
                        has_fd = header.has_fd,
                        "frame received"
                    );

                    if inbound
                        .send(Message::from_parts(header, frame.payload, fd))
                        .is_err()
                    {
                        // Dispatcher is gone; nothing left to deliver to.
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    inner.fail(err.into());
                    return;
                }
            }
        }
    }
}
