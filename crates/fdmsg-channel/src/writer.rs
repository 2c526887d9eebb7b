use std::os::fd::AsFd;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use bytes::BytesMut;
use fdmsg_frame::encode_frame;
use tracing::trace;

use crate::channel::Inner;
use crate::message::Message;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writer loop: drain the outbound queue in enqueue order, one `sendmsg`
/// per frame.
///
/// Exits when every producer handle is gone (queue closed) or on the
/// first send failure, which is fatal to the channel. On a clean exit the
/// socket is shut down so the peer observes EOF.
pub(crate) fn run(inner: Arc<Inner>, queue: Receiver<Message>) {
    let mut wire = BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY);

    for mut msg in queue.iter() {
        msg.stamp(inner.peer_pid, inner.pid);

        wire.clear();
        if let Err(err) = encode_frame(&msg.header, &msg.payload, &mut wire) {
            inner.fail(err.into());
            return;
        }

        let fd = msg.take_fd();
        match inner
            .socket
            .send_with_fd(&wire, fd.as_ref().map(|fd| fd.as_fd()))
        {
            Ok(sent) => {
                trace!(
                    channel = %inner.name,
                    msg_type = msg.header.msg_type,
                    bytes = sent,
                    has_fd = fd.is_some(),
                    "frame sent"
                );
            }
            Err(err) => {
                inner.fail(err.into());
                return;
            }
        }
        // fd drops here: the kernel holds the open-file reference for the
        // peer now, our copy must not be used again.
    }

    let _ = inner.socket.shutdown();
    trace!(channel = %inner.name, "writer done");
}
