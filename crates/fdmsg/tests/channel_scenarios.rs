//! End-to-end channel scenarios over an in-process socket pair.
//!
//! One side is usually a real [`Channel`]; where the wire itself matters
//! (coalescing, descriptor exhaustion, unknown types) the other side is
//! a raw [`MsgSocket`] hand-encoding frames.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use bytes::BytesMut;
use fdmsg::channel::{Channel, ChannelError, Message};
use fdmsg::frame::{encode_frame, Header, MAX_PAYLOAD};
use fdmsg::transport::MsgSocket;
use uuid::Uuid;

const PING: u32 = 1;
const PONG: u32 = 2;
const OPENFILE: u32 = 3;
const NOISE: u32 = 4;

const WAIT: Duration = Duration::from_secs(5);

fn channel_pair() -> (Channel, Channel) {
    let (a, b) = MsgSocket::pair().unwrap();
    let pid = std::process::id();
    (Channel::new("parent", pid, a), Channel::new("child", pid, b))
}

fn raw_frame(msg_type: u32, payload: &[u8], has_fd: bool) -> BytesMut {
    let header = Header {
        id: Uuid::new_v4(),
        msg_type,
        size: payload.len() as u16,
        has_fd,
        peer_pid: 9,
        pid: 9,
    };
    let mut wire = BytesMut::new();
    encode_frame(&header, payload, &mut wire).unwrap();
    wire
}

#[test]
fn ping_pong_once() {
    let (parent, child) = channel_pair();

    child.handler(PING, |channel, msg| {
        assert_eq!(msg.payload(), b"PING ?");
        let _ = channel.reply(&msg, PONG, "PONG !", None);
    });
    let _child_done = child.dispatch();
    let _parent_done = parent.dispatch();

    let reply = parent.query(PING, "PING ?", None).unwrap();
    assert_eq!(reply.msg_type(), PONG);
    assert_eq!(reply.payload(), b"PONG !");
}

#[test]
fn ping_pong_forever() {
    const ITERATIONS: usize = 32;

    let (parent, child) = channel_pair();
    let (pong_tx, pong_rx) = mpsc::channel();

    child.handler(PING, |channel, msg| {
        let _ = channel.reply(&msg, PONG, "PONG !", None);
    });
    // The kick-off PING below counts as the first send; stop once the
    // final PONG is in so teardown happens on a quiescent wire.
    let pings_sent = AtomicUsize::new(1);
    parent.handler(PONG, move |channel, msg| {
        let _ = pong_tx.send(msg.id());
        if pings_sent.fetch_add(1, Ordering::SeqCst) < ITERATIONS {
            let _ = channel.message(PING, "PING ?", None);
        }
    });
    let child_done = child.dispatch();
    let parent_done = parent.dispatch();

    parent.message(PING, "PING ?", None).unwrap();

    let mut ids = HashSet::new();
    for _ in 0..ITERATIONS {
        let id = pong_rx.recv_timeout(WAIT).unwrap();
        assert!(ids.insert(id), "pong ids must be distinct");
    }

    parent.shutdown().unwrap();
    assert!(matches!(parent_done.wait_timeout(WAIT), Some(Ok(()))));
    assert!(matches!(child_done.wait_timeout(WAIT), Some(Ok(()))));
}

#[test]
fn query_ignores_interleaved_unsolicited_traffic() {
    let (parent, child) = channel_pair();
    let (noise_tx, noise_rx) = mpsc::channel();

    child.handler(PING, |channel, msg| {
        // Unrelated traffic lands ahead of the reply on the wire.
        let _ = channel.message(NOISE, "noise-1", None);
        let _ = channel.message(NOISE, "noise-2", None);
        let _ = channel.reply(&msg, PONG, "PONG !", None);
    });
    parent.handler(NOISE, move |_, msg| {
        let _ = noise_tx.send(msg.payload().to_vec());
    });
    let _child_done = child.dispatch();
    let _parent_done = parent.dispatch();

    let reply = parent.query(PING, "PING ?", None).unwrap();
    assert_eq!(reply.msg_type(), PONG);
    assert_eq!(reply.payload(), b"PONG !");

    assert_eq!(noise_rx.recv_timeout(WAIT).unwrap(), b"noise-1");
    assert_eq!(noise_rx.recv_timeout(WAIT).unwrap(), b"noise-2");
}

#[test]
fn coalesced_frames_deliver_as_distinct_messages_in_order() {
    let (raw, sock) = MsgSocket::pair().unwrap();
    let channel = Channel::with_config("receiver", 4242, sock, Default::default());
    let (seen_tx, seen_rx) = mpsc::channel();

    channel.handler(PING, move |_, msg| {
        let _ = seen_tx.send(msg);
    });
    let _done = channel.dispatch();

    // Three frames in a single sendmsg: the reader must split them.
    let mut wire = BytesMut::new();
    wire.extend_from_slice(&raw_frame(PING, b"one", false));
    wire.extend_from_slice(&raw_frame(PING, b"two", false));
    wire.extend_from_slice(&raw_frame(PING, b"three", false));
    raw.send_with_fd(&wire, None).unwrap();

    let first: Message = seen_rx.recv_timeout(WAIT).unwrap();
    let second = seen_rx.recv_timeout(WAIT).unwrap();
    let third = seen_rx.recv_timeout(WAIT).unwrap();

    assert_eq!(first.payload(), b"one");
    assert_eq!(second.payload(), b"two");
    assert_eq!(third.payload(), b"three");

    // Wire pid fields are informational and rewritten on receive.
    assert_eq!(first.peer_pid(), 4242);
    assert_eq!(first.pid(), std::process::id());
}

#[test]
fn descriptor_arrives_with_openfile_query() {
    let (parent, child) = channel_pair();

    child.handler(OPENFILE, |channel, mut msg| {
        let path = String::from_utf8(msg.payload().to_vec()).unwrap();
        assert_eq!(path, "/etc/passwd");

        let fd = msg.take_fd().expect("descriptor should arrive");
        let mut file = File::from(fd);
        let mut head = [0u8; 7];
        file.read_exact(&mut head).unwrap();
        let _ = channel.reply(&msg, PONG, head.to_vec(), None);
    });
    let _child_done = child.dispatch();
    let _parent_done = parent.dispatch();

    let file = File::open("/etc/passwd").unwrap();
    let reply = parent
        .query(OPENFILE, "/etc/passwd", Some(OwnedFd::from(file)))
        .unwrap();

    let head = reply.payload();
    assert_eq!(head.len(), 7);
    assert!(
        head.starts_with(b"root:") || !head.is_empty(),
        "received descriptor must read the file's bytes"
    );
}

#[cfg(target_os = "linux")]
#[test]
fn sender_descriptor_is_closed_after_send() {
    let (raw, sock) = MsgSocket::pair().unwrap();
    let channel = Channel::new("sender", std::process::id(), sock);

    let dir = std::env::temp_dir().join(format!("fdmsg-close-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("sentinel.txt");
    std::fs::write(&path, b"sentinel").unwrap();

    let file = File::open(&path).unwrap();
    let sent_raw = file.as_raw_fd();
    channel
        .message(OPENFILE, "sentinel", Some(OwnedFd::from(file)))
        .unwrap();

    // The writer closes its copy once the frame is on the wire. The raw
    // peer has not received yet, so the descriptor slot cannot have been
    // reused for the passed file.
    let proc_link = format!("/proc/self/fd/{sent_raw}");
    let deadline = std::time::Instant::now() + WAIT;
    loop {
        match std::fs::read_link(&proc_link) {
            Ok(target) if target == path => {
                assert!(
                    std::time::Instant::now() < deadline,
                    "sender descriptor still open after send"
                );
                std::thread::sleep(Duration::from_millis(10));
            }
            _ => break,
        }
    }

    let mut buf = [0u8; 256];
    let (n, fd) = raw.recv_with_fd(&mut buf).unwrap();
    assert!(n > 0);
    let fd = fd.expect("descriptor should still arrive");
    let mut contents = String::new();
    File::from(fd).read_to_string(&mut contents).unwrap();
    assert_eq!(contents, "sentinel");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn only_first_flagged_frame_in_a_batch_gets_the_descriptor() {
    let (raw, sock) = MsgSocket::pair().unwrap();
    let channel = Channel::new("receiver", std::process::id(), sock);
    let (seen_tx, seen_rx) = mpsc::channel();

    channel.handler(OPENFILE, move |_, msg| {
        let _ = seen_tx.send(msg);
    });
    let _done = channel.dispatch();

    // Two flagged frames coalesced into one datagram, but only one
    // descriptor travels with it.
    let mut wire = BytesMut::new();
    wire.extend_from_slice(&raw_frame(OPENFILE, b"first", true));
    wire.extend_from_slice(&raw_frame(OPENFILE, b"second", true));
    let file = File::open("/dev/null").unwrap();
    let fd = OwnedFd::from(file);
    raw.send_with_fd(&wire, Some(fd.as_fd())).unwrap();

    let mut first = seen_rx.recv_timeout(WAIT).unwrap();
    assert!(first.has_fd());
    assert!(first.take_fd().is_some());

    let mut second = seen_rx.recv_timeout(WAIT).unwrap();
    assert!(second.has_fd(), "wire flag is preserved");
    assert!(second.take_fd().is_none(), "descriptor was exhausted");
}

#[test]
fn peer_eof_resolves_done_signal() {
    let (raw, sock) = MsgSocket::pair().unwrap();
    let channel = Channel::new("survivor", std::process::id(), sock);
    let done = channel.dispatch();

    drop(raw);

    assert!(matches!(done.wait_timeout(WAIT), Some(Ok(()))));
}

#[test]
fn unknown_message_type_is_fatal() {
    let (raw, sock) = MsgSocket::pair().unwrap();
    let channel = Channel::new("strict", std::process::id(), sock);
    let done = channel.dispatch();

    let wire = raw_frame(0xDEAD, b"??", false);
    raw.send_with_fd(&wire, None).unwrap();

    match done.wait_timeout(WAIT) {
        Some(Err(ChannelError::UnhandledType { msg_type, .. })) => {
            assert_eq!(msg_type, 0xDEAD);
        }
        other => panic!("expected UnhandledType, got {other:?}"),
    }
}

#[test]
fn typed_payload_query_roundtrip() {
    #[derive(serde::Serialize, serde::Deserialize)]
    struct OpenRequest {
        path: String,
        read_only: bool,
    }

    let (parent, child) = channel_pair();

    child.handler(OPENFILE, |channel, msg| {
        let req: OpenRequest = msg.parse().unwrap();
        assert!(req.read_only);
        let _ = channel.reply_typed(&msg, PONG, &format!("opened {}", req.path), None);
    });
    let _child_done = child.dispatch();
    let _parent_done = parent.dispatch();

    let reply = parent
        .query_typed(
            OPENFILE,
            &OpenRequest {
                path: "/etc/passwd".into(),
                read_only: true,
            },
            None,
        )
        .unwrap();
    let text: String = reply.parse().unwrap();
    assert_eq!(text, "opened /etc/passwd");
}

#[test]
fn payload_boundary_roundtrips_and_overflows_reject() {
    let (parent, child) = channel_pair();
    let (len_tx, len_rx) = mpsc::channel();

    child.handler(PING, move |_, msg| {
        let _ = len_tx.send(msg.payload().len());
    });
    let _child_done = child.dispatch();

    parent
        .message(PING, vec![0xA5u8; MAX_PAYLOAD], None)
        .unwrap();
    assert_eq!(len_rx.recv_timeout(WAIT).unwrap(), MAX_PAYLOAD);

    let err = parent
        .message(PING, vec![0xA5u8; MAX_PAYLOAD + 1], None)
        .unwrap_err();
    assert!(matches!(err, ChannelError::Frame(_)));
}
