use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use fdmsg_frame::{FrameError, MAX_PAYLOAD};
use fdmsg_transport::MsgSocket;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ChannelError, Result};
use crate::message::Message;
use crate::{reader, writer};

/// Default kernel receive buffer handed to each `recvmsg` call.
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

type Handler = Arc<dyn Fn(&Channel, Message) + Send + Sync>;

/// Configuration for a channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Size of the receive buffer supplied to `recvmsg`. Default: 64 KiB,
    /// large enough for any single frame.
    pub recv_buffer_size: usize,
    /// Outbound queue bound. `None` (the default) keeps the queue
    /// unbounded; `Some(n)` makes producers block once `n` messages are
    /// waiting on the writer.
    pub outbound_capacity: Option<usize>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: RECV_BUFFER_SIZE,
            outbound_capacity: None,
        }
    }
}

#[derive(Clone)]
enum OutboundSender {
    Unbounded(mpsc::Sender<Message>),
    Bounded(SyncSender<Message>),
}

impl OutboundSender {
    fn send(&self, msg: Message) -> std::result::Result<(), mpsc::SendError<Message>> {
        match self {
            Self::Unbounded(tx) => tx.send(msg),
            Self::Bounded(tx) => tx.send(msg),
        }
    }
}

/// Reply slots for outstanding queries. Once `closed`, no further slot
/// can be registered and every waiter has been woken with Disconnected.
#[derive(Default)]
struct QueryMap {
    closed: bool,
    slots: HashMap<Uuid, SyncSender<Message>>,
}

/// State shared by the channel handles and the writer/reader threads.
pub(crate) struct Inner {
    pub(crate) name: String,
    pub(crate) peer_pid: u32,
    pub(crate) pid: u32,
    pub(crate) socket: MsgSocket,
    queries: Mutex<QueryMap>,
    handlers: Mutex<HashMap<u32, Handler>>,
    inbound: Mutex<Option<Receiver<Message>>>,
    fault: Mutex<Option<ChannelError>>,
}

impl Inner {
    /// Record the channel's first fault and shut the socket down so the
    /// other loops unblock and wind down.
    pub(crate) fn fail(&self, err: ChannelError) {
        let mut fault = self.fault.lock();
        if fault.is_none() {
            warn!(channel = %self.name, error = %err, "channel fault");
            *fault = Some(err);
        }
        drop(fault);
        self.close_queries();
        let _ = self.socket.shutdown();
    }

    /// Refuse new reply slots and wake every pending waiter by dropping
    /// its slot.
    fn close_queries(&self) {
        let mut queries = self.queries.lock();
        queries.closed = true;
        queries.slots.clear();
    }
}

/// One end of a bidirectional message channel.
///
/// Cheap to clone; all clones share the same underlying socket, queues,
/// and maps. The channel runs until the peer closes its end, a fatal
/// error occurs, or every handle (including the dispatcher's) is
/// dropped — at which point queued messages are flushed and the socket
/// is shut down.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
    outbound: OutboundSender,
}

impl Channel {
    /// Construct a channel around an already-connected endpoint and spawn
    /// its writer and reader threads.
    ///
    /// `peer_pid` is the peer's process id, used to stamp the
    /// informational header fields; `name` appears only in diagnostics.
    pub fn new(name: impl Into<String>, peer_pid: u32, socket: MsgSocket) -> Channel {
        Self::with_config(name, peer_pid, socket, ChannelConfig::default())
    }

    /// Construct a channel with explicit configuration.
    pub fn with_config(
        name: impl Into<String>,
        peer_pid: u32,
        socket: MsgSocket,
        config: ChannelConfig,
    ) -> Channel {
        let name = name.into();
        let (outbound, writer_rx) = match config.outbound_capacity {
            Some(bound) => {
                let (tx, rx) = mpsc::sync_channel(bound);
                (OutboundSender::Bounded(tx), rx)
            }
            None => {
                let (tx, rx) = mpsc::channel();
                (OutboundSender::Unbounded(tx), rx)
            }
        };
        let (inbound_tx, inbound_rx) = mpsc::channel();

        let inner = Arc::new(Inner {
            name,
            peer_pid,
            pid: std::process::id(),
            socket,
            queries: Mutex::new(QueryMap::default()),
            handlers: Mutex::new(HashMap::new()),
            inbound: Mutex::new(Some(inbound_rx)),
            fault: Mutex::new(None),
        });

        debug!(channel = %inner.name, peer_pid, "channel starting");

        {
            let inner = Arc::clone(&inner);
            thread::spawn(move || writer::run(inner, writer_rx));
        }
        {
            let inner = Arc::clone(&inner);
            let recv_buffer_size = config.recv_buffer_size;
            thread::spawn(move || reader::run(inner, inbound_tx, recv_buffer_size));
        }

        Channel { inner, outbound }
    }

    /// The channel's diagnostic name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The peer process id this channel was constructed with.
    pub fn peer_pid(&self) -> u32 {
        self.inner.peer_pid
    }

    /// Register `handler` for unsolicited messages of `msg_type`.
    ///
    /// Replacing an existing registration is permitted; the last writer
    /// wins. Handlers run on the dispatcher thread, one at a time, in
    /// arrival order.
    pub fn handler<F>(&self, msg_type: u32, handler: F)
    where
        F: Fn(&Channel, Message) + Send + Sync + 'static,
    {
        self.inner.handlers.lock().insert(msg_type, Arc::new(handler));
    }

    /// Enqueue an unsolicited message with a fresh id.
    ///
    /// Passing a descriptor transfers ownership to the channel; the
    /// writer closes it once the frame is on the wire.
    pub fn message(
        &self,
        msg_type: u32,
        payload: impl Into<Bytes>,
        fd: Option<OwnedFd>,
    ) -> Result<()> {
        self.enqueue(Message::new(msg_type, payload, fd))
    }

    /// Enqueue a message and block until the correlated reply arrives.
    ///
    /// The reply is matched by message id, so unrelated inbound traffic
    /// may be dispatched while the query is pending. Returns
    /// [`ChannelError::Disconnected`] if the channel dies first.
    ///
    /// Must not be called from inside a handler: the reply can only be
    /// delivered by the dispatcher the handler is running on. Handlers
    /// that need to initiate a round-trip should send with
    /// [`message`](Self::message) and register a handler for the reply
    /// type.
    pub fn query(
        &self,
        msg_type: u32,
        payload: impl Into<Bytes>,
        fd: Option<OwnedFd>,
    ) -> Result<Message> {
        let msg = Message::new(msg_type, payload, fd);
        let id = msg.id();
        let (slot_tx, slot_rx) = mpsc::sync_channel(1);
        {
            let mut queries = self.inner.queries.lock();
            if queries.closed {
                return Err(ChannelError::Disconnected);
            }
            queries.slots.insert(id, slot_tx);
        }

        if let Err(err) = self.enqueue(msg) {
            self.inner.queries.lock().slots.remove(&id);
            return Err(err);
        }

        slot_rx.recv().map_err(|_| ChannelError::Disconnected)
    }

    /// Enqueue a reply to `inbound`: a new message whose id is copied
    /// from the originating query.
    pub fn reply(
        &self,
        inbound: &Message,
        msg_type: u32,
        payload: impl Into<Bytes>,
        fd: Option<OwnedFd>,
    ) -> Result<()> {
        self.enqueue(Message::reply_to(inbound, msg_type, payload, fd))
    }

    /// [`message`](Self::message) with a JSON-serialized payload.
    pub fn message_typed<T: Serialize>(
        &self,
        msg_type: u32,
        value: &T,
        fd: Option<OwnedFd>,
    ) -> Result<()> {
        self.message(msg_type, serde_json::to_vec(value)?, fd)
    }

    /// [`query`](Self::query) with a JSON-serialized payload.
    pub fn query_typed<T: Serialize>(
        &self,
        msg_type: u32,
        value: &T,
        fd: Option<OwnedFd>,
    ) -> Result<Message> {
        self.query(msg_type, serde_json::to_vec(value)?, fd)
    }

    /// [`reply`](Self::reply) with a JSON-serialized payload.
    pub fn reply_typed<T: Serialize>(
        &self,
        inbound: &Message,
        msg_type: u32,
        value: &T,
        fd: Option<OwnedFd>,
    ) -> Result<()> {
        self.reply(inbound, msg_type, serde_json::to_vec(value)?, fd)
    }

    /// Start the dispatcher and obtain the channel's end-of-life signal.
    ///
    /// The dispatcher consumes inbound messages in arrival order,
    /// resolving queries by id and invoking registered handlers by type.
    /// A message that matches neither is fatal. The returned [`Done`]
    /// resolves with `Ok(())` on clean peer EOF or `Err` carrying the
    /// first recorded fault.
    pub fn dispatch(&self) -> Done {
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        match self.inner.inbound.lock().take() {
            Some(inbound) => {
                let channel = self.clone();
                thread::spawn(move || dispatch_loop(channel, inbound, done_tx));
            }
            None => {
                let _ = done_tx.send(Err(ChannelError::AlreadyDispatched));
            }
        }
        Done { rx: done_rx }
    }

    /// Shut down the underlying socket in both directions.
    ///
    /// Both sides observe EOF: the local and remote dispatchers complete
    /// with `Ok(())`. Outbound messages still queued may be lost.
    pub fn shutdown(&self) -> Result<()> {
        debug!(channel = %self.inner.name, "local shutdown");
        self.inner.socket.shutdown().map_err(ChannelError::from)
    }

    fn enqueue(&self, msg: Message) -> Result<()> {
        if msg.payload.len() > MAX_PAYLOAD {
            return Err(ChannelError::Frame(FrameError::PayloadTooLarge {
                size: msg.payload.len(),
                max: MAX_PAYLOAD,
            }));
        }
        self.outbound
            .send(msg)
            .map_err(|_| ChannelError::Disconnected)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("peer_pid", &self.inner.peer_pid)
            .finish()
    }
}

fn dispatch_loop(
    channel: Channel,
    inbound: Receiver<Message>,
    done: SyncSender<Result<()>>,
) {
    for msg in inbound.iter() {
        let slot = channel.inner.queries.lock().slots.remove(&msg.id());
        if let Some(slot) = slot {
            // The waiter may have given up; the message (and any
            // descriptor) is dropped in that case.
            let _ = slot.send(msg);
            continue;
        }

        let handler = channel.inner.handlers.lock().get(&msg.msg_type()).cloned();
        match handler {
            Some(handler) => handler(&channel, msg),
            None => {
                channel.inner.fail(ChannelError::UnhandledType {
                    channel: channel.inner.name.clone(),
                    msg_type: msg.msg_type(),
                });
                break;
            }
        }
    }

    // Resolve pending queries: dropping the slots wakes their waiters
    // with Disconnected.
    channel.inner.close_queries();

    let outcome = match channel.inner.fault.lock().take() {
        Some(err) => Err(err),
        None => Ok(()),
    };
    debug!(channel = %channel.inner.name, ok = outcome.is_ok(), "dispatcher done");
    let _ = done.send(outcome);
}

/// End-of-life signal for a channel, obtained from [`Channel::dispatch`].
#[derive(Debug)]
pub struct Done {
    rx: Receiver<Result<()>>,
}

impl Done {
    /// Block until the channel ends. `Ok(())` means the peer closed its
    /// end; `Err` carries the channel's first fault.
    pub fn wait(self) -> Result<()> {
        self.rx.recv().unwrap_or(Err(ChannelError::Disconnected))
    }

    /// Like [`wait`](Self::wait), bounded by `timeout`. Returns `None`
    /// when the channel is still alive.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        self.rx.recv_timeout(timeout).ok()
    }
}
