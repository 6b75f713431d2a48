//! Multiplexed peer session.
//!
//! A [`Session`] owns one upgraded connection and three tasks: a reader that
//! dispatches inbound frames, a writer that drains the outbound frame queue,
//! and a keepalive that pings an idle peer. Each [`PeerStream`] is backed by
//! an in-memory duplex pipe whose far end is pumped by a per-stream task.
//!
//! Flow control is credit based. A sender may have at most
//! [`SessionConfig::initial_window`] unacknowledged bytes in flight per
//! stream; the receiver returns credit with `WindowUpdate` after it has
//! handed the bytes to the stream owner. A peer that overruns the window gets
//! the stream reset.

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf},
    sync::{mpsc, oneshot, Semaphore},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{
    handshake::{Role, Upgraded},
    mux::{Frame, FrameKind, StreamId, MAX_DATA_LEN},
    TransportError,
};
use crate::identity::PeerId;

const OUTBOUND_QUEUE: usize = 256;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Concurrent streams per session, both directions combined.
    pub max_streams: usize,
    /// Per-stream send credit in bytes.
    pub initial_window: u32,
    pub keepalive_interval: Duration,
    /// The session is closed when nothing arrives for this long.
    pub keepalive_timeout: Duration,
    /// Inbound streams waiting to be accepted before new ones are reset.
    pub accept_backlog: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_streams: 256,
            initial_window: 256 * 1024,
            keepalive_interval: Duration::from_secs(15),
            keepalive_timeout: Duration::from_secs(45),
            accept_backlog: 64,
        }
    }
}

/// Where a session's bytes travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPath {
    Direct(Option<SocketAddr>),
    /// Carried inside a circuit through the given relay.
    Relayed(PeerId),
}

struct StreamSlot {
    /// `None` once the remote closed its write side.
    inbound: Option<mpsc::UnboundedSender<Bytes>>,
    credit: Arc<Semaphore>,
    buffered: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

struct Shared {
    remote: PeerId,
    path: SessionPath,
    role: Role,
    config: SessionConfig,
    outbound: mpsc::Sender<Frame>,
    streams: Mutex<HashMap<StreamId, StreamSlot>>,
    next_stream_id: AtomicU32,
    pings: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    next_ping: AtomicU64,
    cancel: CancellationToken,
    opened_at: Instant,
}

/// Handle to a live session. Cloning is cheap; every clone refers to the same
/// connection.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("remote", &self.shared.remote)
            .field("path", &self.shared.path)
            .field("role", &self.shared.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Starts the session tasks. Streams opened by the remote are delivered
    /// on the returned receiver, which ends when the session closes.
    pub fn spawn<T>(
        upgraded: Upgraded<T>,
        path: SessionPath,
        config: SessionConfig,
    ) -> (Session, mpsc::Receiver<PeerStream>)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Upgraded {
            framed,
            remote,
            role,
        } = upgraded;
        let (sink, stream) = framed.split::<Bytes>();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));

        let first_stream_id = match role {
            Role::Initiator => 1,
            Role::Responder => 2,
        };
        let session = Session {
            shared: Arc::new(Shared {
                remote,
                path,
                role,
                config,
                outbound: outbound_tx,
                streams: Mutex::new(HashMap::new()),
                next_stream_id: AtomicU32::new(first_stream_id),
                pings: Mutex::new(HashMap::new()),
                next_ping: AtomicU64::new(1),
                cancel: CancellationToken::new(),
                opened_at: Instant::now(),
            }),
        };

        tokio::spawn(write_frames(
            sink,
            outbound_rx,
            session.shared.cancel.clone(),
        ));
        tokio::spawn(session.clone().read_frames(stream, accept_tx));
        tokio::spawn(session.clone().keepalive());

        (session, accept_rx)
    }

    pub fn remote_peer(&self) -> PeerId {
        self.shared.remote
    }

    pub fn path(&self) -> SessionPath {
        self.shared.path
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        match self.shared.path {
            SessionPath::Direct(addr) => addr,
            SessionPath::Relayed(_) => None,
        }
    }

    pub fn is_relayed(&self) -> bool {
        matches!(self.shared.path, SessionPath::Relayed(_))
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn age(&self) -> Duration {
        self.shared.opened_at.elapsed()
    }

    pub fn stream_count(&self) -> usize {
        self.shared.streams.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Resolves once the session has closed.
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await
    }

    /// Tells the remote we are leaving and tears down every stream.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        let _ = self.shared.outbound.try_send(Frame::go_away());
        self.shared.cancel.cancel();
    }

    /// Whether both handles refer to the same connection.
    pub fn same_as(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Opens a new stream speaking `protocol`.
    pub async fn open_stream(&self, protocol: &str) -> Result<PeerStream, TransportError> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        if self.stream_count() >= self.shared.config.max_streams {
            return Err(TransportError::StreamLimit);
        }
        let id = self.shared.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let (stream, pump) = self.register_stream(id, protocol);

        // The open frame must precede any data the pump sends.
        if self
            .shared
            .outbound
            .send(Frame::open(id, protocol))
            .await
            .is_err()
        {
            self.shared.streams.lock().remove(&id);
            return Err(TransportError::SessionClosed);
        }
        tokio::spawn(pump.run());
        trace!(peer = %self.shared.remote, stream = id, protocol, "opened stream");
        Ok(stream)
    }

    /// Measures the round trip to the remote.
    pub async fn ping(&self) -> Result<Duration, TransportError> {
        let nonce = self.shared.next_ping.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pings.lock().insert(nonce, tx);

        let start = Instant::now();
        if self.shared.outbound.send(Frame::ping(nonce)).await.is_err() {
            self.shared.pings.lock().remove(&nonce);
            return Err(TransportError::SessionClosed);
        }
        match tokio::time::timeout(self.shared.config.keepalive_timeout, rx).await {
            Ok(Ok(())) => Ok(start.elapsed()),
            Ok(Err(_)) => Err(TransportError::SessionClosed),
            Err(_) => {
                self.shared.pings.lock().remove(&nonce);
                Err(TransportError::Timeout("ping"))
            }
        }
    }

    fn register_stream(&self, id: StreamId, protocol: &str) -> (PeerStream, StreamPump) {
        let window = self.shared.config.initial_window;
        let (user, pumped) = tokio::io::duplex(MAX_DATA_LEN * 4);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let credit = Arc::new(Semaphore::new(window as usize));
        let buffered = Arc::new(AtomicUsize::new(0));
        let cancel = self.shared.cancel.child_token();

        self.shared.streams.lock().insert(
            id,
            StreamSlot {
                inbound: Some(inbound_tx),
                credit: credit.clone(),
                buffered: buffered.clone(),
                cancel: cancel.clone(),
            },
        );

        let stream = PeerStream {
            id,
            protocol: protocol.to_string(),
            remote: self.shared.remote,
            remote_addr: self.remote_addr(),
            io: user,
        };
        let pump = StreamPump {
            session: self.clone(),
            id,
            io: pumped,
            inbound: inbound_rx,
            credit,
            buffered,
            cancel,
            chunk: MAX_DATA_LEN.min(window as usize).max(1),
        };
        (stream, pump)
    }

    /// Queues a control frame from a synchronous context.
    fn send_control(&self, frame: Frame) {
        match self.shared.outbound.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                let outbound = self.shared.outbound.clone();
                tokio::spawn(async move {
                    let _ = outbound.send(frame).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn reset_stream(&self, id: StreamId, notify_remote: bool) {
        if let Some(slot) = self.shared.streams.lock().remove(&id) {
            slot.cancel.cancel();
        }
        if notify_remote {
            self.send_control(Frame::reset(id));
        }
    }

    fn is_remote_stream_id(&self, id: StreamId) -> bool {
        let ours_odd = self.shared.role == Role::Initiator;
        id != 0 && (id % 2 == 1) != ours_odd
    }

    async fn read_frames<S>(self, mut stream: S, accept: mpsc::Sender<PeerStream>)
    where
        S: Stream<Item = Result<Bytes, TransportError>> + Unpin,
    {
        let timeout = self.shared.config.keepalive_timeout;
        let result = loop {
            let next = tokio::select! {
                _ = self.shared.cancel.cancelled() => break Ok(()),
                next = tokio::time::timeout(timeout, stream.next()) => next,
            };
            let bytes = match next {
                Err(_) => break Err(TransportError::Timeout("keepalive")),
                Ok(None) => break Ok(()),
                Ok(Some(Err(err))) => break Err(err),
                Ok(Some(Ok(bytes))) => bytes,
            };
            let frame = match Frame::decode(bytes) {
                Ok(frame) => frame,
                Err(err) => break Err(err),
            };
            if frame.kind == FrameKind::GoAway {
                debug!(peer = %self.shared.remote, "remote is going away");
                break Ok(());
            }
            if let Err(err) = self.dispatch(frame, &accept) {
                break Err(err);
            }
        };

        match result {
            Ok(()) => debug!(peer = %self.shared.remote, "session closed"),
            Err(err) => warn!(peer = %self.shared.remote, %err, "session failed"),
        }
        self.shared.cancel.cancel();
        self.shared.streams.lock().clear();
        self.shared.pings.lock().clear();
    }

    fn dispatch(
        &self,
        frame: Frame,
        accept: &mpsc::Sender<PeerStream>,
    ) -> Result<(), TransportError> {
        let id = frame.stream_id;
        match frame.kind {
            FrameKind::Open => {
                if !self.is_remote_stream_id(id) {
                    return Err(TransportError::protocol(format!(
                        "remote opened stream {id} with our parity"
                    )));
                }
                if self.shared.streams.lock().contains_key(&id) {
                    return Err(TransportError::protocol(format!(
                        "stream {id} opened twice"
                    )));
                }
                if self.stream_count() >= self.shared.config.max_streams {
                    debug!(
                        peer = %self.shared.remote,
                        stream = id,
                        "stream limit reached, resetting"
                    );
                    self.send_control(Frame::reset(id));
                    return Ok(());
                }
                let protocol = frame.protocol()?.to_string();
                let (stream, pump) = self.register_stream(id, &protocol);
                tokio::spawn(pump.run());
                if accept.try_send(stream).is_err() {
                    debug!(
                        peer = %self.shared.remote,
                        stream = id,
                        %protocol,
                        "accept backlog full, resetting"
                    );
                    self.reset_stream(id, true);
                }
            }
            FrameKind::Data => {
                let streams = self.shared.streams.lock();
                let Some(slot) = streams.get(&id) else {
                    return Ok(());
                };
                let len = frame.payload.len();
                let buffered = slot.buffered.fetch_add(len, Ordering::AcqRel) + len;
                let inbound = slot.inbound.clone();
                drop(streams);

                if buffered > self.shared.config.initial_window as usize {
                    warn!(peer = %self.shared.remote, stream = id, "peer overran stream window");
                    self.reset_stream(id, true);
                    return Ok(());
                }
                match inbound {
                    Some(inbound) => {
                        let _ = inbound.send(frame.payload);
                    }
                    None => {
                        self.reset_stream(id, true);
                    }
                }
            }
            FrameKind::Close => {
                if let Some(slot) = self.shared.streams.lock().get_mut(&id) {
                    slot.inbound = None;
                }
            }
            FrameKind::Reset => {
                self.reset_stream(id, false);
            }
            FrameKind::WindowUpdate => {
                let increment = frame.increment() as usize;
                let credit = match self.shared.streams.lock().get(&id) {
                    Some(slot) => slot.credit.clone(),
                    None => return Ok(()),
                };
                let window = self.shared.config.initial_window as usize;
                if credit.available_permits() + increment > window {
                    warn!(
                        peer = %self.shared.remote,
                        stream = id,
                        "window update beyond initial window"
                    );
                    self.reset_stream(id, true);
                } else {
                    credit.add_permits(increment);
                }
            }
            FrameKind::Ping => {
                let _ = self.shared.outbound.try_send(Frame::pong(frame.nonce()));
            }
            FrameKind::Pong => {
                if let Some(waiter) = self.shared.pings.lock().remove(&frame.nonce()) {
                    let _ = waiter.send(());
                }
            }
            FrameKind::GoAway => {}
        }
        Ok(())
    }

    async fn keepalive(self) {
        let period = self.shared.config.keepalive_interval.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let nonce = self.shared.next_ping.fetch_add(1, Ordering::Relaxed);
                    if self.shared.outbound.send(Frame::ping(nonce)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

async fn write_frames<S>(mut sink: S, mut frames: mpsc::Receiver<Frame>, cancel: CancellationToken)
where
    S: Sink<Bytes, Error = TransportError> + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let sent = tokio::select! {
            biased;
            sent = sink.send(frame.encode()) => sent,
            _ = cancel.cancelled() => break,
        };
        if let Err(err) = sent {
            debug!(%err, "session write failed");
            break;
        }
    }
    cancel.cancel();

    // Flush whatever was queued before the close, e.g. a GoAway.
    let drain = async {
        while let Ok(frame) = frames.try_recv() {
            if sink.feed(frame.encode()).await.is_err() {
                return;
            }
        }
        let _ = sink.close().await;
    };
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, drain).await;
}

/// Moves bytes between a stream's duplex pipe and the session.
struct StreamPump {
    session: Session,
    id: StreamId,
    io: DuplexStream,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    credit: Arc<Semaphore>,
    buffered: Arc<AtomicUsize>,
    cancel: CancellationToken,
    chunk: usize,
}

impl StreamPump {
    async fn run(self) {
        let StreamPump {
            session,
            id,
            io,
            mut inbound,
            credit,
            buffered,
            cancel,
            chunk,
        } = self;
        let outbound = session.shared.outbound.clone();
        let (mut reader, mut writer) = tokio::io::split(io);

        let send_half = async {
            let mut buf = vec![0u8; chunk];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    outbound
                        .send(Frame::close(id))
                        .await
                        .map_err(|_| broken_pipe())?;
                    return Ok::<_, std::io::Error>(());
                }
                credit
                    .acquire_many(n as u32)
                    .await
                    .map_err(|_| broken_pipe())?
                    .forget();
                outbound
                    .send(Frame::data(id, Bytes::copy_from_slice(&buf[..n])))
                    .await
                    .map_err(|_| broken_pipe())?;
            }
        };

        let recv_half = async {
            while let Some(data) = inbound.recv().await {
                let len = data.len();
                writer.write_all(&data).await?;
                buffered.fetch_sub(len, Ordering::AcqRel);
                outbound
                    .send(Frame::window_update(id, len as u32))
                    .await
                    .map_err(|_| broken_pipe())?;
            }
            writer.shutdown().await
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            result = async { tokio::try_join!(send_half, recv_half) } => result.map(|_| ()),
        };

        let was_cancelled = cancel.is_cancelled();
        cancel.cancel();
        session.shared.streams.lock().remove(&id);
        if let Err(err) = result {
            if !was_cancelled {
                trace!(stream = id, %err, "stream aborted");
                let _ = outbound.try_send(Frame::reset(id));
            }
        }
    }
}

fn broken_pipe() -> std::io::Error {
    std::io::Error::from(std::io::ErrorKind::BrokenPipe)
}

/// One multiplexed stream. Reads yield what the remote wrote; shutting down
/// the write side sends a half-close, dropping the stream resets it if the
/// remote is still sending.
pub struct PeerStream {
    id: StreamId,
    protocol: String,
    remote: PeerId,
    remote_addr: Option<SocketAddr>,
    io: DuplexStream,
}

impl PeerStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote
    }

    /// Socket address of the remote as seen by this node, when the session
    /// is direct.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

impl fmt::Debug for PeerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerStream")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("remote", &self.remote)
            .finish()
    }
}

impl AsyncRead for PeerStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for PeerStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}
