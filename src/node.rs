//! The overlay node.
//!
//! A [`Node`] owns the local identity, listens for and dials peer
//! connections, keeps the table of live sessions, and routes every inbound
//! stream to the service registered for its protocol with [`Node::accept`].
//! Services (identify, dial-back, exit, relay, peer exchange) are plain tasks
//! reading from those receivers.

pub mod identify;

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc, OwnedSemaphorePermit, Semaphore},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    config::Config,
    identity::{Keypair, PeerId},
    membrane::PreSharedKey,
    nat::NatStatus,
    relay,
    routing::{registry::RegistryConfig, PeerRecord, PeerRegistry, Roles},
    transport::{
        self, session::SessionPath, PeerAddr, PeerStream, Role, Session, SessionConfig,
        TransportError, Upgraded,
    },
    Error,
};

const HANDLER_BACKLOG: usize = 64;
const EVENT_CAPACITY: usize = 256;
/// Pause after a failed `accept`, which usually means descriptors ran out.
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Waits out [`ACCEPT_BACKOFF`]. Returns false when shutdown came first.
pub(crate) async fn accept_backoff(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}

/// Session lifecycle notifications. `Connected` fires for the first live
/// session to a peer and `Disconnected` when its last one ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Connected { peer: PeerId, relayed: bool },
    Disconnected { peer: PeerId },
    Identified { peer: PeerId },
}

#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Inbound connections held at once.
    pub max_connections: usize,
    pub session: SessionConfig,
    pub registry: RegistryConfig,
    pub region: Option<String>,
    pub external_addrs: Vec<String>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            max_connections: 256,
            session: SessionConfig::default(),
            registry: RegistryConfig::default(),
            region: None,
            external_addrs: Vec::new(),
        }
    }
}

impl NodeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dial_timeout: config.network.dial_timeout(),
            handshake_timeout: config.network.handshake_timeout(),
            max_connections: config.network.max_connections,
            session: config.network.session(),
            registry: config.discovery.registry(),
            region: config.network.region.clone(),
            external_addrs: config.network.external_addrs.clone(),
        }
    }
}

/// Something to dial: an address, optionally pinned to the peer expected
/// behind it. Parses `host:port`, `<peer-id>@host:port` and relayed
/// addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialTarget {
    pub peer: Option<PeerId>,
    pub addr: PeerAddr,
}

impl DialTarget {
    pub fn new(peer: Option<PeerId>, addr: PeerAddr) -> Self {
        Self { peer, addr }
    }
}

impl FromStr for DialTarget {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: PeerAddr = match s.split_once('@') {
            Some((peer, rest)) if !s.contains("/circuit/") => {
                let peer = peer
                    .parse()
                    .map_err(|_| TransportError::protocol(format!("bad peer id in {s}")))?;
                return Ok(DialTarget {
                    peer: Some(peer),
                    addr: rest.parse()?,
                });
            }
            _ => s.parse()?,
        };
        let peer = match &addr {
            PeerAddr::Relayed { target, .. } => Some(*target),
            PeerAddr::Direct(_) => None,
        };
        Ok(DialTarget { peer, addr })
    }
}

impl fmt::Display for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.peer, &self.addr) {
            (Some(peer), PeerAddr::Direct(addr)) => write!(f, "{peer}@{addr}"),
            (_, addr) => write!(f, "{addr}"),
        }
    }
}

struct NodeInner {
    identity: Keypair,
    psk: Option<PreSharedKey>,
    settings: NodeSettings,
    sessions: RwLock<HashMap<PeerId, Vec<Session>>>,
    handlers: RwLock<HashMap<String, mpsc::Sender<PeerStream>>>,
    registry: PeerRegistry,
    nat: NatStatus,
    roles: RwLock<Roles>,
    listen_addrs: RwLock<Vec<SocketAddr>>,
    relayed_addrs: RwLock<Vec<PeerAddr>>,
    events: broadcast::Sender<NodeEvent>,
    dial_locks: Mutex<HashMap<PeerId, Arc<tokio::sync::Mutex<()>>>>,
    connections: Arc<Semaphore>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("peer_id", &self.peer_id())
            .field("sessions", &self.inner.sessions.read().len())
            .finish()
    }
}

impl Node {
    /// Creates the node and starts the identify and dial-back responders.
    /// Must be called inside a tokio runtime.
    pub fn start(settings: NodeSettings, identity: Keypair, psk: Option<PreSharedKey>) -> Node {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let node = Node {
            inner: Arc::new(NodeInner {
                identity,
                psk,
                registry: PeerRegistry::new(settings.registry.clone()),
                connections: Arc::new(Semaphore::new(settings.max_connections.max(1))),
                settings,
                sessions: RwLock::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                nat: NatStatus::new(),
                roles: RwLock::new(Roles::default()),
                listen_addrs: RwLock::new(Vec::new()),
                relayed_addrs: RwLock::new(Vec::new()),
                events,
                dial_locks: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        };
        match node.psk() {
            Some(psk) => info!(
                peer_id = %node.peer_id(),
                network = %psk.fingerprint(),
                "node started"
            ),
            None => info!(peer_id = %node.peer_id(), "node started on the open network"),
        }
        identify::serve(node.clone());
        crate::nat::serve(node.clone());
        node
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.identity.peer_id()
    }

    pub fn identity(&self) -> &Keypair {
        &self.inner.identity
    }

    pub fn psk(&self) -> Option<&PreSharedKey> {
        self.inner.psk.as_ref()
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.inner.registry
    }

    pub fn nat(&self) -> &NatStatus {
        &self.inner.nat
    }

    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.inner.listen_addrs.read().clone()
    }

    pub fn roles(&self) -> Roles {
        *self.inner.roles.read()
    }

    pub fn set_roles(&self, update: impl FnOnce(&mut Roles)) {
        update(&mut *self.inner.roles.write());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: NodeEvent) {
        let _ = self.inner.events.send(event);
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stops every task and closes every session.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let sessions: Vec<Session> = self
            .inner
            .sessions
            .read()
            .values()
            .flatten()
            .cloned()
            .collect();
        for session in sessions {
            session.close();
        }
    }

    /// Registers the service for `protocol`. Inbound streams beyond the
    /// receiver's backlog are reset.
    pub fn accept(&self, protocol: &str) -> mpsc::Receiver<PeerStream> {
        let (tx, rx) = mpsc::channel(HANDLER_BACKLOG);
        if self
            .inner
            .handlers
            .write()
            .insert(protocol.to_string(), tx)
            .is_some()
        {
            debug!(protocol, "replaced stream handler");
        }
        rx
    }

    /// What this node tells other peers about itself.
    pub fn local_record(&self) -> PeerRecord {
        let mut addrs: Vec<PeerAddr> = self
            .inner
            .settings
            .external_addrs
            .iter()
            .filter_map(|addr| addr.parse().ok())
            .collect();
        let confirmed = self.inner.nat.confirmed_addrs();
        let listening = self
            .listen_addrs()
            .into_iter()
            .filter(|addr| !addr.ip().is_unspecified());
        for addr in confirmed.into_iter().chain(listening) {
            addrs.push(PeerAddr::Direct(addr.to_string()));
        }
        addrs.extend(self.inner.relayed_addrs.read().iter().cloned());

        let mut unique = Vec::with_capacity(addrs.len());
        for addr in addrs {
            if !unique.contains(&addr) {
                unique.push(addr);
            }
        }
        PeerRecord {
            peer_id: self.peer_id(),
            addrs: unique,
            roles: self.roles(),
            region: self.inner.settings.region.clone(),
        }
    }

    pub(crate) fn add_relayed_addr(&self, addr: PeerAddr) {
        let mut relayed = self.inner.relayed_addrs.write();
        if !relayed.contains(&addr) {
            relayed.push(addr);
        }
    }

    pub(crate) fn remove_relayed_addrs_via(&self, relay: &PeerId) {
        self.inner
            .relayed_addrs
            .write()
            .retain(|addr| !matches!(addr, PeerAddr::Relayed { relay: r, .. } if r == relay));
    }

    /// Closes every session carried through circuits of `relay`.
    pub(crate) fn close_sessions_via(&self, relay: &PeerId) {
        let doomed: Vec<Session> = self
            .inner
            .sessions
            .read()
            .values()
            .flatten()
            .filter(|session| session.path() == SessionPath::Relayed(*relay))
            .cloned()
            .collect();
        for session in doomed {
            debug!(peer = %session.remote_peer(), %relay, "closing relayed session");
            session.close();
        }
    }

    /// Live session to `peer`, direct ones first.
    pub fn session(&self, peer: &PeerId) -> Option<Session> {
        let sessions = self.inner.sessions.read();
        let live = sessions.get(peer)?;
        live.iter()
            .filter(|session| !session.is_closed())
            .min_by_key(|session| session.is_relayed())
            .cloned()
    }

    /// One live session per connected peer.
    pub fn sessions(&self) -> Vec<Session> {
        let peers: Vec<PeerId> = self.inner.sessions.read().keys().copied().collect();
        peers.iter().filter_map(|peer| self.session(peer)).collect()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.session(peer).is_some()
    }

    /// Binds a peer listener and serves it until shutdown. Returns the bound
    /// address.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, Error> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        self.inner.listen_addrs.write().push(local);
        info!(%local, "listening for peers");
        tokio::spawn(self.clone().accept_loop(listener));
        Ok(local)
    }

    async fn accept_loop(self, listener: TcpListener) {
        let shutdown = self.shutdown_token();
        loop {
            let (socket, remote) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(%err, "accept failed");
                        if accept_backoff(&shutdown).await {
                            continue;
                        }
                        break;
                    }
                },
            };
            let permit = match self.inner.connections.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(%remote, "connection limit reached, dropping inbound connection");
                    continue;
                }
            };
            let node = self.clone();
            let span = info_span!("inbound", %remote);
            tokio::spawn(
                async move {
                    if let Err(err) = node.accept_connection(socket, remote, permit).await {
                        debug!(%err, "inbound connection failed");
                    }
                }
                .instrument(span),
            );
        }
    }

    async fn accept_connection(
        &self,
        socket: TcpStream,
        remote: SocketAddr,
        _permit: OwnedSemaphorePermit,
    ) -> Result<(), Error> {
        socket.set_nodelay(true)?;
        let upgraded = self.handshake(socket, Role::Responder, None).await?;
        let session = self.attach(upgraded, SessionPath::Direct(Some(remote)));
        session.closed().await;
        Ok(())
    }

    /// Runs the membrane handshake over `io` within the handshake timeout.
    pub(crate) async fn handshake<T>(
        &self,
        io: T,
        role: Role,
        expected: Option<PeerId>,
    ) -> Result<Upgraded<T>, TransportError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let upgrade = transport::upgrade(io, role, &self.inner.identity, self.psk(), expected);
        match tokio::time::timeout(self.inner.settings.handshake_timeout, upgrade).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout("handshake")),
        }
    }

    /// Adds an upgraded connection to the session table and starts serving
    /// its inbound streams.
    pub(crate) fn attach<T>(&self, upgraded: Upgraded<T>, path: SessionPath) -> Session
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (session, incoming) =
            Session::spawn(upgraded, path, self.inner.settings.session.clone());
        let peer = session.remote_peer();
        let first = {
            let mut sessions = self.inner.sessions.write();
            let live = sessions.entry(peer).or_default();
            live.retain(|existing| !existing.is_closed());
            live.push(session.clone());
            live.len() == 1
        };
        self.inner.registry.mark_seen(&peer);
        info!(peer = %peer, ?path, "session established");
        if first {
            self.emit(NodeEvent::Connected {
                peer,
                relayed: session.is_relayed(),
            });
        }
        tokio::spawn(self.clone().serve_session(session.clone(), incoming));
        tokio::spawn(identify::exchange(self.clone(), session.clone()));
        session
    }

    async fn serve_session(self, session: Session, mut incoming: mpsc::Receiver<PeerStream>) {
        let shutdown = self.shutdown_token();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    session.close();
                    break;
                }
                stream = incoming.recv() => match stream {
                    Some(stream) => self.route_stream(stream),
                    None => break,
                },
            }
        }
        session.closed().await;
        self.detach(&session);
    }

    fn route_stream(&self, stream: PeerStream) {
        let handler = self.inner.handlers.read().get(stream.protocol()).cloned();
        match handler {
            Some(handler) => {
                if let Err(err) = handler.try_send(stream) {
                    let stream = err.into_inner();
                    debug!(
                        protocol = stream.protocol(),
                        peer = %stream.remote_peer(),
                        "handler busy, resetting stream"
                    );
                }
            }
            None => debug!(
                protocol = stream.protocol(),
                peer = %stream.remote_peer(),
                "no handler for protocol"
            ),
        }
    }

    fn detach(&self, session: &Session) {
        let peer = session.remote_peer();
        let gone = {
            let mut sessions = self.inner.sessions.write();
            match sessions.get_mut(&peer) {
                Some(live) => {
                    live.retain(|existing| !existing.same_as(session) && !existing.is_closed());
                    if live.is_empty() {
                        sessions.remove(&peer);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        info!(peer = %peer, "session closed");
        if gone {
            self.emit(NodeEvent::Disconnected { peer });
        }
    }

    /// Dials `target` and returns the new session.
    pub async fn dial(&self, target: &DialTarget) -> Result<Session, Error> {
        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }
        if target.peer == Some(self.peer_id()) {
            return Err(Error::NoAddress(self.peer_id()));
        }
        match &target.addr {
            PeerAddr::Direct(addr) => self.dial_direct(addr, target.peer).await,
            PeerAddr::Relayed {
                relay,
                relay_addr,
                target: destination,
            } => {
                if let Some(expected) = target.peer {
                    if expected != *destination {
                        return Err(TransportError::PeerIdMismatch {
                            expected,
                            actual: *destination,
                        }
                        .into());
                    }
                }
                let relay_session = match self.session(relay).filter(|s| !s.is_relayed()) {
                    Some(session) => session,
                    None => self.dial_direct(relay_addr, Some(*relay)).await?,
                };
                let circuit = relay::client::open_circuit(
                    &relay_session,
                    *destination,
                    self.inner.settings.dial_timeout,
                )
                .await?;
                let upgraded = self
                    .handshake(circuit, Role::Initiator, Some(*destination))
                    .await?;
                Ok(self.attach(upgraded, SessionPath::Relayed(*relay)))
            }
        }
    }

    async fn dial_direct(&self, addr: &str, expected: Option<PeerId>) -> Result<Session, Error> {
        let socket = tokio::time::timeout(
            self.inner.settings.dial_timeout,
            TcpStream::connect(addr),
        )
        .await
        .map_err(|_| TransportError::Timeout("dial"))??;
        socket.set_nodelay(true)?;
        let remote = socket.peer_addr().ok();
        let upgraded = self.handshake(socket, Role::Initiator, expected).await?;
        Ok(self.attach(upgraded, SessionPath::Direct(remote)))
    }

    /// Returns a live session to `peer`, dialing its known addresses (direct
    /// before relayed) when there is none. Concurrent calls for the same
    /// peer share one dial.
    pub async fn connect(&self, peer: PeerId) -> Result<Session, Error> {
        if let Some(session) = self.session(&peer) {
            return Ok(session);
        }
        let lock = self.dial_lock(peer);
        let _dialing = lock.lock().await;
        if let Some(session) = self.session(&peer) {
            return Ok(session);
        }

        let mut addrs = self.inner.registry.addresses(&peer);
        addrs.sort_by_key(PeerAddr::is_relayed);
        let mut last_err = None;
        for addr in addrs {
            match self.dial(&DialTarget::new(Some(peer), addr.clone())).await {
                Ok(session) => return Ok(session),
                Err(err) => {
                    debug!(%peer, %addr, %err, "dial failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or(Error::NoAddress(peer)))
    }

    fn dial_lock(&self, peer: PeerId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.dial_locks.lock();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(peer).or_default().clone()
    }

    /// Opens a `protocol` stream to `peer`, connecting first if needed.
    pub async fn open_stream(&self, peer: PeerId, protocol: &str) -> Result<PeerStream, Error> {
        let session = self.connect(peer).await?;
        Ok(session.open_stream(protocol).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const ECHO: &str = "/test/echo/1.0.0";

    fn settings() -> NodeSettings {
        NodeSettings {
            handshake_timeout: Duration::from_secs(2),
            dial_timeout: Duration::from_secs(2),
            ..NodeSettings::default()
        }
    }

    async fn listening_node() -> (Node, SocketAddr) {
        let node = Node::start(settings(), Keypair::generate(), None);
        let addr = node.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        (node, addr)
    }

    #[tokio::test(start_paused = true)]
    async fn accept_errors_back_off() {
        let shutdown = CancellationToken::new();
        let started = tokio::time::Instant::now();
        assert!(accept_backoff(&shutdown).await);
        assert!(started.elapsed() >= ACCEPT_BACKOFF);

        shutdown.cancel();
        let started = tokio::time::Instant::now();
        assert!(!accept_backoff(&shutdown).await);
        assert!(started.elapsed() < ACCEPT_BACKOFF);
    }

    #[test]
    fn parses_dial_targets() {
        let peer = Keypair::generate().peer_id();
        let plain: DialTarget = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(plain.peer, None);

        let pinned: DialTarget = format!("{peer}@127.0.0.1:4000").parse().unwrap();
        assert_eq!(pinned.peer, Some(peer));
        assert_eq!(pinned.to_string(), format!("{peer}@127.0.0.1:4000"));

        let relay = Keypair::generate().peer_id();
        let relayed: DialTarget = format!("{relay}@10.0.0.1:4000/circuit/{peer}")
            .parse()
            .unwrap();
        assert_eq!(relayed.peer, Some(peer));
        assert!(relayed.addr.is_relayed());

        assert!("not an address".parse::<DialTarget>().is_err());
    }

    #[tokio::test]
    async fn dials_and_routes_streams_by_protocol() {
        let (server, addr) = listening_node().await;
        let mut echo = server.accept(ECHO);
        tokio::spawn(async move {
            while let Some(mut stream) = echo.recv().await {
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    stream.read_to_end(&mut buf).await.unwrap();
                    stream.write_all(&buf).await.unwrap();
                    stream.shutdown().await.unwrap();
                });
            }
        });

        let client = Node::start(settings(), Keypair::generate(), None);
        let target = DialTarget::new(Some(server.peer_id()), PeerAddr::Direct(addr.to_string()));
        let session = client.dial(&target).await.unwrap();
        assert_eq!(session.remote_peer(), server.peer_id());

        let mut stream = client.open_stream(server.peer_id(), ECHO).await.unwrap();
        stream.write_all(b"over the overlay").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut back = Vec::new();
        stream.read_to_end(&mut back).await.unwrap();
        assert_eq!(back, b"over the overlay");
    }

    #[tokio::test]
    async fn identify_fills_the_registry() {
        let (server, addr) = listening_node().await;
        server.set_roles(|roles| roles.exit = true);
        let client = Node::start(settings(), Keypair::generate(), None);
        let mut events = client.subscribe();

        client
            .dial(&DialTarget::new(None, PeerAddr::Direct(addr.to_string())))
            .await
            .unwrap();
        loop {
            match events.recv().await.unwrap() {
                NodeEvent::Identified { peer } if peer == server.peer_id() => break,
                _ => continue,
            }
        }
        let entry = client.registry().get(&server.peer_id()).unwrap();
        assert!(entry.record.roles.exit);
        assert!(entry.record.addrs.contains(&PeerAddr::Direct(addr.to_string())));
    }

    #[tokio::test]
    async fn pinned_peer_id_must_match() {
        let (_server, addr) = listening_node().await;
        let client = Node::start(settings(), Keypair::generate(), None);
        let wrong = Keypair::generate().peer_id();
        let err = client
            .dial(&DialTarget::new(Some(wrong), PeerAddr::Direct(addr.to_string())))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(TransportError::PeerIdMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn disconnect_is_reported() {
        let (server, addr) = listening_node().await;
        let client = Node::start(settings(), Keypair::generate(), None);
        let mut events = client.subscribe();
        let session = client
            .dial(&DialTarget::new(None, PeerAddr::Direct(addr.to_string())))
            .await
            .unwrap();
        server.shutdown();
        session.closed().await;
        loop {
            if let NodeEvent::Disconnected { peer } = events.recv().await.unwrap() {
                assert_eq!(peer, server.peer_id());
                break;
            }
        }
        assert!(!client.is_connected(&server.peer_id()));
    }

    #[tokio::test]
    async fn unknown_peer_has_no_address() {
        let client = Node::start(settings(), Keypair::generate(), None);
        let stranger = Keypair::generate().peer_id();
        assert!(matches!(
            client.connect(stranger).await,
            Err(Error::NoAddress(peer)) if peer == stranger
        ));
    }
}
