//! Node: one local identity with its registry and background tasks
//!
//! The node subscribes to offers and answers addressed to it, turns inbound
//! offers into connection requests (or accepts them directly), applies
//! answers to pending sessions, and periodically evicts stale state.

use crate::config::NodeConfig;
use crate::engine::EngineFactory;
use crate::registry::{ConnectionRegistry, RegistryError};
use crate::session::{DisconnectReason, PeerSession};
use crate::signaling::{InboundSignal, Signaler, SignalingError, SignalingTransport, Subscription};
use crate::transport::ChannelTransport;
use ledgerlink_core::crypto::KeyPair;
use ledgerlink_core::types::{HandshakeBlob, PeerId, SignalKind};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Node errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
    #[error("Unknown username: {0}")]
    UnknownUsername(String),
    #[error("Connection request already handled")]
    AlreadyHandled,
    #[error("Node shut down")]
    ShutDown,
}

/// Node events
#[derive(Clone, Debug)]
pub enum NodeEvent {
    /// A remote party offered a connection; accept or reject it
    ConnectionRequest(IncomingRequest),
    /// A session reached the connected state
    Connected {
        peer: PeerId,
        transport: Arc<ChannelTransport>,
    },
    /// A connected session ended
    Disconnected { peer: PeerId, reason: DisconnectReason },
}

/// Inbound offer awaiting a decision
#[derive(Clone)]
pub struct IncomingRequest {
    from: PeerId,
    welcome: Option<String>,
    offer: HandshakeBlob,
    handled: Arc<AtomicBool>,
    node: Weak<NodeInner>,
}

impl IncomingRequest {
    /// Identity that sent the offer
    pub fn from(&self) -> PeerId {
        self.from
    }

    /// Welcome message carried by the offer
    pub fn welcome(&self) -> Option<&str> {
        self.welcome.as_deref()
    }

    /// Answer the offer and wait for the transport
    pub async fn accept(&self) -> Result<Arc<ChannelTransport>, NodeError> {
        if self.handled.swap(true, Ordering::SeqCst) {
            return Err(NodeError::AlreadyHandled);
        }
        let node = self.node.upgrade().ok_or(NodeError::ShutDown)?;

        info!("Accepting connection request from {}", self.from);
        let session = node.registry.accept_offer(self.from, &self.offer).await?;
        Ok(node.registry.await_ready(&session).await?)
    }

    /// Drop the offer without answering. Returns false if already handled.
    pub fn reject(&self) -> bool {
        let first = !self.handled.swap(true, Ordering::SeqCst);
        if first {
            debug!("Rejected connection request from {}", self.from);
        }
        first
    }
}

impl std::fmt::Debug for IncomingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingRequest")
            .field("from", &self.from)
            .field("welcome", &self.welcome)
            .finish_non_exhaustive()
    }
}

struct NodeInner {
    local: PeerId,
    config: NodeConfig,
    signaler: Arc<Signaler>,
    registry: ConnectionRegistry,
    events: broadcast::Sender<NodeEvent>,
    cancel: CancellationToken,
}

impl NodeInner {
    /// Attach event reporting to a newly created session
    fn watch(self: &Arc<Self>, session: &Arc<PeerSession>) {
        let peer = session.remote();
        let connected = Arc::new(AtomicBool::new(false));

        let node = Arc::downgrade(self);
        let flag = connected.clone();
        session.on_ready(move |transport| {
            flag.store(true, Ordering::SeqCst);
            if let Some(node) = node.upgrade() {
                let _ = node.events.send(NodeEvent::Connected { peer, transport });
            }
        });

        let node = Arc::downgrade(self);
        let watched = Arc::downgrade(session);
        session.on_disconnect(move |reason| {
            let Some(node) = node.upgrade() else {
                return;
            };
            if let Some(session) = watched.upgrade() {
                node.registry.remove_session(&session);
            }
            if connected.load(Ordering::SeqCst) {
                info!("Disconnected from {}: {}", peer, reason);
                let _ = node.events.send(NodeEvent::Disconnected { peer, reason });
            }
        });
    }

    async fn handle_offer(self: Arc<Self>, signal: InboundSignal) {
        let payload = match self.signaler.open(&signal) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Dropping unreadable offer from {}: {}", signal.from, e);
                return;
            }
        };
        debug!("Offer from {} ({} byte blob)", signal.from, payload.blob.len());

        // We were already connecting to them, or the host accepts everything
        if self.config.auto_accept || self.registry.has_pending_offer(signal.from) {
            match self.registry.accept_offer(signal.from, &payload.blob).await {
                Ok(_) => {}
                Err(RegistryError::Glare(peer)) => debug!("Ignoring crossing offer from {}", peer),
                Err(e) => warn!("Failed to answer offer from {}: {}", signal.from, e),
            }
            return;
        }

        let request = IncomingRequest {
            from: signal.from,
            welcome: payload.welcome,
            offer: payload.blob,
            handled: Arc::new(AtomicBool::new(false)),
            node: Arc::downgrade(&self),
        };
        if self.events.send(NodeEvent::ConnectionRequest(request)).is_err() {
            debug!("No listener for connection request from {}", signal.from);
        }
    }

    async fn handle_answer(self: Arc<Self>, signal: InboundSignal) {
        let payload = match self.signaler.open(&signal) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Dropping unreadable answer from {}: {}", signal.from, e);
                return;
            }
        };

        if let Err(e) = self.registry.accept_answer(signal.from, &payload.blob).await {
            debug!("Ignoring answer from {}: {}", signal.from, e);
        }
    }

    fn maintain(&self, now: Instant) -> (usize, usize) {
        let pruned = match self.config.session.handshake_timeout() {
            Some(timeout) => self.registry.prune(timeout, now),
            None => 0,
        };
        let evicted = self.registry.evict_partial_messages(now);
        if pruned > 0 || evicted > 0 {
            debug!("Maintenance: {} sessions pruned, {} partial messages evicted", pruned, evicted);
        }
        (pruned, evicted)
    }
}

async fn dispatch(node: Arc<NodeInner>, mut offers: Subscription, mut answers: Subscription) {
    loop {
        tokio::select! {
            _ = node.cancel.cancelled() => break,
            signal = offers.next() => match signal {
                Some(signal) => {
                    tokio::spawn(node.clone().handle_offer(signal));
                }
                None => {
                    warn!("Offer subscription ended");
                    break;
                }
            },
            signal = answers.next() => match signal {
                Some(signal) => {
                    tokio::spawn(node.clone().handle_answer(signal));
                }
                None => {
                    warn!("Answer subscription ended");
                    break;
                }
            },
        }
    }
    debug!("Dispatch loop for {} stopped", node.local);
}

async fn maintenance(node: Arc<NodeInner>) {
    let mut ticker = tokio::time::interval(node.config.maintenance_interval());
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = node.cancel.cancelled() => break,
            _ = ticker.tick() => {
                node.maintain(Instant::now());
            }
        }
    }
}

/// Running node
pub struct Node {
    inner: Arc<NodeInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Subscribe to signals for `keypair` and start the background tasks
    pub async fn start(
        keypair: KeyPair,
        signaling: Arc<dyn SignalingTransport>,
        engines: Arc<dyn EngineFactory>,
        config: NodeConfig,
    ) -> Result<Self, NodeError> {
        let local = keypair.peer_id();
        let signaler = Arc::new(Signaler::new(keypair, signaling));
        let offers = signaler.subscribe(SignalKind::Offer).await?;
        let answers = signaler.subscribe(SignalKind::Answer).await?;

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let registry = ConnectionRegistry::new(local, engines, signaler.clone(), config.session.clone());
        let inner = Arc::new(NodeInner {
            local,
            config,
            signaler,
            registry,
            events,
            cancel: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&inner);
        inner.registry.set_session_hook(Arc::new(move |session| {
            if let Some(node) = weak.upgrade() {
                node.watch(session);
            }
        }));

        let tasks = vec![
            tokio::spawn(dispatch(inner.clone(), offers, answers)),
            tokio::spawn(maintenance(inner.clone())),
        ];

        info!("Node {} started", local);
        Ok(Self {
            inner,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn local_id(&self) -> PeerId {
        self.inner.local
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Live session with `peer`
    pub fn session(&self, peer: PeerId) -> Option<Arc<PeerSession>> {
        self.inner.registry.get(peer)
    }

    /// Receiver for node events from now on
    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// Connect with the default welcome message
    pub async fn connect(&self, peer: PeerId) -> Result<Arc<ChannelTransport>, NodeError> {
        let welcome = self.inner.config.default_welcome.clone();
        self.connect_with_welcome(peer, welcome).await
    }

    pub async fn connect_with_welcome(
        &self,
        peer: PeerId,
        welcome: impl Into<String>,
    ) -> Result<Arc<ChannelTransport>, NodeError> {
        if self.inner.cancel.is_cancelled() {
            return Err(NodeError::ShutDown);
        }
        Ok(self.inner.registry.connect(peer, Some(welcome.into())).await?)
    }

    /// Resolve a username through the signaling transport and connect
    pub async fn connect_username(&self, username: &str) -> Result<Arc<ChannelTransport>, NodeError> {
        let peer = self
            .inner
            .signaler
            .resolve_address(username)
            .await?
            .ok_or_else(|| NodeError::UnknownUsername(username.to_string()))?;
        debug!("Resolved '{}' to {}", username, peer);
        self.connect(peer).await
    }

    /// Register a username for our identity
    pub async fn register_username(&self, username: &str) -> Result<(), NodeError> {
        self.inner.signaler.register_username(username).await?;
        info!("Registered username '{}'", username);
        Ok(())
    }

    /// Close the session with `peer`
    pub fn disconnect(&self, peer: PeerId) -> bool {
        self.inner.registry.remove(peer).is_some()
    }

    /// Run one maintenance pass. Returns (sessions pruned, partial messages evicted).
    pub fn run_maintenance(&self) -> (usize, usize) {
        self.inner.maintain(Instant::now())
    }

    /// Stop background tasks and close every session
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let closed = self.inner.registry.close_all();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!("Node {} shut down ({} sessions closed)", self.inner.local, closed);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}
