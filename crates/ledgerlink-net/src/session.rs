//! Peer session state machine
//!
//! One session per remote identity. The role is fixed at creation:
//! - Initiator: New -> Offering -> Connected -> Closed
//! - Responder: New -> Answering -> Connected -> Closed
//!
//! Transitions are driven through [`SessionState::transition`]; anything not
//! in the table is rejected with [`SessionError::InvalidTransition`].

use crate::config::TransportConfig;
use crate::engine::{ChannelError, ConnectivityEngine, HandshakeError, RawChannel, SYSTEM_CHANNEL_LABEL};
use crate::transport::ChannelTransport;
use ledgerlink_core::types::{HandshakeBlob, PeerId, Role};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Session lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    New,
    Offering,
    Answering,
    Connected,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::New => "new",
            SessionState::Offering => "offering",
            SessionState::Answering => "answering",
            SessionState::Connected => "connected",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Inputs to the state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    CreateOffer,
    AcceptOffer,
    AcceptAnswer,
    HandshakeFailed,
    ChannelOpened,
    ChannelFailed,
    Close,
}

impl SessionState {
    /// Transition table
    pub fn transition(self, role: Role, event: SessionEvent) -> Result<SessionState, SessionError> {
        use SessionEvent::*;
        use SessionState::*;

        let next = match (self, role, event) {
            (New, Role::Initiator, CreateOffer) => Offering,
            (New, Role::Responder, AcceptOffer) => Answering,
            (Offering, Role::Initiator, AcceptAnswer) => Offering,
            (Offering, Role::Initiator, HandshakeFailed) => New,
            (Answering, Role::Responder, HandshakeFailed) => New,
            (Offering, Role::Initiator, ChannelOpened) => Connected,
            (Answering, Role::Responder, ChannelOpened) => Connected,
            (New | Offering | Answering | Connected, _, ChannelFailed | Close) => Closed,
            (from, role, event) => return Err(SessionError::InvalidTransition { from, role, event }),
        };
        Ok(next)
    }

    /// Still exchanging handshakes
    pub fn is_handshaking(self) -> bool {
        matches!(self, SessionState::New | SessionState::Offering | SessionState::Answering)
    }
}

/// Why a session ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The engine reported a channel error or closure
    Channel(ChannelError),
    /// Closed locally
    Closed,
    /// Replaced by a session for the same peer in the other role
    Superseded,
    /// Pruned after a stale handshake
    Evicted,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Channel(e) => write!(f, "channel: {}", e),
            DisconnectReason::Closed => f.write_str("closed"),
            DisconnectReason::Superseded => f.write_str("superseded"),
            DisconnectReason::Evicted => f.write_str("evicted"),
        }
    }
}

/// Session errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Invalid transition: {event:?} as {role} in state {from}")]
    InvalidTransition {
        from: SessionState,
        role: Role,
        event: SessionEvent,
    },
    #[error("Remote answer already applied")]
    AnswerAlreadyApplied,
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("Session closed: {0}")]
    Closed(DisconnectReason),
}

type ReadyCallback = Box<dyn FnOnce(Arc<ChannelTransport>) + Send>;
type DisconnectCallback = Box<dyn FnOnce(DisconnectReason) + Send>;

struct SessionInner {
    state: SessionState,
    state_since: Instant,
    answer_applied: bool,
    transport: Option<Arc<ChannelTransport>>,
    ready_callbacks: Vec<ReadyCallback>,
    /// Ready callbacks are being fired; later registrations queue behind them
    draining_ready: bool,
    disconnect_callbacks: Vec<DisconnectCallback>,
    close_reason: Option<DisconnectReason>,
}

/// Session with one remote identity
pub struct PeerSession {
    remote: PeerId,
    role: Role,
    engine: Arc<dyn ConnectivityEngine>,
    transport_config: TransportConfig,
    created_at: Instant,
    inner: Mutex<SessionInner>,
    /// Bumped whenever an offer attempt is abandoned and the session is back in `New`
    offer_resets: watch::Sender<u64>,
}

impl PeerSession {
    /// Create a session in `New` and take over the engine's channel events
    pub fn new(
        remote: PeerId,
        role: Role,
        engine: Arc<dyn ConnectivityEngine>,
        transport_config: TransportConfig,
    ) -> Arc<Self> {
        let now = Instant::now();
        let session = Arc::new(Self {
            remote,
            role,
            engine: engine.clone(),
            transport_config,
            created_at: now,
            inner: Mutex::new(SessionInner {
                state: SessionState::New,
                state_since: now,
                answer_applied: false,
                transport: None,
                ready_callbacks: Vec::new(),
                draining_ready: false,
                disconnect_callbacks: Vec::new(),
                close_reason: None,
            }),
            offer_resets: watch::channel(0).0,
        });

        let weak = Arc::downgrade(&session);
        engine.on_channel_open(Box::new(move |channel| {
            if let Some(session) = weak.upgrade() {
                session.handle_channel_open(channel);
            }
        }));

        let weak = Arc::downgrade(&session);
        engine.on_channel_error(Box::new(move |error| {
            if let Some(session) = weak.upgrade() {
                session.handle_channel_error(error);
            }
        }));

        debug!("Created {} session for {}", role, remote);
        session
    }

    pub fn remote(&self) -> PeerId {
        self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Time spent in the current state
    pub fn state_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.inner.lock().state_since)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Transport, once connected
    pub fn transport(&self) -> Option<Arc<ChannelTransport>> {
        self.inner.lock().transport.clone()
    }

    pub fn close_reason(&self) -> Option<DisconnectReason> {
        self.inner.lock().close_reason.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    fn apply(&self, event: SessionEvent) -> Result<SessionState, SessionError> {
        let mut inner = self.inner.lock();
        let next = inner.state.transition(self.role, event)?;
        if next != inner.state {
            debug!("Session {} ({}): {} -> {}", self.remote, self.role, inner.state, next);
            inner.state = next;
            inner.state_since = Instant::now();
        }
        Ok(next)
    }

    fn closed_error(&self) -> SessionError {
        SessionError::Closed(self.close_reason().unwrap_or(DisconnectReason::Closed))
    }

    /// Produce the local offer (Initiator, from `New`).
    ///
    /// Resolves once candidate gathering is complete. On failure the session
    /// returns to `New` so the offer can be retried.
    pub async fn create_local_offer(&self) -> Result<HandshakeBlob, SessionError> {
        self.apply(SessionEvent::CreateOffer)?;

        match self.engine.create_local_description().await {
            Ok(blob) => {
                if self.is_closed() {
                    return Err(self.closed_error());
                }
                Ok(blob)
            }
            Err(e) => {
                warn!("Offer creation for {} failed: {}", self.remote, e);
                let _ = self.reset_offer();
                Err(e.into())
            }
        }
    }

    /// Return an offered session to `New` after its offer could not be delivered
    pub fn abandon_offer(&self) -> Result<(), SessionError> {
        self.reset_offer()
    }

    fn reset_offer(&self) -> Result<(), SessionError> {
        self.apply(SessionEvent::HandshakeFailed)?;
        self.offer_resets.send_modify(|resets| *resets = resets.wrapping_add(1));
        Ok(())
    }

    /// Apply a remote offer and produce the answer (Responder, from `New`).
    ///
    /// A rejected offer leaves the session in `New`.
    pub async fn accept_remote_offer(&self, offer: &HandshakeBlob) -> Result<HandshakeBlob, SessionError> {
        self.apply(SessionEvent::AcceptOffer)?;

        let answer = match self.engine.apply_remote_description(offer).await {
            Ok(()) => self.engine.create_local_description().await,
            Err(e) => Err(e),
        };

        match answer {
            Ok(answer) => {
                if self.is_closed() {
                    return Err(self.closed_error());
                }
                Ok(answer)
            }
            Err(e) => {
                warn!("Rejected offer from {}: {}", self.remote, e);
                let _ = self.apply(SessionEvent::HandshakeFailed);
                Err(e.into())
            }
        }
    }

    /// Apply the remote answer (Initiator, in `Offering`).
    ///
    /// A rejected answer leaves the session in `Offering`; a later answer may
    /// still be applied.
    pub async fn accept_remote_answer(&self, answer: &HandshakeBlob) -> Result<(), SessionError> {
        {
            let mut inner = self.inner.lock();
            inner.state.transition(self.role, SessionEvent::AcceptAnswer)?;
            if inner.answer_applied {
                return Err(SessionError::AnswerAlreadyApplied);
            }
            inner.answer_applied = true;
        }

        if let Err(e) = self.engine.apply_remote_description(answer).await {
            warn!("Rejected answer from {}: {}", self.remote, e);
            self.inner.lock().answer_applied = false;
            return Err(e.into());
        }
        Ok(())
    }

    /// Register a callback for the connected transport.
    ///
    /// Fires exactly once, immediately if already connected. Callbacks fire
    /// in registration order. Dropped without firing if the session closes
    /// first.
    pub fn on_ready<F>(&self, callback: F)
    where
        F: FnOnce(Arc<ChannelTransport>) + Send + 'static,
    {
        let transport = {
            let mut inner = self.inner.lock();
            match (inner.state, inner.transport.clone()) {
                (SessionState::Connected, Some(transport)) if !inner.draining_ready => transport,
                (SessionState::Closed, _) => return,
                _ => {
                    inner.ready_callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(transport);
    }

    /// Register a callback for the end of the session.
    ///
    /// Fires once with the reason; immediately if already closed.
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: FnOnce(DisconnectReason) + Send + 'static,
    {
        let reason = {
            let mut inner = self.inner.lock();
            match inner.close_reason.clone() {
                Some(reason) => reason,
                None => {
                    inner.disconnect_callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(reason);
    }

    /// Wait for the connected transport
    pub async fn ready(&self) -> Result<Arc<ChannelTransport>, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.on_ready(move |transport| {
            let _ = tx.send(transport);
        });
        rx.await.map_err(|_| self.closed_error())
    }

    /// Wait for the connected transport, or for the pending offer to be
    /// abandoned.
    ///
    /// Resolves to `None` when an Initiator is back in `New` and needs a fresh
    /// offer.
    pub async fn ready_or_reset(&self) -> Result<Option<Arc<ChannelTransport>>, SessionError> {
        let mut resets = self.offer_resets.subscribe();
        if self.role == Role::Initiator && self.state() == SessionState::New {
            return Ok(None);
        }

        tokio::select! {
            ready = self.ready() => ready.map(Some),
            _ = resets.changed() => Ok(None),
        }
    }

    fn handle_channel_open(&self, channel: Arc<dyn RawChannel>) {
        if channel.label() != SYSTEM_CHANNEL_LABEL {
            warn!("Ignoring unexpected channel '{}' from {}", channel.label(), self.remote);
            channel.close();
            return;
        }

        let transport = match ChannelTransport::new(self.remote, channel.clone(), &self.transport_config) {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Cannot use channel from {}: {}", self.remote, e);
                channel.close();
                self.close_with(DisconnectReason::Channel(e));
                return;
            }
        };

        let mut callbacks = {
            let mut inner = self.inner.lock();
            match inner.state.transition(self.role, SessionEvent::ChannelOpened) {
                Ok(next) => {
                    inner.state = next;
                    inner.state_since = Instant::now();
                    inner.transport = Some(transport.clone());
                    inner.draining_ready = true;
                    std::mem::take(&mut inner.ready_callbacks)
                }
                Err(e) => {
                    drop(inner);
                    warn!("Unexpected channel from {}: {}", self.remote, e);
                    transport.close();
                    return;
                }
            }
        };

        info!("Session with {} connected ({})", self.remote, self.role);
        loop {
            for callback in callbacks {
                callback(transport.clone());
            }
            let mut inner = self.inner.lock();
            if inner.ready_callbacks.is_empty() {
                inner.draining_ready = false;
                break;
            }
            callbacks = std::mem::take(&mut inner.ready_callbacks);
        }
    }

    fn handle_channel_error(&self, error: ChannelError) {
        self.close_with(DisconnectReason::Channel(error));
    }

    /// Close the session
    pub fn close(&self) -> bool {
        self.close_with(DisconnectReason::Closed)
    }

    /// Close with a reason. Returns false if the session was already closed.
    pub fn close_with(&self, reason: DisconnectReason) -> bool {
        let (ready, disconnect, transport) = {
            let mut inner = self.inner.lock();
            let event = match reason {
                DisconnectReason::Channel(_) => SessionEvent::ChannelFailed,
                _ => SessionEvent::Close,
            };
            let Ok(next) = inner.state.transition(self.role, event) else {
                return false;
            };
            inner.state = next;
            inner.state_since = Instant::now();
            inner.close_reason = Some(reason.clone());
            (
                std::mem::take(&mut inner.ready_callbacks),
                std::mem::take(&mut inner.disconnect_callbacks),
                inner.transport.take(),
            )
        };
        drop(ready);

        info!("Session with {} closed: {}", self.remote, reason);
        if let Some(transport) = transport {
            transport.close();
        }
        self.engine.close();

        for callback in disconnect {
            callback(reason.clone());
        }
        true
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("remote", &self.remote)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}
