//! Connection registry
//!
//! Holds at most one live session per remote identity. Concurrent connects to
//! the same identity share the session and its single offer. Sessions are
//! created and replaced under the write lock; closing a replaced session and
//! running hooks always happens after the lock is released.

use crate::config::SessionConfig;
use crate::engine::{EngineFactory, HandshakeError};
use crate::session::{DisconnectReason, PeerSession, SessionError, SessionState};
use crate::signaling::{Signaler, SignalingError};
use crate::transport::ChannelTransport;
use ledgerlink_core::envelope::SignalPayload;
use ledgerlink_core::types::{HandshakeBlob, PeerId, Role, SignalKind};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Cannot connect to own identity")]
    SelfConnect,
    #[error("No session for peer {0}")]
    UnknownSession(PeerId),
    #[error("Offer from {0} ignored: our own offer takes precedence")]
    Glare(PeerId),
    #[error("Timed out connecting to {0}")]
    Timeout(PeerId),
    #[error("Engine error: {0}")]
    Engine(#[from] HandshakeError),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

/// Called for every session the registry creates
pub type SessionHook = Arc<dyn Fn(&Arc<PeerSession>) + Send + Sync>;

/// Registry statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total: usize,
    pub handshaking: usize,
    pub connected: usize,
    pub closed: usize,
}

/// Table of live sessions keyed by remote identity
pub struct ConnectionRegistry {
    local: PeerId,
    engines: Arc<dyn EngineFactory>,
    signaler: Arc<Signaler>,
    config: SessionConfig,
    sessions: RwLock<HashMap<PeerId, Arc<PeerSession>>>,
    session_hook: RwLock<Option<SessionHook>>,
}

impl ConnectionRegistry {
    pub fn new(
        local: PeerId,
        engines: Arc<dyn EngineFactory>,
        signaler: Arc<Signaler>,
        config: SessionConfig,
    ) -> Self {
        Self {
            local,
            engines,
            signaler,
            config,
            sessions: RwLock::new(HashMap::new()),
            session_hook: RwLock::new(None),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local
    }

    /// Install the hook run for each newly created session
    pub fn set_session_hook(&self, hook: SessionHook) {
        *self.session_hook.write() = Some(hook);
    }

    fn run_hook(&self, session: &Arc<PeerSession>) {
        let hook = self.session_hook.read().clone();
        if let Some(hook) = hook {
            hook(session);
        }
    }

    fn new_session(&self, remote: PeerId, role: Role) -> Result<Arc<PeerSession>, RegistryError> {
        let engine = self.engines.create(remote, role)?;
        Ok(PeerSession::new(remote, role, engine, self.config.transport.clone()))
    }

    fn get_or_create(&self, remote: PeerId, role: Role) -> Result<(Arc<PeerSession>, bool), RegistryError> {
        if let Some(existing) = self.get(remote) {
            return Ok((existing, false));
        }

        let session = {
            let mut sessions = self.sessions.write();
            if let Some(existing) = sessions.get(&remote).filter(|s| !s.is_closed()) {
                return Ok((existing.clone(), false));
            }
            let session = self.new_session(remote, role)?;
            sessions.insert(remote, session.clone());
            session
        };

        self.run_hook(&session);
        Ok((session, true))
    }

    /// Existing session for `remote`, or a new Initiator session
    pub fn get_or_create_initiator(&self, remote: PeerId) -> Result<(Arc<PeerSession>, bool), RegistryError> {
        self.get_or_create(remote, Role::Initiator)
    }

    /// Existing session for `remote`, or a new Responder session
    pub fn get_or_create_responder(&self, remote: PeerId) -> Result<(Arc<PeerSession>, bool), RegistryError> {
        self.get_or_create(remote, Role::Responder)
    }

    /// Live session for `remote`
    pub fn get(&self, remote: PeerId) -> Option<Arc<PeerSession>> {
        self.sessions
            .read()
            .get(&remote)
            .filter(|s| !s.is_closed())
            .cloned()
    }

    /// Start connecting without waiting for readiness.
    ///
    /// Drives the offer if the session is an Initiator still in `New`. Exactly
    /// one caller wins that transition; everyone else shares its outcome.
    pub async fn begin_connect(
        &self,
        remote: PeerId,
        welcome: Option<String>,
    ) -> Result<Arc<PeerSession>, RegistryError> {
        if remote == self.local {
            return Err(RegistryError::SelfConnect);
        }

        let (session, _) = self.get_or_create_initiator(remote)?;
        if session.role() != Role::Initiator || session.state() != SessionState::New {
            return Ok(session);
        }

        let offer = match session.create_local_offer().await {
            Ok(offer) => offer,
            Err(SessionError::InvalidTransition { .. }) | Err(SessionError::Closed(_)) => return Ok(session),
            Err(e) => return Err(e.into()),
        };

        let mut payload = SignalPayload::new(offer);
        payload.welcome = welcome;
        if let Err(e) = self.signaler.send(SignalKind::Offer, remote, &payload).await {
            warn!("Failed to publish offer to {}: {}", remote, e);
            let _ = session.abandon_offer();
            return Err(e.into());
        }

        info!("Offer published to {}", remote);
        Ok(session)
    }

    /// Wait for a session's transport, bounded by the connect timeout
    pub async fn await_ready(&self, session: &Arc<PeerSession>) -> Result<Arc<ChannelTransport>, RegistryError> {
        match self.config.connect_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, session.ready())
                .await
                .map_err(|_| RegistryError::Timeout(session.remote()))?
                .map_err(RegistryError::from),
            None => Ok(session.ready().await?),
        }
    }

    /// Connect to `remote` and wait for the transport.
    ///
    /// If the session is superseded while waiting, follows its replacement. If
    /// the offer this call joined is abandoned, drives a fresh one.
    pub async fn connect(
        &self,
        remote: PeerId,
        welcome: Option<String>,
    ) -> Result<Arc<ChannelTransport>, RegistryError> {
        match self.config.connect_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, self.connect_until_ready(remote, welcome))
                .await
                .map_err(|_| RegistryError::Timeout(remote))?,
            None => self.connect_until_ready(remote, welcome).await,
        }
    }

    async fn connect_until_ready(
        &self,
        remote: PeerId,
        welcome: Option<String>,
    ) -> Result<Arc<ChannelTransport>, RegistryError> {
        loop {
            let session = self.begin_connect(remote, welcome.clone()).await?;
            match session.ready_or_reset().await {
                Ok(Some(transport)) => return Ok(transport),
                Ok(None) => {
                    debug!("Offer to {} abandoned, retrying", remote);
                }
                Err(SessionError::Closed(DisconnectReason::Superseded)) => {
                    debug!("Session with {} superseded, following replacement", remote);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Whether we hold an Initiator session for `remote` that has not connected
    pub fn has_pending_offer(&self, remote: PeerId) -> bool {
        self.get(remote)
            .map(|s| s.role() == Role::Initiator && s.state().is_handshaking())
            .unwrap_or(false)
    }

    /// Answer an inbound offer from `remote`.
    ///
    /// Simultaneous offers are resolved by identity: the smaller id keeps its
    /// Initiator session and ignores the other offer; the larger id closes its
    /// Initiator as superseded and answers. A fresh offer for a session that is
    /// already answering or connected replaces it.
    pub async fn accept_offer(
        &self,
        remote: PeerId,
        offer: &HandshakeBlob,
    ) -> Result<Arc<PeerSession>, RegistryError> {
        if remote == self.local {
            return Err(RegistryError::SelfConnect);
        }

        let (session, replaced, created) = {
            let mut sessions = self.sessions.write();
            let existing = sessions.get(&remote).filter(|s| !s.is_closed()).cloned();
            match existing {
                Some(existing) if existing.role() == Role::Responder && existing.state() == SessionState::New => {
                    (existing, None, false)
                }
                Some(existing)
                    if existing.role() == Role::Initiator
                        && existing.state() == SessionState::Offering
                        && self.local < remote =>
                {
                    debug!("Glare with {}: keeping our offer", remote);
                    return Err(RegistryError::Glare(remote));
                }
                existing => {
                    let session = self.new_session(remote, Role::Responder)?;
                    sessions.insert(remote, session.clone());
                    (session, existing, true)
                }
            }
        };

        if let Some(replaced) = replaced {
            debug!("Replacing {} session with {} ({})", replaced.role(), remote, replaced.state());
            replaced.close_with(DisconnectReason::Superseded);
        }
        if created {
            self.run_hook(&session);
        }

        let answer = session.accept_remote_offer(offer).await?;
        if let Err(e) = self
            .signaler
            .send(SignalKind::Answer, remote, &SignalPayload::new(answer))
            .await
        {
            warn!("Failed to publish answer to {}: {}", remote, e);
            self.remove_session(&session);
            session.close();
            return Err(e.into());
        }

        info!("Answer published to {}", remote);
        Ok(session)
    }

    /// Apply an inbound answer to our Initiator session for `remote`
    pub async fn accept_answer(&self, remote: PeerId, answer: &HandshakeBlob) -> Result<(), RegistryError> {
        let session = self.get(remote).ok_or(RegistryError::UnknownSession(remote))?;
        session.accept_remote_answer(answer).await?;
        debug!("Answer from {} applied", remote);
        Ok(())
    }

    /// Remove and close the session for `remote`
    pub fn remove(&self, remote: PeerId) -> Option<Arc<PeerSession>> {
        let removed = self.sessions.write().remove(&remote);
        if let Some(session) = &removed {
            session.close();
        }
        removed
    }

    /// Remove `session` only if it is still the registered instance
    pub fn remove_session(&self, session: &Arc<PeerSession>) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(&session.remote()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&session.remote());
                true
            }
            _ => false,
        }
    }

    /// Remove closed sessions and close handshakes older than `handshake_timeout`
    pub fn prune(&self, handshake_timeout: Duration, now: Instant) -> usize {
        let stale: Vec<Arc<PeerSession>> = {
            let mut sessions = self.sessions.write();
            let stale: Vec<PeerId> = sessions
                .iter()
                .filter(|(_, s)| {
                    let state = s.state();
                    state == SessionState::Closed
                        || (state.is_handshaking() && s.state_age(now) >= handshake_timeout)
                })
                .map(|(id, _)| *id)
                .collect();
            stale.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        for session in &stale {
            if session.close_with(DisconnectReason::Evicted) {
                debug!("Evicted stale handshake with {}", session.remote());
            }
        }
        stale.len()
    }

    /// Evict stale partial messages in every connected transport
    pub fn evict_partial_messages(&self, now: Instant) -> usize {
        let transports: Vec<Arc<ChannelTransport>> =
            self.sessions.read().values().filter_map(|s| s.transport()).collect();
        transports.iter().map(|t| t.evict_expired(now)).sum()
    }

    /// Remove and close every session
    pub fn close_all(&self) -> usize {
        let drained: Vec<Arc<PeerSession>> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.close();
        }
        drained.len()
    }

    /// Identities with a live session
    pub fn peers(&self) -> Vec<PeerId> {
        self.sessions
            .read()
            .iter()
            .filter(|(_, s)| !s.is_closed())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let sessions = self.sessions.read();
        let mut stats = RegistryStats {
            total: sessions.len(),
            ..Default::default()
        };
        for session in sessions.values() {
            match session.state() {
                SessionState::Connected => stats.connected += 1,
                SessionState::Closed => stats.closed += 1,
                _ => stats.handshaking += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{LoopbackConfig, LoopbackNetwork, MemoryLedger};
    use ledgerlink_core::crypto::KeyPair;

    struct Fixture {
        ledger: Arc<MemoryLedger>,
        network: Arc<LoopbackNetwork>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                ledger: Arc::new(MemoryLedger::new()),
                network: LoopbackNetwork::new(LoopbackConfig {
                    gather_delay: Duration::from_millis(20),
                    ..Default::default()
                }),
            }
        }

        fn registry(&self, config: SessionConfig) -> (Arc<ConnectionRegistry>, Arc<Signaler>) {
            let signaler = Arc::new(Signaler::new(KeyPair::generate(), self.ledger.clone()));
            let registry = Arc::new(ConnectionRegistry::new(
                signaler.local_id(),
                self.network.clone(),
                signaler.clone(),
                config,
            ));
            (registry, signaler)
        }
    }

    /// Answer every offer and apply every answer for `registry`
    async fn pump(registry: Arc<ConnectionRegistry>, signaler: Arc<Signaler>) {
        let mut offers = signaler.subscribe(SignalKind::Offer).await.unwrap();
        let mut answers = signaler.subscribe(SignalKind::Answer).await.unwrap();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(signal) = offers.next() => {
                        let payload = signaler.open(&signal).unwrap();
                        let _ = registry.accept_offer(signal.from, &payload.blob).await;
                    }
                    Some(signal) = answers.next() => {
                        let payload = signaler.open(&signal).unwrap();
                        let _ = registry.accept_answer(signal.from, &payload.blob).await;
                    }
                    else => break,
                }
            }
        });
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_session() {
        let fixture = Fixture::new();
        let (registry, _) = fixture.registry(SessionConfig::default());
        let remote = KeyPair::generate().peer_id();

        let (a, b) = tokio::join!(
            registry.begin_connect(remote, None),
            registry.begin_connect(remote, None)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(fixture.network.descriptions_created(), 1);
        assert_eq!(fixture.ledger.records().len(), 1);
        assert_eq!(a.state(), SessionState::Offering);
    }

    #[tokio::test]
    async fn test_self_connect_rejected() {
        let fixture = Fixture::new();
        let (registry, signaler) = fixture.registry(SessionConfig::default());
        assert!(matches!(
            registry.begin_connect(signaler.local_id(), None).await,
            Err(RegistryError::SelfConnect)
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_responder_session_never_offers() {
        let fixture = Fixture::new();
        let (registry, _) = fixture.registry(SessionConfig::default());
        let remote = KeyPair::generate().peer_id();

        let (responder, created) = registry.get_or_create_responder(remote).unwrap();
        assert!(created);
        let session = registry.begin_connect(remote, None).await.unwrap();

        assert!(Arc::ptr_eq(&responder, &session));
        assert_eq!(session.role(), Role::Responder);
        assert_eq!(fixture.network.descriptions_created(), 0);
        assert!(fixture.ledger.records().is_empty());
    }

    #[tokio::test]
    async fn test_connect_between_registries() {
        let fixture = Fixture::new();
        let (alice, alice_signaler) = fixture.registry(SessionConfig::default());
        let (bob, bob_signaler) = fixture.registry(SessionConfig::default());
        pump(alice.clone(), alice_signaler).await;
        pump(bob.clone(), bob_signaler.clone()).await;

        let (first, second) = tokio::join!(
            alice.connect(bob_signaler.local_id(), Some("hi".into())),
            alice.connect(bob_signaler.local_id(), None)
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(alice.stats().connected, 1);

        let bob_session = bob.get(alice.local_id()).unwrap();
        let bob_transport = bob_session.ready().await.unwrap();
        assert_eq!(bob_session.role(), Role::Responder);
        assert_eq!(bob_transport.remote(), alice.local_id());
    }

    #[tokio::test]
    async fn test_publish_failure_returns_session_to_new() {
        let fixture = Fixture::new();
        let (registry, _) = fixture.registry(SessionConfig::default());
        let remote = KeyPair::generate().peer_id();

        fixture.ledger.set_available(false);
        assert!(matches!(
            registry.begin_connect(remote, None).await,
            Err(RegistryError::Signaling(SignalingError::Unavailable(_)))
        ));
        assert_eq!(registry.get(remote).unwrap().state(), SessionState::New);

        fixture.ledger.set_available(true);
        let session = registry.begin_connect(remote, None).await.unwrap();
        assert_eq!(session.state(), SessionState::Offering);
        assert_eq!(fixture.ledger.records().len(), 1);
    }

    #[tokio::test]
    async fn test_joined_connects_share_publish_failure() {
        let fixture = Fixture::new();
        let (registry, _) = fixture.registry(SessionConfig::default());
        let remote = KeyPair::generate().peer_id();

        fixture.ledger.set_available(false);
        let (first, second) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(registry.connect(remote, None), registry.connect(remote, None))
        })
        .await
        .unwrap();

        assert!(matches!(
            first,
            Err(RegistryError::Signaling(SignalingError::Unavailable(_)))
        ));
        assert!(matches!(
            second,
            Err(RegistryError::Signaling(SignalingError::Unavailable(_)))
        ));
        assert_eq!(registry.get(remote).unwrap().state(), SessionState::New);
        assert!(fixture.ledger.records().is_empty());
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let fixture = Fixture::new();
        let (registry, _) = fixture.registry(SessionConfig {
            connect_timeout_secs: Some(1),
            ..Default::default()
        });
        let remote = KeyPair::generate().peer_id();

        assert!(matches!(
            registry.connect(remote, None).await,
            Err(RegistryError::Timeout(id)) if id == remote
        ));
    }

    #[tokio::test]
    async fn test_prune_stale_handshakes() {
        let fixture = Fixture::new();
        let (registry, _) = fixture.registry(SessionConfig::default());
        let remote = KeyPair::generate().peer_id();
        let session = registry.begin_connect(remote, None).await.unwrap();

        let timeout = Duration::from_secs(60);
        assert_eq!(registry.prune(timeout, Instant::now()), 0);
        assert_eq!(registry.prune(timeout, Instant::now() + Duration::from_secs(61)), 1);

        assert!(registry.is_empty());
        assert_eq!(session.close_reason(), Some(DisconnectReason::Evicted));
    }

    #[tokio::test]
    async fn test_remove_session_checks_identity() {
        let fixture = Fixture::new();
        let (registry, _) = fixture.registry(SessionConfig::default());
        let remote = KeyPair::generate().peer_id();

        let (first, _) = registry.get_or_create_initiator(remote).unwrap();
        first.close();
        let (second, created) = registry.get_or_create_initiator(remote).unwrap();
        assert!(created);
        assert!(!Arc::ptr_eq(&first, &second));

        assert!(!registry.remove_session(&first));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove_session(&second));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_glare_smaller_id_keeps_offer() {
        let fixture = Fixture::new();
        let (registry, signaler) = fixture.registry(SessionConfig::default());
        let local = signaler.local_id();

        // Pick a remote on each side of our identity
        let mut larger = KeyPair::generate().peer_id();
        while larger < local {
            larger = KeyPair::generate().peer_id();
        }
        let mut smaller = KeyPair::generate().peer_id();
        while smaller > local {
            smaller = KeyPair::generate().peer_id();
        }

        let ours = registry.begin_connect(larger, None).await.unwrap();
        let offer = HandshakeBlob::new("{}");
        assert!(matches!(
            registry.accept_offer(larger, &offer).await,
            Err(RegistryError::Glare(_))
        ));
        assert!(Arc::ptr_eq(&ours, &registry.get(larger).unwrap()));

        let yielded = registry.begin_connect(smaller, None).await.unwrap();
        // The bogus offer is rejected by the engine, but only after our
        // initiator has been replaced
        assert!(registry.accept_offer(smaller, &offer).await.is_err());
        assert_eq!(yielded.close_reason(), Some(DisconnectReason::Superseded));
        assert_eq!(registry.get(smaller).unwrap().role(), Role::Responder);
    }
}
