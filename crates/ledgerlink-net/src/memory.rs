//! In-process signaling ledger and loopback connectivity engine
//!
//! Used by tests and the probe binary to run whole sessions inside one
//! process. The ledger keeps an append-only log of postcard records; the
//! loopback engine links two engines of the same network directly.

use crate::engine::{
    ChannelError, ChannelErrorHandler, ChannelOpenHandler, ConnectivityEngine, DatagramHandler, EngineFactory,
    HandshakeError, RawChannel, SYSTEM_CHANNEL_LABEL,
};
use crate::signaling::{InboundSignal, SignalingError, SignalingTransport, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use ledgerlink_core::framing::MAX_FRAME_LEN;
use ledgerlink_core::types::{HandshakeBlob, PeerId, Role, SignalKind};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

const LEDGER_EVENT_CAPACITY: usize = 1024;
const SUBSCRIPTION_BUFFER: usize = 256;

/// One published signal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub kind: SignalKind,
    pub to: PeerId,
    pub from: PeerId,
    pub payload: Vec<u8>,
}

/// Append-only in-process ledger
pub struct MemoryLedger {
    log: RwLock<Vec<Vec<u8>>>,
    events: broadcast::Sender<Arc<LedgerRecord>>,
    usernames: RwLock<HashMap<String, PeerId>>,
    block_time: Option<Duration>,
    available: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(LEDGER_EVENT_CAPACITY);
        Self {
            log: RwLock::new(Vec::new()),
            events,
            usernames: RwLock::new(HashMap::new()),
            block_time: None,
            available: AtomicBool::new(true),
        }
    }

    /// Delay every publication by `block_time`
    pub fn with_block_time(mut self, block_time: Duration) -> Self {
        self.block_time = Some(block_time);
        self
    }

    /// Simulate an outage: publications fail while unavailable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Decoded copy of the log
    pub fn records(&self) -> Vec<LedgerRecord> {
        self.log
            .read()
            .iter()
            .filter_map(|raw| postcard::from_bytes(raw).ok())
            .collect()
    }

    fn check_available(&self) -> Result<(), SignalingError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SignalingError::Unavailable("ledger offline".into()))
        }
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingTransport for MemoryLedger {
    async fn publish(
        &self,
        kind: SignalKind,
        to: PeerId,
        from: PeerId,
        payload: Bytes,
    ) -> Result<(), SignalingError> {
        self.check_available()?;
        if let Some(block_time) = self.block_time {
            tokio::time::sleep(block_time).await;
        }

        let record = LedgerRecord {
            kind,
            to,
            from,
            payload: payload.to_vec(),
        };
        let raw = postcard::to_allocvec(&record).map_err(|e| SignalingError::Rejected(e.to_string()))?;
        self.log.write().push(raw);

        debug!("Ledger record {:?} {} -> {}", kind, from, to);
        // No subscribers is not an error: records stay in the log
        let _ = self.events.send(Arc::new(record));
        Ok(())
    }

    async fn subscribe(&self, kind: SignalKind, self_id: PeerId) -> Result<Subscription, SignalingError> {
        let mut events = self.events.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(record) => {
                        if record.kind != kind || record.to != self_id {
                            continue;
                        }
                        let signal = InboundSignal {
                            from: record.from,
                            payload: Bytes::copy_from_slice(&record.payload),
                        };
                        if tx.send(signal).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Subscription for {} lagged, {} records skipped", self_id, missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(rx))
    }

    async fn resolve_address(&self, username: &str) -> Result<Option<PeerId>, SignalingError> {
        self.check_available()?;
        Ok(self.usernames.read().get(username).copied())
    }

    async fn register_username(&self, username: &str, identity: PeerId) -> Result<(), SignalingError> {
        self.check_available()?;
        let mut usernames = self.usernames.write();
        match usernames.get(username) {
            Some(owner) if *owner != identity => Err(SignalingError::UsernameTaken(username.to_string())),
            Some(_) => Ok(()),
            None => {
                usernames.insert(username.to_string(), identity);
                Ok(())
            }
        }
    }
}

/// Loopback engine settings
#[derive(Clone, Debug)]
pub struct LoopbackConfig {
    /// Simulated candidate gathering time
    pub gather_delay: Duration,
    /// Shuffle each batch of queued datagrams before delivery
    pub shuffle: bool,
    /// Largest datagram accepted by channels
    pub mtu: usize,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            gather_delay: Duration::from_millis(10),
            shuffle: false,
            mtu: MAX_FRAME_LEN,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DescriptorKind {
    Offer,
    Answer,
}

/// Handshake blob contents
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Descriptor {
    kind: DescriptorKind,
    endpoint: u64,
    label: String,
}

#[derive(Default)]
struct Switchboard {
    endpoints: RwLock<HashMap<u64, Weak<LoopbackEngine>>>,
    next_endpoint: AtomicU64,
    engines_created: AtomicUsize,
    descriptions_created: AtomicUsize,
}

/// Creates loopback engines that can reach each other
pub struct LoopbackNetwork {
    config: LoopbackConfig,
    switchboard: Arc<Switchboard>,
}

impl LoopbackNetwork {
    pub fn new(config: LoopbackConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            switchboard: Arc::new(Switchboard::default()),
        })
    }

    /// Engines created so far
    pub fn engines_created(&self) -> usize {
        self.switchboard.engines_created.load(Ordering::SeqCst)
    }

    /// Local descriptions produced so far
    pub fn descriptions_created(&self) -> usize {
        self.switchboard.descriptions_created.load(Ordering::SeqCst)
    }
}

impl EngineFactory for LoopbackNetwork {
    fn create(&self, remote: PeerId, role: Role) -> Result<Arc<dyn ConnectivityEngine>, HandshakeError> {
        let endpoint = self.switchboard.next_endpoint.fetch_add(1, Ordering::SeqCst) + 1;
        let engine = Arc::new_cyclic(|me| LoopbackEngine {
            me: me.clone(),
            endpoint,
            remote,
            role,
            config: self.config.clone(),
            switchboard: self.switchboard.clone(),
            state: Mutex::new(EngineState::default()),
        });

        self.switchboard
            .endpoints
            .write()
            .insert(endpoint, Arc::downgrade(&engine));
        self.switchboard.engines_created.fetch_add(1, Ordering::SeqCst);
        Ok(engine)
    }
}

#[derive(Default)]
struct EngineState {
    remote_endpoint: Option<u64>,
    open_handler: Option<Arc<dyn Fn(Arc<dyn RawChannel>) + Send + Sync>>,
    error_handler: Option<Arc<dyn Fn(ChannelError) + Send + Sync>>,
    unclaimed: Option<Arc<dyn RawChannel>>,
    link: Option<Arc<Link>>,
    closed: bool,
}

/// Engine whose peer is another engine of the same network
pub struct LoopbackEngine {
    me: Weak<LoopbackEngine>,
    endpoint: u64,
    remote: PeerId,
    role: Role,
    config: LoopbackConfig,
    switchboard: Arc<Switchboard>,
    state: Mutex<EngineState>,
}

impl LoopbackEngine {
    fn lookup(&self, endpoint: u64) -> Option<Arc<LoopbackEngine>> {
        self.switchboard.endpoints.read().get(&endpoint).and_then(Weak::upgrade)
    }

    fn remote_endpoint(&self) -> Option<u64> {
        self.state.lock().remote_endpoint
    }

    fn channel_opened(&self, channel: Arc<LoopbackChannel>) {
        let link = channel.link.clone();
        let channel: Arc<dyn RawChannel> = channel;
        let handler = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.link = Some(link);
            match state.open_handler.clone() {
                Some(handler) => handler,
                None => {
                    state.unclaimed = Some(channel);
                    return;
                }
            }
        };
        handler(channel);
    }

    fn report_error(&self, error: ChannelError) {
        let handler = self.state.lock().error_handler.clone();
        if let Some(handler) = handler {
            handler(error);
        }
    }

    /// Link this initiator with the responder that answered it
    fn link_with(&self, remote: Arc<LoopbackEngine>) {
        let link = Arc::new(Link {
            closed: AtomicBool::new(false),
            engines: [self.me.clone(), Arc::downgrade(&remote)],
        });

        let (tx_ab, rx_ab) = mpsc::unbounded_channel();
        let (tx_ba, rx_ba) = mpsc::unbounded_channel();
        let inbound_a = Arc::new(Inbound::default());
        let inbound_b = Arc::new(Inbound::default());

        tokio::spawn(pump(rx_ab, inbound_b.clone(), self.config.shuffle));
        tokio::spawn(pump(rx_ba, inbound_a.clone(), self.config.shuffle));

        let local_end = Arc::new(LoopbackChannel {
            mtu: self.config.mtu,
            outbound: tx_ab,
            inbound: inbound_a,
            link: link.clone(),
        });
        let remote_end = Arc::new(LoopbackChannel {
            mtu: remote.config.mtu,
            outbound: tx_ba,
            inbound: inbound_b,
            link,
        });

        let local = self.me.clone();
        tokio::spawn(async move {
            if let Some(local) = local.upgrade() {
                local.channel_opened(local_end);
            }
            remote.channel_opened(remote_end);
        });
    }
}

#[async_trait]
impl ConnectivityEngine for LoopbackEngine {
    async fn create_local_description(&self) -> Result<HandshakeBlob, HandshakeError> {
        if self.state.lock().closed {
            return Err(HandshakeError::EngineClosed);
        }
        let kind = match self.role {
            Role::Initiator => DescriptorKind::Offer,
            Role::Responder => {
                if self.remote_endpoint().is_none() {
                    return Err(HandshakeError::Inapplicable(
                        "answer requires a remote offer".into(),
                    ));
                }
                DescriptorKind::Answer
            }
        };

        tokio::time::sleep(self.config.gather_delay).await;
        if self.state.lock().closed {
            return Err(HandshakeError::EngineClosed);
        }

        let descriptor = Descriptor {
            kind,
            endpoint: self.endpoint,
            label: SYSTEM_CHANNEL_LABEL.to_string(),
        };
        let json = serde_json::to_string(&descriptor).map_err(|e| HandshakeError::Gathering(e.to_string()))?;
        self.switchboard.descriptions_created.fetch_add(1, Ordering::SeqCst);
        Ok(HandshakeBlob::new(json))
    }

    async fn apply_remote_description(&self, blob: &HandshakeBlob) -> Result<(), HandshakeError> {
        let descriptor: Descriptor =
            serde_json::from_str(blob.as_str()).map_err(|e| HandshakeError::Malformed(e.to_string()))?;

        let expected = match self.role {
            Role::Initiator => DescriptorKind::Answer,
            Role::Responder => DescriptorKind::Offer,
        };
        if descriptor.kind != expected {
            return Err(HandshakeError::Inapplicable(format!(
                "{:?} cannot be applied by a {}",
                descriptor.kind, self.role
            )));
        }
        if descriptor.label != SYSTEM_CHANNEL_LABEL {
            return Err(HandshakeError::Inapplicable(format!(
                "unknown channel label '{}'",
                descriptor.label
            )));
        }

        let remote = self
            .lookup(descriptor.endpoint)
            .ok_or_else(|| HandshakeError::Inapplicable(format!("unknown endpoint {}", descriptor.endpoint)))?;

        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(HandshakeError::EngineClosed);
            }
            if state.remote_endpoint.is_some() {
                return Err(HandshakeError::Inapplicable("remote description already applied".into()));
            }
            state.remote_endpoint = Some(descriptor.endpoint);
        }

        if self.role == Role::Initiator {
            if remote.remote_endpoint() != Some(self.endpoint) {
                self.state.lock().remote_endpoint = None;
                return Err(HandshakeError::Inapplicable("answer does not match our offer".into()));
            }
            debug!("Loopback endpoints {} and {} linked", self.endpoint, descriptor.endpoint);
            self.link_with(remote);
        }
        Ok(())
    }

    fn on_channel_open(&self, handler: ChannelOpenHandler) {
        let handler: Arc<dyn Fn(Arc<dyn RawChannel>) + Send + Sync> = Arc::from(handler);
        let unclaimed = {
            let mut state = self.state.lock();
            state.open_handler = Some(handler.clone());
            state.unclaimed.take()
        };
        if let Some(channel) = unclaimed {
            handler(channel);
        }
    }

    fn on_channel_error(&self, handler: ChannelErrorHandler) {
        self.state.lock().error_handler = Some(Arc::from(handler));
    }

    fn close(&self) {
        let link = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.unclaimed = None;
            state.link.take()
        };
        self.switchboard.endpoints.write().remove(&self.endpoint);
        if let Some(link) = link {
            link.close();
        }
        debug!("Loopback engine for {} closed", self.remote);
    }
}

impl Drop for LoopbackEngine {
    fn drop(&mut self) {
        self.switchboard.endpoints.write().remove(&self.endpoint);
    }
}

/// Shared state of the two channel ends
struct Link {
    closed: AtomicBool,
    engines: [Weak<LoopbackEngine>; 2],
}

impl Link {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close both ends and report the closure to both engines
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for engine in self.engines.iter().filter_map(Weak::upgrade) {
            engine.report_error(ChannelError::Closed);
        }
    }
}

#[derive(Default)]
struct Inbound {
    state: Mutex<InboundState>,
}

#[derive(Default)]
struct InboundState {
    handler: Option<Arc<dyn Fn(Bytes) + Send + Sync>>,
    early: Vec<Bytes>,
}

impl Inbound {
    fn deliver(&self, datagram: Bytes) {
        let handler = {
            let mut state = self.state.lock();
            match state.handler.clone() {
                Some(handler) => handler,
                None => {
                    state.early.push(datagram);
                    return;
                }
            }
        };
        handler(datagram);
    }
}

async fn pump(mut rx: mpsc::UnboundedReceiver<Bytes>, inbound: Arc<Inbound>, shuffle: bool) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(datagram) = rx.try_recv() {
            batch.push(datagram);
        }
        if shuffle {
            batch.shuffle(&mut rand::thread_rng());
        }
        for datagram in batch {
            inbound.deliver(datagram);
        }
    }
}

/// One end of a loopback link
pub struct LoopbackChannel {
    mtu: usize,
    outbound: mpsc::UnboundedSender<Bytes>,
    inbound: Arc<Inbound>,
    link: Arc<Link>,
}

impl RawChannel for LoopbackChannel {
    fn label(&self) -> &str {
        SYSTEM_CHANNEL_LABEL
    }

    fn max_datagram_size(&self) -> usize {
        self.mtu
    }

    fn send(&self, datagram: Bytes) -> Result<(), ChannelError> {
        if self.link.is_closed() {
            return Err(ChannelError::Closed);
        }
        if datagram.len() > self.mtu {
            return Err(ChannelError::TooLarge {
                len: datagram.len(),
                mtu: self.mtu,
            });
        }
        self.outbound.send(datagram).map_err(|_| ChannelError::Closed)
    }

    fn on_message(&self, handler: DatagramHandler) {
        let handler: Arc<dyn Fn(Bytes) + Send + Sync> = Arc::from(handler);
        let early = {
            let mut state = self.inbound.state.lock();
            state.handler = Some(handler.clone());
            std::mem::take(&mut state.early)
        };
        for datagram in early {
            handler(datagram);
        }
    }

    fn close(&self) {
        self.link.close();
    }
}
