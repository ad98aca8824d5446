//! Message transport over one raw data channel
//!
//! Outbound messages are split into frames and handed to the channel without
//! any acknowledgement or ordering. Inbound datagrams are decoded and fed to a
//! reassembly table; complete messages go to the installed handler.

use crate::config::TransportConfig;
use crate::engine::{ChannelError, RawChannel};
use bytes::Bytes;
use ledgerlink_core::framing::{split_message, FrameCodec, MAX_FRAME_LEN};
use ledgerlink_core::reassembly::{Reassembled, ReassemblyTable};
use ledgerlink_core::types::PeerId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Handler for complete inbound messages
pub type MessageHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Transport counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub frames_sent: u64,
    pub messages_received: u64,
    pub frames_received: u64,
    /// Frames whose index was already received
    pub duplicate_frames: u64,
    /// Malformed or rejected frames
    pub dropped_frames: u64,
    /// Partial messages evicted by capacity or age
    pub evicted_messages: u64,
    /// Partial messages currently held
    pub pending_messages: usize,
}

#[derive(Default)]
struct Counters {
    messages_sent: AtomicU64,
    frames_sent: AtomicU64,
    messages_received: AtomicU64,
    frames_received: AtomicU64,
    duplicate_frames: AtomicU64,
    dropped_frames: AtomicU64,
}

#[derive(Default)]
struct Delivery {
    handler: Option<MessageHandler>,
    backlog: VecDeque<Bytes>,
    /// The backlog is being handed to the handler; new messages queue behind it
    draining: bool,
}

/// Framed message transport bound to one remote peer
pub struct ChannelTransport {
    remote: PeerId,
    channel: Arc<dyn RawChannel>,
    max_backlog: usize,
    max_message_bytes: usize,
    next_message_id: AtomicU32,
    reassembly: Mutex<ReassemblyTable>,
    delivery: Mutex<Delivery>,
    counters: Counters,
    closed: AtomicBool,
}

impl ChannelTransport {
    /// Wrap a raw channel and take over its inbound datagrams
    pub fn new(
        remote: PeerId,
        channel: Arc<dyn RawChannel>,
        config: &TransportConfig,
    ) -> Result<Arc<Self>, ChannelError> {
        let mtu = channel.max_datagram_size();
        if mtu < MAX_FRAME_LEN {
            return Err(ChannelError::MtuTooSmall {
                mtu,
                required: MAX_FRAME_LEN,
            });
        }

        let transport = Arc::new(Self {
            remote,
            channel: channel.clone(),
            max_backlog: config.max_backlog,
            max_message_bytes: config.reassembly.max_message_bytes,
            next_message_id: AtomicU32::new(config.first_message_id),
            reassembly: Mutex::new(ReassemblyTable::new(config.reassembly.clone())),
            delivery: Mutex::new(Delivery::default()),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&transport);
        channel.on_message(Box::new(move |datagram| {
            if let Some(transport) = weak.upgrade() {
                transport.handle_datagram(&datagram);
            }
        }));

        debug!("Channel transport to {} ready on '{}'", remote, channel.label());
        Ok(transport)
    }

    /// Remote peer
    pub fn remote(&self) -> PeerId {
        self.remote
    }

    /// Send a message of any length. Never waits; returns the message id.
    pub fn send_message(&self, message: impl Into<Bytes>) -> Result<u32, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let message = message.into();
        if message.len() > self.max_message_bytes {
            return Err(ChannelError::MessageTooLarge {
                len: message.len(),
                max: self.max_message_bytes,
            });
        }
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let frames = split_message(message_id, &message).map_err(|e| ChannelError::Framing(e.to_string()))?;

        let mut codec = FrameCodec::new();
        let count = frames.len() as u64;
        for frame in frames {
            let datagram = codec
                .encode_frame(frame)
                .map_err(|e| ChannelError::Framing(e.to_string()))?;
            self.channel.send(datagram)?;
        }

        self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.counters.frames_sent.fetch_add(count, Ordering::Relaxed);
        trace!(
            "Sent message {} to {} ({} bytes, {} frames)",
            message_id,
            self.remote,
            message.len(),
            count
        );
        Ok(message_id)
    }

    /// Install the handler for complete messages.
    ///
    /// Messages completed before installation are delivered first, in
    /// completion order. Replaces any previous handler.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        {
            let mut delivery = self.delivery.lock();
            delivery.handler = Some(Arc::new(handler));
            if delivery.draining {
                return;
            }
            delivery.draining = true;
        }

        loop {
            let (handler, backlog) = {
                let mut delivery = self.delivery.lock();
                match delivery.handler.clone() {
                    Some(handler) if !delivery.backlog.is_empty() => (handler, std::mem::take(&mut delivery.backlog)),
                    _ => {
                        delivery.draining = false;
                        return;
                    }
                }
            };
            for message in backlog {
                handler(message);
            }
        }
    }

    /// Feed one inbound datagram
    pub fn handle_datagram(&self, datagram: &[u8]) {
        if self.is_closed() {
            return;
        }
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);

        let frame = match FrameCodec::new().decode_datagram(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping malformed frame from {}: {}", self.remote, e);
                return;
            }
        };

        let outcome = self.reassembly.lock().insert(frame, Instant::now());
        match outcome {
            Ok(Reassembled::Pending) => {}
            Ok(Reassembled::Duplicate) => {
                self.counters.duplicate_frames.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Reassembled::Complete { message_id, message }) => {
                self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
                trace!(
                    "Received message {} from {} ({} bytes)",
                    message_id,
                    self.remote,
                    message.len()
                );
                self.deliver(message);
            }
            Err(e) => {
                self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping frame from {}: {}", self.remote, e);
            }
        }
    }

    fn deliver(&self, message: Bytes) {
        let handler = {
            let mut delivery = self.delivery.lock();
            match delivery.handler.clone() {
                Some(handler) if !delivery.draining => handler,
                _ => {
                    if delivery.backlog.len() >= self.max_backlog {
                        warn!("Message backlog for {} full, dropping oldest", self.remote);
                        delivery.backlog.pop_front();
                    }
                    delivery.backlog.push_back(message);
                    return;
                }
            }
        };
        handler(message);
    }

    /// Drop partial messages past their time-to-live
    pub fn evict_expired(&self, now: Instant) -> usize {
        let evicted = self.reassembly.lock().evict_expired(now);
        if evicted > 0 {
            debug!("Evicted {} stale partial messages from {}", evicted, self.remote);
        }
        evicted
    }

    /// Partial messages currently held
    pub fn pending_messages(&self) -> usize {
        self.reassembly.lock().pending_count()
    }

    pub fn stats(&self) -> TransportStats {
        let (evicted_messages, pending_messages) = {
            let table = self.reassembly.lock();
            (table.evicted_count(), table.pending_count())
        };
        TransportStats {
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
            duplicate_frames: self.counters.duplicate_frames.load(Ordering::Relaxed),
            dropped_frames: self.counters.dropped_frames.load(Ordering::Relaxed),
            evicted_messages,
            pending_messages,
        }
    }

    /// Close the transport and its channel
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reassembly.lock().clear();
        self.delivery.lock().backlog.clear();
        self.channel.close();
        debug!("Channel transport to {} closed", self.remote);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("remote", &self.remote)
            .field("label", &self.channel.label())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DatagramHandler;
    use ledgerlink_core::framing::{FRAME_HEADER_LEN, FRAME_PAYLOAD_SIZE};
    use rand::seq::SliceRandom;

    /// Channel that records outbound datagrams
    struct RecordingChannel {
        mtu: usize,
        sent: Mutex<Vec<Bytes>>,
        handler: Mutex<Option<DatagramHandler>>,
        closed: AtomicBool,
    }

    impl RecordingChannel {
        fn new(mtu: usize) -> Arc<Self> {
            Arc::new(Self {
                mtu,
                sent: Mutex::new(Vec::new()),
                handler: Mutex::new(None),
                closed: AtomicBool::new(false),
            })
        }

        fn take_sent(&self) -> Vec<Bytes> {
            std::mem::take(&mut *self.sent.lock())
        }

        fn inject(&self, datagram: Bytes) {
            if let Some(handler) = self.handler.lock().as_ref() {
                handler(datagram);
            }
        }
    }

    impl RawChannel for RecordingChannel {
        fn label(&self) -> &str {
            "test"
        }

        fn max_datagram_size(&self) -> usize {
            self.mtu
        }

        fn send(&self, datagram: Bytes) -> Result<(), ChannelError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ChannelError::Closed);
            }
            if datagram.len() > self.mtu {
                return Err(ChannelError::TooLarge {
                    len: datagram.len(),
                    mtu: self.mtu,
                });
            }
            self.sent.lock().push(datagram);
            Ok(())
        }

        fn on_message(&self, handler: DatagramHandler) {
            *self.handler.lock() = Some(handler);
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn transport(config: &TransportConfig) -> (Arc<ChannelTransport>, Arc<RecordingChannel>) {
        let channel = RecordingChannel::new(MAX_FRAME_LEN);
        let transport = ChannelTransport::new(PeerId([7; 32]), channel.clone(), config).unwrap();
        (transport, channel)
    }

    fn collector(transport: &ChannelTransport) -> Arc<Mutex<Vec<Bytes>>> {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        transport.on_message(move |message| sink.lock().push(message));
        received
    }

    fn message(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i * 31 % 256) as u8).collect::<Vec<u8>>())
    }

    #[test]
    fn test_message_id_wraps() {
        let (tx, channel) = transport(&TransportConfig {
            first_message_id: u32::MAX,
            ..Default::default()
        });

        assert_eq!(tx.send_message(Bytes::from_static(b"a")).unwrap(), u32::MAX);
        assert_eq!(tx.send_message(Bytes::from_static(b"b")).unwrap(), 0);

        let sent = channel.take_sent();
        assert_eq!(&sent[0][..4], &[0xff, 0xff, 0xff, 0xff]);
        assert_eq!(&sent[1][..4], &[0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_first_message_id_is_one() {
        let (tx, _channel) = transport(&TransportConfig::default());
        assert_eq!(tx.send_message(Bytes::new()).unwrap(), 1);
        assert_eq!(tx.send_message(Bytes::new()).unwrap(), 2);
    }

    #[test]
    fn test_send_splits_into_frames() {
        let (tx, channel) = transport(&TransportConfig::default());
        tx.send_message(message(FRAME_PAYLOAD_SIZE + 1)).unwrap();

        let sent = channel.take_sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].len(), MAX_FRAME_LEN);
        assert_eq!(sent[1].len(), FRAME_HEADER_LEN + 1);

        let stats = tx.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.frames_sent, 2);
    }

    #[test]
    fn test_shuffled_delivery_between_transports() {
        let (tx, tx_channel) = transport(&TransportConfig::default());
        let (rx, rx_channel) = transport(&TransportConfig::default());
        let received = collector(&rx);

        let a = message(3 * 1024 * 1024);
        let b = message(FRAME_PAYLOAD_SIZE);
        let c = Bytes::new();
        tx.send_message(a.clone()).unwrap();
        tx.send_message(b.clone()).unwrap();
        tx.send_message(c.clone()).unwrap();

        let mut datagrams = tx_channel.take_sent();
        datagrams.shuffle(&mut rand::thread_rng());
        for datagram in datagrams {
            rx_channel.inject(datagram);
        }

        let received = received.lock();
        assert_eq!(received.len(), 3);
        assert!(received.contains(&a));
        assert!(received.contains(&b));
        assert!(received.contains(&c));
        assert_eq!(rx.pending_messages(), 0);
    }

    #[test]
    fn test_redelivery_is_absorbed() {
        let (tx, tx_channel) = transport(&TransportConfig::default());
        let (rx, _rx_channel) = transport(&TransportConfig::default());
        let received = collector(&rx);

        let msg = message(FRAME_PAYLOAD_SIZE * 2 + 5);
        tx.send_message(msg.clone()).unwrap();
        let datagrams = tx_channel.take_sent();

        for datagram in datagrams.iter().chain(datagrams.iter()) {
            rx.handle_datagram(datagram);
        }

        assert_eq!(*received.lock(), vec![msg]);
        assert_eq!(rx.stats().duplicate_frames, 3);
        assert_eq!(rx.stats().messages_received, 1);
    }

    #[test]
    fn test_backlog_flushed_on_handler_install() {
        let (tx, tx_channel) = transport(&TransportConfig::default());
        let (rx, _rx_channel) = transport(&TransportConfig::default());

        tx.send_message(Bytes::from_static(b"first")).unwrap();
        tx.send_message(Bytes::from_static(b"second")).unwrap();
        for datagram in tx_channel.take_sent() {
            rx.handle_datagram(&datagram);
        }

        let received = collector(&rx);
        assert_eq!(
            *received.lock(),
            vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]
        );
    }

    #[test]
    fn test_message_completed_during_flush_waits_for_backlog() {
        let (tx, tx_channel) = transport(&TransportConfig::default());
        let (rx, _rx_channel) = transport(&TransportConfig::default());

        tx.send_message(Bytes::from_static(b"first")).unwrap();
        tx.send_message(Bytes::from_static(b"second")).unwrap();
        tx.send_message(Bytes::from_static(b"third")).unwrap();
        let mut sent = tx_channel.take_sent();
        let third = sent.pop().unwrap();
        for datagram in sent {
            rx.handle_datagram(&datagram);
        }

        // The third message completes while the backlog is being handed over
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let feeder = rx.clone();
        rx.on_message(move |message| {
            let first = message == Bytes::from_static(b"first");
            sink.lock().push(message);
            if first {
                feeder.handle_datagram(&third);
            }
        });

        assert_eq!(
            *received.lock(),
            vec![
                Bytes::from_static(b"first"),
                Bytes::from_static(b"second"),
                Bytes::from_static(b"third")
            ]
        );

        tx.send_message(Bytes::from_static(b"fourth")).unwrap();
        rx.handle_datagram(&tx_channel.take_sent()[0]);
        assert_eq!(received.lock().last(), Some(&Bytes::from_static(b"fourth")));
    }

    #[test]
    fn test_oversized_message_rejected_locally() {
        let mut config = TransportConfig::default();
        config.reassembly.max_message_bytes = FRAME_PAYLOAD_SIZE * 2;
        let (tx, channel) = transport(&config);

        assert_eq!(
            tx.send_message(message(FRAME_PAYLOAD_SIZE * 2 + 1)),
            Err(ChannelError::MessageTooLarge {
                len: FRAME_PAYLOAD_SIZE * 2 + 1,
                max: FRAME_PAYLOAD_SIZE * 2,
            })
        );
        assert!(channel.take_sent().is_empty());
        assert_eq!(tx.stats().messages_sent, 0);

        tx.send_message(message(FRAME_PAYLOAD_SIZE * 2)).unwrap();
        assert_eq!(channel.take_sent().len(), 2);
    }

    #[test]
    fn test_malformed_datagrams_dropped() {
        let (rx, _channel) = transport(&TransportConfig::default());
        let received = collector(&rx);

        rx.handle_datagram(&[0u8; 5]);
        // frameCount = 0
        rx.handle_datagram(&[0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0]);
        // frameIndex >= frameCount
        rx.handle_datagram(&[0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 2]);

        assert!(received.lock().is_empty());
        assert_eq!(rx.stats().dropped_frames, 3);
        assert_eq!(rx.pending_messages(), 0);
    }

    #[test]
    fn test_mtu_too_small() {
        let channel = RecordingChannel::new(1200);
        let result = ChannelTransport::new(PeerId([1; 32]), channel, &TransportConfig::default());
        assert!(matches!(
            result,
            Err(ChannelError::MtuTooSmall { mtu: 1200, .. })
        ));
    }

    #[test]
    fn test_close() {
        let (tx, channel) = transport(&TransportConfig::default());
        tx.close();
        tx.close();

        assert!(tx.is_closed());
        assert!(channel.closed.load(Ordering::SeqCst));
        assert_eq!(tx.send_message(Bytes::from_static(b"x")), Err(ChannelError::Closed));
    }
}
