//! Reassembly of framed messages
//!
//! Frames of a message may arrive in any order, more than once, and
//! interleaved with frames of other messages. Pending state is keyed by
//! message id and completion is tracked per frame index.

use crate::framing::{Frame, FRAME_PAYLOAD_SIZE};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Reassembly errors (the offending frame is dropped)
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("Frame count mismatch for message {message_id}: pending {expected}, frame says {got}")]
    FrameCountMismatch {
        message_id: u32,
        expected: u32,
        got: u32,
    },
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Message {message_id} too large: {frames} frames exceeds {max_bytes} bytes")]
    MessageTooLarge {
        message_id: u32,
        frames: u32,
        max_bytes: usize,
    },
}

/// Reassembly limits
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// Largest message accepted from the peer
    pub max_message_bytes: usize,
    /// Maximum partial messages held at once (oldest is evicted beyond this)
    pub max_pending_messages: usize,
    /// Partial messages older than this are evicted (None = never)
    pub pending_ttl_secs: Option<u64>,
    /// Recently completed ids remembered to suppress late duplicates
    pub completed_window: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 64 * 1024 * 1024,
            max_pending_messages: 256,
            pending_ttl_secs: Some(120),
            completed_window: 1024,
        }
    }
}

impl ReassemblyConfig {
    /// Pending message time-to-live
    pub fn pending_ttl(&self) -> Option<Duration> {
        self.pending_ttl_secs.map(Duration::from_secs)
    }
}

/// Fixed-size set of frame indices
#[derive(Clone, Debug)]
pub struct IndexSet {
    words: Vec<u64>,
    capacity: usize,
    count: usize,
}

impl IndexSet {
    /// Create an empty set able to hold indices `0..capacity`
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(64)],
            capacity,
            count: 0,
        }
    }

    /// Insert an index; returns false if it was already present
    pub fn insert(&mut self, index: usize) -> bool {
        debug_assert!(index < self.capacity);
        let (word, bit) = (index / 64, index % 64);
        let mask = 1u64 << bit;
        if self.words[word] & mask != 0 {
            return false;
        }
        self.words[word] |= mask;
        self.count += 1;
        true
    }

    pub fn contains(&self, index: usize) -> bool {
        index < self.capacity && self.words[index / 64] & (1u64 << (index % 64)) != 0
    }

    /// Number of distinct indices present
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Whether every index in `0..capacity` is present
    pub fn is_full(&self) -> bool {
        self.count == self.capacity
    }
}

/// An in-progress message
#[derive(Debug)]
pub struct PendingMessage {
    pub message_id: u32,
    pub frame_count: u32,
    received: IndexSet,
    buffer: Vec<u8>,
    first_seen: Instant,
}

impl PendingMessage {
    fn new(message_id: u32, frame_count: u32, now: Instant) -> Self {
        Self {
            message_id,
            frame_count,
            received: IndexSet::new(frame_count as usize),
            buffer: vec![0u8; frame_count as usize * FRAME_PAYLOAD_SIZE],
            first_seen: now,
        }
    }

    /// Distinct frames received so far
    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    pub fn is_complete(&self) -> bool {
        self.received.is_full()
    }

    /// Merge one frame; returns false for a duplicate index
    fn merge(&mut self, frame: &Frame) -> bool {
        if self.received.contains(frame.frame_index as usize) {
            return false;
        }

        let offset = frame.offset();
        self.buffer[offset..offset + frame.payload.len()].copy_from_slice(&frame.payload);

        if frame.is_final() {
            self.buffer.truncate(offset + frame.payload.len());
        }

        self.received.insert(frame.frame_index as usize)
    }
}

/// Outcome of feeding a frame into the table
#[derive(Debug, PartialEq, Eq)]
pub enum Reassembled {
    /// Frame stored, message still incomplete
    Pending,
    /// Frame index already seen (or message already delivered)
    Duplicate,
    /// Message complete; the entry has been removed
    Complete { message_id: u32, message: Bytes },
}

/// Per-channel table of partial messages
#[derive(Debug)]
pub struct ReassemblyTable {
    config: ReassemblyConfig,
    pending: HashMap<u32, PendingMessage>,
    completed: HashSet<u32>,
    completed_order: VecDeque<u32>,
    evicted: u64,
}

impl ReassemblyTable {
    /// Create a new table
    pub fn new(config: ReassemblyConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            completed: HashSet::new(),
            completed_order: VecDeque::new(),
            evicted: 0,
        }
    }

    /// Feed one frame
    pub fn insert(&mut self, frame: Frame, now: Instant) -> Result<Reassembled, ReassemblyError> {
        frame
            .validate()
            .map_err(|e| ReassemblyError::Malformed(e.to_string()))?;
        let message_id = frame.message_id;

        if self.completed.contains(&message_id) && !self.pending.contains_key(&message_id) {
            return Ok(Reassembled::Duplicate);
        }

        if let Some(entry) = self.pending.get(&message_id) {
            if entry.frame_count != frame.frame_count {
                return Err(ReassemblyError::FrameCountMismatch {
                    message_id,
                    expected: entry.frame_count,
                    got: frame.frame_count,
                });
            }
        } else {
            self.admit(&frame, now)?;
        }

        let Some(entry) = self.pending.get_mut(&message_id) else {
            return Ok(Reassembled::Pending);
        };
        if !entry.merge(&frame) {
            return Ok(Reassembled::Duplicate);
        }
        if !entry.is_complete() {
            return Ok(Reassembled::Pending);
        }

        let Some(entry) = self.pending.remove(&message_id) else {
            return Ok(Reassembled::Pending);
        };
        self.remember_completed(message_id);

        Ok(Reassembled::Complete {
            message_id,
            message: Bytes::from(entry.buffer),
        })
    }

    /// Create the pending entry for a message seen for the first time
    fn admit(&mut self, frame: &Frame, now: Instant) -> Result<(), ReassemblyError> {
        let max_frames = self.config.max_message_bytes.div_ceil(FRAME_PAYLOAD_SIZE).max(1);
        if frame.frame_count as usize > max_frames {
            return Err(ReassemblyError::MessageTooLarge {
                message_id: frame.message_id,
                frames: frame.frame_count,
                max_bytes: self.config.max_message_bytes,
            });
        }

        if self.pending.len() >= self.config.max_pending_messages {
            let oldest = self
                .pending
                .values()
                .min_by_key(|m| m.first_seen)
                .map(|m| m.message_id);
            if let Some(oldest) = oldest {
                debug!("Reassembly table full, evicting message {}", oldest);
                self.pending.remove(&oldest);
                self.evicted += 1;
            }
        }

        self.pending.insert(
            frame.message_id,
            PendingMessage::new(frame.message_id, frame.frame_count, now),
        );
        Ok(())
    }

    fn remember_completed(&mut self, message_id: u32) {
        if self.config.completed_window == 0 {
            return;
        }
        if self.completed.insert(message_id) {
            self.completed_order.push_back(message_id);
        }
        while self.completed_order.len() > self.config.completed_window {
            if let Some(old) = self.completed_order.pop_front() {
                self.completed.remove(&old);
            }
        }
    }

    /// Drop partial messages older than the configured TTL
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let Some(ttl) = self.config.pending_ttl() else {
            return 0;
        };

        let before = self.pending.len();
        self.pending
            .retain(|_, m| now.saturating_duration_since(m.first_seen) < ttl);
        let evicted = before - self.pending.len();
        self.evicted += evicted as u64;
        evicted
    }

    /// Get a pending entry
    pub fn get(&self, message_id: u32) -> Option<&PendingMessage> {
        self.pending.get(&message_id)
    }

    /// Number of partial messages
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Total partial messages evicted so far
    pub fn evicted_count(&self) -> u64 {
        self.evicted
    }

    /// Drop all partial state
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

impl Default for ReassemblyTable {
    fn default() -> Self {
        Self::new(ReassemblyConfig::default())
    }
}
