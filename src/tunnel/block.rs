//! Blocks and segmentation
//!
//! Stream records queue up in a [`Segmenter`]; each block packs whole
//! records up to `max_payload`, splitting only a record that could never
//! fit on its own.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use tokio::time::Instant;

/// Sequenced chunk of the session byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelBlock {
    pub sequence: u64,
    pub payload: Bytes,
}

impl TunnelBlock {
    pub fn new(sequence: u64, payload: Bytes) -> Self {
        Self { sequence, payload }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Cut `data` into payloads of at most `max_payload` bytes
pub fn segment(data: &[u8], max_payload: usize) -> Vec<Bytes> {
    let max_payload = max_payload.max(1);
    data.chunks(max_payload).map(Bytes::copy_from_slice).collect()
}

/// Outbound record queue
#[derive(Debug)]
pub struct Segmenter {
    records: VecDeque<Bytes>,
    queued: usize,
    /// When the oldest queued byte arrived
    oldest_at: Option<Instant>,
    max_payload: usize,
}

impl Segmenter {
    pub fn new(max_payload: usize) -> Self {
        Self {
            records: VecDeque::new(),
            queued: 0,
            oldest_at: None,
            max_payload: max_payload.max(1),
        }
    }

    pub fn push(&mut self, record: Bytes) {
        if record.is_empty() {
            return;
        }
        if self.oldest_at.is_none() {
            self.oldest_at = Some(Instant::now());
        }
        self.queued += record.len();
        self.records.push_back(record);
    }

    /// Bytes waiting to be cut into blocks
    pub fn queued(&self) -> usize {
        self.queued
    }

    pub fn is_empty(&self) -> bool {
        self.queued == 0
    }

    /// When a partial block becomes due, if anything is queued
    pub fn due_at(&self, send_delay: std::time::Duration) -> Option<Instant> {
        if self.queued >= self.max_payload {
            return Some(self.oldest_at.unwrap_or_else(Instant::now));
        }
        self.oldest_at.map(|t| t + send_delay)
    }

    /// A block may be cut now: a full one is queued, or the oldest byte
    /// has waited `send_delay`
    pub fn ready(&self, now: Instant, send_delay: std::time::Duration) -> bool {
        self.due_at(send_delay).is_some_and(|at| now >= at)
    }

    /// Next block payload
    pub fn next_payload(&mut self) -> Option<Bytes> {
        let first = self.records.front_mut()?;

        let payload = if first.len() >= self.max_payload {
            let head = first.split_to(self.max_payload);
            if first.is_empty() {
                self.records.pop_front();
            }
            head
        } else {
            let mut buf = BytesMut::with_capacity(self.max_payload.min(self.queued));
            while let Some(record) = self.records.front() {
                if buf.len() + record.len() > self.max_payload {
                    break;
                }
                buf.extend_from_slice(record);
                self.records.pop_front();
            }
            buf.freeze()
        };

        self.queued -= payload.len();
        if self.queued == 0 {
            self.oldest_at = None;
        }
        Some(payload)
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.queued = 0;
        self.oldest_at = None;
    }
}
