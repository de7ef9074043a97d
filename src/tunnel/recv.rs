//! Receive side reordering

use super::TunnelError;
use crate::protocol::AckInfo;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// Inbound block reassembly
///
/// Payload for `next_expected` is handed out as soon as it is present;
/// anything above it waits in `out_of_order`.
#[derive(Debug)]
pub struct RecvBuffer {
    next_expected: u64,
    out_of_order: BTreeMap<u64, Bytes>,
    /// Bytes parked in `out_of_order`
    buffered: usize,
    max_buffered: usize,
    /// Sequences asked for again, with the last time they were requested
    download_timeouts: HashMap<u64, Option<Instant>>,
}

impl RecvBuffer {
    pub fn new(max_buffered: usize) -> Self {
        Self::with_start(1, max_buffered)
    }

    pub fn with_start(first_sequence: u64, max_buffered: usize) -> Self {
        Self {
            next_expected: first_sequence,
            out_of_order: BTreeMap::new(),
            buffered: 0,
            max_buffered,
            download_timeouts: HashMap::new(),
        }
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    pub fn buffered(&self) -> usize {
        self.buffered
    }

    pub fn pending_count(&self) -> usize {
        self.out_of_order.len()
    }

    pub fn is_received(&self, sequence: u64) -> bool {
        sequence < self.next_expected || self.out_of_order.contains_key(&sequence)
    }

    /// Store an inbound block. `Ok(false)` for a duplicate.
    ///
    /// A block that would push the out-of-order buffer past its limit is
    /// refused with `RecvOverflow`; it stays unacked and the peer resends it.
    pub fn put(&mut self, sequence: u64, payload: Bytes) -> Result<bool, TunnelError> {
        if self.is_received(sequence) {
            return Ok(false);
        }
        if sequence != self.next_expected && self.buffered + payload.len() > self.max_buffered {
            return Err(TunnelError::RecvOverflow);
        }
        self.download_timeouts.remove(&sequence);
        self.buffered += payload.len();
        self.out_of_order.insert(sequence, payload);
        Ok(true)
    }

    /// Contiguous payloads from `next_expected` on, in order
    pub fn pop_ready(&mut self) -> Vec<Bytes> {
        let mut ready = Vec::new();
        while let Some(payload) = self.out_of_order.remove(&self.next_expected) {
            self.buffered -= payload.len();
            self.next_expected += 1;
            ready.push(payload);
        }
        ready
    }

    /// Ack for everything received so far, at most `max_selective` entries
    pub fn ack_info(&self, max_selective: usize) -> AckInfo {
        AckInfo {
            next_expected: self.next_expected,
            selective: self.out_of_order.keys().take(max_selective).copied().collect(),
        }
    }

    /// The server sent `sequence` long ago and it never arrived
    pub fn mark_download_timeout(&mut self, sequence: u64) {
        if !self.is_received(sequence) {
            self.download_timeouts.entry(sequence).or_insert(None);
        }
    }

    /// Sequences to re-request now; each is requested at most once per
    /// `interval`
    pub fn download_timeout_list(&mut self, now: Instant, interval: Duration) -> Vec<u64> {
        let next_expected = self.next_expected;
        self.download_timeouts.retain(|seq, _| *seq >= next_expected);

        let mut list: Vec<u64> = self
            .download_timeouts
            .iter_mut()
            .filter(|(_, last)| last.map_or(true, |at| now.duration_since(at) >= interval))
            .map(|(seq, last)| {
                *last = Some(now);
                *seq
            })
            .collect();
        list.sort_unstable();
        list
    }

    pub fn has_download_timeouts(&self) -> bool {
        !self.download_timeouts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(buf: &mut RecvBuffer) -> Vec<u8> {
        buf.pop_ready().iter().flat_map(|b| b.iter().copied()).collect()
    }

    #[test]
    fn test_out_of_order_arrival() {
        let mut buf = RecvBuffer::with_start(0, 1024);
        let payloads = [b"zero".as_slice(), b"one", b"two"];

        assert!(buf.put(2, Bytes::from_static(payloads[2])).unwrap());
        assert!(drain(&mut buf).is_empty());

        assert!(buf.put(0, Bytes::from_static(payloads[0])).unwrap());
        assert_eq!(drain(&mut buf), b"zero");
        assert_eq!(buf.next_expected(), 1);

        assert!(buf.put(1, Bytes::from_static(payloads[1])).unwrap());
        assert_eq!(drain(&mut buf), b"onetwo");
        assert_eq!(buf.next_expected(), 3);
        assert_eq!(buf.buffered(), 0);
    }

    #[test]
    fn test_every_arrival_order_delivers_in_sequence() {
        let blocks: Vec<(u64, Bytes)> = (1..=4u64)
            .map(|s| (s, Bytes::from(vec![s as u8; s as usize])))
            .collect();
        let expected: Vec<u8> = blocks.iter().flat_map(|(_, b)| b.iter().copied()).collect();

        let orders: [[usize; 4]; 6] = [
            [0, 1, 2, 3],
            [3, 2, 1, 0],
            [1, 3, 0, 2],
            [2, 0, 3, 1],
            [3, 0, 2, 1],
            [1, 0, 3, 2],
        ];
        for order in orders {
            let mut buf = RecvBuffer::new(1024);
            let mut delivered = Vec::new();
            for i in order {
                let (seq, payload) = &blocks[i];
                buf.put(*seq, payload.clone()).unwrap();
                // duplicates are ignored
                assert!(!buf.put(*seq, payload.clone()).unwrap());
                delivered.extend(drain(&mut buf));
            }
            assert_eq!(delivered, expected, "order {:?}", order);
        }
    }

    #[test]
    fn test_ack_info() {
        let mut buf = RecvBuffer::new(1024);
        buf.put(1, Bytes::from_static(b"a")).unwrap();
        buf.put(3, Bytes::from_static(b"c")).unwrap();
        buf.put(5, Bytes::from_static(b"e")).unwrap();
        buf.pop_ready();

        let ack = buf.ack_info(16);
        assert_eq!(ack.next_expected, 2);
        assert_eq!(ack.selective, vec![3, 5]);
        assert_eq!(buf.ack_info(1).selective, vec![3]);
    }

    #[test]
    fn test_overflow_refuses_out_of_order_only() {
        let mut buf = RecvBuffer::new(4);
        buf.put(3, Bytes::from_static(b"abcd")).unwrap();
        assert!(matches!(
            buf.put(2, Bytes::from_static(b"x")),
            Err(TunnelError::RecvOverflow)
        ));
        // the expected block is always accepted
        assert!(buf.put(1, Bytes::from_static(b"next")).unwrap());
        assert_eq!(buf.pop_ready().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_timeouts_throttled() {
        let interval = Duration::from_secs(4);
        let mut buf = RecvBuffer::new(1024);
        buf.mark_download_timeout(2);
        buf.mark_download_timeout(1);

        assert_eq!(buf.download_timeout_list(Instant::now(), interval), vec![1, 2]);
        assert!(buf.download_timeout_list(Instant::now(), interval).is_empty());

        buf.put(1, Bytes::from_static(b"a")).unwrap();
        buf.pop_ready();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(buf.download_timeout_list(Instant::now(), interval), vec![2]);
    }
}
