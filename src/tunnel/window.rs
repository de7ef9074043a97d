//! Send window: unacknowledged blocks, acks and retransmission
//!
//! Invariants: `base <= next`, and the payload bytes of unacked blocks
//! never exceed `window_size`.

use super::{TunnelBlock, TunnelError};
use crate::protocol::AckInfo;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Unacked {
    block: TunnelBlock,
    sent_at: Option<Instant>,
    /// Failed sends so far
    retry_count: u32,
    /// Waiting to be (re)sent
    due: bool,
}

#[derive(Debug)]
pub struct SendWindow {
    base: u64,
    next: u64,
    unacked: BTreeMap<u64, Unacked>,
    window_size: usize,
    bytes: usize,
}

impl SendWindow {
    /// Window whose first sequence is 1
    pub fn new(window_size: usize) -> Self {
        Self::with_start(1, window_size)
    }

    pub fn with_start(first_sequence: u64, window_size: usize) -> Self {
        Self {
            base: first_sequence,
            next: first_sequence,
            unacked: BTreeMap::new(),
            window_size,
            bytes: 0,
        }
    }

    /// Lowest unacknowledged sequence
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Sequence the next pushed block gets
    pub fn next_sequence(&self) -> u64 {
        self.next
    }

    /// Unacknowledged payload bytes
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn unacked_count(&self) -> usize {
        self.unacked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unacked.is_empty()
    }

    pub fn has_room(&self, len: usize) -> bool {
        self.bytes + len <= self.window_size
    }

    /// Assign the next sequence to `payload`
    pub fn push(&mut self, payload: Bytes) -> Result<u64, TunnelError> {
        if !self.has_room(payload.len()) {
            return Err(TunnelError::WindowFull);
        }
        let sequence = self.next;
        self.next += 1;
        self.bytes += payload.len();
        self.unacked.insert(
            sequence,
            Unacked {
                block: TunnelBlock::new(sequence, payload),
                sent_at: None,
                retry_count: 0,
                due: true,
            },
        );
        Ok(sequence)
    }

    pub fn has_due(&self) -> bool {
        self.unacked.values().any(|u| u.due)
    }

    /// Due blocks in sequence order, up to `max_bytes` (at least one);
    /// they count as sent at `now`
    pub fn take_due(&mut self, max_bytes: usize, now: Instant) -> Vec<TunnelBlock> {
        let mut blocks = Vec::new();
        let mut total = 0;
        for entry in self.unacked.values_mut().filter(|u| u.due) {
            if !blocks.is_empty() && total + entry.block.len() > max_bytes {
                break;
            }
            total += entry.block.len();
            entry.due = false;
            entry.sent_at = Some(now);
            blocks.push(entry.block.clone());
        }
        blocks
    }

    fn check_sent(&self, sequence: u64) -> Result<(), TunnelError> {
        if sequence >= self.next {
            return Err(TunnelError::AckOutOfRange {
                sequence,
                next: self.next,
            });
        }
        Ok(())
    }

    fn remove(&mut self, sequence: u64) -> bool {
        match self.unacked.remove(&sequence) {
            Some(entry) => {
                self.bytes -= entry.block.len();
                true
            }
            None => false,
        }
    }

    /// Everything below `next_expected` has arrived
    pub fn ack_cumulative(&mut self, next_expected: u64) -> Result<usize, TunnelError> {
        if next_expected > self.next {
            return Err(TunnelError::AckOutOfRange {
                sequence: next_expected - 1,
                next: self.next,
            });
        }
        let acked: Vec<u64> = self.unacked.range(..next_expected).map(|(s, _)| *s).collect();
        for seq in &acked {
            self.remove(*seq);
        }
        self.base = self.base.max(next_expected);
        Ok(acked.len())
    }

    pub fn ack_selective(&mut self, sequences: &[u64]) -> Result<usize, TunnelError> {
        let mut acked = 0;
        for seq in sequences {
            self.check_sent(*seq)?;
            if self.remove(*seq) {
                acked += 1;
            }
        }
        Ok(acked)
    }

    /// Apply a peer ack; referencing an unsent sequence is a protocol error
    pub fn apply(&mut self, ack: &AckInfo) -> Result<usize, TunnelError> {
        let mut acked = self.ack_cumulative(ack.next_expected)?;
        acked += self.ack_selective(&ack.selective)?;
        if let Some(first) = self.unacked.keys().next() {
            self.base = self.base.max(*first);
        } else {
            self.base = self.next;
        }
        Ok(acked)
    }

    /// A roundtrip carrying these blocks failed: resend them now
    pub fn mark_failed(&mut self, sequences: &[u64]) -> usize {
        let mut marked = 0;
        for seq in sequences {
            if let Some(entry) = self.unacked.get_mut(seq) {
                if !entry.due {
                    entry.due = true;
                    entry.retry_count += 1;
                    marked += 1;
                }
            }
        }
        marked
    }

    /// Mark blocks unacked for `resend_timeout` as due; returns how many
    pub fn sweep(&mut self, now: Instant, resend_timeout: Duration) -> usize {
        let mut marked = 0;
        for entry in self.unacked.values_mut() {
            if entry.due {
                continue;
            }
            if let Some(sent_at) = entry.sent_at {
                if now.duration_since(sent_at) >= resend_timeout {
                    entry.due = true;
                    entry.retry_count += 1;
                    marked += 1;
                }
            }
        }
        marked
    }

    /// First block that has failed `max_retry` times
    pub fn exhausted(&self, max_retry: u32) -> Option<u64> {
        self.unacked
            .iter()
            .find(|(_, u)| u.retry_count >= max_retry)
            .map(|(seq, _)| *seq)
    }

    pub fn retry_count(&self, sequence: u64) -> Option<u32> {
        self.unacked.get(&sequence).map(|u| u.retry_count)
    }

    /// When the earliest in-flight block times out
    pub fn next_timeout(&self, resend_timeout: Duration) -> Option<Instant> {
        self.unacked
            .values()
            .filter(|u| !u.due)
            .filter_map(|u| u.sent_at)
            .min()
            .map(|t| t + resend_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: usize) -> Bytes {
        Bytes::from(vec![0u8; n])
    }

    #[test]
    fn test_window_invariant() {
        let mut w = SendWindow::new(100);
        assert_eq!(w.push(payload(40)).unwrap(), 1);
        assert_eq!(w.push(payload(40)).unwrap(), 2);
        assert!(matches!(w.push(payload(40)), Err(TunnelError::WindowFull)));
        assert!(w.bytes() <= w.window_size());

        w.ack_cumulative(2).unwrap();
        assert_eq!(w.bytes(), 40);
        assert_eq!(w.base(), 2);
        assert_eq!(w.push(payload(60)).unwrap(), 3);
        assert_eq!(w.bytes(), 100);
        assert!(w.base() <= w.next_sequence());
    }

    #[test]
    fn test_acks_in_any_order() {
        let mut w = SendWindow::with_start(0, 1000);
        for _ in 0..5 {
            w.push(payload(10)).unwrap();
        }
        w.take_due(1000, Instant::now());

        w.apply(&AckInfo {
            next_expected: 0,
            selective: vec![3, 1],
        })
        .unwrap();
        assert_eq!(w.unacked_count(), 3);
        assert_eq!(w.base(), 0);

        w.apply(&AckInfo {
            next_expected: 3,
            selective: vec![4],
        })
        .unwrap();
        assert!(w.is_empty());
        assert_eq!(w.base(), 5);
    }

    #[test]
    fn test_ack_for_unsent_block_is_rejected() {
        let mut w = SendWindow::new(1000);
        w.push(payload(1)).unwrap();

        assert!(matches!(
            w.apply(&AckInfo {
                next_expected: 5,
                selective: vec![]
            }),
            Err(TunnelError::AckOutOfRange { .. })
        ));
        assert!(matches!(
            w.ack_selective(&[2]),
            Err(TunnelError::AckOutOfRange { sequence: 2, next: 2 })
        ));
    }

    #[test]
    fn test_take_due_budget() {
        let mut w = SendWindow::new(1000);
        for _ in 0..3 {
            w.push(payload(30)).unwrap();
        }
        let now = Instant::now();
        let first = w.take_due(64, now);
        assert_eq!(first.iter().map(|b| b.sequence).collect::<Vec<_>>(), vec![1, 2]);
        let rest = w.take_due(10, now);
        assert_eq!(rest.len(), 1);
        assert!(!w.has_due());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_after_timeout() {
        let timeout = Duration::from_secs(5);
        let mut w = SendWindow::with_start(5, 1000);
        w.push(Bytes::from_static(b"five")).unwrap();

        let sent = w.take_due(1000, Instant::now());
        assert_eq!(sent[0].sequence, 5);
        assert_eq!(w.sweep(Instant::now(), timeout), 0);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(w.sweep(Instant::now(), timeout), 1);
        assert_eq!(w.retry_count(5), Some(1));

        let resent = w.take_due(1000, Instant::now());
        assert_eq!(resent[0], sent[0]);

        w.ack_cumulative(6).unwrap();
        assert!(w.is_empty());
        assert_eq!(w.base(), 6);
    }

    #[test]
    fn test_retry_exhaustion() {
        let mut w = SendWindow::new(1000);
        let seq = w.push(payload(1)).unwrap();
        for _ in 0..2 {
            w.take_due(1000, Instant::now());
            w.mark_failed(&[seq]);
        }
        assert_eq!(w.exhausted(3), None);
        w.take_due(1000, Instant::now());
        w.mark_failed(&[seq]);
        assert_eq!(w.exhausted(3), Some(seq));
    }
}
