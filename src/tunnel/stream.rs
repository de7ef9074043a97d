//! Per-stream command ordering and flow control

use super::{FrameBody, TunnelError};
use std::collections::BTreeMap;

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Stream is open and active
    Open,
    /// Local side has closed
    HalfClosedLocal,
    /// Remote side has closed
    HalfClosedRemote,
    /// Stream is fully closed
    Closed,
}

/// One logical connection inside the session
#[derive(Debug)]
pub struct TunnelStream {
    id: u32,
    state: StreamState,
    destination: String,
    /// Next outbound command sequence (create took 0)
    next_cmd_seq: u32,
    /// Next inbound command sequence to process
    next_recv_seq: u32,
    /// Inbound commands that arrived ahead of `next_recv_seq`
    pending: BTreeMap<u32, FrameBody>,
    /// Data bytes written by the local side
    sent_position: u64,
    /// Bytes the peer reports having consumed
    remote_acked: u64,
    /// Data bytes handed to the local reader
    consumed_position: u64,
    /// Position carried by our last ack command
    acked_position: u64,
    windows_size: u64,
    windows_ack: u64,
}

impl TunnelStream {
    pub fn new(id: u32, destination: String, windows_size: u32, windows_ack: u32) -> Self {
        Self {
            id,
            state: StreamState::Open,
            destination,
            next_cmd_seq: 1,
            next_recv_seq: 1,
            pending: BTreeMap::new(),
            sent_position: 0,
            remote_acked: 0,
            consumed_position: 0,
            acked_position: 0,
            windows_size: windows_size as u64,
            windows_ack: windows_ack as u64,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn sent_position(&self) -> u64 {
        self.sent_position
    }

    pub fn remote_acked(&self) -> u64 {
        self.remote_acked
    }

    /// Allocate the sequence for the next outbound command
    pub fn next_seq(&mut self) -> u32 {
        let seq = self.next_cmd_seq;
        self.next_cmd_seq = self.next_cmd_seq.wrapping_add(1);
        seq
    }

    /// Unacknowledged bytes are below the stream window
    pub fn can_send(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedRemote)
            && self.sent_position.saturating_sub(self.remote_acked) < self.windows_size
    }

    pub fn can_recv(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// Account for `len` bytes queued for the peer
    pub fn record_sent(&mut self, len: usize) -> Result<(), TunnelError> {
        if !matches!(self.state, StreamState::Open | StreamState::HalfClosedRemote) {
            return Err(TunnelError::StreamClosed);
        }
        self.sent_position += len as u64;
        Ok(())
    }

    /// Peer ack; returns true when it freed window space
    pub fn on_remote_ack(&mut self, position: u64) -> bool {
        if position > self.remote_acked {
            self.remote_acked = position;
            true
        } else {
            false
        }
    }

    /// The local reader took `len` bytes; returns the position to ack once
    /// enough has been consumed
    pub fn consume(&mut self, len: usize) -> Option<u64> {
        self.consumed_position += len as u64;
        if self.consumed_position - self.acked_position > self.windows_ack {
            self.acked_position = self.consumed_position;
            Some(self.consumed_position)
        } else {
            None
        }
    }

    /// Queue an inbound command and release every command now in order
    pub fn reorder(&mut self, seq: u32, body: FrameBody) -> Vec<FrameBody> {
        if seq < self.next_recv_seq {
            return Vec::new();
        }
        self.pending.entry(seq).or_insert(body);

        let mut ready = Vec::new();
        while let Some(body) = self.pending.remove(&self.next_recv_seq) {
            self.next_recv_seq += 1;
            ready.push(body);
        }
        ready
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Close local side
    pub fn close_local(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            _ => self.state,
        };
    }

    /// Close remote side
    pub fn close_remote(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            _ => self.state,
        };
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn stream() -> TunnelStream {
        TunnelStream::new(1, "example.com:443".into(), 100, 40)
    }

    #[test]
    fn test_stream_states() {
        let mut stream = stream();
        assert_eq!(stream.state(), StreamState::Open);

        stream.close_local();
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);
        assert!(!stream.can_send());
        assert!(stream.can_recv());
        assert!(matches!(stream.record_sent(1), Err(TunnelError::StreamClosed)));

        stream.close_remote();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.is_closed());
    }

    #[test]
    fn test_send_window() {
        let mut stream = stream();
        assert_eq!(stream.next_seq(), 1);
        assert_eq!(stream.next_seq(), 2);

        stream.record_sent(100).unwrap();
        assert!(!stream.can_send());

        assert!(stream.on_remote_ack(30));
        assert!(stream.can_send());
        assert!(!stream.on_remote_ack(10));
        assert_eq!(stream.remote_acked(), 30);
    }

    #[test]
    fn test_ack_threshold() {
        let mut stream = stream();
        assert_eq!(stream.consume(40), None);
        assert_eq!(stream.consume(1), Some(41));
        assert_eq!(stream.consume(40), None);
        assert_eq!(stream.consume(10), Some(91));
    }

    #[test]
    fn test_commands_reordered() {
        let mut stream = stream();
        let data = |s: &'static [u8]| FrameBody::Data(Bytes::from_static(s));

        assert!(stream.reorder(2, data(b"b")).is_empty());
        assert!(stream.reorder(3, FrameBody::Close("eof".into())).is_empty());
        assert_eq!(stream.pending_count(), 2);

        let ready = stream.reorder(1, data(b"a"));
        assert_eq!(
            ready,
            vec![data(b"a"), data(b"b"), FrameBody::Close("eof".into())]
        );
        // duplicate of an already processed command
        assert!(stream.reorder(2, data(b"b")).is_empty());
        assert_eq!(stream.pending_count(), 0);
    }
}
