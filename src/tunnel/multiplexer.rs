//! Stream multiplexer for the tunnel
//!
//! Manages the logical streams carried over one session. Outbound commands
//! collect in a send queue that the session drains into blocks; inbound
//! commands are reordered per stream and delivered over channels.

use super::{Frame, FrameBody, TunnelError, TunnelStream};
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Maximum number of concurrent streams
pub const MAX_STREAMS: usize = 1024;

/// Event delivered to a stream's reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// In-order data from the remote
    Data(Bytes),
    /// Stream closed by remote
    Close(String),
    /// The session failed underneath the stream
    Error(String),
}

/// What handling an inbound frame changed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameOutcome {
    /// A remote ack freed send window
    pub window_opened: bool,
    /// A stream was removed
    pub stream_removed: bool,
}

struct StreamSlot {
    stream: TunnelStream,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
}

/// Stream multiplexer
pub struct Multiplexer {
    streams: HashMap<u32, StreamSlot>,
    /// Next stream ID (odd for client)
    next_stream_id: u32,
    windows_size: u32,
    windows_ack: u32,
    /// Pending frames to send
    send_queue: Vec<Frame>,
}

impl Multiplexer {
    /// Create a client-side multiplexer
    pub fn new_client(windows_size: u32, windows_ack: u32) -> Self {
        Self {
            streams: HashMap::new(),
            next_stream_id: 1,
            windows_size,
            windows_ack,
            send_queue: Vec::new(),
        }
    }

    /// Open a new stream to `host:port` and queue its create command
    pub fn open_stream(
        &mut self,
        host: &str,
        port: u16,
    ) -> Result<(u32, mpsc::UnboundedReceiver<StreamEvent>), TunnelError> {
        if self.streams.len() >= MAX_STREAMS {
            return Err(TunnelError::TooManyStreams(MAX_STREAMS));
        }

        let stream_id = self.next_stream_id;
        self.next_stream_id = self.next_stream_id.wrapping_add(2);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let stream = TunnelStream::new(
            stream_id,
            format!("{}:{}", host, port),
            self.windows_size,
            self.windows_ack,
        );
        self.streams.insert(stream_id, StreamSlot { stream, event_tx });
        self.send_queue.push(Frame::create(stream_id, host, port));

        debug!(stream_id, host, port, "stream opened");
        Ok((stream_id, event_rx))
    }

    /// Whether `stream_id` may queue more data now
    pub fn can_send(&self, stream_id: u32) -> Result<bool, TunnelError> {
        let slot = self
            .streams
            .get(&stream_id)
            .ok_or(TunnelError::StreamNotFound(stream_id))?;
        if !matches!(
            slot.stream.state(),
            super::StreamState::Open | super::StreamState::HalfClosedRemote
        ) {
            return Err(TunnelError::StreamClosed);
        }
        Ok(slot.stream.can_send())
    }

    /// Queue data commands, each carrying at most `max_chunk` bytes
    pub fn send_data(
        &mut self,
        stream_id: u32,
        data: Bytes,
        max_chunk: usize,
    ) -> Result<(), TunnelError> {
        let slot = self
            .streams
            .get_mut(&stream_id)
            .ok_or(TunnelError::StreamNotFound(stream_id))?;
        slot.stream.record_sent(data.len())?;

        let mut rest = data;
        while !rest.is_empty() {
            let chunk = rest.split_to(rest.len().min(max_chunk.max(1)));
            let seq = slot.stream.next_seq();
            self.send_queue.push(Frame::data(stream_id, seq, chunk));
        }
        Ok(())
    }

    /// The reader consumed `len` bytes; queues an ack past the threshold
    pub fn consume(&mut self, stream_id: u32, len: usize) {
        if let Some(slot) = self.streams.get_mut(&stream_id) {
            if let Some(position) = slot.stream.consume(len) {
                let seq = slot.stream.next_seq();
                self.send_queue.push(Frame::ack(stream_id, seq, position));
            }
        }
    }

    /// Handle an incoming frame
    pub fn handle_frame(&mut self, frame: Frame) -> FrameOutcome {
        let mut outcome = FrameOutcome::default();
        let stream_id = frame.stream_id;

        let Some(slot) = self.streams.get_mut(&stream_id) else {
            if matches!(frame.body, FrameBody::Create { .. }) {
                warn!(stream_id, "remote tried to open a stream");
            } else {
                trace!(stream_id, seq = frame.seq, "frame for unknown stream");
            }
            return outcome;
        };

        if let FrameBody::Create { .. } = frame.body {
            warn!(stream_id, "create for an existing stream ignored");
            return outcome;
        }

        for body in slot.stream.reorder(frame.seq, frame.body) {
            match body {
                FrameBody::Data(data) => {
                    if slot.stream.can_recv() {
                        let _ = slot.event_tx.send(StreamEvent::Data(data));
                    }
                }
                FrameBody::Ack(position) => {
                    outcome.window_opened |= slot.stream.on_remote_ack(position);
                }
                FrameBody::Close(reason) => {
                    debug!(stream_id, reason = %reason, "stream closed by remote");
                    slot.stream.close_remote();
                    let _ = slot.event_tx.send(StreamEvent::Close(reason));
                    outcome.window_opened = true;
                }
                FrameBody::Create { .. } => {}
            }
        }

        if slot.stream.is_closed() {
            self.streams.remove(&stream_id);
            outcome.stream_removed = true;
        }
        outcome
    }

    /// Close a stream locally
    ///
    /// Queues a close command; the stream is dropped once both sides closed.
    /// Returns false if there was nothing left to close.
    pub fn close_stream_local(&mut self, stream_id: u32, reason: &str) -> bool {
        let Some(slot) = self.streams.get_mut(&stream_id) else {
            return false;
        };
        if matches!(
            slot.stream.state(),
            super::StreamState::HalfClosedLocal | super::StreamState::Closed
        ) {
            return false;
        }

        let seq = slot.stream.next_seq();
        slot.stream.close_local();
        self.send_queue.push(Frame::close(stream_id, seq, reason));

        if slot.stream.is_closed() {
            self.streams.remove(&stream_id);
        }
        true
    }

    /// Force-remove a stream
    pub fn remove_stream(&mut self, stream_id: u32) {
        self.streams.remove(&stream_id);
    }

    /// End every stream with an EOF
    pub fn close_all(&mut self, reason: &str) {
        for (_, slot) in self.streams.drain() {
            let _ = slot.event_tx.send(StreamEvent::Close(reason.to_string()));
        }
        self.send_queue.clear();
    }

    /// End every stream with an error
    pub fn fail_all(&mut self, error: &str) {
        for (_, slot) in self.streams.drain() {
            let _ = slot.event_tx.send(StreamEvent::Error(error.to_string()));
        }
        self.send_queue.clear();
    }

    /// Get frames ready to send
    pub fn take_send_queue(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.send_queue)
    }

    pub fn has_pending_frames(&self) -> bool {
        !self.send_queue.is_empty()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stream(&self, stream_id: u32) -> Option<&TunnelStream> {
        self.streams.get(&stream_id).map(|s| &s.stream)
    }

    pub fn streams(&self) -> impl Iterator<Item = &TunnelStream> {
        self.streams.values().map(|s| &s.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::StreamState;

    fn mux() -> Multiplexer {
        Multiplexer::new_client(64, 16)
    }

    #[test]
    fn test_stream_ids_are_odd() {
        let mut mux = mux();
        let (a, _ra) = mux.open_stream("a.example", 80).unwrap();
        let (b, _rb) = mux.open_stream("b.example", 443).unwrap();
        assert_eq!((a, b), (1, 3));
        assert_eq!(mux.stream_count(), 2);

        let queued = mux.take_send_queue();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0], Frame::create(1, "a.example", 80));
        assert!(!mux.has_pending_frames());
    }

    #[test]
    fn test_send_data_chunks_and_window() {
        let mut mux = mux();
        let (id, _rx) = mux.open_stream("h", 1).unwrap();
        mux.take_send_queue();

        mux.send_data(id, Bytes::from(vec![7u8; 70]), 32).unwrap();
        let frames = mux.take_send_queue();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames.iter().map(|f| f.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(!mux.can_send(id).unwrap());

        let outcome = mux.handle_frame(Frame::ack(id, 1, 70));
        assert!(outcome.window_opened);
        assert!(mux.can_send(id).unwrap());
    }

    #[tokio::test]
    async fn test_inbound_reordered_and_delivered() {
        let mut mux = mux();
        let (id, mut rx) = mux.open_stream("h", 1).unwrap();

        mux.handle_frame(Frame::data(id, 2, Bytes::from_static(b"world")));
        assert!(rx.try_recv().is_err());
        mux.handle_frame(Frame::data(id, 1, Bytes::from_static(b"hello ")));

        assert_eq!(rx.recv().await, Some(StreamEvent::Data(Bytes::from_static(b"hello "))));
        assert_eq!(rx.recv().await, Some(StreamEvent::Data(Bytes::from_static(b"world"))));

        mux.handle_frame(Frame::close(id, 3, "bye"));
        assert_eq!(rx.recv().await, Some(StreamEvent::Close("bye".into())));
        assert_eq!(mux.stream(id).unwrap().state(), StreamState::HalfClosedRemote);

        assert!(mux.close_stream_local(id, "done"));
        assert!(mux.stream(id).is_none());
        assert!(!mux.close_stream_local(id, "done"));
    }

    #[test]
    fn test_consume_queues_ack() {
        let mut mux = mux();
        let (id, _rx) = mux.open_stream("h", 1).unwrap();
        mux.take_send_queue();

        mux.consume(id, 10);
        assert!(!mux.has_pending_frames());
        mux.consume(id, 10);
        assert_eq!(mux.take_send_queue(), vec![Frame::ack(id, 1, 20)]);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let mut mux = mux();
        let (_, mut rx) = mux.open_stream("h", 1).unwrap();
        mux.fail_all("retry exhausted");
        assert_eq!(mux.stream_count(), 0);
        assert_eq!(rx.recv().await, Some(StreamEvent::Error("retry exhausted".into())));
        assert_eq!(rx.recv().await, None);
    }
}
