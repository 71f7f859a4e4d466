//! # Multiplexed Streams
//!
//! A [`Stream`] is one logical TCP connection carried over a control link,
//! identified by a 32-bit id scoped to the agent that opened it. The
//! [`StreamRegistry`] owns every live stream for one link; callers hold
//! `Arc` handles, and removal from the registry closes the stream.
//!
//! Inbound bytes flow through a bounded queue. The link dispatcher writes
//! into it (payloads and the single-byte handshake sentinels) and the
//! splicing task drains it into the local socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

/// Handshake sentinel written by the dispatcher on ConnAck.
pub const SENTINEL_CONNACK: u8 = 0x02;

/// Handshake sentinel written by the dispatcher on Error.
pub const SENTINEL_ERROR: u8 = 0x05;

/// Inbound queue depth per stream.
pub const STREAM_QUEUE_DEPTH: usize = 256;

/// One multiplexed logical connection on a control link.
pub struct Stream {
    id: u32,
    target: String,
    inbound_tx: mpsc::Sender<Bytes>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    dropped: AtomicU64,
}

impl Stream {
    pub fn new(id: u32, target: impl Into<String>) -> Arc<Self> {
        Self::with_queue_depth(id, target, STREAM_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(id: u32, target: impl Into<String>, depth: usize) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(depth);
        let (close_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            target: target.into(),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            closed: AtomicBool::new(false),
            close_tx,
            dropped: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Delivers one inbound chunk.
    ///
    /// A closed stream swallows the write and reports `false` without
    /// counting a drop — late frames after Close are benign. On a full queue
    /// the consumer gets one scheduling window to drain before the chunk is
    /// dropped and counted.
    pub async fn write(&self, data: Bytes) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.inbound_tx.try_send(data) {
            Ok(()) => true,
            Err(TrySendError::Closed(_)) => false,
            Err(TrySendError::Full(data)) => {
                tokio::task::yield_now().await;
                if self.closed.load(Ordering::Acquire) {
                    return false;
                }
                match self.inbound_tx.try_send(data) {
                    Ok(()) => true,
                    Err(TrySendError::Closed(_)) => false,
                    Err(TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(stream = self.id, "inbound queue overflow, chunk dropped");
                        false
                    }
                }
            }
        }
    }

    /// Closes the stream. Idempotent; the close signal fires exactly once.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.close_tx.send(true);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Chunks dropped on queue overflow.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Takes the inbound consumer half. Only the first caller gets it; the
    /// splicing task owns the receive side for the stream's lifetime.
    pub fn take_reader(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.inbound_rx.lock().take()
    }

    /// A watch that flips to `true` when the stream closes.
    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }
}

/// Per-link table of live streams.
pub struct StreamRegistry {
    streams: RwLock<HashMap<u32, Arc<Stream>>>,
    next_id: AtomicU32,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(0),
        }
    }

    /// Opens a stream with a fresh locally-assigned id.
    pub fn create(&self, target: impl Into<String>) -> Arc<Stream> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let stream = Stream::new(id, target);
        self.streams.write().insert(id, stream.clone());
        stream
    }

    /// Registers a stream whose id was assigned by the peer (exit side).
    pub fn insert(&self, stream: Arc<Stream>) {
        self.streams.write().insert(stream.id(), stream);
    }

    pub fn get(&self, id: u32) -> Option<Arc<Stream>> {
        self.streams.read().get(&id).cloned()
    }

    /// Removes and closes a stream.
    pub fn remove(&self, id: u32) -> Option<Arc<Stream>> {
        let stream = self.streams.write().remove(&id);
        if let Some(ref s) = stream {
            s.close();
        }
        stream
    }

    /// Closes every stream and empties the table; called on link teardown.
    pub fn close_all(&self) {
        let drained: Vec<_> = {
            let mut map = self.streams.write();
            map.drain().map(|(_, s)| s).collect()
        };
        for stream in drained {
            stream.close();
        }
    }

    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_and_read_in_order() {
        let stream = Stream::new(1, "127.0.0.1:80");
        let mut rx = stream.take_reader().unwrap();
        assert!(stream.write(Bytes::from_static(b"a")).await);
        assert!(stream.write(Bytes::from_static(b"b")).await);
        assert_eq!(rx.recv().await.unwrap().as_ref(), b"a");
        assert_eq!(rx.recv().await.unwrap().as_ref(), b"b");
    }

    #[tokio::test]
    async fn write_after_close_is_benign() {
        let stream = Stream::new(1, "t");
        stream.close();
        assert!(!stream.write(Bytes::from_static(b"late")).await);
        assert_eq!(stream.dropped_messages(), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_signals_once() {
        let stream = Stream::new(1, "t");
        let mut signal = stream.close_signal();
        stream.close();
        stream.close();
        signal.changed().await.unwrap();
        assert!(*signal.borrow());
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn overflow_from_many_writers_counts_every_drop() {
        // Queue of one, pre-filled; 100 concurrent writers all fail.
        let stream = Stream::with_queue_depth(1, "t", 1);
        assert!(stream.write(Bytes::from_static(b"fill")).await);

        let mut tasks = Vec::new();
        for _ in 0..100 {
            let s = stream.clone();
            tasks.push(tokio::spawn(
                async move { s.write(Bytes::from_static(b"x")).await },
            ));
        }
        for task in tasks {
            assert!(!task.await.unwrap());
        }
        assert_eq!(stream.dropped_messages(), 100);
    }

    #[tokio::test]
    async fn reader_can_only_be_taken_once() {
        let stream = Stream::new(1, "t");
        assert!(stream.take_reader().is_some());
        assert!(stream.take_reader().is_none());
    }

    #[test]
    fn registry_assigns_monotonic_ids() {
        let registry = StreamRegistry::new();
        let a = registry.create("x");
        let b = registry.create("y");
        assert!(b.id() > a.id());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn remove_closes_the_stream() {
        let registry = StreamRegistry::new();
        let stream = registry.create("x");
        let removed = registry.remove(stream.id()).unwrap();
        assert!(removed.is_closed());
        assert!(registry.get(stream.id()).is_none());
    }

    #[test]
    fn close_all_empties_the_table() {
        let registry = StreamRegistry::new();
        let a = registry.create("x");
        let b = registry.create("y");
        registry.close_all();
        assert!(a.is_closed() && b.is_closed());
        assert!(registry.is_empty());
    }

    #[test]
    fn insert_registers_peer_assigned_id() {
        let registry = StreamRegistry::new();
        let stream = Stream::new(4242, "target:9");
        registry.insert(stream);
        assert_eq!(registry.get(4242).unwrap().target(), "target:9");
    }
}
