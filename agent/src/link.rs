//! # Agent Control Link
//!
//! The persistent outbound WebSocket to the broker, carrying all tunneled
//! traffic for this agent. The run loop connects, pumps frames until the
//! connection drops, then reconnects with a capped doubling backoff. Data
//! payloads are sealed by the write pump and opened by the read pump; the
//! broker never sees plaintext.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use lattice_protocol::{cipher, marshal, unmarshal, MessageType, StreamRegistry, TunnelMessage};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outbound message queue depth per connection.
pub const SEND_QUEUE_DEPTH: usize = 512;

/// Capped doubling schedule for reconnect delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: None,
        }
    }

    /// The next delay: the initial interval first, then doubling up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.unwrap_or(self.initial).min(self.max);
        self.current = Some((delay * 2).min(self.max));
        delay
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub agent_id: String,
    /// WebSocket endpoint, e.g. `ws://broker:7070/ws`.
    pub endpoint: String,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

/// The agent's one link to the broker.
pub struct ControlLink {
    config: LinkConfig,
    streams: Arc<StreamRegistry>,
    /// Sender into the live connection's write pump; `None` while offline.
    current_tx: RwLock<Option<mpsc::Sender<TunnelMessage>>>,
    connected: AtomicBool,
    reconnect_enabled: AtomicBool,
    shutdown: CancellationToken,
    /// Bumped on every successful (re)connect; the main loop re-registers
    /// rules when it observes a change.
    reconnects_tx: watch::Sender<u64>,
    dropped_sends: AtomicU64,
    invalid_frames: AtomicU64,
}

impl ControlLink {
    /// Spawns the run loop. Returns the link handle plus the inbound message
    /// channel the dispatcher consumes.
    pub fn start(config: LinkConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<TunnelMessage>) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (reconnects_tx, _) = watch::channel(0);
        let link = Arc::new(Self {
            config,
            streams: Arc::new(StreamRegistry::new()),
            current_tx: RwLock::new(None),
            connected: AtomicBool::new(false),
            reconnect_enabled: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            reconnects_tx,
            dropped_sends: AtomicU64::new(0),
            invalid_frames: AtomicU64::new(0),
        });
        tokio::spawn(link.clone().run(in_tx));
        (link, in_rx)
    }

    /// Enqueues a message for the write pump. Returns `false` when offline
    /// or when the bounded queue is full; a full-queue drop is counted.
    pub fn send(&self, msg: TunnelMessage) -> bool {
        let guard = self.current_tx.read();
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        if tx.try_send(msg).is_err() {
            self.dropped_sends.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    pub fn streams(&self) -> &Arc<StreamRegistry> {
        &self.streams
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn dropped_sends(&self) -> u64 {
        self.dropped_sends.load(Ordering::Relaxed)
    }

    /// Malformed frames dropped by the read pump.
    pub fn invalid_frames(&self) -> u64 {
        self.invalid_frames.load(Ordering::Relaxed)
    }

    /// Watch that bumps on every successful (re)connect.
    pub fn reconnects(&self) -> watch::Receiver<u64> {
        self.reconnects_tx.subscribe()
    }

    /// Shuts the link down for good: no further reconnects, the run loop
    /// exits (interrupting any backoff sleep), every stream closes.
    /// Idempotent.
    pub fn close(&self) {
        self.reconnect_enabled.store(false, Ordering::Release);
        self.shutdown.cancel();
        *self.current_tx.write() = None;
        self.streams.close_all();
    }

    async fn run(self: Arc<Self>, in_tx: mpsc::UnboundedSender<TunnelMessage>) {
        let mut backoff = Backoff::new(
            self.config.reconnect_initial,
            self.config.reconnect_max,
        );
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let url = format!(
                "{}?client_id={}",
                self.config.endpoint, self.config.agent_id
            );
            match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    info!(endpoint = %self.config.endpoint, "control link established");
                    backoff.reset();
                    self.run_connection(ws, &in_tx).await;
                    self.connected.store(false, Ordering::Release);
                    *self.current_tx.write() = None;
                    // Streams were multiplexed over the lost connection;
                    // their routes are gone broker-side.
                    self.streams.close_all();
                    warn!("control link lost");
                }
                Err(e) => {
                    warn!(error = %e, "broker connection failed");
                }
            }

            if !self.reconnect_enabled.load(Ordering::Acquire) || self.shutdown.is_cancelled() {
                break;
            }
            let delay = backoff.next_delay();
            info!(delay_secs = delay.as_secs(), "reconnecting");
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_connection<S>(
        &self,
        ws: tokio_tungstenite::WebSocketStream<S>,
        in_tx: &mpsc::UnboundedSender<TunnelMessage>,
    ) where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::channel::<TunnelMessage>(SEND_QUEUE_DEPTH);
        *self.current_tx.write() = Some(tx);
        self.connected.store(true, Ordering::Release);
        self.reconnects_tx.send_modify(|n| *n += 1);

        // Write pump: seals Data payloads, marshals into pooled frames and
        // owns the socket's send half.
        let writer = tokio::spawn(async move {
            while let Some(mut msg) = rx.recv().await {
                if msg.msg_type == MessageType::Data {
                    match cipher().seal(&msg.payload) {
                        Ok(sealed) => msg.payload = sealed,
                        Err(e) => {
                            warn!(error = %e, "payload seal failed, frame dropped");
                            continue;
                        }
                    }
                }
                match marshal(&msg) {
                    Ok(frame) => {
                        if sink.send(Message::Binary(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "marshal failed, frame dropped"),
                }
            }
            let _ = sink.close().await;
        });

        // Read pump: opens Data payloads before handing messages to the
        // dispatcher.
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Binary(frame))) => match unmarshal(&frame) {
                        Ok(mut msg) => {
                            if msg.msg_type == MessageType::Data {
                                match cipher().open(&msg.payload) {
                                    Ok(plain) => msg.payload = plain,
                                    Err(e) => {
                                        warn!(stream = msg.stream_id, error = %e, "frame dropped");
                                        continue;
                                    }
                                }
                            }
                            if in_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            self.invalid_frames.fetch_add(1, Ordering::Relaxed);
                            debug!(error = %e, "invalid frame dropped");
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "read error");
                        break;
                    }
                },
            }
        }

        // Dropping the connection's sender lets the write pump drain and exit.
        *self.current_tx.write() = None;
        let _ = writer.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_the_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn backoff_reset_returns_to_initial() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(backoff.next_delay().as_secs(), 5);
        assert_eq!(backoff.next_delay().as_secs(), 10);
        backoff.reset();
        assert_eq!(backoff.next_delay().as_secs(), 5);
    }

    #[test]
    fn backoff_initial_above_cap_is_clamped() {
        let mut backoff = Backoff::new(Duration::from_secs(90), Duration::from_secs(60));
        assert_eq!(backoff.next_delay().as_secs(), 60);
        assert_eq!(backoff.next_delay().as_secs(), 60);
    }
}
