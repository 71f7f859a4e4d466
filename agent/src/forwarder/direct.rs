//! # Direct Forwarder
//!
//! Listens on a local address and splices every accepted TCP connection to
//! a target endpoint on this agent — no tunnel involved. Byte counts are
//! named from the rule's outward perspective: client→target is `bytes_out`,
//! target→client is `bytes_in`.

use std::net::SocketAddr;
use std::sync::Arc;

use lattice_protocol::TrafficStats;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{ForwarderSettings, RuleStatus, StatusFn};

pub struct DirectForwarder {
    rule_id: String,
    listen_addr: String,
    target_addr: String,
    settings: ForwarderSettings,
    traffic: Arc<TrafficStats<String>>,
    status: StatusFn,
    stop_token: CancellationToken,
    tasks: TaskTracker,
    stop_guard: Mutex<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl DirectForwarder {
    pub fn new(
        rule_id: String,
        listen_addr: String,
        target_addr: String,
        settings: ForwarderSettings,
        traffic: Arc<TrafficStats<String>>,
        status: StatusFn,
    ) -> Arc<Self> {
        Arc::new(Self {
            rule_id,
            listen_addr,
            target_addr,
            settings,
            traffic,
            status,
            stop_token: CancellationToken::new(),
            tasks: TaskTracker::new(),
            stop_guard: Mutex::new(false),
            local_addr: Mutex::new(None),
        })
    }

    /// The bound listen address, once `start` succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Binds the listen address and enters the accept loop on a tracked
    /// task. The bind outcome is reported through the status callback; a
    /// bind failure is also returned and never retried here.
    pub async fn start(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = match TcpListener::bind(&self.listen_addr).await {
            Ok(listener) => {
                (self.status)(&self.rule_id, RuleStatus::Running, "");
                listener
            }
            Err(e) => {
                (self.status)(&self.rule_id, RuleStatus::Error, &e.to_string());
                return Err(anyhow::Error::new(e)
                    .context(format!("failed to bind {}", self.listen_addr)));
            }
        };
        *self.local_addr.lock() = listener.local_addr().ok();
        info!(rule = %self.rule_id, listen = %self.listen_addr, target = %self.target_addr, "direct forwarder listening");

        let this = self.clone();
        self.tasks.spawn(async move { this.accept_loop(listener).await });
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.stop_token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((client, peer)) => {
                        debug!(rule = %self.rule_id, %peer, "accepted connection");
                        let this = self.clone();
                        self.tasks.spawn(async move { this.handle_conn(client).await });
                    }
                    Err(e) => {
                        warn!(rule = %self.rule_id, error = %e, "accept failed");
                        break;
                    }
                },
            }
        }
        // Listener drops here, releasing the port.
    }

    async fn handle_conn(self: Arc<Self>, client: TcpStream) {
        self.traffic.increment_conn(self.rule_id.clone());

        let dialed = timeout(
            self.settings.connect_timeout,
            TcpStream::connect(&self.target_addr),
        )
        .await;
        let upstream = match dialed {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(e)) => {
                debug!(rule = %self.rule_id, target = %self.target_addr, error = %e, "dial failed");
                self.traffic.decrement_conn(self.rule_id.clone());
                return;
            }
            Err(_) => {
                debug!(rule = %self.rule_id, target = %self.target_addr, "dial timed out");
                self.traffic.decrement_conn(self.rule_id.clone());
                return;
            }
        };

        let (client_rd, client_wr) = client.into_split();
        let (upstream_rd, upstream_wr) = upstream.into_split();

        let outbound = self.pump(client_rd, upstream_wr, true);
        let inbound = self.pump(upstream_rd, client_wr, false);
        tokio::pin!(outbound);
        tokio::pin!(inbound);

        // Either direction ending (or stop) closes both sockets on return.
        tokio::select! {
            _ = self.stop_token.cancelled() => {}
            _ = &mut outbound => {}
            _ = &mut inbound => {}
        }

        self.traffic.decrement_conn(self.rule_id.clone());
    }

    async fn pump<R, W>(&self, mut rd: R, mut wr: W, outbound: bool)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; self.settings.buffer_size];
        loop {
            let n = match timeout(self.settings.idle_timeout, rd.read(&mut buf)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => n,
                Ok(Err(_)) => break,
            };
            if wr.write_all(&buf[..n]).await.is_err() {
                break;
            }
            if outbound {
                self.traffic.add_bytes_out(self.rule_id.clone(), n as u64);
            } else {
                self.traffic.add_bytes_in(self.rule_id.clone(), n as u64);
            }
        }
    }

    /// Stops the forwarder and waits for in-flight connection tasks.
    /// Idempotent and safe whether or not `start` ever ran; concurrent
    /// callers all wait for the drain.
    pub async fn stop(&self) {
        {
            let mut stopped = self.stop_guard.lock();
            if !*stopped {
                *stopped = true;
                self.stop_token.cancel();
                self.tasks.close();
            }
        }
        self.tasks.wait().await;
    }
}
