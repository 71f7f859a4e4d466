//! # Relay Forwarder
//!
//! Same surface as the direct forwarder, but each accepted connection is
//! carried through the broker: open a stream on the control link, send a
//! Connect toward the exit, wait for the handshake sentinel, then splice.
//!
//! The handshake blocks on exactly one channel — the stream's own inbound
//! queue — where the link dispatcher delivers a single sentinel byte for
//! ConnAck or Error.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use lattice_protocol::{TrafficStats, TunnelMessage, SENTINEL_CONNACK, SENTINEL_ERROR};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::splice::splice;
use super::{ForwarderSettings, RuleStatus, StatusFn};
use crate::link::ControlLink;

pub struct RelayForwarder {
    rule_id: String,
    listen_addr: String,
    exit_addr: String,
    relay_chain: Vec<String>,
    link: Arc<ControlLink>,
    settings: ForwarderSettings,
    traffic: Arc<TrafficStats<String>>,
    status: StatusFn,
    stop_token: CancellationToken,
    tasks: TaskTracker,
    stop_guard: Mutex<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl RelayForwarder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rule_id: String,
        listen_addr: String,
        exit_addr: String,
        relay_chain: Vec<String>,
        link: Arc<ControlLink>,
        settings: ForwarderSettings,
        traffic: Arc<TrafficStats<String>>,
        status: StatusFn,
    ) -> Arc<Self> {
        Arc::new(Self {
            rule_id,
            listen_addr,
            exit_addr,
            relay_chain,
            link,
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
        info!(
            rule = %self.rule_id,
            listen = %self.listen_addr,
            exit = %self.exit_addr,
            "relay forwarder listening"
        );

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
    }

    async fn handle_conn(self: Arc<Self>, client: TcpStream) {
        self.traffic.increment_conn(self.rule_id.clone());

        let stream = self.link.streams().create(&self.exit_addr);
        let stream_id = stream.id();
        let Some(mut queue) = stream.take_reader() else {
            self.link.streams().remove(stream_id);
            self.traffic.decrement_conn(self.rule_id.clone());
            return;
        };

        // The Connect's payload names the next hop toward the exit.
        let next_hop = self.relay_chain.first().cloned().unwrap_or_default();
        let connect = TunnelMessage::connect(
            stream_id,
            &self.exit_addr,
            &self.rule_id,
            Bytes::from(next_hop.into_bytes()),
        );
        if !self.link.send(connect) {
            debug!(rule = %self.rule_id, stream = stream_id, "connect not sent, link down");
            self.link.streams().remove(stream_id);
            self.traffic.decrement_conn(self.rule_id.clone());
            return;
        }

        // Handshake: one sentinel byte on the inbound queue decides.
        match timeout(self.settings.connect_timeout, queue.recv()).await {
            Ok(Some(b)) if b.first() == Some(&SENTINEL_CONNACK) => {}
            Ok(Some(b)) => {
                if b.first() == Some(&SENTINEL_ERROR) {
                    debug!(rule = %self.rule_id, stream = stream_id, "tunnel refused");
                } else {
                    debug!(rule = %self.rule_id, stream = stream_id, "unexpected handshake byte");
                }
                self.link.streams().remove(stream_id);
                self.traffic.decrement_conn(self.rule_id.clone());
                return;
            }
            Ok(None) | Err(_) => {
                debug!(rule = %self.rule_id, stream = stream_id, "tunnel handshake timed out");
                // The broker may hold a half-open route; tell it to clean up.
                self.link.send(TunnelMessage::close(stream_id));
                self.link.streams().remove(stream_id);
                self.traffic.decrement_conn(self.rule_id.clone());
                return;
            }
        }

        splice(
            self.link.clone(),
            stream,
            queue,
            client,
            &self.settings,
            Some((self.traffic.clone(), self.rule_id.clone())),
            self.stop_token.clone(),
        )
        .await;

        self.traffic.decrement_conn(self.rule_id.clone());
    }

    /// Same contract as [`super::DirectForwarder::stop`].
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
