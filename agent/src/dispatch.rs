//! # Link Dispatcher
//!
//! A single task that consumes decoded messages from the control link and
//! routes each one:
//!
//! - `Connect` — spawn the exit handler (dial the target, splice)
//! - `ConnAck` / `Error` — deliver the handshake sentinel to the stream
//! - `Data` — deliver the payload to the stream's inbound queue
//! - `Close` — remove (and thereby close) the stream
//! - `RuleUpdate` — trigger an asynchronous rule refresh
//! - `CheckPort` — probe the requested address and answer

use std::sync::Arc;

use bytes::Bytes;
use lattice_protocol::{
    MessageType, Stream, TunnelMessage, SENTINEL_CONNACK, SENTINEL_ERROR,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::forwarder::splice::splice;
use crate::forwarder::ForwarderSettings;
use crate::link::ControlLink;
use crate::rules::RuleManager;

pub struct Dispatcher {
    link: Arc<ControlLink>,
    rules: Arc<RuleManager>,
    settings: ForwarderSettings,
    /// Nudges the main loop into a rule reconcile.
    refresh_tx: mpsc::Sender<()>,
}

impl Dispatcher {
    pub fn new(
        link: Arc<ControlLink>,
        rules: Arc<RuleManager>,
        settings: ForwarderSettings,
        refresh_tx: mpsc::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            link,
            rules,
            settings,
            refresh_tx,
        })
    }

    /// Runs until the link's inbound channel closes.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<TunnelMessage>) {
        while let Some(msg) = inbound.recv().await {
            match msg.msg_type {
                MessageType::Connect => {
                    let link = self.link.clone();
                    let settings = self.settings.clone();
                    tokio::spawn(async move { run_exit(link, msg, settings).await });
                }
                MessageType::ConnAck => {
                    if let Some(stream) = self.link.streams().get(msg.stream_id) {
                        stream.write(Bytes::from_static(&[SENTINEL_CONNACK])).await;
                    }
                }
                MessageType::Data => {
                    if let Some(stream) = self.link.streams().get(msg.stream_id) {
                        if !stream.write(msg.payload).await {
                            debug!(stream = msg.stream_id, "inbound chunk not delivered");
                        }
                    }
                }
                MessageType::Close => {
                    self.link.streams().remove(msg.stream_id);
                }
                MessageType::Error => {
                    if let Some(stream) = self.link.streams().get(msg.stream_id) {
                        debug!(stream = msg.stream_id, error = %msg.error, "stream failed");
                        stream.write(Bytes::from_static(&[SENTINEL_ERROR])).await;
                        stream.close();
                    }
                }
                MessageType::RuleUpdate => {
                    info!("rule update pushed by broker");
                    let _ = self.refresh_tx.try_send(());
                }
                MessageType::CheckPort => {
                    let reply = self.probe_port(&msg).await;
                    self.link.send(reply);
                }
                MessageType::CheckPortResult => {
                    debug!("stray check-port result dropped");
                }
            }
        }
    }

    /// Bind test for the broker's port probe. The rule that already holds
    /// the address reports it as available.
    async fn probe_port(&self, msg: &TunnelMessage) -> TunnelMessage {
        if !msg.rule_id.is_empty() && self.rules.owns_listener(&msg.rule_id, &msg.target).await {
            return TunnelMessage::check_port_result(msg.stream_id, "");
        }
        let error = match TcpListener::bind(&msg.target).await {
            Ok(listener) => {
                drop(listener);
                String::new()
            }
            Err(e) => e.to_string(),
        };
        TunnelMessage::check_port_result(msg.stream_id, error)
    }
}

/// Exit side of a tunnel: dial the target named by a broker-forwarded
/// Connect, register the stream under the peer-assigned id, acknowledge and
/// splice until either side ends.
async fn run_exit(link: Arc<ControlLink>, msg: TunnelMessage, settings: ForwarderSettings) {
    let stream_id = msg.stream_id;
    let target = msg.target;

    let tcp = match timeout(settings.connect_timeout, TcpStream::connect(&target)).await {
        Ok(Ok(tcp)) => tcp,
        Ok(Err(e)) => {
            warn!(stream = stream_id, %target, error = %e, "exit dial failed");
            link.send(TunnelMessage::error(
                stream_id,
                format!("dial {target} failed: {e}"),
            ));
            return;
        }
        Err(_) => {
            warn!(stream = stream_id, %target, "exit dial timed out");
            link.send(TunnelMessage::error(
                stream_id,
                format!("dial {target} timed out"),
            ));
            return;
        }
    };

    let stream = Stream::new(stream_id, &target);
    let Some(queue) = stream.take_reader() else {
        return;
    };
    link.streams().insert(stream.clone());
    link.send(TunnelMessage::conn_ack(stream_id));
    debug!(stream = stream_id, %target, "exit tunnel open");

    splice(
        link,
        stream,
        queue,
        tcp,
        &settings,
        None,
        CancellationToken::new(),
    )
    .await;
}
