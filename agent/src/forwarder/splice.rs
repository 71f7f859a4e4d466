//! Bidirectional splice between a local TCP socket and a multiplexed
//! stream on the control link. Used by the relay forwarder (entry side) and
//! the exit handler (exit side).

use std::sync::Arc;

use bytes::{BufMut, Bytes};
use lattice_protocol::crypto::SEAL_OVERHEAD;
use lattice_protocol::{pool, Stream, TrafficStats, TunnelMessage, MAX_PAYLOAD};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ForwarderSettings;
use crate::link::ControlLink;

/// Optional per-rule accounting: the entry side attributes spliced bytes to
/// its rule, the exit side splices unattributed.
pub(crate) type SpliceTraffic = Option<(Arc<TrafficStats<String>>, String)>;

/// Pumps `tcp` and `stream` into each other until either direction ends,
/// the stream closes, or `abort` fires. Sends Close and removes the stream
/// from the link's registry on the way out.
///
/// `queue` is the stream's inbound consumer half, taken by the caller before
/// the splice starts (the relay forwarder already consumed the handshake
/// sentinel from it).
pub(crate) async fn splice(
    link: Arc<ControlLink>,
    stream: Arc<Stream>,
    mut queue: mpsc::Receiver<Bytes>,
    tcp: TcpStream,
    settings: &ForwarderSettings,
    traffic: SpliceTraffic,
    abort: CancellationToken,
) {
    let stream_id = stream.id();
    let (mut rd, mut wr) = tcp.into_split();
    let mut close_rx = stream.close_signal();

    // Socket → link: read into a pooled buffer's payload region and ship
    // each chunk as a Data frame. The chunk cap leaves room for the seal
    // overhead the write pump adds before marshalling.
    let to_link = {
        let link = link.clone();
        let traffic = traffic.clone();
        let max_chunk = settings.buffer_size.min(MAX_PAYLOAD - SEAL_OVERHEAD);
        let idle = settings.idle_timeout;
        async move {
            let mut buf = pool().acquire_for(max_chunk);
            loop {
                if buf.capacity() < max_chunk && !buf.try_reclaim(max_chunk) {
                    pool().release(std::mem::replace(&mut buf, pool().acquire_for(max_chunk)));
                }
                let n = match timeout(idle, rd.read_buf(&mut (&mut buf).limit(max_chunk))).await {
                    Ok(Ok(0)) | Err(_) => break,
                    Ok(Ok(n)) => n,
                    Ok(Err(_)) => break,
                };
                if let Some((stats, rule_id)) = &traffic {
                    stats.add_bytes_out(rule_id.clone(), n as u64);
                }
                let chunk = buf.split().freeze();
                if !link.send(TunnelMessage::data(stream_id, chunk)) {
                    debug!(stream = stream_id, "data chunk dropped on full link queue");
                }
            }
            pool().release(buf);
        }
    };

    // Link → socket: drain the stream's inbound queue into the socket.
    let to_tcp = {
        let stream = stream.clone();
        let traffic = traffic.clone();
        async move {
            if stream.is_closed() {
                return;
            }
            loop {
                tokio::select! {
                    _ = close_rx.changed() => break,
                    chunk = queue.recv() => match chunk {
                        Some(data) => {
                            if let Some((stats, rule_id)) = &traffic {
                                stats.add_bytes_in(rule_id.clone(), data.len() as u64);
                            }
                            if wr.write_all(&data).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        }
    };

    tokio::pin!(to_link);
    tokio::pin!(to_tcp);
    tokio::select! {
        _ = abort.cancelled() => {}
        _ = &mut to_link => {}
        _ = &mut to_tcp => {}
    }

    link.send(TunnelMessage::close(stream_id));
    link.streams().remove(stream_id);
}
