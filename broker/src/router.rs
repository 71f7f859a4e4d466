//! # Route Engine
//!
//! Per-message dispatch for the broker. Connect builds a route and forwards
//! a cleaned copy to the exit agent; Data, ConnAck, Close and Error are
//! routed by `(sending agent, stream id)` and forwarded as their original
//! frames; Close and Error also tear the route down. Disconnects sweep every
//! route touching the lost agent.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lattice_protocol::{MessageType, TunnelMessage};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::link::AgentLink;
use crate::state::{AppState, Route};

/// Routes one decoded message from an agent. `frame` is the original wire
/// frame, reused on forwarding paths so nothing is re-marshalled.
pub async fn dispatch(state: &AppState, from: &Arc<AgentLink>, msg: TunnelMessage, frame: Bytes) {
    match msg.msg_type {
        MessageType::Connect => handle_connect(state, from, msg),
        MessageType::ConnAck => handle_conn_ack(state, from, &msg, frame),
        MessageType::Data => handle_data(state, from, &msg, frame),
        MessageType::Close | MessageType::Error => handle_teardown(state, from, &msg, frame),
        MessageType::CheckPortResult => handle_check_port_result(state, msg),
        // Broker-originated types have no meaning inbound.
        MessageType::RuleUpdate | MessageType::CheckPort => {
            debug!(agent = %from.agent_id, msg_type = ?msg.msg_type, "unexpected message dropped");
        }
    }
}

fn handle_connect(state: &AppState, from: &Arc<AgentLink>, msg: TunnelMessage) {
    let target_ref = String::from_utf8_lossy(&msg.payload).into_owned();
    if target_ref.is_empty() {
        from.send(&TunnelMessage::error(msg.stream_id, "no target"));
        return;
    }

    // "@group" references go through the load balancer; anything else is a
    // concrete agent id.
    let (target_agent, node_id) = if let Some(group) = target_ref.strip_prefix('@') {
        match state.balancer.resolve_target(group, &from.peer_ip) {
            Ok(resolved) => (resolved.agent_id, resolved.node_id),
            Err(e) => {
                from.send(&TunnelMessage::error(
                    msg.stream_id,
                    format!("resolution failed: {e}"),
                ));
                return;
            }
        }
    } else {
        (target_ref, String::new())
    };

    let Some(target_link) = state.link(&target_agent) else {
        from.send(&TunnelMessage::error(
            msg.stream_id,
            format!("target agent {target_agent} offline"),
        ));
        return;
    };

    if !node_id.is_empty() {
        state.balancer.increment(&node_id);
    }

    let route = state.routes.insert(
        from.agent_id.clone(),
        target_agent.clone(),
        msg.stream_id,
        msg.target.clone(),
        node_id,
        msg.rule_id.clone(),
    );

    if !msg.rule_id.is_empty() {
        state.sink.increment_conn(&msg.rule_id, &from.agent_id);
    }

    // The exit agent gets a clean Connect: same stream id and target, no
    // next-hop payload, no rule attribution.
    let mut clean = TunnelMessage::new(MessageType::Connect, msg.stream_id);
    clean.target = msg.target.clone();
    if !target_link.send(&clean) {
        warn!(
            source = %from.agent_id,
            target = %target_agent,
            stream = msg.stream_id,
            "connect forward failed, rolling back route"
        );
        clean_route(state, &route);
        from.send(&TunnelMessage::error(msg.stream_id, "target send failed"));
        return;
    }

    info!(
        source = %from.agent_id,
        target = %target_agent,
        stream = msg.stream_id,
        exit = %route.exit_addr,
        "route established"
    );
}

fn handle_conn_ack(state: &AppState, from: &Arc<AgentLink>, msg: &TunnelMessage, frame: Bytes) {
    let Some(route) = state.routes.get(&from.agent_id, msg.stream_id) else {
        return;
    };
    // Only the exit side acknowledges; an ack from the source side is bogus.
    if from.agent_id != route.target_agent {
        debug!(agent = %from.agent_id, stream = msg.stream_id, "conn ack from wrong side dropped");
        return;
    }
    if let Some(source) = state.link(&route.source_agent) {
        source.send_raw(frame);
    }
}

fn handle_data(state: &AppState, from: &Arc<AgentLink>, msg: &TunnelMessage, frame: Bytes) {
    // Late data after a close is normal; drop silently.
    let Some(route) = state.routes.get(&from.agent_id, msg.stream_id) else {
        return;
    };

    let outbound = from.agent_id == route.source_agent;
    let other = if outbound {
        &route.target_agent
    } else {
        &route.source_agent
    };

    // Both directions are attributed to the route's source agent.
    if !route.rule_id.is_empty() {
        let n = msg.payload.len() as u64;
        if outbound {
            state.sink.add_bytes_out(&route.rule_id, &route.source_agent, n);
        } else {
            state.sink.add_bytes_in(&route.rule_id, &route.source_agent, n);
        }
    }

    match state.link(other) {
        Some(link) => {
            if !link.send_raw(frame) {
                debug!(stream = msg.stream_id, to = %other, "data frame dropped on full queue");
            }
        }
        None => debug!(stream = msg.stream_id, to = %other, "data for offline agent dropped"),
    }
}

fn handle_teardown(state: &AppState, from: &Arc<AgentLink>, msg: &TunnelMessage, frame: Bytes) {
    let Some(route) = state.routes.get(&from.agent_id, msg.stream_id) else {
        return;
    };
    let other = if from.agent_id == route.source_agent {
        &route.target_agent
    } else {
        &route.source_agent
    };
    if let Some(link) = state.link(other) {
        link.send_raw(frame);
    }
    clean_route(state, &route);
    debug!(stream = msg.stream_id, msg_type = ?msg.msg_type, "route closed");
}

fn handle_check_port_result(state: &AppState, msg: TunnelMessage) {
    if let Some((_, slot)) = state.pending_checks.remove(&msg.stream_id) {
        let _ = slot.send(msg.error);
    }
}

/// Removes both index entries and settles the route's counters. The CAS in
/// `RouteTable::remove` makes the settlement run at most once per route.
fn clean_route(state: &AppState, route: &Arc<Route>) {
    if !state.routes.remove(route) {
        return;
    }
    if !route.node_id.is_empty() {
        state.balancer.decrement(&route.node_id);
    }
    if !route.rule_id.is_empty() {
        state.sink.decrement_conn(&route.rule_id, &route.source_agent);
    }
}

/// Sweeps every route with `link`'s agent on either end. Called once per
/// disconnecting link.
pub fn cleanup_agent(state: &AppState, link: &Arc<AgentLink>) {
    let cleaned = state.routes.remove_for_agent(&link.agent_id);
    for route in &cleaned {
        if !route.node_id.is_empty() {
            state.balancer.decrement(&route.node_id);
        }
        if !route.rule_id.is_empty() {
            state.sink.decrement_conn(&route.rule_id, &route.source_agent);
        }
    }
    if !cleaned.is_empty() {
        info!(agent = %link.agent_id, routes = cleaned.len(), "cleaned routes after disconnect");
    }
}

/// Asks `agent_id` whether `addr` is locally bindable.
///
/// Allocates a request id, parks a one-shot result slot under it, sends a
/// CheckPort and waits for the matching CheckPortResult. The returned string
/// is empty when the port is available, otherwise the reason.
pub async fn check_port(
    state: &AppState,
    agent_id: &str,
    addr: &str,
    rule_id: &str,
    timeout: Duration,
) -> String {
    let Some(link) = state.link(agent_id) else {
        return "offline".to_string();
    };

    let request_id = state.next_check_id();
    let (tx, rx) = oneshot::channel();
    state.pending_checks.insert(request_id, tx);

    if !link.send(&TunnelMessage::check_port(request_id, addr, rule_id)) {
        state.pending_checks.remove(&request_id);
        return "unavailable, no response".to_string();
    }

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        _ => {
            state.pending_checks.remove(&request_id);
            "unavailable, no response".to_string()
        }
    }
}

/// Pushes a RuleUpdate to a connected agent. Returns whether it was queued.
pub fn notify_rule_update(state: &AppState, agent_id: &str) -> bool {
    match state.link(agent_id) {
        Some(link) => link.send(&TunnelMessage::rule_update()),
        None => false,
    }
}
