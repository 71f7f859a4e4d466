//! # Broker State
//!
//! Shared state for the relay broker:
//! - **Agent directory**: agent ids to their live link handles
//! - **Route table**: stream routes indexed under both endpoint keys
//! - **Pending port checks**: one-shot result slots keyed by request id
//! - Injected **load balancer** and **traffic sink** integrations
//!
//! Registries use [`DashMap`] so the per-link tasks never block each other
//! on the common path.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use lattice_protocol::TrafficStats;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::link::AgentLink;

/// Broker-side traffic counters, keyed by `(rule_id, agent_id)`.
pub type BrokerTraffic = TrafficStats<(String, String)>;

/// The broker's bookkeeping for one tunneled stream.
///
/// Stream ids are scoped to the agent that allocated them, so a route is
/// reachable under both `(source_agent, stream_id)` and
/// `(target_agent, stream_id)` without id coordination across links.
#[derive(Debug)]
pub struct Route {
    pub source_agent: String,
    pub target_agent: String,
    pub stream_id: u32,
    pub exit_addr: String,
    pub node_id: String,
    pub rule_id: String,
    cleaned: AtomicBool,
}

/// Cross-link routing table with the two-key index.
#[derive(Default)]
pub struct RouteTable {
    routes: DashMap<(String, u32), Arc<Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a route under both endpoint keys.
    pub fn insert(
        &self,
        source_agent: String,
        target_agent: String,
        stream_id: u32,
        exit_addr: String,
        node_id: String,
        rule_id: String,
    ) -> Arc<Route> {
        let route = Arc::new(Route {
            source_agent: source_agent.clone(),
            target_agent: target_agent.clone(),
            stream_id,
            exit_addr,
            node_id,
            rule_id,
            cleaned: AtomicBool::new(false),
        });
        self.routes
            .insert((source_agent, stream_id), route.clone());
        self.routes
            .insert((target_agent, stream_id), route.clone());
        route
    }

    /// Looks a route up by the sending agent plus the stream id.
    pub fn get(&self, agent_id: &str, stream_id: u32) -> Option<Arc<Route>> {
        self.routes
            .get(&(agent_id.to_string(), stream_id))
            .map(|e| e.value().clone())
    }

    /// Deletes both index entries. Runs at most once per route; returns
    /// whether this call was the one that cleaned it.
    pub fn remove(&self, route: &Arc<Route>) -> bool {
        if route.cleaned.swap(true, Ordering::AcqRel) {
            return false;
        }
        for key in [
            (route.source_agent.clone(), route.stream_id),
            (route.target_agent.clone(), route.stream_id),
        ] {
            // Guarded removal: a newer route may have reused the slot.
            self.routes.remove_if(&key, |_, r| Arc::ptr_eq(r, route));
        }
        true
    }

    /// Single-pass sweep of every route touching `agent_id`; returns the
    /// routes this call cleaned so the caller can settle their counters.
    pub fn remove_for_agent(&self, agent_id: &str) -> Vec<Arc<Route>> {
        let mut hit: Vec<Arc<Route>> = Vec::new();
        for entry in self.routes.iter() {
            let r = entry.value();
            if r.source_agent == agent_id || r.target_agent == agent_id {
                hit.push(r.clone());
            }
        }
        // The CAS inside `remove` dedups the two index hits per route.
        hit.retain(|r| self.remove(r));
        hit
    }

    /// Number of index entries (two per live route).
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Resolution failure reported by a [`LoadBalancer`].
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ResolveError(pub String);

/// A proxy-group member chosen by the load balancer.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub agent_id: String,
    pub node_id: String,
}

/// Resolves `@group` references to a concrete exit agent and tracks
/// per-node connection counts.
pub trait LoadBalancer: Send + Sync {
    fn resolve_target(&self, group: &str, source_ip: &str) -> Result<ResolvedTarget, ResolveError>;
    fn increment(&self, node_id: &str);
    fn decrement(&self, node_id: &str);
}

/// Null balancer: no groups exist, counters are no-ops.
pub struct NullBalancer;

impl LoadBalancer for NullBalancer {
    fn resolve_target(&self, group: &str, _source_ip: &str) -> Result<ResolvedTarget, ResolveError> {
        Err(ResolveError(format!("no load balancer for group {group}")))
    }

    fn increment(&self, _node_id: &str) {}

    fn decrement(&self, _node_id: &str) {}
}

/// Receives per-rule traffic attribution from the route engine.
pub trait TrafficSink: Send + Sync {
    fn add_bytes_in(&self, rule_id: &str, agent_id: &str, n: u64);
    fn add_bytes_out(&self, rule_id: &str, agent_id: &str, n: u64);
    fn increment_conn(&self, rule_id: &str, agent_id: &str);
    fn decrement_conn(&self, rule_id: &str, agent_id: &str);
}

/// Null sink: drops every sample.
pub struct NullSink;

impl TrafficSink for NullSink {
    fn add_bytes_in(&self, _rule_id: &str, _agent_id: &str, _n: u64) {}
    fn add_bytes_out(&self, _rule_id: &str, _agent_id: &str, _n: u64) {}
    fn increment_conn(&self, _rule_id: &str, _agent_id: &str) {}
    fn decrement_conn(&self, _rule_id: &str, _agent_id: &str) {}
}

impl TrafficSink for BrokerTraffic {
    fn add_bytes_in(&self, rule_id: &str, agent_id: &str, n: u64) {
        TrafficStats::add_bytes_in(self, (rule_id.to_string(), agent_id.to_string()), n);
    }

    fn add_bytes_out(&self, rule_id: &str, agent_id: &str, n: u64) {
        TrafficStats::add_bytes_out(self, (rule_id.to_string(), agent_id.to_string()), n);
    }

    fn increment_conn(&self, rule_id: &str, agent_id: &str) {
        TrafficStats::increment_conn(self, (rule_id.to_string(), agent_id.to_string()));
    }

    fn decrement_conn(&self, rule_id: &str, agent_id: &str) {
        TrafficStats::decrement_conn(self, (rule_id.to_string(), agent_id.to_string()));
    }
}

/// Shared broker state, cloned into every handler task.
#[derive(Clone)]
pub struct AppState {
    /// Live agent links, keyed by agent id.
    pub agents: Arc<DashMap<String, Arc<AgentLink>>>,
    pub routes: Arc<RouteTable>,
    /// Port-check result slots keyed by request id.
    pub pending_checks: Arc<DashMap<u32, oneshot::Sender<String>>>,
    next_check_id: Arc<AtomicU32>,
    pub balancer: Arc<dyn LoadBalancer>,
    pub sink: Arc<dyn TrafficSink>,
    /// The broker's own counters; the default sink points here.
    pub traffic: Arc<BrokerTraffic>,
}

impl AppState {
    /// State with the null balancer and the broker's own counters as sink.
    pub fn new() -> Self {
        Self::with_integrations(Arc::new(NullBalancer), None)
    }

    /// State with injected integrations. `sink = None` routes attribution to
    /// the broker's own counter table.
    pub fn with_integrations(
        balancer: Arc<dyn LoadBalancer>,
        sink: Option<Arc<dyn TrafficSink>>,
    ) -> Self {
        let traffic = Arc::new(BrokerTraffic::new());
        let sink = sink.unwrap_or_else(|| traffic.clone() as Arc<dyn TrafficSink>);
        Self {
            agents: Arc::new(DashMap::new()),
            routes: Arc::new(RouteTable::new()),
            pending_checks: Arc::new(DashMap::new()),
            next_check_id: Arc::new(AtomicU32::new(0)),
            balancer,
            sink,
            traffic,
        }
    }

    pub fn link(&self, agent_id: &str) -> Option<Arc<AgentLink>> {
        self.agents.get(agent_id).map(|e| e.value().clone())
    }

    /// Allocates a port-check correlation id; never zero.
    pub fn next_check_id(&self) -> u32 {
        self.next_check_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(table: &RouteTable, source: &str, target: &str, id: u32) -> Arc<Route> {
        table.insert(
            source.to_string(),
            target.to_string(),
            id,
            "10.0.0.9:80".into(),
            String::new(),
            String::new(),
        )
    }

    #[test]
    fn insert_creates_exactly_two_entries() {
        let table = RouteTable::new();
        let r = route(&table, "a", "b", 5);
        assert_eq!(table.len(), 2);
        assert!(table.remove(&r));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn remove_runs_once() {
        let table = RouteTable::new();
        let r = route(&table, "a", "b", 5);
        assert!(table.remove(&r));
        assert!(!table.remove(&r));
    }

    #[test]
    fn same_stream_id_from_different_sources_is_independent() {
        let table = RouteTable::new();
        let ra = route(&table, "a", "exit", 7);
        let rb = route(&table, "b", "exit", 7);
        // The (exit, 7) slot is contended; the later insert owns it. The
        // source-side keys stay distinct.
        assert!(table.get("a", 7).is_some());
        assert!(table.get("b", 7).is_some());

        table.remove(&ra);
        assert!(table.get("a", 7).is_none());
        assert!(
            table.get("b", 7).is_some(),
            "cleanup of one source's route must not touch the other's"
        );
        table.remove(&rb);
        assert!(table.is_empty());
    }

    #[test]
    fn sweep_cleans_both_roles() {
        let table = RouteTable::new();
        route(&table, "a", "b", 1);
        route(&table, "b", "c", 2);
        route(&table, "c", "d", 3);

        let cleaned = table.remove_for_agent("b");
        assert_eq!(cleaned.len(), 2);
        assert!(table.get("c", 3).is_some());
        assert_eq!(table.len(), 2);
    }
}
