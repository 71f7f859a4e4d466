//! # Forwarding Rules
//!
//! The agent's installed rules and their reconciliation. Rules arrive from
//! the control plane as JSON; each maps to one forwarder. A canonical config
//! fingerprint decides whether a reapply can keep a running forwarder or has
//! to restart it.

use std::collections::HashMap;
use std::sync::Arc;

use lattice_protocol::TrafficStats;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::forwarder::{
    DirectForwarder, Forwarder, ForwarderSettings, RelayForwarder, RuleStatus, StatusFn,
};
use crate::link::ControlLink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    /// Local listener spliced straight to a target address.
    Direct,
    /// Local listener tunneled through the broker to an exit agent.
    Relay,
}

/// One installed forwarding rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RuleKind,
    pub listen_addr: String,
    #[serde(default)]
    pub target_addr: String,
    #[serde(default)]
    pub exit_addr: String,
    #[serde(default)]
    pub relay_chain: Vec<String>,
}

impl Rule {
    /// Canonical fingerprint used to detect config changes:
    /// `direct:<listen>:<target>` or `relay:<listen>:<exit>:<hop1>,<hop2>,…,`.
    pub fn fingerprint(&self) -> String {
        match self.kind {
            RuleKind::Direct => format!("direct:{}:{}", self.listen_addr, self.target_addr),
            RuleKind::Relay => {
                let hops: String = self.relay_chain.iter().map(|h| format!("{h},")).collect();
                format!("relay:{}:{}:{}", self.listen_addr, self.exit_addr, hops)
            }
        }
    }
}

/// A rule status transition to push upstream.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub rule_id: String,
    pub status: RuleStatus,
    pub error: String,
}

struct RunningRule {
    fingerprint: String,
    listen_addr: String,
    forwarder: Forwarder,
}

/// Owns the running forwarders and reconciles them against the control
/// plane's rule list.
pub struct RuleManager {
    link: Arc<ControlLink>,
    traffic: Arc<TrafficStats<String>>,
    settings: ForwarderSettings,
    status: StatusFn,
    running: Mutex<HashMap<String, RunningRule>>,
}

impl RuleManager {
    pub fn new(
        link: Arc<ControlLink>,
        traffic: Arc<TrafficStats<String>>,
        settings: ForwarderSettings,
        status_tx: mpsc::UnboundedSender<StatusEvent>,
    ) -> Arc<Self> {
        let status: StatusFn = Arc::new(move |rule_id: &str, status: RuleStatus, error: &str| {
            let _ = status_tx.send(StatusEvent {
                rule_id: rule_id.to_string(),
                status,
                error: error.to_string(),
            });
        });
        Arc::new(Self {
            link,
            traffic,
            settings,
            status,
            running: Mutex::new(HashMap::new()),
        })
    }

    /// Applies a full rule list: unchanged rules keep running, changed rules
    /// restart, removed rules stop, new rules start.
    pub async fn apply(&self, rules: &[Rule]) {
        let desired: HashMap<&str, String> = rules
            .iter()
            .map(|r| (r.id.as_str(), r.fingerprint()))
            .collect();

        let mut running = self.running.lock().await;

        let stale: Vec<String> = running
            .iter()
            .filter(|(id, rr)| desired.get(id.as_str()) != Some(&rr.fingerprint))
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(rr) = running.remove(&id) {
                info!(rule = %id, "stopping forwarder");
                rr.forwarder.stop().await;
            }
        }

        for rule in rules {
            if running.contains_key(&rule.id) {
                continue;
            }
            let forwarder = self.build(rule);
            match forwarder.start().await {
                Ok(()) => {
                    info!(rule = %rule.id, listen = %rule.listen_addr, "forwarder running");
                    running.insert(
                        rule.id.clone(),
                        RunningRule {
                            fingerprint: rule.fingerprint(),
                            listen_addr: rule.listen_addr.clone(),
                            forwarder,
                        },
                    );
                }
                // The status callback already carried the bind failure; the
                // rule is retried on the next reconcile.
                Err(e) => warn!(rule = %rule.id, error = %e, "forwarder failed to start"),
            }
        }
    }

    fn build(&self, rule: &Rule) -> Forwarder {
        match rule.kind {
            RuleKind::Direct => Forwarder::Direct(DirectForwarder::new(
                rule.id.clone(),
                rule.listen_addr.clone(),
                rule.target_addr.clone(),
                self.settings.clone(),
                self.traffic.clone(),
                self.status.clone(),
            )),
            RuleKind::Relay => Forwarder::Relay(RelayForwarder::new(
                rule.id.clone(),
                rule.listen_addr.clone(),
                rule.exit_addr.clone(),
                rule.relay_chain.clone(),
                self.link.clone(),
                self.settings.clone(),
                self.traffic.clone(),
                self.status.clone(),
            )),
        }
    }

    /// Whether `rule_id` is currently bound to exactly `addr`. The broker's
    /// port probe exempts the rule that already owns the port.
    pub async fn owns_listener(&self, rule_id: &str, addr: &str) -> bool {
        self.running
            .lock()
            .await
            .get(rule_id)
            .map(|rr| rr.listen_addr == addr)
            .unwrap_or(false)
    }

    /// Stops every forwarder, waiting for in-flight connections.
    pub async fn stop_all(&self) {
        let drained: Vec<RunningRule> = {
            let mut running = self.running.lock().await;
            running.drain().map(|(_, rr)| rr).collect()
        };
        for rr in drained {
            rr.forwarder.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_fingerprint() {
        let rule = Rule {
            id: "r1".into(),
            kind: RuleKind::Direct,
            listen_addr: "0.0.0.0:2022".into(),
            target_addr: "10.0.0.5:22".into(),
            exit_addr: String::new(),
            relay_chain: vec![],
        };
        assert_eq!(rule.fingerprint(), "direct:0.0.0.0:2022:10.0.0.5:22");
    }

    #[test]
    fn relay_fingerprint_lists_hops_with_trailing_comma() {
        let rule = Rule {
            id: "r2".into(),
            kind: RuleKind::Relay,
            listen_addr: "127.0.0.1:9000".into(),
            target_addr: String::new(),
            exit_addr: "db.internal:5432".into(),
            relay_chain: vec!["edge-b".into(), "@pool-eu".into()],
        };
        assert_eq!(
            rule.fingerprint(),
            "relay:127.0.0.1:9000:db.internal:5432:edge-b,@pool-eu,"
        );
    }

    #[test]
    fn fingerprint_changes_with_chain_order() {
        let mut rule = Rule {
            id: "r".into(),
            kind: RuleKind::Relay,
            listen_addr: "l".into(),
            target_addr: String::new(),
            exit_addr: "e".into(),
            relay_chain: vec!["a".into(), "b".into()],
        };
        let first = rule.fingerprint();
        rule.relay_chain.reverse();
        assert_ne!(first, rule.fingerprint());
    }

    #[test]
    fn rules_deserialize_from_control_plane_json() {
        let raw = r#"{
            "id": "r9",
            "type": "relay",
            "listen_addr": "127.0.0.1:8443",
            "exit_addr": "internal:443",
            "relay_chain": ["edge-b"]
        }"#;
        let rule: Rule = serde_json::from_str(raw).unwrap();
        assert_eq!(rule.kind, RuleKind::Relay);
        assert_eq!(rule.relay_chain, vec!["edge-b".to_string()]);
        assert!(rule.target_addr.is_empty());
    }
}
