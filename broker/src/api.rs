//! # Inspection API
//!
//! REST endpoints for operators and tooling: list connected agents, push a
//! rule refresh to an agent, and probe whether a port is bindable on one.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::router;
use crate::state::AppState;

#[derive(Serialize)]
pub struct AgentListItem {
    pub agent_id: String,
}

/// `GET /api/agents` — all currently connected agents.
pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentListItem>> {
    let agents = state
        .agents
        .iter()
        .map(|entry| AgentListItem {
            agent_id: entry.key().clone(),
        })
        .collect();
    Json(agents)
}

#[derive(Serialize)]
pub struct RefreshReply {
    pub delivered: bool,
}

/// `POST /api/agents/{id}/refresh` — push a RuleUpdate to the agent.
pub async fn refresh_agent_rules(
    Path(agent_id): Path<String>,
    State(state): State<AppState>,
) -> Json<RefreshReply> {
    Json(RefreshReply {
        delivered: router::notify_rule_update(&state, &agent_id),
    })
}

#[derive(Deserialize)]
pub struct CheckPortParams {
    pub agent_id: String,
    pub addr: String,
    #[serde(default)]
    pub rule_id: String,
    #[serde(default = "default_check_timeout")]
    pub timeout_secs: u64,
}

fn default_check_timeout() -> u64 {
    5
}

#[derive(Serialize)]
pub struct CheckPortReply {
    pub available: bool,
    pub detail: String,
}

/// `GET /api/check_port` — ask an agent whether an address is bindable.
pub async fn check_port(
    Query(params): Query<CheckPortParams>,
    State(state): State<AppState>,
) -> Json<CheckPortReply> {
    let detail = router::check_port(
        &state,
        &params.agent_id,
        &params.addr,
        &params.rule_id,
        Duration::from_secs(params.timeout_secs),
    )
    .await;
    Json(CheckPortReply {
        available: detail.is_empty(),
        detail,
    })
}
