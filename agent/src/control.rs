//! # Control-Plane Client
//!
//! JSON-RPC over HTTP toward the management service. The envelope is the
//! standard `{jsonrpc, id, method, params}` request with a
//! `{result | error}` response; the five methods the agent calls are
//! registration, heartbeat, rule fetch, traffic reports and rule-status
//! reports.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Context};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::rules::Rule;

#[derive(Serialize)]
struct RpcRequest<'a, P: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Deserialize)]
struct RpcResponse<R> {
    #[serde(default = "Option::default")]
    result: Option<R>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Deserialize, Debug)]
struct RpcError {
    code: i64,
    message: String,
}

/// Reply to `clientRegister`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterReply {
    pub client_id: String,
    pub secret_key: String,
    #[serde(default)]
    pub ws_endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RulesReply {
    #[serde(default)]
    rules: Vec<Rule>,
}

/// One drained traffic row for `clientReportTraffic`.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficReport {
    pub rule_id: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub connections: u64,
}

/// One rule status transition for `clientReportRuleStatus`.
#[derive(Debug, Clone, Serialize)]
pub struct RuleStatusReport {
    pub rule_id: String,
    pub status: String,
    pub error: String,
}

/// HTTP client for the management service.
pub struct ControlClient {
    http: reqwest::Client,
    base_url: String,
    next_id: AtomicU64,
}

impl ControlClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            next_id: AtomicU64::new(1),
        }
    }

    /// One JSON-RPC round trip. A missing or null `result` without an error
    /// is a valid void reply and comes back as `None`.
    async fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> anyhow::Result<Option<R>> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let response: RpcResponse<R> = self
            .http
            .post(&self.base_url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("{method} request failed"))?
            .json()
            .await
            .with_context(|| format!("{method} returned an invalid response"))?;

        if let Some(e) = response.error {
            return Err(anyhow!("{method} failed: {} (code {})", e.message, e.code));
        }
        Ok(response.result)
    }

    pub async fn register(
        &self,
        token: &str,
        hostname: &str,
        version: &str,
        report_ip: Option<&str>,
    ) -> anyhow::Result<RegisterReply> {
        self.call(
            "clientRegister",
            json!({
                "token": token,
                "hostname": hostname,
                "version": version,
                "report_ip": report_ip,
            }),
        )
        .await?
        .ok_or_else(|| anyhow!("clientRegister returned no result"))
    }

    pub async fn heartbeat(&self, client_id: &str) -> anyhow::Result<()> {
        let _: Option<serde_json::Value> = self
            .call("clientHeartbeat", json!({ "client_id": client_id }))
            .await?;
        Ok(())
    }

    pub async fn get_rules(&self, client_id: &str) -> anyhow::Result<Vec<Rule>> {
        let reply: Option<RulesReply> = self
            .call("clientGetRules", json!({ "client_id": client_id }))
            .await?;
        Ok(reply.map(|r| r.rules).unwrap_or_default())
    }

    pub async fn report_traffic(
        &self,
        client_id: &str,
        reports: &[TrafficReport],
    ) -> anyhow::Result<()> {
        let _: Option<serde_json::Value> = self
            .call(
                "clientReportTraffic",
                json!({ "client_id": client_id, "reports": reports }),
            )
            .await?;
        Ok(())
    }

    pub async fn report_rule_status(
        &self,
        client_id: &str,
        reports: &[RuleStatusReport],
    ) -> anyhow::Result<()> {
        let _: Option<serde_json::Value> = self
            .call(
                "clientReportRuleStatus",
                json!({ "client_id": client_id, "reports": reports }),
            )
            .await?;
        Ok(())
    }
}
