//! Policy-engine adapter.
//!
//! Security groups are handed to an external policy engine as JSON input and
//! the engine answers with a boolean verdict. [`PolicyEngine`] abstracts the
//! engine; [`OpaEngine`] talks to an Open Policy Agent server over its REST
//! API:
//!
//! - `GET    /v1/policies`       list loaded modules
//! - `DELETE /v1/policies/{id}`  unload a module
//! - `PUT    /v1/policies/{id}`  upload (compile) the Rego source
//! - `PUT    /v1/data`           replace the base data document
//! - `POST   /v1/data/{path}`    evaluate the query with `{"input": ...}`
//!
//! OPA merges every loaded module that declares the same package and serves
//! one base data document. Policies are therefore evaluated one at a time:
//! compiling a policy first unloads every module sgguard uploaded before
//! (ids prefixed with [`MODULE_PREFIX`]) and replaces the data document, and
//! [`PolicyEngine::release`] unloads it again once its groups are evaluated.
//! The OPA server is assumed to be dedicated to one sgguard process.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::config::PolicyConfig;
use crate::error::{Result, SgGuardError};
use crate::inventory::SecurityGroup;

/// A compiled policy, ready to evaluate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedQuery {
    /// Engine-side policy identifier.
    pub policy_id: String,
    /// Dotted query, e.g. `data.example.allow`.
    pub query: String,
}

impl PreparedQuery {
    /// Human-readable name for logs.
    pub fn name(&self) -> &str {
        &self.policy_id
    }
}

/// Trait for policy-engine backends.
///
/// Implementations must be `Send + Sync` for use across async tasks.
#[async_trait::async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Load the policy source (and optional data) and bind its query.
    ///
    /// Failures are reported as [`SgGuardError::PolicyLoad`].
    async fn compile(&self, policy: &PolicyConfig) -> Result<PreparedQuery>;

    /// Evaluate a prepared query against a JSON input document.
    async fn evaluate(&self, query: &PreparedQuery, input: &serde_json::Value) -> Result<bool>;

    /// Unload a compiled policy once it is no longer evaluated.
    async fn release(&self, _query: &PreparedQuery) -> Result<()> {
        Ok(())
    }
}

/// Prefix of every module id sgguard uploads to OPA.
pub const MODULE_PREFIX: &str = "sgguard_";

/// Serialize a security group into the JSON input given to policies.
///
/// `created_at` is integer nanoseconds since the Unix epoch (`0` when unknown).
pub fn policy_input(group: &SecurityGroup) -> serde_json::Value {
    let created_at = group
        .created_at
        .and_then(|dt| dt.timestamp_nanos_opt())
        .unwrap_or(0);

    let rules: Vec<serde_json::Value> = group
        .rules
        .iter()
        .map(|r| {
            serde_json::json!({
                "direction": r.direction,
                "protocol": r.protocol,
                "remote_ip_prefix": r.remote_ip_prefix,
                "port_range_min": r.port_min(),
                "port_range_max": r.port_max(),
                "ethertype": r.ethertype,
            })
        })
        .collect();

    serde_json::json!({
        "id": group.id,
        "name": group.name,
        "description": group.description,
        "tenant_id": group.tenant_id,
        "created_at": created_at,
        "rules": rules,
    })
}

/// Evaluate one group against a prepared query.
pub async fn evaluate_group(
    engine: &dyn PolicyEngine,
    query: &PreparedQuery,
    group: &SecurityGroup,
) -> Result<bool> {
    let input = policy_input(group);
    let matched = engine.evaluate(query, &input).await?;
    debug!("Policy {} on {}: {}", query.name(), group.name, matched);
    Ok(matched)
}

/// Policy engine backed by an OPA server.
pub struct OpaEngine {
    base_url: String,
    client: reqwest::Client,
}

/// `GET /v1/policies` response.
#[derive(Debug, Deserialize)]
struct PolicyList {
    #[serde(default)]
    result: Vec<PolicyModule>,
}

#[derive(Debug, Deserialize)]
struct PolicyModule {
    id: String,
}

impl OpaEngine {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Unload every module left by an earlier policy or an earlier process.
    async fn unload_previous(&self) -> std::result::Result<(), String> {
        let resp = self
            .client
            .get(format!("{}/v1/policies", self.base_url))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("OPA policy listing returned {}", resp.status()));
        }
        let list: PolicyList = resp.json().await.map_err(|e| e.to_string())?;

        for module in list.result.iter().filter(|m| m.id.starts_with(MODULE_PREFIX)) {
            debug!("Unloading stale policy module {}", module.id);
            self.delete_module(&module.id).await?;
        }
        Ok(())
    }

    async fn delete_module(&self, id: &str) -> std::result::Result<(), String> {
        let resp = self
            .client
            .delete(format!("{}/v1/policies/{}", self.base_url, id))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("OPA returned {} unloading {}", resp.status(), id));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PolicyEngine for OpaEngine {
    async fn compile(&self, policy: &PolicyConfig) -> Result<PreparedQuery> {
        let name = policy.policy.display().to_string();
        let load_err = |reason: String| SgGuardError::PolicyLoad {
            policy: name.clone(),
            reason,
        };

        let data_path = query_path(&policy.query).ok_or_else(|| {
            load_err(format!("query {} does not start with data.", policy.query))
        })?;
        let source = std::fs::read_to_string(&policy.policy).map_err(|e| load_err(e.to_string()))?;
        let data: serde_json::Value = match &policy.data {
            Some(data_file) => {
                let raw =
                    std::fs::read_to_string(data_file).map_err(|e| load_err(e.to_string()))?;
                serde_json::from_str(&raw).map_err(|e| load_err(e.to_string()))?
            }
            None => serde_json::json!({}),
        };
        let policy_id = policy_id(&name);

        self.unload_previous().await.map_err(load_err)?;

        let resp = self
            .client
            .put(format!("{}/v1/data", self.base_url))
            .json(&data)
            .send()
            .await
            .map_err(|e| load_err(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(load_err(format!("OPA data upload returned {}: {}", status, body)));
        }

        let resp = self
            .client
            .put(format!("{}/v1/policies/{}", self.base_url, policy_id))
            .header("Content-Type", "text/plain")
            .body(source)
            .send()
            .await
            .map_err(|e| load_err(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(load_err(format!("OPA returned {}: {}", status, body)));
        }

        debug!("Compiled policy {} (query {})", policy_id, data_path);
        Ok(PreparedQuery {
            policy_id,
            query: policy.query.clone(),
        })
    }

    async fn evaluate(&self, query: &PreparedQuery, input: &serde_json::Value) -> Result<bool> {
        let path = query_path(&query.query)
            .ok_or_else(|| SgGuardError::PolicyEval(format!("bad query {}", query.query)))?;
        let url = format!("{}/v1/data/{}", self.base_url, path);

        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "input": input }))
            .send()
            .await
            .map_err(|e| SgGuardError::PolicyEval(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SgGuardError::PolicyEval(format!(
                "OPA returned {}: {}",
                status, body
            )));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| SgGuardError::PolicyEval(e.to_string()))?;
        Ok(json["result"].as_bool().unwrap_or(false))
    }

    async fn release(&self, query: &PreparedQuery) -> Result<()> {
        self.delete_module(&query.policy_id)
            .await
            .map_err(SgGuardError::PolicyEval)
    }
}

/// `data.example.allow` -> `example/allow`.
fn query_path(query: &str) -> Option<String> {
    let rest = query.strip_prefix("data.")?;
    if rest.is_empty() {
        return None;
    }
    Some(rest.replace('.', "/"))
}

/// Stable, URL-safe module id derived from the source path.
fn policy_id(path: &str) -> String {
    let sanitized: String = path
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}{}", MODULE_PREFIX, sanitized)
}
