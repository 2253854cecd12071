//! OpenStack inventory backend (Keystone v3 + Neutron v2.0).
//!
//! Authentication uses the Keystone password method scoped to a project.
//! The token comes back in the `X-Subject-Token` header and the service
//! catalog in the body supplies the identity and network endpoints.
//! Listing calls follow the `next` links until the collection is exhausted.
//!
//! An optional client certificate/key pair enables mTLS, and an optional CA
//! bundle is added to the trusted roots.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use super::{Inventory, Project, Rule, SecurityGroup, Session};
use crate::config::OpenStackConfig;
use crate::error::{Result, SgGuardError};

/// Inventory backed by the OpenStack REST APIs.
pub struct OpenStackInventory {
    config: OpenStackConfig,
    client: reqwest::Client,
}

impl OpenStackInventory {
    /// Build the HTTP client (with mTLS identity and extra CA when configured).
    pub fn new(config: OpenStackConfig, timeout: Duration) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(timeout);

        if let Some(ca_path) = &config.ca_cert {
            let pem = std::fs::read(ca_path)?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| SgGuardError::Authentication(format!("invalid CA bundle: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        if let (Some(cert_path), Some(key_path)) = (&config.cert, &config.key) {
            let mut pem = std::fs::read(cert_path)?;
            pem.push(b'\n');
            pem.extend(std::fs::read(key_path)?);
            let identity = reqwest::Identity::from_pem(&pem).map_err(|e| {
                SgGuardError::Authentication(format!("invalid client certificate: {}", e))
            })?;
            builder = builder.identity(identity);
        }

        let client = builder.build()?;
        Ok(Self { config, client })
    }

    fn auth_body(&self) -> serde_json::Value {
        serde_json::json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.config.username,
                            "domain": { "name": self.config.domain_name },
                            "password": self.config.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": self.config.project_name,
                        "domain": { "name": self.config.domain_name },
                    }
                }
            }
        })
    }

    async fn get_json(&self, session: &Session, url: &str) -> Result<serde_json::Value> {
        let resp = self
            .client
            .get(url)
            .header("X-Auth-Token", &session.token)
            .send()
            .await
            .map_err(|e| SgGuardError::InventoryFetch(format!("GET {}: {}", url, e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SgGuardError::InventoryFetch(format!(
                "GET {} returned {}: {}",
                url, status, body
            )));
        }

        resp.json()
            .await
            .map_err(|e| SgGuardError::InventoryFetch(format!("GET {}: {}", url, e)))
    }
}

#[async_trait::async_trait]
impl Inventory for OpenStackInventory {
    async fn authenticate(&self) -> Result<Session> {
        let url = format!("{}/auth/tokens", versioned_url(&self.config.auth_url, "v3"));

        let resp = self
            .client
            .post(&url)
            .json(&self.auth_body())
            .send()
            .await
            .map_err(|e| SgGuardError::Authentication(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SgGuardError::Authentication(format!(
                "Keystone returned {}: {}",
                status, body
            )));
        }

        let token = resp
            .headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| SgGuardError::Authentication("no X-Subject-Token header".to_string()))?;

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| SgGuardError::Authentication(format!("bad token body: {}", e)))?;

        let region = self.config.region_name.as_deref();
        let identity_url = find_endpoint(&body.token.catalog, "identity", region)
            .unwrap_or_else(|| self.config.auth_url.clone());
        let network_url = find_endpoint(&body.token.catalog, "network", region).ok_or_else(|| {
            SgGuardError::Authentication("no network endpoint in service catalog".to_string())
        })?;

        info!("Authenticated to OpenStack as {}", self.config.username);
        Ok(Session {
            token,
            identity_url,
            network_url,
        })
    }

    async fn list_projects(&self, session: &Session) -> Result<Vec<Project>> {
        let mut url = Some(format!(
            "{}/projects",
            versioned_url(&session.identity_url, "v3")
        ));
        let mut projects = Vec::new();

        while let Some(current) = url {
            let json = self.get_json(session, &current).await?;
            let page: ProjectPage = serde_json::from_value(json)
                .map_err(|e| SgGuardError::InventoryFetch(format!("bad project page: {}", e)))?;
            projects.extend(page.projects.into_iter().map(|p| Project {
                id: p.id,
                name: p.name,
            }));
            url = page.links.and_then(|l| l.next);
        }

        debug!("Fetched {} projects", projects.len());
        Ok(projects)
    }

    async fn list_security_groups(&self, session: &Session) -> Result<Vec<SecurityGroup>> {
        let mut url = Some(format!(
            "{}/security-groups",
            versioned_url(&session.network_url, "v2.0")
        ));
        let mut groups = Vec::new();

        while let Some(current) = url {
            let json = self.get_json(session, &current).await?;
            let page: SecurityGroupPage = serde_json::from_value(json).map_err(|e| {
                SgGuardError::InventoryFetch(format!("bad security group page: {}", e))
            })?;
            url = next_link(&page.security_groups_links);
            groups.extend(page.security_groups.into_iter().map(SecurityGroup::from));
        }

        debug!("Fetched {} security groups", groups.len());
        Ok(groups)
    }
}

// ─── Wire Types ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
struct CatalogEndpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    region_id: Option<String>,
    url: String,
}

#[derive(Debug, Deserialize)]
struct ProjectPage {
    projects: Vec<RawProject>,
    #[serde(default)]
    links: Option<PageLinks>,
}

#[derive(Debug, Deserialize)]
struct PageLinks {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawProject {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct SecurityGroupPage {
    security_groups: Vec<RawSecurityGroup>,
    #[serde(default)]
    security_groups_links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    rel: String,
    href: String,
}

/// Neutron returns both `tenant_id` and `project_id`; either may be missing.
#[derive(Debug, Deserialize)]
struct RawSecurityGroup {
    id: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    security_group_rules: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    direction: String,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    remote_ip_prefix: Option<String>,
    #[serde(default)]
    port_range_min: Option<u16>,
    #[serde(default)]
    port_range_max: Option<u16>,
    #[serde(default)]
    ethertype: Option<String>,
}

impl From<RawSecurityGroup> for SecurityGroup {
    fn from(raw: RawSecurityGroup) -> Self {
        Self {
            id: raw.id,
            name: raw.name,
            description: raw.description.unwrap_or_default(),
            tenant_id: raw.tenant_id.or(raw.project_id).unwrap_or_default(),
            created_at: raw.created_at.as_deref().and_then(parse_timestamp),
            rules: raw
                .security_group_rules
                .into_iter()
                .map(|r| Rule {
                    direction: r.direction,
                    protocol: r.protocol,
                    remote_ip_prefix: r.remote_ip_prefix,
                    port_range_min: r.port_range_min,
                    port_range_max: r.port_range_max,
                    ethertype: r.ethertype.unwrap_or_else(|| "IPv4".to_string()),
                })
                .collect(),
        }
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Ensure `base` ends with the given API version segment.
fn versioned_url(base: &str, version: &str) -> String {
    let trimmed = base.trim_end_matches('/');
    if trimmed.ends_with(&format!("/{}", version)) {
        trimmed.to_string()
    } else {
        format!("{}/{}", trimmed, version)
    }
}

/// Public endpoint URL of the given service type, preferring the configured region.
fn find_endpoint(catalog: &[CatalogEntry], service_type: &str, region: Option<&str>) -> Option<String> {
    let entry = catalog.iter().find(|e| e.service_type == service_type)?;
    entry
        .endpoints
        .iter()
        .filter(|ep| ep.interface == "public")
        .find(|ep| match region {
            Some(r) => ep.region.as_deref() == Some(r) || ep.region_id.as_deref() == Some(r),
            None => true,
        })
        .map(|ep| ep.url.clone())
}

fn next_link(links: &[Link]) -> Option<String> {
    links
        .iter()
        .find(|l| l.rel == "next")
        .map(|l| l.href.clone())
}

/// Neutron emits RFC 3339, older releases omit the offset.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}
