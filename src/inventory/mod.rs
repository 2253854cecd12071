//! Cloud inventory: the security groups and projects a compliance run audits.
//!
//! The [`Inventory`] trait abstracts over inventory backends. The shipped
//! implementation is [`openstack::OpenStackInventory`] (Keystone v3 + Neutron).
//! Everything returned here is a fresh snapshot for one run and is never
//! mutated locally.

pub mod openstack;

use chrono::{DateTime, Utc};

use crate::error::Result;

/// Authenticated session returned by [`Inventory::authenticate`].
#[derive(Debug, Clone, Default)]
pub struct Session {
    /// Bearer token sent with every subsequent call.
    pub token: String,
    /// Identity service base URL.
    pub identity_url: String,
    /// Network service base URL.
    pub network_url: String,
}

/// A project (tenant) known to the identity service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub id: String,
    pub name: String,
}

/// A single security-group rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// `"ingress"` or `"egress"`.
    pub direction: String,
    /// `"tcp"`, `"udp"`, ... or `None` for any protocol.
    pub protocol: Option<String>,
    /// Remote CIDR, `None` when the rule references a remote group instead.
    pub remote_ip_prefix: Option<String>,
    pub port_range_min: Option<u16>,
    pub port_range_max: Option<u16>,
    /// `"IPv4"` or `"IPv6"`.
    pub ethertype: String,
}

impl Rule {
    /// Lower port bound, `0` when unbounded.
    pub fn port_min(&self) -> u16 {
        self.port_range_min.unwrap_or(0)
    }

    /// Upper port bound, `0` when unbounded.
    pub fn port_max(&self) -> u16 {
        self.port_range_max.unwrap_or(0)
    }

    /// Port range rendered as `"{min}-{max}"`.
    pub fn port_range(&self) -> String {
        format!("{}-{}", self.port_min(), self.port_max())
    }
}

/// A security group with its ordered rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Owning project (tenant) id.
    pub tenant_id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub rules: Vec<Rule>,
}

/// Trait for inventory backends.
///
/// Implementations must be `Send + Sync` for use across async tasks.
#[async_trait::async_trait]
pub trait Inventory: Send + Sync {
    /// Authenticate and return a session for the calls below.
    async fn authenticate(&self) -> Result<Session>;
    /// List every project visible to the session.
    async fn list_projects(&self, session: &Session) -> Result<Vec<Project>>;
    /// List every security group visible to the session, following pagination.
    async fn list_security_groups(&self, session: &Session) -> Result<Vec<SecurityGroup>>;
}

/// Display name for a tenant id: the project name, or the raw id when unknown.
pub fn project_name<'a>(tenant_id: &'a str, projects: &'a [Project]) -> &'a str {
    projects
        .iter()
        .find(|p| p.id == tenant_id)
        .map(|p| p.name.as_str())
        .unwrap_or(tenant_id)
}
