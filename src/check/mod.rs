//! One compliance pass over the security-group inventory.
//!
//! A [`ComplianceRun`] authenticates to the inventory, resolves allow-list
//! tenants, reads the exception snapshot and then runs two phases in order:
//!
//! 1. **Full-open scan**: every ingress TCP rule open to `0.0.0.0/0` that is
//!    neither allow-listed nor excepted becomes a [`Finding`].
//! 2. **Policy scan**: every configured policy is compiled and evaluated
//!    against each non-excepted group. A policy that fails to compile is
//!    recorded in the report and the next policy still runs.
//!
//! Findings are posted through the [`Notifier`] unless the run is a dry run.
//! Notification failures are logged and never abort the pass.

use std::sync::Arc;

use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::chat::Attachment;
use crate::config::{AllowEntry, AppConfig, PolicyConfig};
use crate::error::{Result, SgGuardError};
use crate::exception::{ExceptionSnapshot, ExceptionStore};
use crate::inventory::{Inventory, Project, Rule, SecurityGroup, project_name};
use crate::notification::{Notifier, full_open_attachment, policy_attachment};
use crate::policy::allowlist::{is_full_open, matches_allow_list, resolve_tenants};
use crate::policy::engine::{PolicyEngine, evaluate_group};

/// A non-compliant group (and rule, for full-open findings).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub group: SecurityGroup,
    /// The offending rule of a full-open finding.
    pub rule: Option<Rule>,
    /// The policy that flagged the group.
    pub policy: Option<String>,
    /// Owner display name.
    pub owner: String,
}

impl Finding {
    pub fn attachment(&self) -> Attachment {
        match &self.rule {
            Some(rule) => full_open_attachment(&self.group, rule, &self.owner),
            None => policy_attachment(&self.group, &self.owner),
        }
    }
}

/// Result of one policy within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyOutcome {
    Evaluated {
        policy: String,
        findings: Vec<Finding>,
    },
    LoadFailed {
        policy: String,
        reason: String,
    },
}

impl PolicyOutcome {
    pub fn policy(&self) -> &str {
        match self {
            PolicyOutcome::Evaluated { policy, .. } | PolicyOutcome::LoadFailed { policy, .. } => {
                policy
            }
        }
    }

    pub fn findings(&self) -> &[Finding] {
        match self {
            PolicyOutcome::Evaluated { findings, .. } => findings,
            PolicyOutcome::LoadFailed { .. } => &[],
        }
    }
}

/// Everything a run found.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub full_open: Vec<Finding>,
    pub policies: Vec<PolicyOutcome>,
    /// Exception ids read at the start of the run.
    pub exceptions: Vec<String>,
    pub dry_run: bool,
}

impl RunReport {
    /// Full-open plus policy findings.
    pub fn total_findings(&self) -> usize {
        self.full_open.len()
            + self
                .policies
                .iter()
                .map(|p| p.findings().len())
                .sum::<usize>()
    }
}

/// Orchestrates a single audit pass.
pub struct ComplianceRun {
    config: Arc<AppConfig>,
    inventory: Arc<dyn Inventory>,
    engine: Arc<dyn PolicyEngine>,
    exceptions: ExceptionStore,
    notifier: Notifier,
}

impl ComplianceRun {
    pub fn new(
        config: Arc<AppConfig>,
        inventory: Arc<dyn Inventory>,
        engine: Arc<dyn PolicyEngine>,
        exceptions: ExceptionStore,
        notifier: Notifier,
    ) -> Self {
        Self {
            config,
            inventory,
            engine,
            exceptions,
            notifier,
        }
    }

    /// Run both phases once.
    ///
    /// Authentication, inventory and exception-store failures abort the pass.
    pub async fn run(&self) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("compliance_run", %run_id, dry_run = self.config.dry_run);
        self.run_phases(run_id).instrument(span).await
    }

    async fn run_phases(&self, run_id: Uuid) -> Result<RunReport> {
        let session = self.inventory.authenticate().await?;
        let projects = self.inventory.list_projects(&session).await?;
        let entries = resolve_tenants(&self.config.rules, &projects);
        let groups = self.inventory.list_security_groups(&session).await?;
        debug!(
            "Fetched {} projects and {} security groups",
            projects.len(),
            groups.len()
        );

        let snapshot = self.exceptions.snapshot().await?;
        info!("Temporary allowed security groups: {:?}", snapshot.ids());

        info!("Scanning for security groups open to any address");
        let full_open = scan_full_open(&groups, &entries, &projects, &snapshot);
        if full_open.is_empty() {
            info!("No security group open to any address found");
        } else {
            info!("{} rules open to any address found", full_open.len());
            self.notify(
                &full_open,
                &self.config.prefix_message,
                &self.config.suffix_message,
            )
            .await;
        }

        info!("Scanning for security groups matching policies");
        let mut policies = Vec::with_capacity(self.config.policies.len());
        for policy in &self.config.policies {
            let outcome = self.scan_policy(policy, &groups, &projects, &snapshot).await;
            if let PolicyOutcome::Evaluated { findings, .. } = &outcome {
                if findings.is_empty() {
                    info!("No security group matches policy {}", outcome.policy());
                } else {
                    info!(
                        "{} security groups match policy {}",
                        findings.len(),
                        outcome.policy()
                    );
                    self.notify(findings, &policy.prefix_message, &policy.suffix_message)
                        .await;
                }
            }
            policies.push(outcome);
        }

        Ok(RunReport {
            run_id,
            full_open,
            policies,
            exceptions: snapshot.ids().to_vec(),
            dry_run: self.config.dry_run,
        })
    }

    async fn scan_policy(
        &self,
        policy: &PolicyConfig,
        groups: &[SecurityGroup],
        projects: &[Project],
        snapshot: &ExceptionSnapshot,
    ) -> PolicyOutcome {
        let name = policy.policy.display().to_string();

        let query = match self.engine.compile(policy).await {
            Ok(query) => query,
            Err(e) => {
                error!("Skipping policy {}: {}", name, e);
                let reason = match e {
                    SgGuardError::PolicyLoad { reason, .. } => reason,
                    other => other.to_string(),
                };
                return PolicyOutcome::LoadFailed {
                    policy: name,
                    reason,
                };
            }
        };

        let mut findings = Vec::new();
        for group in groups {
            if snapshot.contains(&group.id) {
                debug!("{} is temporarily allowed, not evaluated", group.id);
                continue;
            }
            match evaluate_group(self.engine.as_ref(), &query, group).await {
                Ok(true) => {
                    let owner = project_name(&group.tenant_id, projects).to_string();
                    debug!(
                        "[[rules]]\ntenant = \"{}\"\nsg = \"{}\"\ncreated = \"{}\"",
                        owner,
                        group.name,
                        group
                            .created_at
                            .map(|dt| dt.to_rfc3339())
                            .unwrap_or_default()
                    );
                    findings.push(Finding {
                        group: group.clone(),
                        rule: None,
                        policy: Some(name.clone()),
                        owner,
                    });
                }
                Ok(false) => {}
                Err(e) => warn!("Policy {} failed on {}: {}", name, group.id, e),
            }
        }

        if let Err(e) = self.engine.release(&query).await {
            warn!("Failed to unload policy {}: {}", name, e);
        }

        PolicyOutcome::Evaluated {
            policy: name,
            findings,
        }
    }

    async fn notify(&self, findings: &[Finding], prefix: &str, suffix: &str) {
        if self.config.dry_run {
            info!("Dry run, {} findings not posted", findings.len());
            return;
        }
        let attachments: Vec<Attachment> = findings.iter().map(Finding::attachment).collect();
        if let Err(e) = self.notifier.post_warning(&attachments, prefix, suffix).await {
            error!("Failed to post warning: {}", e);
        }
    }
}

/// Phase A: uncovered, non-excepted full-open rules.
fn scan_full_open(
    groups: &[SecurityGroup],
    entries: &[AllowEntry],
    projects: &[Project],
    snapshot: &ExceptionSnapshot,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    for group in groups {
        for rule in group.rules.iter().filter(|r| is_full_open(r)) {
            if matches_allow_list(group, rule, entries) {
                continue;
            }
            if snapshot.contains(&group.id) {
                debug!("{} is temporarily allowed, not reported", group.id);
                continue;
            }
            let owner = project_name(&group.tenant_id, projects).to_string();
            debug!(
                "[[rules]]\ntenant = \"{}\"\nsg = \"{}\"\nport = [\"{}\"]",
                owner,
                group.name,
                rule.port_range()
            );
            findings.push(Finding {
                group: group.clone(),
                rule: Some(rule.clone()),
                policy: None,
                owner,
            });
        }
    }
    findings
}
