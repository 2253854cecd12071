use crate::config::AllowEntry;
use crate::inventory::{Project, Rule, SecurityGroup};

const ANY_IPV4: &str = "0.0.0.0/0";

/// True for an ingress TCP rule open to `0.0.0.0/0`.
pub fn is_full_open(rule: &Rule) -> bool {
    rule.direction == "ingress"
        && rule.protocol.as_deref() == Some("tcp")
        && rule.remote_ip_prefix.as_deref() == Some(ANY_IPV4)
}

/// Check whether a rule of `group` is covered by a static allow-list entry.
///
/// An entry covers the rule when its resolved tenant id equals the group's
/// owner, its name equals the group name, and its port specs either contain
/// the token `"{min}-{max}"` or contain both `"{min}"` and `"{max}"` as
/// separate tokens. The second form only checks the two boundaries, so
/// `{"80", "443"}` covers a rule for `80-443`.
pub fn matches_allow_list(group: &SecurityGroup, rule: &Rule, entries: &[AllowEntry]) -> bool {
    let min = rule.port_min().to_string();
    let max = rule.port_max().to_string();
    let range = format!("{}-{}", min, max);

    entries.iter().any(|entry| {
        let Some(tenant_id) = entry.tenant_id.as_deref() else {
            return false;
        };
        if tenant_id != group.tenant_id || entry.sg != group.name {
            return false;
        }

        let has = |token: &str| entry.port.iter().any(|p| p == token);
        has(&range) || (has(&min) && has(&max))
    })
}

/// Return the entries with `tenant_id` resolved from project names.
///
/// Entries whose tenant is not among `projects` stay unresolved. When two
/// projects share a name the last one listed wins.
pub fn resolve_tenants(entries: &[AllowEntry], projects: &[Project]) -> Vec<AllowEntry> {
    entries
        .iter()
        .map(|entry| AllowEntry {
            tenant_id: projects
                .iter()
                .rfind(|p| p.name == entry.tenant)
                .map(|p| p.id.clone()),
            ..entry.clone()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_rule(direction: &str, protocol: &str, cidr: &str, min: u16, max: u16) -> Rule {
        Rule {
            direction: direction.to_string(),
            protocol: Some(protocol.to_string()),
            remote_ip_prefix: Some(cidr.to_string()),
            port_range_min: Some(min),
            port_range_max: Some(max),
            ethertype: "IPv4".to_string(),
        }
    }

    fn open_rule(min: u16, max: u16) -> Rule {
        make_rule("ingress", "tcp", "0.0.0.0/0", min, max)
    }

    fn make_group(tenant_id: &str, name: &str) -> SecurityGroup {
        SecurityGroup {
            id: format!("{}-uuid", name),
            name: name.to_string(),
            description: String::new(),
            tenant_id: tenant_id.to_string(),
            created_at: None,
            rules: vec![],
        }
    }

    fn make_entry(tenant_id: Option<&str>, sg: &str, ports: Vec<&str>) -> AllowEntry {
        AllowEntry {
            tenant: "web".to_string(),
            tenant_id: tenant_id.map(str::to_string),
            sg: sg.to_string(),
            port: ports.into_iter().map(str::to_string).collect(),
        }
    }

    #[test]
    fn full_open_requires_ingress_tcp_any() {
        assert!(is_full_open(&open_rule(22, 22)));
        assert!(!is_full_open(&make_rule("egress", "tcp", "0.0.0.0/0", 22, 22)));
        assert!(!is_full_open(&make_rule("ingress", "udp", "0.0.0.0/0", 53, 53)));
        assert!(!is_full_open(&make_rule("ingress", "tcp", "10.0.0.0/8", 22, 22)));
    }

    #[test]
    fn any_protocol_rule_is_not_full_open() {
        let mut rule = open_rule(0, 0);
        rule.protocol = None;
        assert!(!is_full_open(&rule));
    }

    #[test]
    fn exact_range_token_suppresses() {
        let group = make_group("p-1", "web-sg");
        let entries = vec![make_entry(Some("p-1"), "web-sg", vec!["22-22"])];
        assert!(matches_allow_list(&group, &open_rule(22, 22), &entries));
    }

    #[test]
    fn different_range_token_does_not_suppress() {
        let group = make_group("p-1", "web-sg");
        let entries = vec![make_entry(Some("p-1"), "web-sg", vec!["22-23"])];
        assert!(!matches_allow_list(&group, &open_rule(22, 80), &entries));
    }

    #[test]
    fn boundary_tokens_suppress_non_contiguous_range() {
        // Only the two boundaries are checked, never the ports in between.
        let group = make_group("p-1", "web-sg");
        let entries = vec![make_entry(Some("p-1"), "web-sg", vec!["80", "443"])];
        assert!(matches_allow_list(&group, &open_rule(80, 443), &entries));
    }

    #[test]
    fn single_port_token_covers_single_port_rule_only() {
        let group = make_group("p-1", "web-sg");
        let entries = vec![make_entry(Some("p-1"), "web-sg", vec!["22"])];
        assert!(matches_allow_list(&group, &open_rule(22, 22), &entries));
        assert!(!matches_allow_list(&group, &open_rule(22, 23), &entries));
    }

    #[test]
    fn tenant_mismatch_does_not_suppress() {
        let group = make_group("p-2", "web-sg");
        let entries = vec![make_entry(Some("p-1"), "web-sg", vec!["22"])];
        assert!(!matches_allow_list(&group, &open_rule(22, 22), &entries));
    }

    #[test]
    fn name_mismatch_does_not_suppress() {
        let group = make_group("p-1", "api-sg");
        let entries = vec![make_entry(Some("p-1"), "web-sg", vec!["22"])];
        assert!(!matches_allow_list(&group, &open_rule(22, 22), &entries));
    }

    #[test]
    fn unresolved_entry_never_matches() {
        let group = make_group("", "web-sg");
        let entries = vec![make_entry(None, "web-sg", vec!["22"])];
        assert!(!matches_allow_list(&group, &open_rule(22, 22), &entries));
    }

    #[test]
    fn resolve_tenants_sets_ids_by_name() {
        let projects = vec![
            Project {
                id: "p-1".to_string(),
                name: "web".to_string(),
            },
            Project {
                id: "p-2".to_string(),
                name: "db".to_string(),
            },
        ];
        let mut missing = make_entry(None, "x-sg", vec![]);
        missing.tenant = "gone".to_string();
        let entries = vec![make_entry(None, "web-sg", vec!["80"]), missing];

        let resolved = resolve_tenants(&entries, &projects);
        assert_eq!(resolved[0].tenant_id.as_deref(), Some("p-1"));
        assert!(resolved[1].tenant_id.is_none());
        // Input is left untouched.
        assert!(entries[0].tenant_id.is_none());
    }
}
