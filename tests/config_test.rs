use sgguard::config::AppConfig;
use sgguard::error::SgGuardError;

fn write_config(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("sgguard.toml");
    std::fs::write(&path, body).unwrap();
    path
}

fn full_config(include: &str) -> String {
    format!(
        r#"
username = "sgguard"
icon_emoji = ":shield:"
check_interval = "0 0 10 * * *"
reset_interval = "0 0 10 * * *"
prefix_message = "Found security groups open to the world"
suffix_message = "React with :white_check_mark: to allow until the next reset"
include = "{include}"
timeout_secs = 12

[[rules]]
tenant = "web"
sg = "web-sg"
port = ["80", "443", "8000-8080"]

[[policies]]
policy = "policies/stale.rego"
data = "policies/data.json"
prefix_message = "Stale groups"
suffix_message = "Please clean up"

[openstack]
auth_url = "${{SGGUARD_IT_AUTH_URL}}"
username = "auditor"
password = "$SGGUARD_IT_PASSWORD"
project_name = "admin"
region_name = "RegionOne"

[slack]
token = "xoxb-test"
channel = "C123"
batch_size = 1

[store]
path = "sgguard.db"

[server]
listen = "127.0.0.1:9090"
"#
    )
}

#[test]
fn full_config_loads_with_env_and_includes() {
    unsafe {
        std::env::set_var("SGGUARD_IT_AUTH_URL", "https://keystone.example.com:5000");
        std::env::set_var("SGGUARD_IT_PASSWORD", "hunter2");
    }
    let dir = tempfile::tempdir().unwrap();
    let rules_dir = dir.path().join("rules.d");
    std::fs::create_dir(&rules_dir).unwrap();
    std::fs::write(
        rules_dir.join("b.toml"),
        "[[rules]]\ntenant = \"db\"\nsg = \"db-sg\"\nport = [\"5432\"]\n",
    )
    .unwrap();
    std::fs::write(
        rules_dir.join("a.toml"),
        "[[rules]]\ntenant = \"ops\"\nsg = \"bastion\"\nport = [\"22\"]\n",
    )
    .unwrap();

    let include = format!("{}/*.toml", rules_dir.display());
    let path = write_config(&dir, &full_config(&include));
    let config = AppConfig::load_from_path(&path).unwrap();

    assert_eq!(config.openstack.auth_url, "https://keystone.example.com:5000");
    assert_eq!(config.openstack.password, "hunter2");
    assert_eq!(config.openstack.region_name.as_deref(), Some("RegionOne"));
    let sgs: Vec<&str> = config.rules.iter().map(|r| r.sg.as_str()).collect();
    assert_eq!(sgs, vec!["web-sg", "bastion", "db-sg"]);
    assert_eq!(config.policies[0].query, "data.example.allow");
    assert_eq!(config.slack.batch_size, Some(1));
    assert_eq!(config.timeout_secs, 12);
    assert_eq!(config.server.listen, "127.0.0.1:9090");
    assert!(config.store.path.is_some());
}

#[test]
fn unset_variable_fails_load() {
    let dir = tempfile::tempdir().unwrap();
    let body = full_config("").replace("SGGUARD_IT_AUTH_URL", "SGGUARD_IT_NEVER_SET");
    let path = write_config(&dir, &body);
    let err = AppConfig::load_from_path(&path).unwrap_err();
    assert!(matches!(err, SgGuardError::ConfigEnvVar(ref name) if name == "SGGUARD_IT_NEVER_SET"));
}

#[test]
fn five_field_cron_is_rejected() {
    unsafe {
        std::env::set_var("SGGUARD_IT_AUTH_URL", "https://keystone.example.com:5000");
        std::env::set_var("SGGUARD_IT_PASSWORD", "hunter2");
    }
    let dir = tempfile::tempdir().unwrap();
    let body = full_config("").replace(
        "check_interval = \"0 0 10 * * *\"",
        "check_interval = \"*/5 * * * *\"",
    );
    let path = write_config(&dir, &body);
    let err = AppConfig::load_from_path(&path).unwrap_err();
    assert!(matches!(err, SgGuardError::Config(_)));
}

#[test]
fn credentials_with_quotes_and_backslashes_load_verbatim() {
    unsafe {
        std::env::set_var("SGGUARD_IT_AUTH_URL", "https://keystone.example.com:5000");
        std::env::set_var("SGGUARD_IT_QUOTED_PASSWORD", r#"pa"ss\w0rd"#);
    }
    let dir = tempfile::tempdir().unwrap();
    let body = full_config("").replace("$SGGUARD_IT_PASSWORD", "${SGGUARD_IT_QUOTED_PASSWORD}");
    let path = write_config(&dir, &body);
    let config = AppConfig::load_from_path(&path).unwrap();
    assert_eq!(config.openstack.password, r#"pa"ss\w0rd"#);
}
