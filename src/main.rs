use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use sgguard::cli::{Cli, Commands};
use sgguard::config::AppConfig;
use sgguard::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sgguard=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { dry_run } => cmd_check(&cli.config, dry_run).await?,
        Commands::Server { dry_run } => cmd_server(&cli.config, dry_run).await?,
    }

    Ok(())
}

fn load_config(config_path: &Path, dry_run: bool) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::load_from_path(config_path)?;
    config.dry_run |= dry_run;
    tracing::info!(
        "Loaded {} ({} allow-list rules, {} policies)",
        config_path.display(),
        config.rules.len(),
        config.policies.len()
    );
    Ok(config)
}

async fn cmd_check(config_path: &Path, dry_run: bool) -> anyhow::Result<()> {
    let config = Arc::new(load_config(config_path, dry_run)?);
    let gateway = server::chat_gateway(&config)?;
    let exceptions = server::exception_store(&config)?;
    let run = server::compliance_run(config, gateway, exceptions)?;

    let report = run.run().await?;
    println!("Run {}", report.run_id);
    println!("Open to any address: {}", report.full_open.len());
    for outcome in &report.policies {
        match outcome {
            sgguard::check::PolicyOutcome::Evaluated { policy, findings } => {
                println!("Policy {}: {}", policy, findings.len());
            }
            sgguard::check::PolicyOutcome::LoadFailed { policy, reason } => {
                println!("Policy {}: not loaded ({})", policy, reason);
            }
        }
    }
    if report.dry_run {
        println!("Dry run: nothing was posted.");
    }
    Ok(())
}

async fn cmd_server(config_path: &Path, dry_run: bool) -> anyhow::Result<()> {
    let config = load_config(config_path, dry_run)?;
    println!("sgguard starting...");
    println!("Config: {}", config_path.display());
    println!("Listen: {}", config.server.listen);
    println!("Check interval: {}", config.check_interval);
    println!("Reset interval: {}", config.reset_interval);

    server::serve(config).await?;
    Ok(())
}
