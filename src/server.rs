//! Long-running mode: scheduler, event listener and webhook in one process.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tracing::{error, info, warn};

use crate::chat::ChatGateway;
use crate::chat::slack::SlackGateway;
use crate::check::ComplianceRun;
use crate::config::AppConfig;
use crate::error::Result;
use crate::exception::ExceptionStore;
use crate::exception::sqlite::SqliteListStore;
use crate::inventory::openstack::OpenStackInventory;
use crate::listener::EventListener;
use crate::notification::Notifier;
use crate::policy::engine::OpaEngine;
use crate::scheduler::Scheduler;
use crate::web::{self, AppState};

/// Capacity of the webhook to listener channel.
const EVENT_BUFFER: usize = 64;

/// Slack gateway built from `config`.
pub fn chat_gateway(config: &AppConfig) -> Result<Arc<dyn ChatGateway>> {
    Ok(Arc::new(SlackGateway::new(
        config.slack.token.clone(),
        &config.slack.api_url,
        config.timeout(),
    )?))
}

/// SQLite-backed store when `store.path` is set, in-memory otherwise.
pub fn exception_store(config: &AppConfig) -> Result<ExceptionStore> {
    match &config.store.path {
        Some(path) => {
            info!("Temporary exceptions stored in {}", path.display());
            Ok(ExceptionStore::new(Arc::new(SqliteListStore::open(path)?)))
        }
        None => {
            warn!("No store.path configured, temporary exceptions are lost on restart");
            Ok(ExceptionStore::in_memory())
        }
    }
}

/// A compliance run against OpenStack and OPA.
pub fn compliance_run(
    config: Arc<AppConfig>,
    gateway: Arc<dyn ChatGateway>,
    exceptions: ExceptionStore,
) -> Result<ComplianceRun> {
    let inventory = OpenStackInventory::new(config.openstack.clone(), config.timeout())?;
    let engine = OpaEngine::new(&config.opa.url, config.timeout())?;
    let notifier = Notifier::from_config(gateway, &config);
    Ok(ComplianceRun::new(
        config,
        Arc::new(inventory),
        Arc::new(engine),
        exceptions,
        notifier,
    ))
}

/// Flatten a joined task into its own result, logging failures.
fn joined(name: &str, outcome: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match outcome {
        Ok(result) => {
            if let Err(e) = &result {
                error!("{} failed: {}", name, e);
            }
            result
        }
        Err(e) => {
            error!("{} panicked: {}", name, e);
            Ok(())
        }
    }
}

/// Run until Ctrl-C, until the chat platform rejects our credentials or until
/// the webhook server fails.
pub async fn serve(config: AppConfig) -> Result<()> {
    let config = Arc::new(config.for_server()?);
    let webhook = web::bind(&config.server.listen).await?;

    let gateway = chat_gateway(&config)?;
    let exceptions = exception_store(&config)?;

    let run = compliance_run(config.clone(), gateway.clone(), exceptions.clone())?;
    let scheduler = Scheduler::new(&config, Arc::new(run), exceptions.clone())?;
    let listener = EventListener::new(gateway, exceptions, &config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);

    let tasks = scheduler.spawn(shutdown_rx.clone());

    let mut listener_task = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { listener.run(event_rx, shutdown).await })
    };

    let mut web_task = {
        let state = Arc::new(AppState { events: event_tx });
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { web::start(webhook, state, shutdown).await })
    };

    info!(
        "sgguard server started (dry_run = {}, batch_size = {:?})",
        config.dry_run, config.slack.batch_size
    );

    let mut result = Ok(());
    let (listener_done, web_done) = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                result = Err(e.into());
            }
            info!("Shutting down...");
            (false, false)
        }
        outcome = &mut listener_task => {
            warn!("Event listener exited");
            result = joined("Event listener", outcome);
            (true, false)
        }
        outcome = &mut web_task => {
            warn!("Webhook server exited");
            result = joined("Webhook server", outcome);
            (false, true)
        }
    };

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            error!("Background task failed: {}", e);
        }
    }
    if !listener_done {
        let outcome = joined("Event listener", listener_task.await);
        if result.is_ok() {
            result = outcome;
        }
    }
    if !web_done {
        let outcome = joined("Webhook server", web_task.await);
        if result.is_ok() {
            result = outcome;
        }
    }
    result
}
