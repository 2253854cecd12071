//! Cron triggers for compliance runs and exception resets.
//!
//! Expressions use six fields with seconds first (`"0 */5 * * * *"`). Each
//! trigger runs in its own task and sleeps until its next fire time; both
//! tasks stop when the shutdown signal flips to `true`.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::check::ComplianceRun;
use crate::config::AppConfig;
use crate::error::{Result, SgGuardError};
use crate::exception::ExceptionStore;

/// Parse a cron expression, mapping failures to a config error.
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    Schedule::from_str(expr)
        .map_err(|e| SgGuardError::Config(format!("invalid cron expression {:?}: {}", expr, e)))
}

/// Time until the next fire of `schedule`, or `None` if it never fires again.
fn next_delay(schedule: &Schedule) -> Option<Duration> {
    let next = schedule.upcoming(Utc).next()?;
    Some((next - Utc::now()).to_std().unwrap_or(Duration::ZERO))
}

/// Call `tick` at every fire time of `schedule` until shutdown.
async fn every<F, Fut>(
    name: &'static str,
    schedule: Schedule,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let Some(delay) = next_delay(&schedule) else {
            warn!("{} schedule has no upcoming fire time", name);
            break;
        };

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(delay) => tick().await,
        }
    }
    info!("{} trigger stopped", name);
}

/// Drives [`ComplianceRun`] and [`ExceptionStore::clear`] on their schedules.
#[derive(Clone)]
pub struct Scheduler {
    check: Schedule,
    reset: Schedule,
    run: Arc<ComplianceRun>,
    exceptions: ExceptionStore,
    in_progress: Arc<Mutex<()>>,
}

impl Scheduler {
    pub fn new(config: &AppConfig, run: Arc<ComplianceRun>, exceptions: ExceptionStore) -> Result<Self> {
        Ok(Self {
            check: parse_schedule(&config.check_interval)?,
            reset: parse_schedule(&config.reset_interval)?,
            run,
            exceptions,
            in_progress: Arc::new(Mutex::new(())),
        })
    }

    /// Start a compliance run in the background unless one is still going.
    ///
    /// Returns `None` when the tick is skipped.
    pub fn start_check(&self) -> Option<JoinHandle<()>> {
        let Ok(guard) = self.in_progress.clone().try_lock_owned() else {
            warn!("Previous compliance run still in progress, skipping this tick");
            return None;
        };

        let run = self.run.clone();
        Some(tokio::spawn(async move {
            let _guard = guard;
            match run.run().await {
                Ok(report) => info!(
                    "Compliance run {} finished with {} findings",
                    report.run_id,
                    report.total_findings()
                ),
                Err(e) => error!("Compliance run failed: {}", e),
            }
        }))
    }

    /// Clear every temporary exception.
    pub async fn reset(&self) {
        if let Err(e) = self.exceptions.clear().await {
            error!("Failed to reset temporary exceptions: {}", e);
        }
    }

    /// Spawn the check and reset triggers.
    ///
    /// The check task finishes only after a run started by its last tick has
    /// completed, so joining the handles drains in-flight work.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!("Check interval: {}", self.check);
        info!("Reset interval: {}", self.reset);

        let checker = self.clone();
        let check_shutdown = shutdown.clone();
        let check = tokio::spawn(async move {
            let trigger = checker.clone();
            every("check", checker.check.clone(), check_shutdown, move || {
                trigger.start_check();
                std::future::ready(())
            })
            .await;

            if checker.in_progress.try_lock().is_err() {
                info!("Waiting for the running compliance run to finish");
            }
            let _drained = checker.in_progress.lock().await;
        });

        let resetter = self.clone();
        let reset = tokio::spawn(every("reset", self.reset.clone(), shutdown, move || {
            let resetter = resetter.clone();
            async move { resetter.reset().await }
        }));

        vec![check, reset]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::testing::MockGateway;
    use crate::check::testing::{FakeEngine, FakeInventory};
    use crate::notification::Notifier;

    const BASE_TOML: &str = r#"
username = "sgguard"
icon_emoji = ":shield:"
check_interval = "0 0 0 1 1 *"
reset_interval = "* * * * * *"
prefix_message = "open groups found"
suffix_message = "react to allow"

[openstack]
auth_url = "https://keystone.example.com:5000"
username = "auditor"
password = "secret"
project_name = "admin"

[slack]
token = "xoxb-test"
channel = "C123"
"#;

    fn scheduler(exceptions: ExceptionStore) -> Scheduler {
        let config = Arc::new(AppConfig::from_toml_str(BASE_TOML).unwrap());
        let (gateway, _sent) = MockGateway::new();
        let run = ComplianceRun::new(
            config.clone(),
            Arc::new(FakeInventory {
                projects: vec![],
                groups: vec![],
                fail_auth: false,
            }),
            Arc::new(FakeEngine::default()),
            exceptions.clone(),
            Notifier::from_config(Arc::new(gateway), &config),
        );
        Scheduler::new(&config, Arc::new(run), exceptions).unwrap()
    }

    #[test]
    fn six_field_expressions_parse() {
        assert!(parse_schedule("0 */5 * * * *").is_ok());
        assert!(parse_schedule("0 0 10 * * Mon-Fri").is_ok());
    }

    #[test]
    fn bad_expressions_are_config_errors() {
        assert!(matches!(parse_schedule("every day"), Err(SgGuardError::Config(_))));
        assert!(matches!(parse_schedule("61 * * * * *"), Err(SgGuardError::Config(_))));
    }

    #[test]
    fn next_delay_is_bounded_by_period() {
        let schedule = parse_schedule("* * * * * *").unwrap();
        let delay = next_delay(&schedule).unwrap();
        assert!(delay <= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn check_tick_is_skipped_while_running() {
        let scheduler = scheduler(ExceptionStore::in_memory());
        let held = scheduler.in_progress.clone().try_lock_owned().unwrap();
        assert!(scheduler.start_check().is_none());

        drop(held);
        let handle = scheduler.start_check().unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_run() {
        let scheduler = scheduler(ExceptionStore::in_memory());
        let running = scheduler.in_progress.clone().try_lock_owned().unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = scheduler.spawn(shutdown_rx);
        shutdown_tx.send(true).unwrap();

        let check = handles.remove(0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!check.is_finished());

        drop(running);
        tokio::time::timeout(Duration::from_secs(2), check)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn reset_trigger_clears_exceptions_and_stops_on_shutdown() {
        let exceptions = ExceptionStore::in_memory();
        exceptions.add("g1").await.unwrap();
        let scheduler = scheduler(exceptions.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = scheduler.spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(exceptions.list().await.unwrap().is_empty());

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
