use chrono::Utc;
use clubhouse_store::app_config::SchedulerConfig;
use std::future::Future;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use crate::state::AppState;

/// Runs `job` every `every`, starting immediately. Errors are logged and the
/// loop carries on with the next tick.
fn spawn_periodic<F, Fut>(name: &'static str, every: Duration, job: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(job = name, every_secs = every.as_secs(), "Scheduled job started");
        loop {
            ticker.tick().await;
            job().await;
        }
    })
}

/// Starts the in-process batch jobs: payout generation followed by transfer
/// execution, installment reminders, and the reconciliation sweep.
pub fn start_scheduler(state: AppState, config: &SchedulerConfig) -> Vec<JoinHandle<()>> {
    let payouts = state.clone();
    let reminders = state.clone();
    let reconciliation = state;

    vec![
        spawn_periodic("payouts", Duration::from_secs(config.payout_interval_secs.max(1)), move || {
            let state = payouts.clone();
            async move {
                match state.payouts.generate(Utc::now().date_naive()).await {
                    Ok(report) => info!(
                        period = %report.period.label(),
                        created = report.created,
                        updated = report.updated,
                        failed = report.failed,
                        "Payout generation finished"
                    ),
                    Err(e) => error!(error = %e, "Payout generation failed"),
                }
                match state.transfers.execute().await {
                    Ok(report) => info!(
                        examined = report.examined,
                        paid = report.paid,
                        failed = report.failed,
                        flagged = report.flagged,
                        "Transfer execution finished"
                    ),
                    Err(e) => error!(error = %e, "Transfer execution failed"),
                }
            }
        }),
        spawn_periodic("reminders", Duration::from_secs(config.reminder_interval_secs.max(1)), move || {
            let state = reminders.clone();
            async move {
                if let Err(e) = state.reminders.run(Utc::now().date_naive()).await {
                    error!(error = %e, "Installment reminders failed");
                }
            }
        }),
        spawn_periodic(
            "reconciliation",
            Duration::from_secs(config.reconciliation_interval_secs.max(1)),
            move || {
                let state = reconciliation.clone();
                async move {
                    match state.reconciliation.sweep().await {
                        Ok(report) if report.examined > 0 => info!(
                            examined = report.examined,
                            resolved = report.resolved,
                            still_open = report.still_open,
                            "Reconciliation sweep finished"
                        ),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Reconciliation sweep failed"),
                    }
                }
            },
        ),
    ]
}
