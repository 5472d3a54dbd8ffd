// src/server/spawner.rs

//! Spawns all of the server's long-running background tasks: the worker
//! pool driver, configured recurring diff jobs, and the auto-repair loop.

use super::context::ServerContext;
use crate::core::autorepair::{
    AutoRepairSettings, auto_repair_pass, promote_exception_status,
};
use crate::core::runner::{TableDiffParams, TaskPayload};
use crate::core::scheduler::timeparse::parse_time_string;
use crate::core::scheduler::{JobFuture, RecurringJob, Trigger, WorkerPoolDriver, parse_crontab};
use crate::core::taskstore::TaskRecord;
use crate::server::context::AppState;
use anyhow::{Result, anyhow};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Spawns all critical background tasks into the context's JoinSet.
pub fn spawn_all(ctx: &mut ServerContext, driver: WorkerPoolDriver) -> Result<()> {
    let shutdown_rx = ctx.shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        driver.run(shutdown_rx).await;
        Ok(())
    });

    spawn_schedule_jobs(ctx)?;
    spawn_auto_repair(ctx)?;

    info!("All background tasks have been spawned.");
    Ok(())
}

/// One recurring table-diff job per enabled schedule entry.
fn spawn_schedule_jobs(ctx: &mut ServerContext) -> Result<()> {
    let config = ctx.state.config.clone();

    for entry in &config.schedule.entries {
        if !entry.enabled {
            continue;
        }
        let job = config
            .schedule
            .jobs
            .iter()
            .find(|j| j.name == entry.job_name)
            .ok_or_else(|| anyhow!("schedule entry references unknown job '{}'", entry.job_name))?;

        let trigger = match (&entry.crontab_schedule, &entry.run_frequency) {
            (Some(crontab), _) => Trigger::Cron(parse_crontab(crontab)?),
            (None, Some(freq)) => Trigger::Interval(parse_time_string(freq)?),
            (None, None) => unreachable!("validated at config load"),
        };

        let params = TableDiffParams {
            cluster_name: job.cluster_name.clone(),
            table_name: job.table_name.clone(),
            dbname: job.dbname.clone(),
            block_rows: job.block_rows.unwrap_or(config.block_rows),
            max_cpu_ratio: job.max_cpu_ratio.unwrap_or(config.max_cpu_ratio),
            batch_size: job.batch_size.unwrap_or(config.batch_size),
            nodes: job.nodes.clone().unwrap_or_else(|| "all".to_string()),
            output: "json".to_string(),
            quiet: true,
            table_filter: None,
        };

        let state = ctx.state.clone();
        let recurring = RecurringJob::new(
            job.name.clone(),
            trigger,
            move || scheduled_table_diff(state.clone(), params.clone()),
        );

        let pool = ctx.state.workers.clone();
        let shutdown_rx = ctx.shutdown_tx.subscribe();
        ctx.background_tasks.spawn(async move {
            recurring.run(pool, shutdown_rx).await;
            Ok(())
        });
    }

    Ok(())
}

/// A scheduled diff goes through the same store-then-run path as an API
/// submission, attributed to the scheduler.
fn scheduled_table_diff(state: Arc<AppState>, params: TableDiffParams) -> JobFuture {
    Box::pin(async move {
        let payload = TaskPayload::TableDiff(params);
        let record = TaskRecord::new(payload.task_type(), payload.context(), "scheduler");
        let task_id = record.task_id.clone();
        match state.store.create(record).await {
            Ok(()) => state.runner.clone().run(task_id).await,
            Err(e) => error!("Cannot enrol scheduled diff task: {e}"),
        }
    })
}

/// The status promoter and the repair driver, both interval-triggered.
fn spawn_auto_repair(ctx: &mut ServerContext) -> Result<()> {
    let config = ctx.state.config.clone();
    if !config.auto_repair.enabled {
        info!("Auto-repair is disabled in the configuration.");
        return Ok(());
    }

    let settings = AutoRepairSettings {
        cluster_dir: config.cluster_dir.clone(),
        cluster_name: config.auto_repair.cluster_name.clone(),
        dbname: config.auto_repair.dbname.clone(),
        statement_timeout_ms: config.statement_timeout_ms,
    };

    let status_interval = parse_time_string(&config.auto_repair.status_update_interval)?;
    let promoter_settings = settings.clone();
    let promoter = RecurringJob::new(
        "exception-status-promoter",
        Trigger::Interval(status_interval),
        move || {
            let settings = promoter_settings.clone();
            Box::pin(async move {
                if let Err(e) = promote_exception_status(&settings).await {
                    warn!("Exception status promotion failed: {e}");
                }
            })
        },
    );

    let poll_interval = parse_time_string(&config.auto_repair.poll_interval)?;
    let driver_settings = settings;
    let repair_driver = RecurringJob::new(
        "auto-repair-driver",
        Trigger::Interval(poll_interval),
        move || {
            let settings = driver_settings.clone();
            Box::pin(async move {
                if let Err(e) = auto_repair_pass(&settings).await {
                    warn!("Auto-repair pass failed: {e}");
                }
            })
        },
    );

    for job in [promoter, repair_driver] {
        let pool = ctx.state.workers.clone();
        let shutdown_rx = ctx.shutdown_tx.subscribe();
        ctx.background_tasks.spawn(async move {
            job.run(pool, shutdown_rx).await;
            Ok(())
        });
    }

    info!(
        "Auto-repair armed for cluster '{}' (db '{}').",
        config.auto_repair.cluster_name, config.auto_repair.dbname
    );
    Ok(())
}
