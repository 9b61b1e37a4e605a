use crate::output::{print_json, print_table};
use anyhow::Context;
use autoreason_core::clock::SystemClock;
use autoreason_core::config::Config;
use autoreason_core::engine::Liveness;
use autoreason_core::scheduler::{PassReport, Scheduler};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Exit status when a pass stops signaling activity.
const NOT_RESPONDING_EXIT: i32 = 3;

const MONITOR_POLL: Duration = Duration::from_secs(1);

pub fn run(
    root: &Path,
    passes: Option<usize>,
    equipment: Option<u64>,
    json: bool,
) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    if config.instances.is_empty() {
        anyhow::bail!("no instances configured; add one with `autoreason instance add`");
    }
    let db = Arc::new(super::open_db(root)?);
    let computer = computer_name();
    let mut scheduler = Scheduler::new(db, config, &computer, Arc::new(SystemClock), equipment)
        .context("failed to build scheduler")?;

    let watchdog = scheduler.watchdog();
    let _monitor = scheduler
        .spawn_monitor(MONITOR_POLL, || {
            tracing::error!("engine stopped signaling activity, exiting");
            std::process::exit(NOT_RESPONDING_EXIT);
        })
        .context("failed to start watchdog monitor")?;

    let mut total = PassReport::default();
    let mut done = 0usize;
    loop {
        let report = scheduler.run_pass();
        tracing::info!(
            pass = done + 1,
            committed = report.committed,
            empty = report.empty,
            rolled_back = report.rolled_back,
            failed = report.failed,
            broken = report.broken,
            "pass finished"
        );
        total.merge(&report);
        done += 1;

        if passes.is_some_and(|n| done >= n) {
            break;
        }
        watchdog.pause_check();
        std::thread::sleep(scheduler.frequency());
        watchdog.resume_check();
    }

    let summaries = scheduler.summaries();
    if json {
        return print_json(&serde_json::json!({
            "passes": done,
            "report": total,
            "engines": summaries,
        }));
    }

    println!(
        "{done} pass(es): {} committed, {} empty, {} rolled back, {} failed, {} broken, {} skipped",
        total.committed, total.empty, total.rolled_back, total.failed, total.broken, total.skipped
    );
    if summaries.is_empty() {
        println!("No engines.");
        return Ok(());
    }
    let rows = summaries
        .iter()
        .map(|s| {
            vec![
                s.equipment_id.to_string(),
                s.equipment.clone(),
                s.instance.clone(),
                format!("{:?}", s.status),
                format!("{:?}", s.state),
            ]
        })
        .collect();
    print_table(&["EQUIPMENT", "NAME", "INSTANCE", "STATUS", "STATE"], rows);
    Ok(())
}

/// Host name recorded on the revision service.
fn computer_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "localhost".to_string())
}
