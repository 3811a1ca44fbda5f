use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::bail;
use reservoir_core::ReservoirConfig;
use reservoir_pool::{ConnectionPool, MemoryDriver, PoolStats};
use serde::Serialize;
use tracing::{debug, info};

pub struct SimulateOptions {
    pub tasks: usize,
    pub iterations: usize,
    pub hold: Duration,
    pub fail_every: u64,
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub tasks: usize,
    pub iterations: usize,
    pub acquire_failures: u64,
    pub statement_failures: u64,
    pub connections_opened: usize,
    pub elapsed_ms: u64,
    /// Connections still checked out when shutdown gave up on them.
    pub force_closed: usize,
    pub stats: PoolStats,
}

pub async fn simulate(path: &str, options: &SimulateOptions, format: &str) -> anyhow::Result<()> {
    let config = ReservoirConfig::from_file(Path::new(path))?;
    let report = run(&config, options).await?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            println!(
                "{} tasks × {} iterations in {}ms",
                report.tasks, report.iterations, report.elapsed_ms
            );
            println!("connectionsOpened       {}", report.connections_opened);
            println!("acquireFailures         {}", report.acquire_failures);
            println!("statementFailures       {}", report.statement_failures);
            println!("{}", report.stats);
        }
    }

    Ok(())
}

/// Drive `options.tasks` concurrent workers through acquire / execute /
/// hold / release against a pool backed by [`MemoryDriver`].
pub async fn run(config: &ReservoirConfig, options: &SimulateOptions) -> anyhow::Result<SimulationReport> {
    if config.source.driver != "memory" {
        bail!(
            "simulate only supports the memory driver (config has driver = {:?})",
            config.source.driver
        );
    }

    let driver = Arc::new(MemoryDriver::new());
    driver.behavior().set_fail_every(options.fail_every);
    let pool = ConnectionPool::from_config(config, driver.clone())?;
    let acquire_failures = Arc::new(AtomicU64::new(0));
    let statement_failures = Arc::new(AtomicU64::new(0));

    info!(
        tasks = options.tasks,
        iterations = options.iterations,
        hold = ?options.hold,
        "starting simulation"
    );
    let started = Instant::now();

    let mut workers = Vec::with_capacity(options.tasks);
    for task in 0..options.tasks {
        let pool = pool.clone();
        let acquire_failures = Arc::clone(&acquire_failures);
        let statement_failures = Arc::clone(&statement_failures);
        let (iterations, hold) = (options.iterations, options.hold);
        workers.push(tokio::spawn(async move {
            for _ in 0..iterations {
                let handle = match pool.acquire().await {
                    Ok(handle) => handle,
                    Err(e) => {
                        debug!(task, error = %e, "acquire failed");
                        acquire_failures.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };
                if let Err(e) = handle.execute("SELECT 1") {
                    debug!(task, error = %e, "statement failed");
                    statement_failures.fetch_add(1, Ordering::Relaxed);
                }
                if !hold.is_zero() {
                    tokio::time::sleep(hold).await;
                }
                handle.close();
            }
        }));
    }
    for worker in workers {
        worker.await?;
    }

    let elapsed = started.elapsed();
    pool.log_stats();
    let stats = pool.stats();
    let force_closed = pool.shutdown().await;

    Ok(SimulationReport {
        tasks: options.tasks,
        iterations: options.iterations,
        acquire_failures: acquire_failures.load(Ordering::Relaxed),
        statement_failures: statement_failures.load(Ordering::Relaxed),
        connections_opened: driver.connects(),
        elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        force_closed,
        stats,
    })
}
