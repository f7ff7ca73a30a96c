//! Lease `cat` workers from a pool and round-trip lines through them.
//!
//! ```sh
//! PROCPOOL_LOG=procpool=debug cargo run -p procpool --example echo_pool
//! ```

use std::thread;
use std::time::Duration;

use procpool::{CommandEngine, LaunchSpec, Pool, PoolConfig, TracingDiagnostics};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _log = procpool_log::init()?;

    let config = PoolConfig {
        min_size: 1,
        max_size: 2,
        max_requests_per_worker: 3,
        ..PoolConfig::default()
    };
    let pool = Pool::builder(CommandEngine::new(), LaunchSpec::new("cat"))
        .config(config)
        .diagnostics(TracingDiagnostics)
        .build()?;

    thread::scope(|scope| {
        for caller in 0..4 {
            let pool = &pool;
            scope.spawn(move || {
                if let Err(error) = run_caller(pool, caller) {
                    tracing::warn!(caller, %error, "caller gave up");
                }
            });
        }
    });

    let metrics = pool.snapshot();
    tracing::info!(
        leases = metrics.total_leases_served,
        retirements = metrics.total_retirements,
        "workload finished"
    );

    if !pool.drain(Duration::from_secs(5)) {
        tracing::warn!("pool did not drain in time");
    }
    Ok(())
}

fn run_caller(pool: &Pool<CommandEngine>, caller: usize) -> procpool::Result<()> {
    for round in 0..3 {
        let lease = pool.acquire()?;
        let line = format!("caller {caller} round {round}");
        let echoed = lease
            .write_line(&line)
            .and_then(|()| lease.read_line())
            .unwrap_or_else(|e| format!("<{e}>"));
        tracing::info!(worker_id = %lease.worker_id(), %echoed, "round trip");
    }
    Ok(())
}
