//! # procpool
//!
//! Pool of long-lived interactive child processes.
//!
//! Callers lease a worker, talk to its session, and close the lease. The pool
//! launches workers on demand up to `max_size`, queues blocked callers in FIFO
//! order, enforces a per-request deadline, retires workers that are worn out,
//! idle too long or failed their reset hooks, and drains cleanly on shutdown.
//!
//! ```no_run
//! use std::time::Duration;
//! use procpool::{CommandEngine, LaunchSpec, Pool, PoolConfig};
//!
//! # fn main() -> procpool::Result<()> {
//! let config = PoolConfig { max_size: 2, ..PoolConfig::default() };
//! let pool = Pool::new(CommandEngine::new(), LaunchSpec::new("cat"), config)?;
//!
//! let lease = pool.acquire()?;
//! lease.write_line("hello").expect("write");
//! assert_eq!(lease.read_line().expect("read"), "hello");
//! lease.close();
//!
//! assert!(pool.drain(Duration::from_secs(5)));
//! # Ok(())
//! # }
//! ```
//!
//! All bookkeeping happens under one fair lock in [`PoolState`]; launching,
//! closing and hook execution always happen outside it.

pub mod clock;
pub mod config;
pub mod deadline;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod events;
pub mod hooks;
pub mod lease;
pub mod ledger;
pub mod lifecycle;
pub mod metrics;
pub mod pool;
pub mod retirement;
pub mod scope;
pub mod state;
pub mod timeout;
pub mod waiter;
pub mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::PoolConfig;
pub use deadline::{AwaitResult, Deadline};
pub use diagnostics::{NoopDiagnostics, PoolDiagnostics, SharedDiagnostics, TracingDiagnostics};
pub use engine::{ChildSession, CommandEngine, LaunchSpec, ProcessEngine, Session};
pub use error::{BoxError, Error, ErrorCategory, Result};
pub use events::{EventBus, PoolEvent};
pub use hooks::{
    CallbackPanicked, ResetHook, ResetHookRunner, ResetOutcome, ResetReason, ResetRequest,
    RetireDecision, WarmupAction,
};
pub use lease::Lease;
pub use metrics::PoolMetrics;
pub use pool::{AcquireOptions, Pool, PoolBuilder, PreferredWorker, Sleeper};
pub use retirement::{RetirementPolicy, RetirementReason};
pub use scope::{LeaseScope, RequestId, WorkerId};
pub use state::{LaunchDiscardReason, PoolState};
pub use timeout::{DefaultRequestTimeoutScheduler, RequestTimeoutScheduler, TimeoutCallback};
pub use waiter::Interrupt;
pub use worker::PoolWorker;
