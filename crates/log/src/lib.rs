//! # procpool-log
//!
//! `tracing` subscriber setup for procpool binaries, examples and tests.
//!
//! ```no_run
//! # fn main() -> procpool_log::LogResult<()> {
//! // Reads PROCPOOL_LOG / RUST_LOG and PROCPOOL_LOG_FORMAT
//! let _guard = procpool_log::init()?;
//! tracing::info!("ready");
//! # Ok(())
//! # }
//! ```

mod builder;
mod config;
mod error;

pub use builder::{LoggerBuilder, LoggerGuard, ReloadHandle};
pub use config::{Config, DisplayConfig, Format, Writer};
pub use error::{LogError, LogResult};

/// Install a logger configured from the environment.
///
/// # Errors
/// Fails on an invalid filter or when a global subscriber already exists.
pub fn init() -> LogResult<LoggerGuard> {
    init_with(Config::from_env())
}

/// Install a logger from an explicit config.
///
/// # Errors
/// Fails on an invalid filter or when a global subscriber already exists.
pub fn init_with(config: Config) -> LogResult<LoggerGuard> {
    LoggerBuilder::from_config(config).build()
}

/// Install a test-captured logger once per process; later calls are no-ops.
///
/// `PROCPOOL_LOG` / `RUST_LOG` override the default `trace` filter.
pub fn init_test() {
    let env = Config::from_env();
    let mut config = Config::test();
    if std::env::var_os("PROCPOOL_LOG").is_some() || std::env::var_os("RUST_LOG").is_some() {
        config.level = env.level;
    }
    // Another test in the same binary may have installed it already
    let _ = init_with(config);
}
