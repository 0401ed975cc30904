//! caret-echo: a marker-delimited echo server
//!
//! Every peer is greeted with `*`. Bytes framed by `^` and `$` are echoed
//! back incremented by one and appended, unmodified, to a per-connection
//! file. Everything else is ignored.
//!
//! The same protocol is served under four strategies:
//! - sequential, blocking
//! - thread per connection, blocking
//! - single-threaded reactor over select(2)
//! - single-threaded reactor over mio (epoll/kqueue)

mod config;
mod protocol;
mod runtime;
mod sink;

use config::Config;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        strategy = ?config.strategy,
        max_connections = config.max_connections,
        "Starting caret-echo server"
    );

    if let Err(e) = runtime::run(config) {
        error!(error = %e, "Server failed");
        return Err(e.into());
    }

    Ok(())
}
