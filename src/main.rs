//! iperf-reactor: an iperf3-compatible throughput test server
//!
//! Serves one test at a time on a single thread:
//! - one control connection negotiates the test and exchanges results
//! - N data connections carry the traffic, counted per stream
//! - forward, reverse and bidirectional TCP tests
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod protocol;
mod runtime;
mod session;

use config::Config;
use tracing::info;
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

    let addr = config.listen_addr()?;

    info!(
        listen = %addr,
        max_events = config.max_events,
        one_off = config.one_off,
        "Starting iperf-reactor server"
    );

    runtime::run(&config, addr)?;
    Ok(())
}
