//! Paced-load latency and loss measurement.
//!
//! A client paces messages at a sweep of target rates against a cycle
//! counter while a server reflects periodic replies and keeps loss and
//! reordering counters; the client correlates the reflections with their
//! sends and prints per-rate summary statistics.

pub mod client;
pub mod config;
pub mod control;
pub mod muxer;
pub mod report;
pub mod server;
pub mod stats;
pub mod transport;
pub mod tsc;

use anyhow::{Result, bail};

use self::config::Config;

/// Role dispatch: a transport argument makes this process the measuring
/// client, no argument makes it a reflecting server.
pub fn run(cfg: Config) -> Result<()> {
    match cfg.fd_type {
        Some(_) => client::run(cfg),
        None => server::run_standalone(&cfg),
    }
}

/// Pins the calling thread. Jitter from migrating between cores is
/// indistinguishable from transport jitter, so failure to pin fails the
/// test rather than degrading it silently.
pub fn pin_core(core: usize) -> Result<()> {
    if core_affinity::set_for_current(core_affinity::CoreId { id: core }) {
        Ok(())
    } else {
        bail!("failed to set CPU affinity to core {}", core);
    }
}
