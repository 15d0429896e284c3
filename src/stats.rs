//! Request counters for `/stats`.

use crate::registry::unix_now;
use parking_lot::Mutex;
use serde::Serialize;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    gets: u64,
    errors: u64,
    timeouts: u64,
}

pub struct Stats {
    counters: Mutex<Counters>,
    start: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub version: &'static str,
    pub gets: u64,
    pub errors: u64,
    pub timeout: u64,
    pub ts: u64,
    pub start: u64,
    /// Peak resident set size in KiB, 0 where unavailable.
    pub mem: u64,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            start: unix_now(),
        }
    }

    /// Count one handled request.
    pub fn record(&self, is_error: bool, is_timeout: bool) {
        let mut c = self.counters.lock();
        c.gets += 1;
        if is_error {
            c.errors += 1;
        }
        if is_timeout {
            c.timeouts += 1;
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = *self.counters.lock();
        StatsSnapshot {
            version: VERSION,
            gets: c.gets,
            errors: c.errors,
            timeout: c.timeouts,
            ts: unix_now(),
            start: self.start,
            mem: peak_rss_kib(),
        }
    }
}

/// `VmHWM` from `/proc/self/status`.
pub fn peak_rss_kib() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find_map(|l| l.strip_prefix("VmHWM:"))
                .and_then(|v| v.split_whitespace().next())
                .and_then(|n| n.parse().ok())
        })
        .unwrap_or(0)
}
