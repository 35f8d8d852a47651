//! Telemetry and metrics collection
//!
//! Counters and timers are emitted as structured events on the
//! `deployd::metrics` target and tallied in process.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sysinfo::System;
use tracing::info;

pub const REQUEST_LATENCY: &str = "deploy.agent.request.latency";
pub const FAILED_REQUESTS: &str = "deploy.failed.agent.requests";
pub const FAILED_HOST_INFO: &str = "deploy.failed.agent.hostinfocollection";
pub const FAILED_STATUS_FILE: &str = "deploy.failed.agent.statusfile";
pub const DEPLOY_STATUS_SUM: &str = "deployd.stats.deploy.status.sum";
pub const STAGE_TIME_ELAPSED: &str = "deployd.stats.deploy.stage.time_elapsed_sec";
pub const HOST_UPTIME: &str = "deployd.stats.host.uptime_sec";
pub const DEPLOY_INFO: &str = "deploy.info";

/// Metric tags, rendered as `key=value` pairs
pub type Tags = Vec<(&'static str, String)>;

/// Shared metrics recorder
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    counters: Arc<Mutex<BTreeMap<String, u64>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &str, tags: Tags) {
        let total = match self.counters.lock() {
            Ok(mut counters) => {
                let count = counters.entry(name.to_string()).or_insert(0);
                *count += 1;
                *count
            }
            Err(_) => 0,
        };
        info!(
            target: "deployd::metrics",
            metric = name,
            kind = "counter",
            total,
            tags = %render_tags(&tags),
        );
    }

    pub fn timing(&self, name: &str, elapsed: Duration, tags: Tags) {
        info!(
            target: "deployd::metrics",
            metric = name,
            kind = "timer",
            value_ms = elapsed.as_millis() as u64,
            tags = %render_tags(&tags),
        );
    }

    /// Number of increments of a counter so far
    pub fn count(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .map(|counters| counters.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

fn render_tags(tags: &Tags) -> String {
    tags.iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(",")
}

/// Hostname as reported by the OS
pub fn hostname() -> Option<String> {
    System::host_name().filter(|name| !name.is_empty())
}

/// Seconds since the host booted
pub fn host_uptime() -> Duration {
    Duration::from_secs(System::uptime())
}
