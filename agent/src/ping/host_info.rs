//! Host identity reported with every ping

use std::collections::BTreeMap;
use std::net::IpAddr;

use tracing::{debug, warn};

use crate::filesys::file::File;
use crate::telemetry::{self, Metrics, FAILED_HOST_INFO};

/// Identity of this host as known to the deploy service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostInfo {
    pub host_id: String,
    pub host_name: String,
    pub host_ip: Option<String>,
    pub groups: Option<Vec<String>>,
}

/// Values given on the command line, taking precedence over the host info file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostOverrides {
    pub host_name: Option<String>,
    pub groups: Option<Vec<String>>,
}

/// Parse `key=value` lines, stripping quotes and whitespace around both sides
pub fn parse_host_info(contents: &str) -> BTreeMap<String, String> {
    let strip: &[char] = &['"', '\'', ' ', '\t', '\r', '\n'];
    contents
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim_matches(strip).to_string(), value.trim_matches(strip).to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

fn split_groups(raw: &str) -> Option<Vec<String>> {
    let groups: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|group| !group.is_empty())
        .map(str::to_string)
        .collect();
    (!groups.is_empty()).then_some(groups)
}

/// Resolve the host identity on a best-effort basis. Missing pieces are
/// patched from the OS and DNS; nothing here fails the ping.
pub async fn resolve_host_info(
    host_info_file: &File,
    overrides: &HostOverrides,
    metrics: &Metrics,
) -> HostInfo {
    let mut values = BTreeMap::new();
    if host_info_file.exists().await {
        match host_info_file.read_string().await {
            Ok(contents) => values = parse_host_info(&contents),
            Err(e) => warn!(
                "Cannot read host info file {}: {}",
                host_info_file.path().display(),
                e
            ),
        }
    } else {
        warn!(
            "Cannot find host information file {}",
            host_info_file.path().display()
        );
    }
    let value = |key: &str| values.get(key).filter(|v| !v.is_empty()).cloned();

    let host_name = match overrides
        .host_name
        .clone()
        .or_else(|| value("hostname"))
        .or_else(telemetry::hostname)
    {
        Some(name) => name,
        None => {
            warn!("Cannot determine the hostname");
            metrics.incr(FAILED_HOST_INFO, vec![]);
            "unknown".to_string()
        }
    };

    let host_id = value("id").unwrap_or_else(|| host_name.clone());

    let host_ip = match value("ip") {
        Some(ip) => Some(ip),
        None => lookup_ip(&host_name).await,
    };

    let groups = overrides
        .groups
        .clone()
        .or_else(|| value("groups").and_then(|raw| split_groups(&raw)));

    HostInfo {
        host_id,
        host_name,
        host_ip,
        groups,
    }
}

/// First address of the hostname, IPv4 preferred
async fn lookup_ip(host_name: &str) -> Option<String> {
    match tokio::net::lookup_host((host_name, 0)).await {
        Ok(addrs) => {
            let addrs: Vec<IpAddr> = addrs.map(|addr| addr.ip()).collect();
            addrs
                .iter()
                .find(|ip| ip.is_ipv4())
                .or_else(|| addrs.first())
                .map(|ip| ip.to_string())
        }
        Err(e) => {
            debug!("Cannot resolve {}: {}", host_name, e);
            warn!("Host ip information does not exist");
            None
        }
    }
}
