//! Ping protocol client

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::errors::AgentError;
use crate::filesys::file::File;
use crate::http::client::HttpClient;
use crate::models::deploy_status::Envs;
use crate::models::ping::{PingRequest, PingResponse};
use crate::ping::host_info::{resolve_host_info, HostOverrides};
use crate::telemetry::{Metrics, FAILED_REQUESTS, REQUEST_LATENCY};

const PING_TRIES: u32 = 3;
const PING_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Exchanges the tracked status for the server's next goal
#[async_trait]
pub trait PingClient: Send + Sync {
    /// Report every tracked environment. `None` when the server could not
    /// be reached or answered with something unusable.
    async fn send_reports(&self, envs: &Envs) -> Option<PingResponse>;
}

/// Ping client talking to the deploy service over HTTP
pub struct RestPingClient {
    http: HttpClient,
    host_info_file: File,
    overrides: HostOverrides,
    agent_version: String,
    metrics: Metrics,
}

impl RestPingClient {
    pub fn new(
        http: HttpClient,
        host_info_file: File,
        overrides: HostOverrides,
        agent_version: impl Into<String>,
        metrics: Metrics,
    ) -> Self {
        Self {
            http,
            host_info_file,
            overrides,
            agent_version: agent_version.into(),
            metrics,
        }
    }

    async fn build_request(&self, envs: &Envs) -> PingRequest {
        let host = resolve_host_info(&self.host_info_file, &self.overrides, &self.metrics).await;
        PingRequest {
            host_id: host.host_id,
            host_name: host.host_name,
            host_ip: host.host_ip,
            groups: host.groups,
            agent_version: Some(self.agent_version.clone()),
            reports: envs.values().map(|status| status.report.sanitized()).collect(),
        }
    }

    /// Transport call with a fixed number of tries
    async fn ping_with_retry(&self, request: &PingRequest) -> Result<PingResponse, AgentError> {
        let mut attempt = 1;
        loop {
            match self.http.ping(request).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < PING_TRIES => {
                    warn!("Ping attempt {} failed: {}, retrying", attempt, e);
                    attempt += 1;
                    tokio::time::sleep(PING_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl PingClient for RestPingClient {
    async fn send_reports(&self, envs: &Envs) -> Option<PingResponse> {
        let request = self.build_request(envs).await;

        let started = Instant::now();
        let result = self.ping_with_retry(&request).await;
        self.metrics
            .timing(REQUEST_LATENCY, started.elapsed(), vec![]);

        match result {
            Ok(response) => {
                debug!("{:?} -> {:?}", request, response);
                Some(response)
            }
            Err(e) => {
                error!("Failed to ping the deploy service: {}", e);
                self.metrics.incr(FAILED_REQUESTS, vec![]);
                None
            }
        }
    }
}
