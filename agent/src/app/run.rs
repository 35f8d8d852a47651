//! Main application run loop

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info};

use crate::app::instance::SingleInstance;
use crate::app::options::AppOptions;
use crate::deploy::agent::DeployAgent;
use crate::deploy::executor::ProcessExecutor;
use crate::deploy::helper::LocalBuildHelper;
use crate::errors::AgentError;
use crate::http::client::HttpClient;
use crate::ping::client::RestPingClient;
use crate::storage::config::Config;
use crate::storage::env_status::EnvStatus;
use crate::telemetry::{self, Metrics, HOST_UPTIME};
use crate::utils::random_delay;

/// Run the deploy agent
pub async fn run(
    agent_version: String,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), AgentError> {
    info!("Initializing deploy agent...");

    let config = Config::new(options.settings.clone(), options.config_file.clone());
    config.layout().setup().await?;
    let _instance = SingleInstance::acquire(config.layout().instance_lock_file().path())?;

    let metrics = Metrics::new();
    let mut agent = init_agent(agent_version, &options, config, metrics.clone()).await?;
    metrics.timing(
        HOST_UPTIME,
        telemetry::host_uptime(),
        vec![("first_run", agent.first_run().to_string())],
    );

    let settings = &options.settings;
    if options.daemon {
        serve_forever(
            &mut agent,
            Duration::from_secs(settings.daemon_sleep_time),
            shutdown_signal,
        )
        .await;
    } else {
        tokio::select! {
            _ = serve_once(&mut agent, settings.init_sleep_time) => {}
            _ = shutdown_signal => {
                info!("Shutdown signal received, shutting down...");
            }
        }
    }

    Ok(())
}

async fn init_agent(
    agent_version: String,
    options: &AppOptions,
    config: Config,
    metrics: Metrics,
) -> Result<DeployAgent, AgentError> {
    let settings = config.settings();
    let http = HttpClient::new(&settings.service)?;
    let client = RestPingClient::new(
        http,
        config.layout().host_info_file(),
        options.host_overrides.clone(),
        agent_version,
        metrics.clone(),
    );
    let store = EnvStatus::new(config.layout().env_status_file())
        .with_sentinel(settings.host_type_sentinel.clone());

    Ok(DeployAgent::new(
        Box::new(client),
        store,
        config,
        Box::new(ProcessExecutor::default()),
        Box::new(LocalBuildHelper),
        metrics,
    )
    .await)
}

/// Run a single cycle. Hosts with existing status wait a random delay first
/// so a fleet started together does not ping at once.
pub async fn serve_once(agent: &mut DeployAgent, init_sleep_secs: u64) {
    info!("Running deploy agent in non daemon mode");
    if !agent.envs().is_empty() {
        let delay = random_delay(init_sleep_secs);
        info!("Randomly sleeping {:?} before starting", delay);
        tokio::time::sleep(delay).await;
    } else {
        info!("No status file, could be the first time the agent runs");
    }
    agent.serve_build().await;
}

/// Run cycles until shutdown, reloading the status file between them
pub async fn serve_forever(
    agent: &mut DeployAgent,
    sleep: Duration,
    shutdown_signal: impl Future<Output = ()>,
) {
    info!("Running deploy agent in daemon mode");
    tokio::pin!(shutdown_signal);

    loop {
        tokio::select! {
            _ = agent.serve_build() => {}
            _ = &mut shutdown_signal => {
                info!("Shutdown signal received, shutting down...");
                return;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = &mut shutdown_signal => {
                info!("Shutdown signal received, shutting down...");
                return;
            }
        }

        agent.load_status_file().await;
        debug!("Reloaded {} tracked environments", agent.envs().len());
    }
}
