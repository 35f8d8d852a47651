//! deployd - Entry Point
//!
//! Host-resident deploy agent. Polls the deploy service for the next goal of
//! every environment on this host and runs the matching stage.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use deployd::app::options::{AppOptions, DEFAULT_SETTINGS_FILE};
use deployd::app::run::run;
use deployd::filesys::file::File;
use deployd::logs::{init_logging, LogOptions};
use deployd::ping::host_info::HostOverrides;
use deployd::storage::settings::Settings;
use deployd::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version.version),
        }
        return;
    }

    // Retrieve the settings file
    let explicit = cli_args.get("config").map(PathBuf::from);
    let settings_path = explicit
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE));
    let settings_file = File::new(&settings_path);
    let (settings, config_file) = if settings_file.exists().await {
        match settings_file.read_json::<Settings>().await {
            Ok(settings) => (settings, Some(settings_path)),
            Err(e) => {
                eprintln!("Unable to read settings file {}: {}", settings_path.display(), e);
                return;
            }
        }
    } else if explicit.is_some() {
        eprintln!("Settings file {} does not exist", settings_path.display());
        return;
    } else {
        (Settings::default(), None)
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: Some(settings.log_dir.clone()),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    let options = AppOptions {
        daemon: cli_args.contains_key("daemon"),
        config_file,
        host_overrides: HostOverrides {
            host_name: cli_args.get("host").cloned(),
            groups: cli_args.get("group").map(|groups| {
                groups
                    .split(',')
                    .map(|group| group.trim().to_string())
                    .filter(|group| !group.is_empty())
                    .collect()
            }),
        },
        settings,
    };

    info!(
        "Running deploy agent {} (daemon: {}, config: {:?})",
        version.version, options.daemon, options.config_file
    );
    let result = run(version.version, options, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("Failed to run the agent: {e}");
        std::process::exit(1);
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Failed to install signal handlers, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down...");
    }
}
