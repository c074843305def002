use std::{env, fs, path::PathBuf};

use clap::Parser;
use dirs::home_dir;
use obs_autoscene::{
    config::{Config, LoadOutcome, LogLevel},
    monitor::{Monitor, MonitorSettings},
    obs::ObsSession,
    status::StatusClient,
    Cli,
};
use tokio::{signal, sync::broadcast};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

fn get_base_dir(custom_path: &Option<String>) -> anyhow::Result<PathBuf> {
    let default_path = home_dir()
        .ok_or_else(|| anyhow::anyhow!("failed to get home directory"))?
        .join(".obs-autoscene");

    let base_dir = custom_path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or(default_path);

    fs::create_dir_all(&base_dir)?;
    Ok(base_dir)
}

fn setup_logging(base_dir: &PathBuf, config: &Config, debug: bool) -> anyhow::Result<WorkerGuard> {
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("obs-autoscene")
        .filename_suffix("log")
        .max_log_files(5)
        .build(base_dir)?;

    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if debug || config.log_level == LogLevel::Debug {
        "debug"
    } else {
        "info"
    };

    let make_env_filter = || {
        let filter = EnvFilter::from_default_env()
            .add_directive(default_level.parse().unwrap())
            .add_directive("hyper=warn".parse().unwrap())
            .add_directive("reqwest=warn".parse().unwrap())
            .add_directive("tungstenite=warn".parse().unwrap());

        env::var("OBS_AUTOSCENE_LOG")
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.is_empty())
            .fold(filter, |filter, module_directive| {
                match module_directive.parse() {
                    Ok(directive) => filter.add_directive(directive),
                    Err(e) => {
                        eprintln!(
                            "warning: invalid log directive '{}': {}",
                            module_directive, e
                        );
                        filter
                    }
                }
            })
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(make_env_filter()),
        )
        .with(
            fmt::layer()
                .with_writer(file_writer)
                .with_filter(make_env_filter()),
        )
        .init();

    Ok(guard)
}

fn spawn_signal_handler(shutdown_tx: broadcast::Sender<()>) {
    tokio::spawn(async move {
        let ctrl_c = async {
            let _ = signal::ctrl_c().await;
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    warn!("could not install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received ctrl+c, initiating shutdown"),
            _ = terminate => info!("received terminate signal, initiating shutdown"),
        }
        let _ = shutdown_tx.send(());
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // any failure up to the monitor loop is fatal (exit code 1)
    let base_dir = get_base_dir(&cli.data_dir)?;
    let config_path = cli
        .config
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| base_dir.join("config.json"));
    let (config, outcome) = Config::load_or_create(&config_path);
    let _log_guard = setup_logging(&base_dir, &config, cli.debug)?;

    match outcome {
        LoadOutcome::Loaded => info!("configuration loaded from {}", config_path.display()),
        LoadOutcome::Created => {
            info!("created {} with default settings", config_path.display())
        }
        LoadOutcome::Defaulted(reason) => {
            warn!("using default configuration: {}", reason)
        }
    }

    info!("obs-autoscene starting");
    info!("  srt api: {}", config.srt_api_url);
    info!("  obs: {}:{}", config.obs_host, config.obs_port);
    info!(
        "  live scene: \"{}\", fallback scene: \"{}\"",
        config.live_scene, config.fallback_scene
    );
    if config.bitrate.enabled {
        info!(
            "  bitrate monitoring: show \"{}\" below {:.2} mbps",
            config.bitrate.overlay_source, config.bitrate.threshold_mbps
        );
    }
    info!("  check interval: {}ms", config.check_interval);

    let status = StatusClient::new(&config.srt_api_url);
    let mut session = ObsSession::new(&config.obs_host, config.obs_port, &config.obs_password);
    if let Err(e) = session.connect().await {
        error!("could not connect to OBS: {}", e);
        error!("  make sure OBS is running, the websocket server is enabled, and the port/password are correct");
        // scene/source commands will no-op until the process is restarted
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    spawn_signal_handler(shutdown_tx);

    let mut monitor = Monitor::new(MonitorSettings::from(&config), session, status);
    monitor.run(shutdown_rx).await;

    monitor.controller_mut().disconnect().await;
    info!("shutdown complete");
    Ok(())
}
