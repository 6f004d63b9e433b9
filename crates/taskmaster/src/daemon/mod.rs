pub mod control;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use taskmaster_core::config::{self, Config, ConfigError};
use taskmaster_core::{Request, Response};
use taskmaster_ipc::{client, server, Daemon};
use taskmaster_supervisor::{EventMonitor, OsLauncher, Supervisor, SupervisorConfig};
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use control::{log_reload, ControlServer};

#[derive(Debug, Error)]
pub enum StartupError {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("daemon already running")]
	AlreadyRunning,
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

/// Runs the daemon in the foreground until SIGTERM, SIGINT or a `shutdown`
/// request.
pub async fn run(daemon: &Daemon, config_path: PathBuf) -> Result<(), StartupError> {
	let config = match config::load_config(&config_path) {
		Ok(config) => config,
		Err(e) => {
			init_logging("info");
			tracing::error!("cannot load {}: {}", config_path.display(), e);
			return Err(e.into());
		}
	};
	init_logging(&config.daemon.log_level);

	if client::is_running(&daemon.paths) {
		return Err(StartupError::AlreadyRunning);
	}
	daemon.prepare()?;
	let listener = server::bind(&daemon.paths)?;

	let supervisor = start_engine(&config);
	let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
	let control = Arc::new(ControlServer::new(
		Arc::clone(&supervisor),
		config_path.clone(),
		shutdown_tx,
	));

	tracing::info!(
		"daemon started (pid {}, config {})",
		std::process::id(),
		config_path.display()
	);
	log_reload(&control.reload(Some(config.programs)).await);

	let handler_control = Arc::clone(&control);
	let server = tokio::spawn(server::serve(
		listener,
		move |request: Request| {
			let control = Arc::clone(&handler_control);
			async move { control.handle(request).await }
		},
		Some(|message: String| Response::Error { message }),
	));

	let mut sigterm = signal(SignalKind::terminate())?;
	let mut sigint = signal(SignalKind::interrupt())?;
	let mut sighup = signal(SignalKind::hangup())?;

	loop {
		tokio::select! {
			_ = sigterm.recv() => {
				tracing::info!("received SIGTERM");
				break;
			}
			_ = sigint.recv() => {
				tracing::info!("received SIGINT");
				break;
			}
			_ = sighup.recv() => {
				tracing::info!("received SIGHUP; reloading {}", config_path.display());
				log_reload(&control.reload(None).await);
			}
			_ = shutdown_rx.recv() => {
				tracing::info!("shutdown requested");
				break;
			}
		}
	}

	if let Err(e) = supervisor.shutdown().await {
		tracing::warn!("{}", e);
	}
	server.abort();
	daemon.cleanup();
	tracing::info!("daemon stopped");
	Ok(())
}

fn start_engine(config: &Config) -> Arc<Supervisor> {
	let (monitor, events) =
		EventMonitor::new(Duration::from_millis(config.supervisor.reap_interval_ms.max(10)));
	let launcher = Arc::new(OsLauncher::new(monitor.clone()));
	let supervisor = Supervisor::new(SupervisorConfig::from(config), launcher);
	tokio::spawn(monitor.run());
	tokio::spawn(Arc::clone(&supervisor).run(events));
	supervisor
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(level: &str) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
	let _ = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.try_init();
}
