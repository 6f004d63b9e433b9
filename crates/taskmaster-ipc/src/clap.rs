use clap::Subcommand;
use std::time::Duration;

use crate::client;
use crate::daemon::{Daemon, DaemonError};

#[derive(Debug, Clone, Subcommand)]
pub enum DaemonCommand {
	/// Run the daemon in the foreground
	Run,
	/// Start the daemon in the background
	Start,
	/// Stop the running daemon
	Stop,
	/// Show whether the daemon is running
	Status,
}

impl DaemonCommand {
	/// Handles everything except `Run`, which belongs to the application.
	/// `run_args` is the argument list that makes the binary run the daemon
	/// in the foreground.
	pub fn execute(&self, daemon: &Daemon, run_args: &[String]) -> Result<String, DaemonError> {
		match self {
			DaemonCommand::Run => {
				Ok("the 'run' subcommand must be handled by the application".to_string())
			}
			DaemonCommand::Start => {
				daemon.start_background(run_args)?;
				Ok(match client::read_pid(&daemon.paths) {
					Some(pid) => format!("daemon started (pid {})", pid),
					None => "daemon started".to_string(),
				})
			}
			DaemonCommand::Stop => {
				daemon.stop(Duration::from_secs(60))?;
				Ok("daemon stopped".to_string())
			}
			DaemonCommand::Status => {
				if !client::is_running(&daemon.paths) {
					return Ok("daemon not running".to_string());
				}
				Ok(match client::read_pid(&daemon.paths) {
					Some(pid) => format!("daemon running (pid {})", pid),
					None => "daemon running".to_string(),
				})
			}
		}
	}
}
