use std::fs::OpenOptions;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::client;
use crate::paths::DaemonPaths;

#[derive(Debug, Error)]
pub enum DaemonError {
	#[error("daemon already running")]
	AlreadyRunning,
	#[error("daemon not running")]
	NotRunning,
	#[error("daemon did not come up within {0:?}")]
	StartTimeout(Duration),
	#[error("failed to signal daemon: {0}")]
	Signal(#[from] nix::Error),
	#[error("io error: {0}")]
	Io(#[from] io::Error),
}

/// PID file and background-process management for one daemon.
pub struct Daemon {
	pub paths: DaemonPaths,
}

impl Daemon {
	pub fn new(app_name: impl Into<String>) -> Self {
		Self {
			paths: DaemonPaths::new(app_name),
		}
	}

	/// Creates the state directory and records this process's PID.
	pub fn prepare(&self) -> io::Result<()> {
		std::fs::create_dir_all(self.paths.state_dir())?;
		std::fs::write(self.paths.pid_path(), std::process::id().to_string())?;
		Ok(())
	}

	pub fn cleanup(&self) {
		let _ = std::fs::remove_file(self.paths.socket_path());
		let _ = std::fs::remove_file(self.paths.pid_path());
	}

	/// Re-executes the current binary with `args` as a detached daemon and
	/// waits until its socket accepts connections.
	pub fn start_background(&self, args: &[String]) -> Result<(), DaemonError> {
		if client::is_running(&self.paths) {
			return Err(DaemonError::AlreadyRunning);
		}

		std::fs::create_dir_all(self.paths.state_dir())?;
		let log = OpenOptions::new()
			.create(true)
			.append(true)
			.open(self.paths.daemon_log_path())?;

		std::process::Command::new(find_current_binary())
			.args(args)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(log)
			.process_group(0)
			.spawn()?;

		let timeout = Duration::from_secs(5);
		let deadline = Instant::now() + timeout;
		while Instant::now() < deadline {
			std::thread::sleep(Duration::from_millis(100));
			if client::is_running(&self.paths) {
				return Ok(());
			}
		}
		Err(DaemonError::StartTimeout(timeout))
	}

	/// Sends SIGTERM to the recorded PID and waits for the socket to go away.
	pub fn stop(&self, wait: Duration) -> Result<(), DaemonError> {
		use nix::sys::signal::{kill, Signal};
		use nix::unistd::Pid;

		let pid = client::read_pid(&self.paths).ok_or(DaemonError::NotRunning)?;
		match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
			Ok(()) => {}
			Err(nix::errno::Errno::ESRCH) => {
				self.cleanup();
				return Err(DaemonError::NotRunning);
			}
			Err(e) => return Err(e.into()),
		}

		let deadline = Instant::now() + wait;
		while Instant::now() < deadline && client::is_running(&self.paths) {
			std::thread::sleep(Duration::from_millis(100));
		}
		Ok(())
	}
}

fn find_current_binary() -> PathBuf {
	std::env::current_exe().unwrap_or_else(|_| PathBuf::from("taskmaster"))
}
