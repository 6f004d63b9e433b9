//! Error types raised by the supervisor engine.
//!
//! - [`ControlError`]: a control operation was refused; reported to the client.
//! - [`SpawnError`]: the OS could not create a child; absorbed by the state machine.
//! - [`ShutdownError`]: shutdown had to force-kill instances after its deadline.

use std::time::Duration;
use taskmaster_core::ConfigError;
use thiserror::Error;

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ControlError {
	#[error("{0}: no such program")]
	NotFound(String),
	#[error("{0}: already running")]
	AlreadyRunning(String),
	#[error("{0}: not running")]
	NotRunning(String),
	/// An instance of the program is mid-transition; the caller should retry.
	#[error("{0}: busy")]
	Busy(String),
	#[error("shutting down")]
	ShuttingDown,
	#[error("invalid configuration: {0}")]
	Invalid(#[from] ConfigError),
}

impl ControlError {
	/// Short stable label (snake_case) for logs.
	pub fn as_label(&self) -> &'static str {
		match self {
			ControlError::NotFound(_) => "not_found",
			ControlError::AlreadyRunning(_) => "already_running",
			ControlError::NotRunning(_) => "not_running",
			ControlError::Busy(_) => "busy",
			ControlError::ShuttingDown => "shutting_down",
			ControlError::Invalid(_) => "invalid",
		}
	}
}

#[derive(Debug, Error)]
pub enum SpawnError {
	#[error("failed to spawn {command}: {source}")]
	Io {
		command: String,
		#[source]
		source: std::io::Error,
	},
}

#[derive(Debug, Error)]
pub enum ShutdownError {
	/// Some instances ignored their stop signal past the global deadline and
	/// were killed.
	#[error("shutdown timeout {timeout:?} exceeded; killed: {stuck:?}")]
	DeadlineExceeded {
		timeout: Duration,
		stuck: Vec<String>,
	},
}
