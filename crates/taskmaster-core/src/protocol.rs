use crate::types::{AppliedAction, InstanceStatus, ProcessSpec};
use serde::{Deserialize, Serialize};

/// Program name that matches every group in a `status` request.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
	Start { name: String },
	Stop { name: String },
	Restart { name: String },
	Status {
		#[serde(default)]
		name: Option<String>,
	},
	/// With `programs` unset the daemon re-reads its own config file.
	Reload {
		#[serde(default)]
		programs: Option<Vec<ProcessSpec>>,
	},
	Shutdown,
	Pid,
	Tail {
		name: String,
		#[serde(default)]
		index: Option<usize>,
	},
	Clear { name: String },
	Ping,
}

/// The `type` tag doubles as the response status code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
	Accepted { message: String },
	NotFound { name: String },
	AlreadyRunning { name: String },
	NotRunning { name: String },
	Busy { name: String },
	Status { instances: Vec<InstanceStatus> },
	Reloaded { actions: Vec<AppliedAction> },
	Invalid { message: String },
	Error { message: String },
	Pid { pid: u32 },
	Output { name: String, index: usize, text: String },
	Pong,
}

impl Response {
	pub fn is_success(&self) -> bool {
		!matches!(
			self,
			Response::NotFound { .. }
				| Response::AlreadyRunning { .. }
				| Response::NotRunning { .. }
				| Response::Busy { .. }
				| Response::Invalid { .. }
				| Response::Error { .. }
		)
	}
}
