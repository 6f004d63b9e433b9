use std::path::PathBuf;
use std::sync::Arc;
use taskmaster_core::config;
use taskmaster_core::{ProcessSpec, Request, Response};
use taskmaster_supervisor::{ControlError, Supervisor};
use tokio::sync::mpsc;

/// Turns control requests into engine operations and engine results into
/// responses.
pub struct ControlServer {
	supervisor: Arc<Supervisor>,
	config_path: PathBuf,
	shutdown: mpsc::Sender<()>,
}

impl ControlServer {
	pub fn new(supervisor: Arc<Supervisor>, config_path: PathBuf, shutdown: mpsc::Sender<()>) -> Self {
		Self {
			supervisor,
			config_path,
			shutdown,
		}
	}

	pub async fn handle(&self, request: Request) -> Response {
		tracing::debug!(?request, "control request");
		match request {
			Request::Ping => Response::Pong,
			Request::Pid => Response::Pid {
				pid: std::process::id(),
			},
			Request::Start { name } => accepted(self.supervisor.start(&name).await),
			Request::Stop { name } => accepted(self.supervisor.stop(&name).await),
			Request::Restart { name } => accepted(self.supervisor.restart(&name).await),
			Request::Status { name } => match self.supervisor.status(name.as_deref()).await {
				Ok(instances) => Response::Status { instances },
				Err(e) => refused(e),
			},
			Request::Reload { programs } => self.reload(programs).await,
			Request::Shutdown => {
				// A full channel means a shutdown is already on its way.
				let _ = self.shutdown.try_send(());
				Response::Accepted {
					message: "shutting down".to_string(),
				}
			}
			Request::Tail { name, index } => match self.supervisor.tail(&name, index).await {
				Ok((index, bytes)) => Response::Output {
					name,
					index,
					text: String::from_utf8_lossy(&bytes).into_owned(),
				},
				Err(e) => refused(e),
			},
			Request::Clear { name } => accepted(self.supervisor.clear(&name).await),
		}
	}

	/// Applies `programs`, or the daemon's config file when none are given.
	pub async fn reload(&self, programs: Option<Vec<ProcessSpec>>) -> Response {
		let programs = match programs {
			Some(programs) => programs,
			None => match config::load_config(&self.config_path) {
				Ok(config) => config.programs,
				Err(e) => {
					return Response::Invalid {
						message: format!("{}: {}", self.config_path.display(), e),
					}
				}
			},
		};
		match self.supervisor.reload(programs).await {
			Ok(actions) => Response::Reloaded { actions },
			Err(e) => refused(e),
		}
	}
}

pub fn log_reload(response: &Response) {
	match response {
		Response::Reloaded { actions } => {
			let failed = actions.iter().filter(|a| a.error.is_some()).count();
			tracing::info!(applied = actions.len() - failed, failed, "configuration loaded");
		}
		Response::Invalid { message } | Response::Error { message } => {
			tracing::error!("reload rejected: {}", message);
		}
		other => tracing::warn!("unexpected reload result: {:?}", other),
	}
}

fn accepted(result: Result<String, ControlError>) -> Response {
	match result {
		Ok(message) => Response::Accepted { message },
		Err(e) => refused(e),
	}
}

fn refused(error: ControlError) -> Response {
	match error {
		ControlError::NotFound(name) => Response::NotFound { name },
		ControlError::AlreadyRunning(name) => Response::AlreadyRunning { name },
		ControlError::NotRunning(name) => Response::NotRunning { name },
		ControlError::Busy(name) => Response::Busy { name },
		ControlError::Invalid(e) => Response::Invalid {
			message: e.to_string(),
		},
		other => Response::Error {
			message: other.to_string(),
		},
	}
}
