use serde::{de::DeserializeOwned, Serialize};
use std::io::{self, BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::os::unix::net::UnixStream;
use std::time::Duration;
use thiserror::Error;

use crate::paths::DaemonPaths;

/// Errors from daemon client operations.
#[derive(Debug, Error)]
pub enum ClientError {
	/// Daemon is not running (socket missing or refusing connections).
	#[error("daemon not running")]
	NotRunning,
	#[error("io error: {0}")]
	Io(#[from] io::Error),
	#[error("serialize error: {0}")]
	Serialize(String),
	#[error("deserialize error: {0}")]
	Deserialize(String),
}

/// Blocking client for a daemon's Unix socket.
///
/// Generic over request and response types; one connection can carry any
/// number of request/response exchanges.
pub struct DaemonClient<Req, Resp> {
	writer: UnixStream,
	reader: BufReader<UnixStream>,
	_phantom: PhantomData<(Req, Resp)>,
}

impl<Req, Resp> DaemonClient<Req, Resp>
where
	Req: Serialize,
	Resp: DeserializeOwned,
{
	/// Connect to an already-running daemon.
	pub fn connect(paths: &DaemonPaths) -> Result<Self, ClientError> {
		let writer =
			UnixStream::connect(paths.socket_path()).map_err(|_| ClientError::NotRunning)?;
		let reader = BufReader::new(writer.try_clone()?);
		Ok(Self {
			writer,
			reader,
			_phantom: PhantomData,
		})
	}

	/// Bounds how long `send` waits for the daemon's answer.
	pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), ClientError> {
		self.writer.set_read_timeout(timeout)?;
		self.writer.set_write_timeout(timeout)?;
		Ok(())
	}

	/// Send a request and wait for its response line.
	pub fn send(&mut self, request: &Req) -> Result<Resp, ClientError> {
		let mut data =
			serde_json::to_vec(request).map_err(|e| ClientError::Serialize(e.to_string()))?;
		data.push(b'\n');
		self.writer.write_all(&data)?;

		let mut line = String::new();
		if self.reader.read_line(&mut line)? == 0 {
			return Err(ClientError::Io(io::Error::new(
				io::ErrorKind::UnexpectedEof,
				"daemon closed the connection",
			)));
		}

		serde_json::from_str(&line).map_err(|e| ClientError::Deserialize(e.to_string()))
	}
}

/// True when the daemon socket accepts connections.
pub fn is_running(paths: &DaemonPaths) -> bool {
	UnixStream::connect(paths.socket_path()).is_ok()
}

/// PID recorded by a running daemon, if its PID file is readable.
pub fn read_pid(paths: &DaemonPaths) -> Option<u32> {
	std::fs::read_to_string(paths.pid_path())
		.ok()
		.and_then(|s| s.trim().parse().ok())
}
