use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::Instrument;

use crate::paths::DaemonPaths;

static CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Binds the daemon socket, replacing a stale socket file left by a dead daemon.
pub fn bind(paths: &DaemonPaths) -> io::Result<UnixListener> {
	let socket_path = paths.socket_path();
	if let Some(parent) = socket_path.parent() {
		std::fs::create_dir_all(parent)?;
	}
	if socket_path.exists() {
		std::fs::remove_file(&socket_path)?;
	}
	let listener = UnixListener::bind(&socket_path)?;
	tracing::info!("listening on {}", socket_path.display());
	Ok(listener)
}

/// Accept loop. Each connection gets its own task and may send any number of
/// requests; responses are written in request order.
pub async fn serve<Req, Resp, F, Fut, E>(listener: UnixListener, handler: F, on_error: Option<E>)
where
	Req: DeserializeOwned + Send + 'static,
	Resp: Serialize + Send + 'static,
	F: Fn(Req) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Resp> + Send,
	E: Fn(String) -> Resp + Send + Sync + 'static,
{
	let handler = Arc::new(handler);
	let on_error = Arc::new(on_error);

	loop {
		let (stream, _) = match listener.accept().await {
			Ok(s) => s,
			Err(e) => {
				tracing::error!("accept error: {}", e);
				continue;
			}
		};

		let id = CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
		let handler = Arc::clone(&handler);
		let on_error = Arc::clone(&on_error);
		tokio::spawn(
			async move {
				tracing::debug!("client connected");
				handle_connection(stream, handler, on_error).await;
				tracing::debug!("client disconnected");
			}
			.instrument(tracing::debug_span!("conn", id)),
		);
	}
}

async fn handle_connection<Req, Resp, F, Fut, E>(
	stream: UnixStream,
	handler: Arc<F>,
	on_error: Arc<Option<E>>,
) where
	Req: DeserializeOwned + Send + 'static,
	Resp: Serialize + Send + 'static,
	F: Fn(Req) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Resp> + Send,
	E: Fn(String) -> Resp + Send + Sync + 'static,
{
	let (reader, mut writer) = stream.into_split();
	let mut lines = BufReader::new(reader).lines();

	loop {
		let line = match lines.next_line().await {
			Ok(Some(line)) => line,
			Ok(None) => break,
			Err(e) => {
				tracing::warn!("read error: {}", e);
				break;
			}
		};
		if line.trim().is_empty() {
			continue;
		}

		let response = match serde_json::from_str::<Req>(&line) {
			Ok(request) => handler(request).await,
			Err(e) => {
				tracing::warn!("invalid request: {}", e);
				match on_error.as_ref() {
					Some(on_error) => on_error(format!("invalid request: {}", e)),
					None => continue,
				}
			}
		};

		let mut data = match serde_json::to_vec(&response) {
			Ok(d) => d,
			Err(e) => {
				tracing::error!("failed to serialize response: {}", e);
				continue;
			}
		};
		data.push(b'\n');

		if writer.write_all(&data).await.is_err() {
			break;
		}
	}
}
