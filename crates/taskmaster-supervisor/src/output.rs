use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use taskmaster_core::{ProcessSpec, Stream};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;

const RING_BUFFER_SIZE: usize = 64 * 1024;

/// Routes one instance's output: an in-memory tail of both streams plus the
/// configured per-stream log files. File rotation is left to external tools.
#[derive(Clone)]
pub struct OutputCapture {
	ring: Arc<Mutex<VecDeque<u8>>>,
	files: Arc<Mutex<LogFiles>>,
}

struct LogFiles {
	stdout: Option<LogFile>,
	stderr: Option<LogFile>,
}

struct LogFile {
	path: PathBuf,
	file: Option<File>,
}

impl LogFile {
	fn open(path: PathBuf) -> Self {
		if let Some(parent) = path.parent() {
			let _ = std::fs::create_dir_all(parent);
		}
		let file = match OpenOptions::new().create(true).append(true).open(&path) {
			Ok(f) => Some(f),
			Err(e) => {
				tracing::warn!("cannot open log file {}: {}", path.display(), e);
				None
			}
		};
		Self { path, file }
	}

	fn write(&mut self, data: &[u8]) {
		if let Some(ref mut file) = self.file {
			if let Err(e) = file.write_all(data) {
				tracing::warn!("write to {} failed: {}", self.path.display(), e);
				self.file = None;
			}
		}
	}

	fn truncate(&mut self) {
		if let Some(ref file) = self.file {
			let _ = file.set_len(0);
		}
	}
}

impl OutputCapture {
	pub fn new(spec: &ProcessSpec, index: usize) -> Self {
		Self {
			ring: Arc::new(Mutex::new(VecDeque::with_capacity(RING_BUFFER_SIZE))),
			files: Arc::new(Mutex::new(LogFiles::for_spec(spec, index))),
		}
	}

	pub async fn write(&self, stream: Stream, data: &[u8]) {
		{
			let mut ring = self.ring.lock().await;
			push_bounded(&mut ring, data);
		}

		let mut files = self.files.lock().await;
		let target = match stream {
			Stream::Stdout => files.stdout.as_mut(),
			Stream::Stderr => files.stderr.as_mut(),
		};
		if let Some(file) = target {
			file.write(data);
		}
	}

	/// Supervisor lifecycle line, visible in the tail but not in the log files.
	pub async fn notice(&self, message: &str) {
		let line = format!("[taskmaster] {}\n", message);
		let mut ring = self.ring.lock().await;
		push_bounded(&mut ring, line.as_bytes());
	}

	pub async fn snapshot(&self) -> Vec<u8> {
		let ring = self.ring.lock().await;
		ring.iter().copied().collect()
	}

	/// Empties the tail and truncates both log files.
	pub async fn clear(&self) {
		self.ring.lock().await.clear();
		let mut guard = self.files.lock().await;
		let files = &mut *guard;
		for file in [files.stdout.as_mut(), files.stderr.as_mut()].into_iter().flatten() {
			file.truncate();
		}
	}

	/// Points future output at the destinations of `spec`, reopening only the
	/// files whose path changed.
	pub async fn retarget(&self, spec: &ProcessSpec, index: usize) {
		let mut files = self.files.lock().await;
		retarget_one(&mut files.stdout, spec.log_path(Stream::Stdout, index));
		retarget_one(&mut files.stderr, spec.log_path(Stream::Stderr, index));
	}
}

impl LogFiles {
	fn for_spec(spec: &ProcessSpec, index: usize) -> Self {
		Self {
			stdout: spec.log_path(Stream::Stdout, index).map(LogFile::open),
			stderr: spec.log_path(Stream::Stderr, index).map(LogFile::open),
		}
	}
}

fn retarget_one(slot: &mut Option<LogFile>, path: Option<PathBuf>) {
	let unchanged = match (slot.as_ref(), path.as_deref()) {
		(Some(current), Some(path)) => current.path == Path::new(path),
		(None, None) => true,
		_ => false,
	};
	if !unchanged {
		*slot = path.map(LogFile::open);
	}
}

fn push_bounded(ring: &mut VecDeque<u8>, data: &[u8]) {
	let data = if data.len() > RING_BUFFER_SIZE {
		&data[data.len() - RING_BUFFER_SIZE..]
	} else {
		data
	};
	let overflow = (ring.len() + data.len()).saturating_sub(RING_BUFFER_SIZE);
	ring.drain(..overflow);
	ring.extend(data);
}

/// Copies a child pipe into the capture until EOF.
pub async fn pipe_output<R: AsyncRead + Unpin>(mut reader: R, output: OutputCapture, stream: Stream) {
	let mut buf = [0u8; 4096];
	loop {
		match reader.read(&mut buf).await {
			Ok(0) => break,
			Ok(n) => output.write(stream, &buf[..n]).await,
			Err(_) => break,
		}
	}
}
