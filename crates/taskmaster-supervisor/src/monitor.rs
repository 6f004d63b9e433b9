use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskmaster_core::ExitReason;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// A child the monitor has reaped. The PID is no longer valid when this is sent.
///
/// `token` is the value [`EventMonitor::watch`] handed out for this child, so
/// an event can never be mistaken for a later child that reuses the PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitEvent {
	pub pid: u32,
	pub token: u64,
	pub reason: ExitReason,
}

/// Reaps supervised children from one task.
///
/// Wakes on `SIGCHLD`, on every newly watched PID and on a fallback interval,
/// then polls each watched PID with `WNOHANG`. Only watched PIDs are reaped, so
/// unrelated children of the daemon are left alone. Every exit is delivered
/// exactly once on the event channel.
#[derive(Clone)]
pub struct EventMonitor {
	watched: Arc<Mutex<HashMap<u32, u64>>>,
	events: mpsc::UnboundedSender<ExitEvent>,
	wake: Arc<Notify>,
	interval: Duration,
}

impl EventMonitor {
	pub fn new(interval: Duration) -> (Self, mpsc::UnboundedReceiver<ExitEvent>) {
		let (events, rx) = mpsc::unbounded_channel();
		let monitor = Self {
			watched: Arc::new(Mutex::new(HashMap::new())),
			events,
			wake: Arc::new(Notify::new()),
			interval,
		};
		(monitor, rx)
	}

	/// Starts tracking a freshly spawned child. Returns the token its exit
	/// event will carry.
	pub fn watch(&self, pid: u32) -> u64 {
		let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
		self.lock().insert(pid, token);
		self.wake.notify_one();
		token
	}

	pub fn watched(&self) -> usize {
		self.lock().len()
	}

	/// Runs until the event receiver is dropped.
	pub async fn run(self) {
		let mut sigchld = match signal(SignalKind::child()) {
			Ok(s) => Some(s),
			Err(e) => {
				tracing::warn!("cannot listen for SIGCHLD ({}); polling every {:?}", e, self.interval);
				None
			}
		};
		let mut tick = tokio::time::interval(self.interval);
		tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

		loop {
			tokio::select! {
				_ = next_sigchld(&mut sigchld) => {}
				_ = tick.tick() => {}
				_ = self.wake.notified() => {}
			}
			if !self.reap() {
				tracing::debug!("event receiver closed; monitor exiting");
				return;
			}
		}
	}

	/// Collects every watched child that has terminated. Returns false once
	/// nobody is listening for events any more.
	pub fn reap(&self) -> bool {
		let pids: Vec<u32> = self.lock().keys().copied().collect();
		for pid in pids {
			let reason = match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
				Ok(WaitStatus::Exited(_, code)) => ExitReason::Code { code },
				Ok(WaitStatus::Signaled(_, sig, _)) => ExitReason::Signal { signal: sig as i32 },
				Ok(_) => continue,
				Err(Errno::EINTR) => continue,
				// Someone else collected it; the PID is gone all the same.
				Err(Errno::ECHILD) => ExitReason::Unknown,
				Err(e) => {
					tracing::warn!(pid, "waitpid failed: {}", e);
					continue;
				}
			};

			let Some(token) = self.lock().remove(&pid) else {
				continue;
			};
			tracing::debug!(pid, token, %reason, "reaped child");
			if self.events.send(ExitEvent { pid, token, reason }).is_err() {
				return false;
			}
		}
		!self.events.is_closed()
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, u64>> {
		self.watched.lock().unwrap_or_else(|e| e.into_inner())
	}
}

async fn next_sigchld(sigchld: &mut Option<Signal>) {
	match sigchld {
		Some(s) => {
			if s.recv().await.is_none() {
				*sigchld = None;
			}
		}
		None => std::future::pending::<()>().await,
	}
}
