//! Lifecycle of one process instance.
//!
//! Transitions are plain methods with no I/O: the engine calls them, then
//! performs whatever they ask for (spawn, signal, arm a timer). Every
//! transition that leaves a state bumps the instance generation, which is how
//! timers armed for an earlier state find out they are stale.

use crate::backoff::BackoffPolicy;
use crate::output::OutputCapture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use taskmaster_core::{
	ExitReason, InstanceState, InstanceStatus, ProcessSpec, RestartPolicy, StopSignal,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;

// Shared by every instance so a timer can never match an instance that
// replaced the one it was armed for.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// The in-flight operation that makes an instance "busy".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOp {
	Stop,
	Restart,
	Remove,
	Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
	/// Promote STARTING to RUNNING.
	StartConfirm,
	/// Try again after a failure.
	Backoff,
	/// Escalate a stop to SIGKILL.
	StopGrace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
	pub kind: TimerKind,
	pub after: Duration,
	pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
	/// Nothing to stop.
	NotRunning,
	/// A pending restart was cancelled; the instance is STOPPED already.
	Stopped,
	AlreadyStopping,
	/// Send `signal` to `pid` and arm `timer`.
	Signal {
		pid: u32,
		signal: StopSignal,
		timer: Timer,
	},
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
	/// Not this instance's current child.
	Stale,
	Stopped,
	Exited,
	Backoff(Timer),
	Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffOutcome {
	Ignored,
	Spawn,
	Fatal,
}

pub struct ProcessInstance {
	index: usize,
	state: InstanceState,
	pid: Option<u32>,
	token: u64,
	started_at: Option<Instant>,
	failures: u32,
	last_exit: Option<ExitReason>,
	pending: Option<PendingOp>,
	generation: u64,
	escalated: bool,
	retiring: bool,
	timer: Option<JoinHandle<()>>,
	output: OutputCapture,
}

impl ProcessInstance {
	pub fn new(index: usize, output: OutputCapture) -> Self {
		Self {
			index,
			state: InstanceState::Stopped,
			pid: None,
			token: 0,
			started_at: None,
			failures: 0,
			last_exit: None,
			pending: None,
			generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
			escalated: false,
			retiring: false,
			timer: None,
			output,
		}
	}

	pub fn index(&self) -> usize {
		self.index
	}

	pub fn state(&self) -> InstanceState {
		self.state
	}

	pub fn pid(&self) -> Option<u32> {
		self.pid
	}

	pub fn owns_child(&self, pid: u32, token: u64) -> bool {
		self.pid == Some(pid) && self.token == token
	}

	pub fn failures(&self) -> u32 {
		self.failures
	}

	pub fn generation(&self) -> u64 {
		self.generation
	}

	pub fn pending(&self) -> Option<PendingOp> {
		self.pending
	}

	pub fn set_pending(&mut self, op: PendingOp) {
		self.pending = Some(op);
	}

	pub fn take_pending(&mut self) -> Option<PendingOp> {
		self.pending.take()
	}

	pub fn output(&self) -> &OutputCapture {
		&self.output
	}

	pub fn is_retiring(&self) -> bool {
		self.retiring
	}

	/// Marks the instance for removal once it has no process.
	pub fn retire(&mut self) {
		self.retiring = true;
	}

	pub fn revive(&mut self) {
		self.retiring = false;
	}

	pub fn status(&self, name: &str, now: Instant) -> InstanceStatus {
		let uptime_secs = match (self.state.has_process(), self.started_at) {
			(true, Some(at)) => Some(now.saturating_duration_since(at).as_secs()),
			_ => None,
		};
		InstanceStatus {
			name: name.to_string(),
			index: self.index,
			state: self.state,
			pid: self.pid,
			uptime_secs,
			last_exit: self.last_exit,
			failures: self.failures,
		}
	}

	/// Stores the task backing the timer of the current generation.
	pub fn arm(&mut self, handle: JoinHandle<()>) {
		if let Some(old) = self.timer.replace(handle) {
			old.abort();
		}
	}

	/// Forgets the stored timer without cancelling it. Called from inside the
	/// timer's own task before it changes state.
	pub fn detach_timer(&mut self) {
		self.timer = None;
	}

	fn bump(&mut self) -> u64 {
		if let Some(timer) = self.timer.take() {
			timer.abort();
		}
		self.generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
		self.generation
	}

	/// A manual start forgets earlier failures and any scheduled retry.
	pub fn reset_for_start(&mut self) {
		self.failures = 0;
		self.bump();
	}

	/// `token` identifies this child in exit events, in case its PID is reused.
	pub fn on_spawned(&mut self, pid: u32, token: u64, now: Instant, spec: &ProcessSpec) -> Option<Timer> {
		let generation = self.bump();
		self.pid = Some(pid);
		self.token = token;
		self.started_at = Some(now);
		self.escalated = false;
		if spec.start_secs == 0 {
			self.state = InstanceState::Running;
			self.failures = 0;
			return None;
		}
		self.state = InstanceState::Starting;
		Some(Timer {
			kind: TimerKind::StartConfirm,
			after: Duration::from_secs(spec.start_secs),
			generation,
		})
	}

	pub fn on_spawn_failed(&mut self, spec: &ProcessSpec, backoff: &BackoffPolicy) -> Option<Timer> {
		self.pid = None;
		self.started_at = None;
		self.fail(spec, backoff)
	}

	/// Counts one more consecutive failure. Returns the retry timer, or `None`
	/// when the instance went FATAL.
	fn fail(&mut self, spec: &ProcessSpec, backoff: &BackoffPolicy) -> Option<Timer> {
		let generation = self.bump();
		let attempt = self.failures.saturating_add(1);
		if attempt > spec.max_restarts {
			self.failures = attempt;
			self.state = InstanceState::Fatal;
			return None;
		}
		self.state = InstanceState::Backoff;
		Some(Timer {
			kind: TimerKind::Backoff,
			after: backoff.delay(attempt),
			generation,
		})
	}

	pub fn confirm_started(&mut self, generation: u64) -> bool {
		if generation != self.generation || self.state != InstanceState::Starting {
			return false;
		}
		self.state = InstanceState::Running;
		self.failures = 0;
		true
	}

	pub fn backoff_elapsed(&mut self, generation: u64, spec: &ProcessSpec) -> BackoffOutcome {
		if generation != self.generation || self.state != InstanceState::Backoff {
			return BackoffOutcome::Ignored;
		}
		self.failures = self.failures.saturating_add(1);
		if self.failures > spec.max_restarts {
			self.bump();
			self.state = InstanceState::Fatal;
			return BackoffOutcome::Fatal;
		}
		BackoffOutcome::Spawn
	}

	pub fn begin_stop(&mut self, spec: &ProcessSpec) -> StopOutcome {
		match self.state {
			InstanceState::Backoff => {
				self.bump();
				self.state = InstanceState::Stopped;
				StopOutcome::Stopped
			}
			InstanceState::Starting | InstanceState::Running => {
				let generation = self.bump();
				let Some(pid) = self.pid else {
					self.state = InstanceState::Stopped;
					return StopOutcome::Stopped;
				};
				self.state = InstanceState::Stopping;
				self.escalated = false;
				StopOutcome::Signal {
					pid,
					signal: spec.stop_signal,
					timer: Timer {
						kind: TimerKind::StopGrace,
						after: Duration::from_secs(spec.stop_grace_secs),
						generation,
					},
				}
			}
			InstanceState::Stopping => StopOutcome::AlreadyStopping,
			InstanceState::Stopped | InstanceState::Exited | InstanceState::Fatal => {
				StopOutcome::NotRunning
			}
		}
	}

	/// Returns the PID to SIGKILL, at most once per stop.
	pub fn grace_elapsed(&mut self, generation: u64) -> Option<u32> {
		if generation != self.generation || self.state != InstanceState::Stopping || self.escalated {
			return None;
		}
		self.escalated = true;
		self.pid
	}

	pub fn on_exit(
		&mut self,
		pid: u32,
		token: u64,
		reason: ExitReason,
		spec: &ProcessSpec,
		backoff: &BackoffPolicy,
	) -> ExitOutcome {
		if self.pid != Some(pid) || self.token != token || !self.state.has_process() {
			return ExitOutcome::Stale;
		}
		self.pid = None;
		self.started_at = None;
		self.last_exit = Some(reason);

		match self.state {
			InstanceState::Stopping => {
				self.bump();
				self.state = InstanceState::Stopped;
				ExitOutcome::Stopped
			}
			InstanceState::Running => {
				let expected = matches!(reason, ExitReason::Code { code } if spec.is_expected_exit(code));
				if expected || spec.autorestart == RestartPolicy::Never {
					self.bump();
					self.state = InstanceState::Exited;
					ExitOutcome::Exited
				} else {
					self.fail_outcome(spec, backoff)
				}
			}
			// Dying before the start threshold is a failure whatever the code.
			_ => self.fail_outcome(spec, backoff),
		}
	}

	fn fail_outcome(&mut self, spec: &ProcessSpec, backoff: &BackoffPolicy) -> ExitOutcome {
		match self.fail(spec, backoff) {
			Some(timer) => ExitOutcome::Backoff(timer),
			None => ExitOutcome::Fatal,
		}
	}
}

impl Drop for ProcessInstance {
	fn drop(&mut self) {
		if let Some(timer) = self.timer.take() {
			timer.abort();
		}
	}
}
