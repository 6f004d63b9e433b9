use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskmaster_core::config::{self, Config};
use taskmaster_core::protocol::WILDCARD;
use taskmaster_core::{
	AppliedAction, InstanceState, InstanceStatus, ProcessSpec, StopSignal, Stream,
};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::time::Instant;

use crate::backoff::BackoffPolicy;
use crate::error::{ControlError, ShutdownError};
use crate::group::ProcessGroup;
use crate::instance::{
	BackoffOutcome, ExitOutcome, PendingOp, ProcessInstance, StopOutcome, Timer, TimerKind,
};
use crate::launcher::Launcher;
use crate::monitor::ExitEvent;
use crate::output::pipe_output;
use crate::reconcile::{self, Change};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
	pub backoff: BackoffPolicy,
	/// How long shutdown waits before force-killing what is left.
	pub shutdown_timeout: Duration,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			backoff: BackoffPolicy::default(),
			shutdown_timeout: Duration::from_secs(30),
		}
	}
}

impl From<&Config> for SupervisorConfig {
	fn from(config: &Config) -> Self {
		Self {
			backoff: BackoffPolicy::from(&config.supervisor),
			shutdown_timeout: Duration::from_secs(config.daemon.shutdown_timeout_secs),
		}
	}
}

/// The process-control engine.
///
/// All mutable state lives behind one lock; control operations, timer expiry
/// and exit events each take it for the duration of a transition, so no
/// observer ever sees a half-applied change.
pub struct Supervisor {
	groups: RwLock<BTreeMap<String, ProcessGroup>>,
	launcher: Arc<dyn Launcher>,
	config: SupervisorConfig,
	reloading: Mutex<()>,
	settled: Notify,
	shutting_down: AtomicBool,
}

impl Supervisor {
	pub fn new(config: SupervisorConfig, launcher: Arc<dyn Launcher>) -> Arc<Self> {
		Arc::new(Self {
			groups: RwLock::new(BTreeMap::new()),
			launcher,
			config,
			reloading: Mutex::new(()),
			settled: Notify::new(),
			shutting_down: AtomicBool::new(false),
		})
	}

	pub fn is_shutting_down(&self) -> bool {
		self.shutting_down.load(Ordering::SeqCst)
	}

	/// Feeds exit events into the engine until the channel closes.
	pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ExitEvent>) {
		while let Some(event) = events.recv().await {
			self.handle_exit(event).await;
		}
		tracing::debug!("exit event channel closed");
	}

	pub async fn status(&self, name: Option<&str>) -> Result<Vec<InstanceStatus>, ControlError> {
		let groups = self.groups.read().await;
		let now = Instant::now();
		match name {
			None | Some(WILDCARD) => Ok(groups
				.iter()
				.flat_map(|(name, group)| group.statuses(name, now))
				.collect()),
			Some(name) => groups
				.get(name)
				.map(|group| group.statuses(name, now))
				.ok_or_else(|| ControlError::NotFound(name.to_string())),
		}
	}

	pub async fn start(self: &Arc<Self>, name: &str) -> Result<String, ControlError> {
		let mut groups = self.groups.write().await;
		self.ensure_accepting()?;
		let group = idle_group(&mut groups, name)?;
		let spec = Arc::clone(group.spec());

		let mut started = 0;
		for inst in group.instances_mut() {
			if !inst.state().can_start() {
				continue;
			}
			inst.reset_for_start();
			self.launch(name, &spec, inst).await;
			started += 1;
		}
		if started == 0 {
			return Err(ControlError::AlreadyRunning(name.to_string()));
		}
		tracing::info!(program = name, instances = started, "start requested");
		Ok(format!("{}: starting {} instance(s)", name, started))
	}

	pub async fn stop(self: &Arc<Self>, name: &str) -> Result<String, ControlError> {
		let mut groups = self.groups.write().await;
		let group = idle_group(&mut groups, name)?;
		let spec = Arc::clone(group.spec());

		let mut stopping = 0;
		for inst in group.instances_mut() {
			if inst.state().is_running() || inst.state() == InstanceState::Backoff {
				self.stop_instance(name, &spec, inst, PendingOp::Stop).await;
				stopping += 1;
			}
		}
		if stopping == 0 {
			return Err(ControlError::NotRunning(name.to_string()));
		}
		self.settle(&mut groups, name);
		tracing::info!(program = name, instances = stopping, "stop requested");
		Ok(format!("{}: stopping {} instance(s)", name, stopping))
	}

	/// Stops whatever is running, then starts every instance again. Instances
	/// without a process are simply started.
	pub async fn restart(self: &Arc<Self>, name: &str) -> Result<String, ControlError> {
		let mut groups = self.groups.write().await;
		self.ensure_accepting()?;
		let group = idle_group(&mut groups, name)?;
		let spec = Arc::clone(group.spec());

		for inst in group.instances_mut() {
			self.stop_instance(name, &spec, inst, PendingOp::Restart).await;
		}
		tracing::info!(program = name, "restart requested");
		Ok(format!("{}: restarting", name))
	}

	/// Brings the supervised set in line with `specs`.
	///
	/// The whole set is validated before anything is touched. Individual
	/// actions can still fail (a removal still in progress blocks a re-add,
	/// a shutdown that began mid-reload blocks further spawns); those are
	/// reported per action and do not roll back the others.
	pub async fn reload(
		self: &Arc<Self>,
		specs: Vec<ProcessSpec>,
	) -> Result<Vec<AppliedAction>, ControlError> {
		self.ensure_accepting()?;
		let _reload = self.reloading.lock().await;
		config::validate(&specs)?;

		let current = self.current_specs().await;
		let changes = reconcile::diff(&current, &specs);
		let mut applied = Vec::with_capacity(changes.len());

		for change in changes {
			let action = change.kind();
			let name = change.name().to_string();
			let result = match change {
				Change::Remove(name) => self.remove_group(&name).await.map(|_| false),
				Change::Update { name, old, new } => self.update_group(&name, &old, new).await,
				Change::Add(spec) => self.add_group(spec).await.map(|_| false),
			};
			match result {
				Ok(restarted) => {
					tracing::info!(program = %name, %action, restarted, "applied");
					applied.push(AppliedAction {
						action,
						name,
						restarted,
						error: None,
					});
				}
				Err(e) => {
					tracing::warn!(program = %name, %action, "not applied: {}", e);
					applied.push(AppliedAction {
						action,
						name,
						restarted: false,
						error: Some(e.to_string()),
					});
				}
			}
		}
		Ok(applied)
	}

	/// Stops every instance, waits up to the shutdown timeout, then kills the
	/// rest. Further start, restart and reload requests are refused.
	pub async fn shutdown(self: &Arc<Self>) -> Result<(), ShutdownError> {
		if self.shutting_down.swap(true, Ordering::SeqCst) {
			tracing::debug!("shutdown already in progress");
		}
		tracing::info!("stopping all programs");
		{
			let mut groups = self.groups.write().await;
			let names: Vec<String> = groups.keys().cloned().collect();
			for name in names {
				let Some(group) = groups.get_mut(&name) else {
					continue;
				};
				let spec = Arc::clone(group.spec());
				for inst in group.instances_mut() {
					self.stop_instance(&name, &spec, inst, PendingOp::Shutdown).await;
				}
				self.settle(&mut groups, &name);
			}
		}

		let timeout = self.config.shutdown_timeout;
		if self.wait_for_exits(Instant::now() + timeout).await {
			tracing::info!("all programs stopped");
			return Ok(());
		}

		let stuck = self.kill_remaining().await;
		tracing::warn!("shutdown timeout {:?} exceeded; killed {:?}", timeout, stuck);
		// Give the monitor a moment to collect what was just killed.
		self.wait_for_exits(Instant::now() + Duration::from_secs(5)).await;
		Err(ShutdownError::DeadlineExceeded { timeout, stuck })
	}

	/// Buffered output of one instance (index 0 when none is given).
	pub async fn tail(&self, name: &str, index: Option<usize>) -> Result<(usize, Vec<u8>), ControlError> {
		let output = {
			let groups = self.groups.read().await;
			let group = groups
				.get(name)
				.ok_or_else(|| ControlError::NotFound(name.to_string()))?;
			let index = index.unwrap_or(0);
			let inst = group
				.instance(index)
				.ok_or_else(|| ControlError::NotFound(format!("{}:{}", name, index)))?;
			(index, inst.output().clone())
		};
		Ok((output.0, output.1.snapshot().await))
	}

	/// Empties the buffered output and log files of every instance of `name`.
	pub async fn clear(&self, name: &str) -> Result<String, ControlError> {
		let outputs: Vec<_> = {
			let groups = self.groups.read().await;
			let group = groups
				.get(name)
				.ok_or_else(|| ControlError::NotFound(name.to_string()))?;
			group.instances().iter().map(|i| i.output().clone()).collect()
		};
		for output in &outputs {
			output.clear().await;
		}
		Ok(format!("{}: cleared", name))
	}

	/// Applies one reaped exit. Exits for PIDs no instance owns are ignored.
	pub async fn handle_exit(self: &Arc<Self>, event: ExitEvent) {
		let ExitEvent { pid, token, reason } = event;
		let mut groups = self.groups.write().await;
		let Some((name, position)) = groups.iter().find_map(|(name, group)| {
			group
				.position_of_child(pid, token)
				.map(|p| (name.clone(), p))
		}) else {
			tracing::debug!(pid, token, %reason, "exit for unknown child");
			return;
		};
		let Some(group) = groups.get_mut(&name) else {
			return;
		};
		let spec = Arc::clone(group.spec());
		let inst = &mut group.instances_mut()[position];
		let index = inst.index();

		match inst.on_exit(pid, token, reason, &spec, &self.config.backoff) {
			ExitOutcome::Stale => {}
			ExitOutcome::Stopped => {
				tracing::info!(program = %name, index, pid, %reason, "stopped");
				inst.output().notice(&format!("stopped ({})", reason)).await;
				if inst.take_pending() == Some(PendingOp::Restart) && !self.is_shutting_down() {
					inst.reset_for_start();
					self.launch(&name, &spec, inst).await;
				}
			}
			ExitOutcome::Exited => {
				tracing::info!(program = %name, index, pid, %reason, "exited");
				inst.output().notice(&format!("exited ({})", reason)).await;
			}
			ExitOutcome::Backoff(timer) => {
				tracing::warn!(
					program = %name,
					index,
					pid,
					%reason,
					failures = inst.failures(),
					"died; retrying in {:?}",
					timer.after
				);
				inst.output()
					.notice(&format!("died ({}); retrying in {:?}", reason, timer.after))
					.await;
				if self.is_shutting_down() {
					inst.begin_stop(&spec);
				} else {
					self.arm(&name, inst, timer);
				}
			}
			ExitOutcome::Fatal => {
				tracing::error!(
					program = %name,
					index,
					pid,
					%reason,
					failures = inst.failures(),
					"died too many times; giving up"
				);
				inst.output()
					.notice(&format!("died ({}); giving up", reason))
					.await;
			}
		}
		self.settle(&mut groups, &name);
	}

	async fn on_timer(self: &Arc<Self>, name: &str, index: usize, timer: Timer) {
		let mut groups = self.groups.write().await;
		let Some(group) = groups.get_mut(name) else {
			return;
		};
		let spec = Arc::clone(group.spec());
		let Some(inst) = group.instance_mut(index) else {
			return;
		};
		if inst.generation() != timer.generation {
			return;
		}
		// This task is the stored timer; later transitions must not abort it.
		inst.detach_timer();

		match timer.kind {
			TimerKind::StartConfirm => {
				if inst.confirm_started(timer.generation) {
					tracing::info!(program = name, index, pid = ?inst.pid(), "running");
					inst.output().notice("running").await;
				}
			}
			TimerKind::StopGrace => {
				if let Some(pid) = inst.grace_elapsed(timer.generation) {
					tracing::warn!(
						program = name,
						index,
						pid,
						"still alive {}s after {}; sending SIGKILL",
						spec.stop_grace_secs,
						spec.stop_signal
					);
					if let Err(e) = self.launcher.signal(pid, StopSignal::Kill) {
						tracing::debug!(pid, "SIGKILL failed: {}", e);
					}
				}
			}
			TimerKind::Backoff => {
				if self.is_shutting_down() {
					inst.begin_stop(&spec);
				} else {
					match inst.backoff_elapsed(timer.generation, &spec) {
						BackoffOutcome::Spawn => self.launch(name, &spec, inst).await,
						BackoffOutcome::Fatal => {
							tracing::error!(program = name, index, failures = inst.failures(), "giving up");
							inst.output().notice("giving up").await;
						}
						BackoffOutcome::Ignored => {}
					}
				}
			}
		}
		self.settle(&mut groups, name);
	}

	async fn launch(self: &Arc<Self>, name: &str, spec: &Arc<ProcessSpec>, inst: &mut ProcessInstance) {
		let index = inst.index();
		match self.launcher.launch(spec, index) {
			Ok(launched) => {
				let output = inst.output().clone();
				if let Some(stdout) = launched.stdout {
					tokio::spawn(pipe_output(stdout, output.clone(), Stream::Stdout));
				}
				if let Some(stderr) = launched.stderr {
					tokio::spawn(pipe_output(stderr, output.clone(), Stream::Stderr));
				}
				tracing::info!(program = name, index, pid = launched.pid, "spawned");
				output.notice(&format!("spawned (pid {})", launched.pid)).await;
				match inst.on_spawned(launched.pid, launched.token, Instant::now(), spec) {
					Some(timer) => self.arm(name, inst, timer),
					None => tracing::info!(program = name, index, pid = launched.pid, "running"),
				}
			}
			Err(e) => {
				tracing::warn!(program = name, index, "{}", e);
				inst.output().notice(&e.to_string()).await;
				match inst.on_spawn_failed(spec, &self.config.backoff) {
					Some(timer) => self.arm(name, inst, timer),
					None => {
						tracing::error!(program = name, index, failures = inst.failures(), "giving up");
					}
				}
			}
		}
	}

	async fn stop_instance(
		self: &Arc<Self>,
		name: &str,
		spec: &Arc<ProcessSpec>,
		inst: &mut ProcessInstance,
		op: PendingOp,
	) {
		match inst.begin_stop(spec) {
			StopOutcome::Signal { pid, signal, timer } => {
				inst.set_pending(op);
				tracing::info!(program = name, index = inst.index(), pid, %signal, "stopping");
				if let Err(e) = self.launcher.signal(pid, signal) {
					tracing::debug!(pid, "{} failed: {}", signal, e);
				}
				inst.output().notice(&format!("sent {}", signal)).await;
				self.arm(name, inst, timer);
			}
			StopOutcome::AlreadyStopping => inst.set_pending(op),
			StopOutcome::Stopped | StopOutcome::NotRunning => {
				if op == PendingOp::Restart {
					inst.reset_for_start();
					self.launch(name, spec, inst).await;
				}
			}
		}
	}

	// Kept synchronous: the spawned task re-enters `on_timer`.
	fn arm(self: &Arc<Self>, name: &str, inst: &mut ProcessInstance, timer: Timer) {
		let sup = Arc::clone(self);
		let name = name.to_string();
		let index = inst.index();
		let handle = tokio::spawn(async move {
			tokio::time::sleep(timer.after).await;
			sup.on_timer(&name, index, timer).await;
		});
		inst.arm(handle);
	}

	async fn add_group(self: &Arc<Self>, spec: Arc<ProcessSpec>) -> Result<(), ControlError> {
		let mut groups = self.groups.write().await;
		self.ensure_accepting()?;
		if groups.contains_key(&spec.name) {
			// Only a group still being torn down can linger under this name.
			return Err(ControlError::Busy(spec.name.clone()));
		}
		let mut group = ProcessGroup::new(Arc::clone(&spec));
		if spec.autostart {
			for inst in group.instances_mut() {
				self.launch(&spec.name, &spec, inst).await;
			}
		}
		groups.insert(spec.name.clone(), group);
		Ok(())
	}

	async fn remove_group(self: &Arc<Self>, name: &str) -> Result<(), ControlError> {
		let mut groups = self.groups.write().await;
		let group = groups
			.get_mut(name)
			.ok_or_else(|| ControlError::NotFound(name.to_string()))?;
		let spec = Arc::clone(group.spec());
		group.mark_removing();
		for inst in group.instances_mut() {
			self.stop_instance(name, &spec, inst, PendingOp::Remove).await;
		}
		self.settle(&mut groups, name);
		Ok(())
	}

	/// Returns whether running instances were restarted.
	async fn update_group(
		self: &Arc<Self>,
		name: &str,
		old: &ProcessSpec,
		new: Arc<ProcessSpec>,
	) -> Result<bool, ControlError> {
		let mut groups = self.groups.write().await;
		self.ensure_accepting()?;
		let group = groups
			.get_mut(name)
			.filter(|g| !g.is_removing())
			.ok_or_else(|| ControlError::NotFound(name.to_string()))?;

		let disruptive = old.requires_restart(&new);
		tracing::debug!(
			program = name,
			disruptive,
			instances = %format!("{} -> {}", old.instances, new.instances),
			"updating"
		);
		group.set_spec(Arc::clone(&new));
		for inst in group.instances() {
			inst.output().retarget(&new, inst.index()).await;
		}

		let resize = group.resize(new.instances);
		for index in &resize.retired {
			if let Some(inst) = group.instance_mut(*index) {
				self.stop_instance(name, &new, inst, PendingOp::Remove).await;
			}
		}
		for index in &resize.revived {
			if let Some(inst) = group.instance_mut(*index) {
				let op = if new.autostart { PendingOp::Restart } else { PendingOp::Stop };
				inst.set_pending(op);
			}
		}

		let mut restarted = false;
		if disruptive {
			for inst in group.instances_mut() {
				if inst.state().is_running() && inst.pending().is_none() && !inst.is_retiring() {
					self.stop_instance(name, &new, inst, PendingOp::Restart).await;
					restarted = true;
				}
			}
		}

		if new.autostart {
			for index in &resize.created {
				if let Some(inst) = group.instance_mut(*index) {
					self.launch(name, &new, inst).await;
				}
			}
		}

		self.settle(&mut groups, name);
		Ok(restarted)
	}

	async fn current_specs(&self) -> BTreeMap<String, Arc<ProcessSpec>> {
		let groups = self.groups.read().await;
		groups
			.iter()
			.filter(|(_, g)| !g.is_removing())
			.map(|(name, g)| (name.clone(), Arc::clone(g.spec())))
			.collect()
	}

	/// Prunes retired instances, drops a drained group and wakes shutdown.
	fn settle(&self, groups: &mut BTreeMap<String, ProcessGroup>, name: &str) {
		if let Some(group) = groups.get_mut(name) {
			let pruned = group.prune();
			if pruned > 0 {
				tracing::debug!(program = name, pruned, "retired instances dropped");
			}
			if group.is_drained() {
				groups.remove(name);
				tracing::info!(program = name, "removed");
			}
		}
		self.settled.notify_waiters();
	}

	/// True when no instance owns a process before `deadline`.
	async fn wait_for_exits(&self, deadline: Instant) -> bool {
		loop {
			let notified = self.settled.notified();
			if !self.has_live_processes().await {
				return true;
			}
			if Instant::now() >= deadline {
				return false;
			}
			tokio::select! {
				_ = notified => {}
				_ = tokio::time::sleep_until(deadline) => {}
			}
		}
	}

	async fn has_live_processes(&self) -> bool {
		let groups = self.groups.read().await;
		groups
			.values()
			.flat_map(|g| g.instances())
			.any(|i| i.state().has_process())
	}

	async fn kill_remaining(&self) -> Vec<String> {
		let groups = self.groups.read().await;
		let mut stuck = Vec::new();
		for (name, group) in groups.iter() {
			for inst in group.instances() {
				if let (true, Some(pid)) = (inst.state().has_process(), inst.pid()) {
					if let Err(e) = self.launcher.signal(pid, StopSignal::Kill) {
						tracing::debug!(pid, "SIGKILL failed: {}", e);
					}
					stuck.push(format!("{}:{}", name, inst.index()));
				}
			}
		}
		stuck
	}

	// Spawning paths call this with the group lock held, so a child they
	// create is always seen by shutdown's stop pass.
	fn ensure_accepting(&self) -> Result<(), ControlError> {
		if self.is_shutting_down() {
			return Err(ControlError::ShuttingDown);
		}
		Ok(())
	}
}

/// The named group, provided no instance of it is mid-transition.
fn idle_group<'a>(
	groups: &'a mut BTreeMap<String, ProcessGroup>,
	name: &str,
) -> Result<&'a mut ProcessGroup, ControlError> {
	let group = groups
		.get_mut(name)
		.ok_or_else(|| ControlError::NotFound(name.to_string()))?;
	if group.is_busy() || group.is_removing() {
		return Err(ControlError::Busy(name.to_string()));
	}
	Ok(group)
}
