use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskmaster_core::{
	ActionKind, AppliedAction, ExitReason, InstanceState, InstanceStatus, ProcessSpec,
	RestartPolicy, StopSignal,
};
use taskmaster_supervisor::{
	BackoffPolicy, ControlError, ExitEvent, Launched, Launcher, ShutdownError, SpawnError,
	Supervisor, SupervisorConfig,
};
use tokio::time::sleep;

#[derive(Default)]
struct FakeLauncher {
	next_pid: AtomicU32,
	spawned: Mutex<Vec<(String, usize, u32)>>,
	signals: Mutex<Vec<(u32, StopSignal)>>,
	failing: Mutex<HashSet<String>>,
}

impl FakeLauncher {
	fn spawn_count(&self, name: &str) -> usize {
		self.spawned.lock().unwrap().iter().filter(|(n, _, _)| n == name).count()
	}

	fn signals(&self) -> Vec<(u32, StopSignal)> {
		self.signals.lock().unwrap().clone()
	}

	fn fail(&self, name: &str) {
		self.failing.lock().unwrap().insert(name.to_string());
	}
}

impl Launcher for FakeLauncher {
	fn launch(&self, spec: &ProcessSpec, index: usize) -> Result<Launched, SpawnError> {
		if self.failing.lock().unwrap().contains(&spec.name) {
			return Err(SpawnError::Io {
				command: spec.command.clone(),
				source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
			});
		}
		let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
		self.spawned.lock().unwrap().push((spec.name.clone(), index, pid));
		Ok(Launched {
			pid,
			token: u64::from(pid),
			stdout: None,
			stderr: None,
		})
	}

	fn signal(&self, pid: u32, signal: StopSignal) -> std::io::Result<()> {
		self.signals.lock().unwrap().push((pid, signal));
		Ok(())
	}
}

fn setup() -> (Arc<Supervisor>, Arc<FakeLauncher>) {
	let launcher = Arc::new(FakeLauncher::default());
	let sup = Supervisor::new(
		SupervisorConfig {
			backoff: BackoffPolicy {
				base: Duration::from_secs(1),
				max: Duration::from_secs(5),
			},
			shutdown_timeout: Duration::from_secs(10),
		},
		launcher.clone(),
	);
	(sup, launcher)
}

fn program(name: &str, instances: usize, start_secs: u64) -> ProcessSpec {
	let mut spec = ProcessSpec::new(name, "/usr/bin/env");
	spec.instances = instances;
	spec.start_secs = start_secs;
	spec
}

async fn status(sup: &Supervisor, name: &str) -> Vec<InstanceStatus> {
	sup.status(Some(name)).await.unwrap()
}

async fn states(sup: &Supervisor, name: &str) -> Vec<InstanceState> {
	status(sup, name).await.iter().map(|s| s.state).collect()
}

async fn pids(sup: &Supervisor, name: &str) -> Vec<u32> {
	status(sup, name).await.iter().filter_map(|s| s.pid).collect()
}

async fn exit(sup: &Arc<Supervisor>, pid: u32, reason: ExitReason) {
	sup.handle_exit(ExitEvent {
		pid,
		token: u64::from(pid),
		reason,
	})
	.await;
}

const KILLED: ExitReason = ExitReason::Signal { signal: 9 };
const TERMINATED: ExitReason = ExitReason::Signal { signal: 15 };

// --- Lifecycle ---

#[tokio::test(start_paused = true)]
async fn killed_instance_restarts_without_touching_sibling() {
	let (sup, _launcher) = setup();
	let mut web = program("web", 2, 2);
	web.autorestart = RestartPolicy::Always;

	let applied = sup.reload(vec![web]).await.unwrap();
	assert_eq!(
		applied,
		vec![AppliedAction {
			action: ActionKind::Add,
			name: "web".into(),
			restarted: false,
			error: None,
		}]
	);
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Starting; 2]);

	sleep(Duration::from_millis(2500)).await;
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Running; 2]);
	let before = pids(&sup, "web").await;

	exit(&sup, before[0], KILLED).await;
	let after = status(&sup, "web").await;
	assert_eq!(after[0].state, InstanceState::Backoff);
	assert_eq!(after[0].pid, None);
	assert_eq!(after[0].last_exit, Some(KILLED));
	assert_eq!(after[1].state, InstanceState::Running);
	assert_eq!(after[1].pid, Some(before[1]));

	sleep(Duration::from_millis(1500)).await;
	let restarted = status(&sup, "web").await;
	assert_eq!(restarted[0].state, InstanceState::Starting);
	assert_ne!(restarted[0].pid, Some(before[0]));

	sleep(Duration::from_millis(2500)).await;
	let settled = status(&sup, "web").await;
	assert_eq!(settled[0].state, InstanceState::Running);
	assert_eq!(settled[0].failures, 0);
	assert_eq!(settled[1].pid, Some(before[1]));
	assert!(settled[1].uptime_secs.unwrap() > settled[0].uptime_secs.unwrap());
}

#[tokio::test(start_paused = true)]
async fn zero_threshold_runs_immediately() {
	let (sup, _launcher) = setup();
	sup.reload(vec![program("web", 1, 0)]).await.unwrap();
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Running]);
}

#[tokio::test(start_paused = true)]
async fn autostart_false_stays_stopped() {
	let (sup, launcher) = setup();
	let mut web = program("web", 2, 1);
	web.autostart = false;
	sup.reload(vec![web]).await.unwrap();
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Stopped; 2]);
	assert_eq!(launcher.spawn_count("web"), 0);

	sup.start("web").await.unwrap();
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Starting; 2]);
}

#[tokio::test(start_paused = true)]
async fn goes_fatal_exactly_when_failures_exceed_limit() {
	let (sup, launcher) = setup();
	let mut web = program("web", 1, 5);
	web.max_restarts = 2;
	sup.reload(vec![web]).await.unwrap();

	// First failure: retry after 1 s.
	exit(&sup, pids(&sup, "web").await[0], ExitReason::Code { code: 1 }).await;
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Backoff]);
	sleep(Duration::from_millis(1500)).await;
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Starting]);

	// Second failure: the delay grows to 2 s.
	exit(&sup, pids(&sup, "web").await[0], ExitReason::Code { code: 1 }).await;
	sleep(Duration::from_millis(1500)).await;
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Backoff]);
	sleep(Duration::from_millis(1000)).await;
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Starting]);

	// Third failure exceeds max_restarts.
	exit(&sup, pids(&sup, "web").await[0], ExitReason::Code { code: 1 }).await;
	let fatal = status(&sup, "web").await;
	assert_eq!(fatal[0].state, InstanceState::Fatal);
	assert_eq!(fatal[0].failures, 3);
	assert_eq!(launcher.spawn_count("web"), 3);

	sleep(Duration::from_secs(60)).await;
	assert_eq!(launcher.spawn_count("web"), 3);

	// A manual start clears the failure count.
	sup.start("web").await.unwrap();
	let again = status(&sup, "web").await;
	assert_eq!(again[0].state, InstanceState::Starting);
	assert_eq!(again[0].failures, 0);
}

#[tokio::test(start_paused = true)]
async fn spawn_failure_backs_off_then_gives_up() {
	let (sup, launcher) = setup();
	launcher.fail("ghost");
	let mut ghost = program("ghost", 1, 1);
	ghost.max_restarts = 1;
	sup.reload(vec![ghost]).await.unwrap();
	assert_eq!(states(&sup, "ghost").await, vec![InstanceState::Backoff]);

	sleep(Duration::from_millis(1500)).await;
	let fatal = status(&sup, "ghost").await;
	assert_eq!(fatal[0].state, InstanceState::Fatal);
	assert_eq!(fatal[0].failures, 2);
	assert_eq!(fatal[0].pid, None);
}

#[tokio::test(start_paused = true)]
async fn expected_exit_is_not_restarted() {
	let (sup, launcher) = setup();
	sup.reload(vec![program("job", 1, 0)]).await.unwrap();
	exit(&sup, pids(&sup, "job").await[0], ExitReason::Code { code: 0 }).await;
	assert_eq!(states(&sup, "job").await, vec![InstanceState::Exited]);

	sleep(Duration::from_secs(30)).await;
	assert_eq!(launcher.spawn_count("job"), 1);

	sup.start("job").await.unwrap();
	assert_eq!(states(&sup, "job").await, vec![InstanceState::Running]);
}

#[tokio::test(start_paused = true)]
async fn never_policy_exits_on_any_code() {
	let (sup, _launcher) = setup();
	let mut job = program("job", 1, 0);
	job.autorestart = RestartPolicy::Never;
	sup.reload(vec![job]).await.unwrap();
	exit(&sup, pids(&sup, "job").await[0], ExitReason::Code { code: 3 }).await;
	assert_eq!(states(&sup, "job").await, vec![InstanceState::Exited]);
}

#[tokio::test(start_paused = true)]
async fn unexpected_exit_code_is_restarted() {
	let (sup, _launcher) = setup();
	let mut job = program("job", 1, 0);
	job.exit_codes = vec![0, 2];
	sup.reload(vec![job]).await.unwrap();

	exit(&sup, pids(&sup, "job").await[0], ExitReason::Code { code: 2 }).await;
	assert_eq!(states(&sup, "job").await, vec![InstanceState::Exited]);

	sup.start("job").await.unwrap();
	exit(&sup, pids(&sup, "job").await[0], ExitReason::Code { code: 1 }).await;
	assert_eq!(states(&sup, "job").await, vec![InstanceState::Backoff]);
}

#[tokio::test(start_paused = true)]
async fn exit_for_unknown_pid_is_ignored() {
	let (sup, _launcher) = setup();
	sup.reload(vec![program("web", 1, 0)]).await.unwrap();
	let before = status(&sup, "web").await;
	exit(&sup, 424_242, KILLED).await;
	assert_eq!(status(&sup, "web").await, before);
}

#[tokio::test(start_paused = true)]
async fn exit_of_earlier_child_with_same_pid_is_ignored() {
	let (sup, _launcher) = setup();
	sup.reload(vec![program("web", 1, 0)]).await.unwrap();
	let before = status(&sup, "web").await;
	let pid = before[0].pid.unwrap();

	sup.handle_exit(ExitEvent {
		pid,
		token: u64::from(pid) + 1,
		reason: KILLED,
	})
	.await;
	assert_eq!(status(&sup, "web").await, before);
}

// --- Stop / start / restart ---

#[tokio::test(start_paused = true)]
async fn stop_signals_and_waits_for_exit() {
	let (sup, launcher) = setup();
	let mut web = program("web", 1, 0);
	web.stop_signal = StopSignal::Int;
	sup.reload(vec![web]).await.unwrap();
	let pid = pids(&sup, "web").await[0];

	sup.stop("web").await.unwrap();
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Stopping]);
	assert_eq!(launcher.signals(), vec![(pid, StopSignal::Int)]);

	exit(&sup, pid, ExitReason::Signal { signal: 2 }).await;
	let stopped = status(&sup, "web").await;
	assert_eq!(stopped[0].state, InstanceState::Stopped);
	assert_eq!(stopped[0].pid, None);
	assert_eq!(stopped[0].uptime_secs, None);
}

#[tokio::test(start_paused = true)]
async fn stop_escalates_to_kill_once() {
	let (sup, launcher) = setup();
	let mut web = program("web", 1, 0);
	web.stop_grace_secs = 3;
	sup.reload(vec![web]).await.unwrap();
	let pid = pids(&sup, "web").await[0];

	sup.stop("web").await.unwrap();
	sleep(Duration::from_millis(3500)).await;
	assert_eq!(
		launcher.signals(),
		vec![(pid, StopSignal::Term), (pid, StopSignal::Kill)]
	);
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Stopping]);

	sleep(Duration::from_secs(30)).await;
	assert_eq!(launcher.signals().len(), 2);

	exit(&sup, pid, KILLED).await;
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Stopped]);
}

#[tokio::test(start_paused = true)]
async fn stop_during_backoff_cancels_restart() {
	let (sup, launcher) = setup();
	sup.reload(vec![program("web", 1, 2)]).await.unwrap();
	exit(&sup, pids(&sup, "web").await[0], KILLED).await;
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Backoff]);

	sup.stop("web").await.unwrap();
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Stopped]);

	sleep(Duration::from_secs(60)).await;
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Stopped]);
	assert_eq!(launcher.spawn_count("web"), 1);
	assert!(launcher.signals().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent() {
	let (sup, launcher) = setup();
	let mut web = program("web", 1, 1);
	web.autostart = false;
	sup.reload(vec![web]).await.unwrap();

	for _ in 0..2 {
		let err = sup.stop("web").await.unwrap_err();
		assert!(matches!(err, ControlError::NotRunning(ref n) if n == "web"));
	}
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Stopped]);
	assert!(launcher.signals().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unknown_program_is_not_found() {
	let (sup, _launcher) = setup();
	assert!(matches!(sup.start("nope").await, Err(ControlError::NotFound(_))));
	assert!(matches!(sup.stop("nope").await, Err(ControlError::NotFound(_))));
	assert!(matches!(sup.restart("nope").await, Err(ControlError::NotFound(_))));
	assert!(matches!(sup.status(Some("nope")).await, Err(ControlError::NotFound(_))));
	assert!(matches!(sup.tail("nope", None).await, Err(ControlError::NotFound(_))));
}

#[tokio::test(start_paused = true)]
async fn start_when_running_is_refused() {
	let (sup, _launcher) = setup();
	sup.reload(vec![program("web", 1, 1)]).await.unwrap();
	assert!(matches!(
		sup.start("web").await,
		Err(ControlError::AlreadyRunning(_))
	));
}

#[tokio::test(start_paused = true)]
async fn operations_are_busy_while_stopping() {
	let (sup, _launcher) = setup();
	sup.reload(vec![program("web", 1, 0)]).await.unwrap();
	let pid = pids(&sup, "web").await[0];
	sup.stop("web").await.unwrap();

	assert!(matches!(sup.start("web").await, Err(ControlError::Busy(_))));
	assert!(matches!(sup.restart("web").await, Err(ControlError::Busy(_))));
	assert!(matches!(sup.stop("web").await, Err(ControlError::Busy(_))));

	exit(&sup, pid, TERMINATED).await;
	sup.start("web").await.unwrap();
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Running]);
}

#[tokio::test(start_paused = true)]
async fn restart_stops_then_starts() {
	let (sup, launcher) = setup();
	sup.reload(vec![program("web", 1, 1)]).await.unwrap();
	sleep(Duration::from_millis(1500)).await;
	let old = pids(&sup, "web").await[0];

	sup.restart("web").await.unwrap();
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Stopping]);
	exit(&sup, old, TERMINATED).await;

	let restarted = status(&sup, "web").await;
	assert_eq!(restarted[0].state, InstanceState::Starting);
	assert_ne!(restarted[0].pid, Some(old));
	assert_eq!(launcher.spawn_count("web"), 2);
}

#[tokio::test(start_paused = true)]
async fn restart_of_stopped_program_starts_it() {
	let (sup, _launcher) = setup();
	let mut web = program("web", 2, 0);
	web.autostart = false;
	sup.reload(vec![web]).await.unwrap();
	sup.restart("web").await.unwrap();
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Running; 2]);
}

// --- Status ---

#[tokio::test(start_paused = true)]
async fn status_lists_instances_sorted() {
	let (sup, _launcher) = setup();
	sup.reload(vec![program("b", 2, 1), program("a", 1, 1)]).await.unwrap();

	for query in [None, Some("*")] {
		let all = sup.status(query).await.unwrap();
		let keys: Vec<(&str, usize)> = all.iter().map(|s| (s.name.as_str(), s.index)).collect();
		assert_eq!(keys, vec![("a", 0), ("b", 0), ("b", 1)]);
	}
}

// --- Reload ---

#[tokio::test(start_paused = true)]
async fn reload_leaves_unchanged_programs_alone() {
	let (sup, launcher) = setup();
	sup.reload(vec![program("a", 1, 1), program("b", 1, 1)]).await.unwrap();
	sleep(Duration::from_secs(10)).await;
	let a_before = status(&sup, "a").await;
	let b_pid = pids(&sup, "b").await[0];

	let mut b2 = program("b", 1, 1);
	b2.args = vec!["--port".into(), "9000".into()];
	let applied = sup.reload(vec![program("a", 1, 1), b2]).await.unwrap();
	assert_eq!(applied.len(), 1);
	assert_eq!(applied[0].action, ActionKind::Update);
	assert_eq!(applied[0].name, "b");
	assert!(applied[0].restarted);
	assert_eq!(launcher.signals(), vec![(b_pid, StopSignal::Term)]);

	let a_after = status(&sup, "a").await;
	assert_eq!(a_after[0].pid, a_before[0].pid);
	assert_eq!(a_after[0].uptime_secs, a_before[0].uptime_secs);

	exit(&sup, b_pid, TERMINATED).await;
	let b_after = status(&sup, "b").await;
	assert_eq!(b_after[0].state, InstanceState::Starting);
	assert_ne!(b_after[0].pid, Some(b_pid));
}

#[tokio::test(start_paused = true)]
async fn identical_reload_is_a_no_op() {
	let (sup, launcher) = setup();
	let specs = vec![program("a", 2, 1)];
	sup.reload(specs.clone()).await.unwrap();
	assert!(sup.reload(specs).await.unwrap().is_empty());
	assert_eq!(launcher.spawn_count("a"), 2);
}

#[tokio::test(start_paused = true)]
async fn changed_arguments_restart_running_instances() {
	let (sup, launcher) = setup();
	sup.reload(vec![program("web", 1, 0), program("db", 1, 0)]).await.unwrap();
	let pid = pids(&sup, "web").await[0];
	let db = pids(&sup, "db").await;

	let mut web = program("web", 1, 0);
	web.args = vec!["--port".into(), "8081".into()];
	let applied = sup
		.reload(vec![web, program("db", 1, 0)])
		.await
		.unwrap();
	assert_eq!(applied.len(), 1);
	assert_eq!((applied[0].action, applied[0].restarted), (ActionKind::Update, true));
	assert_eq!(launcher.signals(), vec![(pid, StopSignal::Term)]);
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Stopping]);

	exit(&sup, pid, TERMINATED).await;
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Running]);
	assert_ne!(pids(&sup, "web").await, vec![pid]);
	assert_eq!(launcher.spawn_count("web"), 2);
	assert_eq!(pids(&sup, "db").await, db);
}

#[tokio::test(start_paused = true)]
async fn non_disruptive_update_keeps_processes() {
	let (sup, launcher) = setup();
	sup.reload(vec![program("web", 1, 0)]).await.unwrap();
	let pid = pids(&sup, "web").await[0];

	let mut web = program("web", 1, 0);
	web.autorestart = RestartPolicy::Never;
	web.stop_grace_secs = 2;
	let applied = sup.reload(vec![web]).await.unwrap();
	assert!(!applied[0].restarted);
	assert!(launcher.signals().is_empty());
	assert_eq!(pids(&sup, "web").await, vec![pid]);

	// The new policy applies to the running child.
	exit(&sup, pid, ExitReason::Code { code: 9 }).await;
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Exited]);
}

#[tokio::test(start_paused = true)]
async fn resize_adds_and_retires_instances() {
	let (sup, launcher) = setup();
	sup.reload(vec![program("web", 2, 0)]).await.unwrap();
	let before = pids(&sup, "web").await;

	let applied = sup.reload(vec![program("web", 3, 0)]).await.unwrap();
	assert!(!applied[0].restarted);
	let grown = status(&sup, "web").await;
	assert_eq!(grown.len(), 3);
	assert_eq!(grown[0].pid, Some(before[0]));
	assert_eq!(grown[1].pid, Some(before[1]));
	assert_eq!(grown[2].state, InstanceState::Running);

	sup.reload(vec![program("web", 1, 0)]).await.unwrap();
	assert_eq!(
		states(&sup, "web").await,
		vec![
			InstanceState::Running,
			InstanceState::Stopping,
			InstanceState::Stopping
		]
	);
	for (pid, _) in launcher.signals() {
		exit(&sup, pid, TERMINATED).await;
	}
	let shrunk = status(&sup, "web").await;
	assert_eq!(shrunk.len(), 1);
	assert_eq!(shrunk[0].pid, Some(before[0]));
}

#[tokio::test(start_paused = true)]
async fn removed_program_disappears_once_stopped() {
	let (sup, _launcher) = setup();
	sup.reload(vec![program("web", 2, 0), program("db", 1, 0)]).await.unwrap();
	let web_pids = pids(&sup, "web").await;

	let applied = sup.reload(vec![program("db", 1, 0)]).await.unwrap();
	assert_eq!(applied.len(), 1);
	assert_eq!(applied[0].action, ActionKind::Remove);
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Stopping; 2]);
	assert!(matches!(sup.start("web").await, Err(ControlError::Busy(_))));

	for pid in web_pids {
		exit(&sup, pid, TERMINATED).await;
	}
	assert!(matches!(sup.status(Some("web")).await, Err(ControlError::NotFound(_))));
	assert!(matches!(sup.start("web").await, Err(ControlError::NotFound(_))));
	assert_eq!(states(&sup, "db").await, vec![InstanceState::Running]);
}

#[tokio::test(start_paused = true)]
async fn readd_while_removal_pending_is_busy() {
	let (sup, _launcher) = setup();
	sup.reload(vec![program("web", 1, 0)]).await.unwrap();
	let pid = pids(&sup, "web").await[0];
	sup.reload(vec![]).await.unwrap();

	let applied = sup.reload(vec![program("web", 1, 0)]).await.unwrap();
	assert_eq!(applied[0].action, ActionKind::Add);
	assert!(applied[0].error.as_deref().unwrap().contains("busy"));

	exit(&sup, pid, TERMINATED).await;
	let applied = sup.reload(vec![program("web", 1, 0)]).await.unwrap();
	assert_eq!(applied[0].error, None);
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Running]);
}

#[tokio::test(start_paused = true)]
async fn invalid_reload_applies_nothing() {
	let (sup, launcher) = setup();
	let err = sup
		.reload(vec![program("a", 1, 1), program("a", 2, 1)])
		.await
		.unwrap_err();
	assert!(matches!(err, ControlError::Invalid(_)));
	assert!(sup.status(None).await.unwrap().is_empty());
	assert_eq!(launcher.spawn_count("a"), 0);
}

// --- Output ---

#[tokio::test(start_paused = true)]
async fn tail_shows_lifecycle_and_clear_empties_it() {
	let (sup, _launcher) = setup();
	sup.reload(vec![program("web", 2, 0)]).await.unwrap();

	let (index, text) = sup.tail("web", Some(1)).await.unwrap();
	assert_eq!(index, 1);
	assert!(String::from_utf8_lossy(&text).contains("spawned (pid"));
	assert!(matches!(sup.tail("web", Some(7)).await, Err(ControlError::NotFound(_))));

	sup.clear("web").await.unwrap();
	assert!(sup.tail("web", None).await.unwrap().1.is_empty());
}

// --- Shutdown ---

#[tokio::test(start_paused = true)]
async fn shutdown_stops_everything_and_refuses_new_work() {
	let (sup, launcher) = setup();
	sup.reload(vec![program("a", 1, 0), program("b", 2, 0)]).await.unwrap();

	let stopper = Arc::clone(&sup);
	let shutdown = tokio::spawn(async move { stopper.shutdown().await });
	sleep(Duration::from_millis(100)).await;
	assert_eq!(launcher.signals().len(), 3);
	assert!(matches!(sup.start("a").await, Err(ControlError::ShuttingDown)));
	assert!(matches!(sup.reload(vec![]).await, Err(ControlError::ShuttingDown)));

	for (pid, _) in launcher.signals() {
		exit(&sup, pid, TERMINATED).await;
	}
	shutdown.await.unwrap().unwrap();
	let all = sup.status(None).await.unwrap();
	assert!(all.iter().all(|s| s.state == InstanceState::Stopped));
}

#[tokio::test(start_paused = true)]
async fn shutdown_kills_stragglers_after_deadline() {
	let (sup, launcher) = setup();
	let mut stubborn = program("stubborn", 1, 0);
	stubborn.stop_grace_secs = 600;
	sup.reload(vec![stubborn]).await.unwrap();
	let pid = pids(&sup, "stubborn").await[0];

	let err = sup.shutdown().await.unwrap_err();
	let ShutdownError::DeadlineExceeded { timeout, stuck } = err;
	assert_eq!(timeout, Duration::from_secs(10));
	assert_eq!(stuck, vec!["stubborn:0".to_string()]);
	assert_eq!(
		launcher.signals(),
		vec![(pid, StopSignal::Term), (pid, StopSignal::Kill)]
	);
}

#[tokio::test(start_paused = true)]
async fn shutdown_prevents_pending_restarts() {
	let (sup, launcher) = setup();
	sup.reload(vec![program("web", 1, 2)]).await.unwrap();
	exit(&sup, pids(&sup, "web").await[0], KILLED).await;
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Backoff]);

	sup.shutdown().await.unwrap();
	sleep(Duration::from_secs(30)).await;
	assert_eq!(states(&sup, "web").await, vec![InstanceState::Stopped]);
	assert_eq!(launcher.spawn_count("web"), 1);
}

/// Holds the launch of one program until the test lets it through.
struct GatedLauncher {
	inner: FakeLauncher,
	gated: String,
	entered: tokio::sync::mpsc::UnboundedSender<()>,
	release: Mutex<std::sync::mpsc::Receiver<()>>,
}

impl Launcher for GatedLauncher {
	fn launch(&self, spec: &ProcessSpec, index: usize) -> Result<Launched, SpawnError> {
		if spec.name == self.gated {
			let _ = self.entered.send(());
			let _ = self.release.lock().unwrap().recv();
		}
		self.inner.launch(spec, index)
	}

	fn signal(&self, pid: u32, signal: StopSignal) -> std::io::Result<()> {
		self.inner.signal(pid, signal)
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_during_reload_blocks_later_spawns() {
	let (entered_tx, mut entered) = tokio::sync::mpsc::unbounded_channel();
	let (release, release_rx) = std::sync::mpsc::channel();
	let launcher = Arc::new(GatedLauncher {
		inner: FakeLauncher::default(),
		gated: "a".into(),
		entered: entered_tx,
		release: Mutex::new(release_rx),
	});
	let sup = Supervisor::new(
		SupervisorConfig {
			backoff: BackoffPolicy::default(),
			shutdown_timeout: Duration::from_secs(5),
		},
		launcher.clone(),
	);

	let reloader = Arc::clone(&sup);
	let reload = tokio::spawn(async move {
		reloader
			.reload(vec![program("a", 1, 0), program("b", 1, 0)])
			.await
	});
	entered.recv().await.unwrap();

	let stopper = Arc::clone(&sup);
	let shutdown = tokio::spawn(async move { stopper.shutdown().await });
	while !sup.is_shutting_down() {
		tokio::task::yield_now().await;
	}
	release.send(()).unwrap();

	let applied = reload.await.unwrap().unwrap();
	assert_eq!(applied.len(), 2);
	assert_eq!((applied[0].name.as_str(), applied[0].error.as_deref()), ("a", None));
	assert_eq!(
		(applied[1].name.as_str(), applied[1].error.as_deref()),
		("b", Some("shutting down"))
	);
	assert_eq!(launcher.inner.spawn_count("b"), 0);

	// The child that made it out before shutdown gets a graceful stop.
	while launcher.inner.signals().is_empty() {
		sleep(Duration::from_millis(10)).await;
	}
	let pid = pids(&sup, "a").await[0];
	assert_eq!(launcher.inner.signals(), vec![(pid, StopSignal::Term)]);
	exit(&sup, pid, TERMINATED).await;
	shutdown.await.unwrap().unwrap();
	assert_eq!(states(&sup, "a").await, vec![InstanceState::Stopped]);
}
