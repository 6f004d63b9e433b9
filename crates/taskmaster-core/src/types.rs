use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Immutable description of one supervisable program.
///
/// A configuration change always produces a new `ProcessSpec`; running groups
/// swap their `Arc<ProcessSpec>` instead of mutating it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessSpec {
	pub name: String,
	pub command: String,
	#[serde(default)]
	pub args: Vec<String>,
	#[serde(default)]
	pub env: BTreeMap<String, String>,
	#[serde(default)]
	pub working_dir: Option<PathBuf>,
	#[serde(default)]
	pub umask: Option<u32>,
	#[serde(default = "default_instances")]
	pub instances: usize,
	#[serde(default = "default_true")]
	pub autostart: bool,
	#[serde(default)]
	pub autorestart: RestartPolicy,
	#[serde(default = "default_exit_codes")]
	pub exit_codes: Vec<i32>,
	#[serde(default = "default_start_secs")]
	pub start_secs: u64,
	#[serde(default = "default_max_restarts")]
	pub max_restarts: u32,
	#[serde(default)]
	pub stop_signal: StopSignal,
	#[serde(default = "default_stop_grace")]
	pub stop_grace_secs: u64,
	#[serde(default)]
	pub stdout: Option<PathBuf>,
	#[serde(default)]
	pub stderr: Option<PathBuf>,
}

fn default_instances() -> usize {
	1
}
fn default_true() -> bool {
	true
}
fn default_exit_codes() -> Vec<i32> {
	vec![0]
}
fn default_start_secs() -> u64 {
	1
}
fn default_max_restarts() -> u32 {
	3
}
fn default_stop_grace() -> u64 {
	10
}

impl ProcessSpec {
	/// A spec with every optional attribute at its default.
	pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			command: command.into(),
			args: Vec::new(),
			env: BTreeMap::new(),
			working_dir: None,
			umask: None,
			instances: default_instances(),
			autostart: true,
			autorestart: RestartPolicy::default(),
			exit_codes: default_exit_codes(),
			start_secs: default_start_secs(),
			max_restarts: default_max_restarts(),
			stop_signal: StopSignal::default(),
			stop_grace_secs: default_stop_grace(),
			stdout: None,
			stderr: None,
		}
	}

	/// True when moving from `self` to `next` changes what a running child
	/// actually executes, so every running instance has to be restarted.
	pub fn requires_restart(&self, next: &ProcessSpec) -> bool {
		self.command != next.command
			|| self.args != next.args
			|| self.env != next.env
			|| self.working_dir != next.working_dir
			|| self.umask != next.umask
	}

	pub fn is_expected_exit(&self, code: i32) -> bool {
		self.exit_codes.contains(&code)
	}

	/// Log destination for one instance, with `{name}` and `{index}` expanded.
	pub fn log_path(&self, stream: Stream, index: usize) -> Option<PathBuf> {
		let template = match stream {
			Stream::Stdout => self.stdout.as_deref(),
			Stream::Stderr => self.stderr.as_deref(),
		}?;
		Some(expand_placeholders(template, &self.name, index))
	}
}

fn expand_placeholders(template: &Path, name: &str, index: usize) -> PathBuf {
	let raw = template.to_string_lossy();
	if !raw.contains('{') {
		return template.to_path_buf();
	}
	PathBuf::from(
		raw.replace("{name}", name)
			.replace("{index}", &index.to_string()),
	)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
	Never,
	Always,
	#[default]
	#[serde(alias = "unexpected")]
	OnUnexpectedExit,
}

/// Signal used for a graceful stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StopSignal {
	#[default]
	#[serde(alias = "SIGTERM")]
	Term,
	#[serde(alias = "SIGINT")]
	Int,
	#[serde(alias = "SIGQUIT")]
	Quit,
	#[serde(alias = "SIGHUP")]
	Hup,
	#[serde(alias = "SIGKILL")]
	Kill,
	#[serde(alias = "SIGUSR1")]
	Usr1,
	#[serde(alias = "SIGUSR2")]
	Usr2,
}

impl fmt::Display for StopSignal {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			StopSignal::Term => "SIGTERM",
			StopSignal::Int => "SIGINT",
			StopSignal::Quit => "SIGQUIT",
			StopSignal::Hup => "SIGHUP",
			StopSignal::Kill => "SIGKILL",
			StopSignal::Usr1 => "SIGUSR1",
			StopSignal::Usr2 => "SIGUSR2",
		};
		f.write_str(name)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
	Stdout,
	Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
	Stopped,
	Starting,
	Running,
	Stopping,
	Backoff,
	Exited,
	Fatal,
}

impl InstanceState {
	/// An OS process is (or may still be) attached to the instance.
	pub fn has_process(&self) -> bool {
		matches!(
			self,
			InstanceState::Starting | InstanceState::Running | InstanceState::Stopping
		)
	}

	pub fn is_running(&self) -> bool {
		matches!(self, InstanceState::Starting | InstanceState::Running)
	}

	pub fn can_start(&self) -> bool {
		matches!(
			self,
			InstanceState::Stopped
				| InstanceState::Exited
				| InstanceState::Fatal
				| InstanceState::Backoff
		)
	}
}

impl fmt::Display for InstanceState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			InstanceState::Stopped => "STOPPED",
			InstanceState::Starting => "STARTING",
			InstanceState::Running => "RUNNING",
			InstanceState::Stopping => "STOPPING",
			InstanceState::Backoff => "BACKOFF",
			InstanceState::Exited => "EXITED",
			InstanceState::Fatal => "FATAL",
		};
		f.write_str(s)
	}
}

/// How a child terminated, as reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitReason {
	Code { code: i32 },
	Signal { signal: i32 },
	/// The process vanished without a status we could collect.
	Unknown,
}

impl fmt::Display for ExitReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ExitReason::Code { code } => write!(f, "exit {}", code),
			ExitReason::Signal { signal } => write!(f, "signal {}", signal),
			ExitReason::Unknown => f.write_str("unknown"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
	pub name: String,
	pub index: usize,
	pub state: InstanceState,
	pub pid: Option<u32>,
	pub uptime_secs: Option<u64>,
	pub last_exit: Option<ExitReason>,
	pub failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
	Add,
	Remove,
	Update,
}

impl fmt::Display for ActionKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			ActionKind::Add => "ADD",
			ActionKind::Remove => "REMOVE",
			ActionKind::Update => "UPDATE",
		};
		f.write_str(s)
	}
}

/// One reconciliation action as applied by a reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedAction {
	pub action: ActionKind,
	pub name: String,
	/// Set when an UPDATE stopped and restarted the group's running instances.
	#[serde(default)]
	pub restarted: bool,
	#[serde(default)]
	pub error: Option<String>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn spec_defaults_from_minimal_json() {
		let spec: ProcessSpec =
			serde_json::from_str(r#"{"name":"web","command":"/bin/sleep"}"#).unwrap();
		assert_eq!(spec, ProcessSpec::new("web", "/bin/sleep"));
		assert_eq!(spec.autorestart, RestartPolicy::OnUnexpectedExit);
		assert_eq!(spec.exit_codes, vec![0]);
		assert_eq!(spec.stop_signal, StopSignal::Term);
	}

	#[test]
	fn restart_policy_accepts_short_alias() {
		let p: RestartPolicy = serde_json::from_str(r#""unexpected""#).unwrap();
		assert_eq!(p, RestartPolicy::OnUnexpectedExit);
		let p: RestartPolicy = serde_json::from_str(r#""on-unexpected-exit""#).unwrap();
		assert_eq!(p, RestartPolicy::OnUnexpectedExit);
	}

	#[test]
	fn stop_signal_accepts_sig_prefix() {
		let s: StopSignal = serde_json::from_str(r#""SIGUSR1""#).unwrap();
		assert_eq!(s, StopSignal::Usr1);
		let s: StopSignal = serde_json::from_str(r#""INT""#).unwrap();
		assert_eq!(s, StopSignal::Int);
		assert_eq!(StopSignal::Quit.to_string(), "SIGQUIT");
	}

	#[test]
	fn disruptive_attributes() {
		let base = ProcessSpec::new("web", "/bin/sleep");

		let mut logs = base.clone();
		logs.stdout = Some("/tmp/web.log".into());
		logs.instances = 4;
		logs.autorestart = RestartPolicy::Never;
		assert!(!base.requires_restart(&logs));

		let mut args = base.clone();
		args.args = vec!["60".into()];
		assert!(base.requires_restart(&args));

		let mut env = base.clone();
		env.env.insert("PORT".into(), "8080".into());
		assert!(base.requires_restart(&env));

		let mut dir = base.clone();
		dir.working_dir = Some("/srv".into());
		assert!(base.requires_restart(&dir));
	}

	#[test]
	fn log_path_expands_placeholders() {
		let mut spec = ProcessSpec::new("web", "/bin/sleep");
		spec.stdout = Some("/var/log/{name}-{index}.out".into());
		assert_eq!(
			spec.log_path(Stream::Stdout, 2),
			Some(PathBuf::from("/var/log/web-2.out"))
		);
		assert_eq!(spec.log_path(Stream::Stderr, 2), None);
	}

	#[test]
	fn instance_state_predicates() {
		assert!(InstanceState::Starting.is_running());
		assert!(InstanceState::Stopping.has_process());
		assert!(!InstanceState::Stopping.is_running());
		assert!(InstanceState::Backoff.can_start());
		assert!(!InstanceState::Running.can_start());
		assert_eq!(
			serde_json::to_string(&InstanceState::Backoff).unwrap(),
			r#""BACKOFF""#
		);
	}
}
