use crate::error::SpawnError;
use crate::monitor::EventMonitor;
use nix::sys::signal::{killpg, Signal};
use nix::sys::stat::{umask, Mode};
use nix::unistd::Pid;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use taskmaster_core::{ProcessSpec, StopSignal};
use tokio::io::AsyncRead;

pub type OutputPipe = Box<dyn AsyncRead + Send + Unpin>;

/// A child that was just created.
pub struct Launched {
	pub pid: u32,
	/// Matches the `token` of this child's [`crate::ExitEvent`].
	pub token: u64,
	pub stdout: Option<OutputPipe>,
	pub stderr: Option<OutputPipe>,
}

/// The engine's only door to the operating system.
///
/// Exits are not reported here; whoever launches must arrange for them to
/// arrive as [`crate::ExitEvent`]s.
pub trait Launcher: Send + Sync + 'static {
	fn launch(&self, spec: &ProcessSpec, index: usize) -> Result<Launched, SpawnError>;

	/// Delivers `signal` to the child and everything it spawned.
	fn signal(&self, pid: u32, signal: StopSignal) -> std::io::Result<()>;
}

/// Spawns real children, each leading its own process group.
pub struct OsLauncher {
	monitor: EventMonitor,
}

impl OsLauncher {
	pub fn new(monitor: EventMonitor) -> Self {
		Self { monitor }
	}
}

impl Launcher for OsLauncher {
	fn launch(&self, spec: &ProcessSpec, index: usize) -> Result<Launched, SpawnError> {
		let mut cmd = Command::new(&spec.command);
		cmd.args(&spec.args)
			.envs(&spec.env)
			.env("TASKMASTER_PROCESS_NAME", &spec.name)
			.env("TASKMASTER_INSTANCE", index.to_string())
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.process_group(0);

		if let Some(ref dir) = spec.working_dir {
			cmd.current_dir(dir);
		}

		if let Some(mask) = spec.umask {
			let mode = Mode::from_bits_truncate(mask as nix::libc::mode_t);
			// SAFETY: umask(2) is async-signal-safe and touches no shared state.
			unsafe {
				cmd.pre_exec(move || {
					umask(mode);
					Ok(())
				});
			}
		}

		let mut child = cmd.spawn().map_err(|source| SpawnError::Io {
			command: spec.command.clone(),
			source,
		})?;
		let pid = child.id();
		let token = self.monitor.watch(pid);

		let stdout = child
			.stdout
			.take()
			.and_then(|s| tokio::process::ChildStdout::from_std(s).ok())
			.map(|s| Box::new(s) as OutputPipe);
		let stderr = child
			.stderr
			.take()
			.and_then(|s| tokio::process::ChildStderr::from_std(s).ok())
			.map(|s| Box::new(s) as OutputPipe);

		Ok(Launched {
			pid,
			token,
			stdout,
			stderr,
		})
	}

	fn signal(&self, pid: u32, signal: StopSignal) -> std::io::Result<()> {
		killpg(Pid::from_raw(pid as i32), to_nix(signal))?;
		Ok(())
	}
}

fn to_nix(signal: StopSignal) -> Signal {
	match signal {
		StopSignal::Term => Signal::SIGTERM,
		StopSignal::Int => Signal::SIGINT,
		StopSignal::Quit => Signal::SIGQUIT,
		StopSignal::Hup => Signal::SIGHUP,
		StopSignal::Kill => Signal::SIGKILL,
		StopSignal::Usr1 => Signal::SIGUSR1,
		StopSignal::Usr2 => Signal::SIGUSR2,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;
	use taskmaster_core::ExitReason;
	use tokio::io::AsyncReadExt;

	#[tokio::test]
	async fn passes_identity_and_env() {
		let (monitor, mut rx) = EventMonitor::new(Duration::from_millis(50));
		tokio::spawn(monitor.clone().run());
		let launcher = OsLauncher::new(monitor);

		let mut spec = ProcessSpec::new("echoer", "/bin/sh");
		spec.args = vec![
			"-c".into(),
			"echo $TASKMASTER_PROCESS_NAME:$TASKMASTER_INSTANCE:$GREETING; pwd".into(),
		];
		spec.env.insert("GREETING".into(), "hi".into());
		spec.working_dir = Some("/tmp".into());

		let launched = launcher.launch(&spec, 3).unwrap();
		let mut out = String::new();
		launched.stdout.unwrap().read_to_string(&mut out).await.unwrap();
		let real_tmp = std::fs::canonicalize("/tmp").unwrap();
		assert_eq!(out, format!("echoer:3:hi\n{}\n", real_tmp.display()));

		let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
			.await
			.unwrap()
			.unwrap();
		assert_eq!((event.pid, event.token), (launched.pid, launched.token));
		assert_eq!(event.reason, ExitReason::Code { code: 0 });
	}

	#[tokio::test]
	async fn applies_umask() {
		let (monitor, _rx) = EventMonitor::new(Duration::from_millis(50));
		let launcher = OsLauncher::new(monitor);
		let mut spec = ProcessSpec::new("masked", "/bin/sh");
		spec.args = vec!["-c".into(), "umask".into()];
		spec.umask = Some(0o027);

		let launched = launcher.launch(&spec, 0).unwrap();
		let mut out = String::new();
		launched.stdout.unwrap().read_to_string(&mut out).await.unwrap();
		assert_eq!(out.trim(), "0027");
	}

	#[test]
	fn missing_binary_is_spawn_error() {
		let (monitor, _rx) = EventMonitor::new(Duration::from_millis(50));
		let launcher = OsLauncher::new(monitor.clone());
		let spec = ProcessSpec::new("ghost", "/nonexistent/taskmaster-ghost");
		let err = launcher.launch(&spec, 0).err().unwrap();
		assert!(err.to_string().contains("/nonexistent/taskmaster-ghost"));
		assert_eq!(monitor.watched(), 0);
	}
}
