mod daemon;
mod output;

use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use taskmaster_core::config;
use taskmaster_core::{Request, Response};
use taskmaster_ipc::clap::DaemonCommand;
use taskmaster_ipc::{ClientError, Daemon, DaemonClient};

pub const APP_NAME: &str = "taskmaster";

#[derive(Parser)]
#[command(name = "taskmaster", version, about = "Keeps configured programs running")]
struct Cli {
	/// Config file [default: $XDG_CONFIG_HOME/taskmaster/taskmaster.toml]
	#[arg(long, short, global = true)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Start every instance of a program
	Start { name: String },
	/// Stop every instance of a program
	Stop { name: String },
	/// Stop, then start every instance of a program
	Restart { name: String },
	/// Show instance states (all programs when no name is given)
	#[command(visible_alias = "st")]
	Status { name: Option<String> },
	/// Re-read the daemon's config file, or apply FILE instead
	Reload { file: Option<PathBuf> },
	/// Stop all programs and the daemon
	Shutdown,
	/// Print the daemon's PID
	Pid,
	/// Print buffered output of one instance
	Tail { name: String, index: Option<usize> },
	/// Discard buffered output and truncate log files of a program
	Clear { name: String },
	/// Check that the daemon answers
	Ping,
	/// Manage the daemon process
	#[command(subcommand)]
	Daemon(DaemonCommand),
}

fn main() {
	let cli = Cli::parse();
	let daemon = Daemon::new(APP_NAME);
	let config_path = cli.config.unwrap_or_else(|| daemon.paths.config_path());

	let code = match cli.command {
		Command::Daemon(DaemonCommand::Run) => run_daemon(&daemon, config_path),
		Command::Daemon(cmd) => match cmd.execute(&daemon, &run_args(&config_path)) {
			Ok(message) => {
				eprintln!("{}", message);
				0
			}
			Err(e) => {
				eprintln!("{}: {}", "error".red(), e);
				1
			}
		},
		command => match build_request(command) {
			Ok(request) => send(&daemon, &request),
			Err(message) => {
				eprintln!("{}: {}", "error".red(), message);
				1
			}
		},
	};
	std::process::exit(code);
}

/// Arguments that make this binary run the daemon in the foreground.
fn run_args(config_path: &Path) -> Vec<String> {
	vec![
		"--config".to_string(),
		config_path.display().to_string(),
		"daemon".to_string(),
		"run".to_string(),
	]
}

fn run_daemon(daemon: &Daemon, config_path: PathBuf) -> i32 {
	let runtime = match tokio::runtime::Runtime::new() {
		Ok(rt) => rt,
		Err(e) => {
			eprintln!("{}: cannot start runtime: {}", "error".red(), e);
			return 1;
		}
	};
	match runtime.block_on(daemon::run(daemon, config_path)) {
		Ok(()) => 0,
		Err(e) => {
			eprintln!("{}: {}", "error".red(), e);
			1
		}
	}
}

fn build_request(command: Command) -> Result<Request, String> {
	Ok(match command {
		Command::Start { name } => Request::Start { name },
		Command::Stop { name } => Request::Stop { name },
		Command::Restart { name } => Request::Restart { name },
		Command::Status { name } => Request::Status { name },
		Command::Reload { file: None } => Request::Reload { programs: None },
		Command::Reload { file: Some(file) } => {
			let config = config::load_config(&file).map_err(|e| e.to_string())?;
			Request::Reload {
				programs: Some(config.programs),
			}
		}
		Command::Shutdown => Request::Shutdown,
		Command::Pid => Request::Pid,
		Command::Tail { name, index } => Request::Tail { name, index },
		Command::Clear { name } => Request::Clear { name },
		Command::Ping => Request::Ping,
		Command::Daemon(_) => return Err("daemon commands are not sent over the socket".to_string()),
	})
}

fn send(daemon: &Daemon, request: &Request) -> i32 {
	let result = DaemonClient::<Request, Response>::connect(&daemon.paths).and_then(|mut client| {
		client.set_timeout(Some(Duration::from_secs(60)))?;
		client.send(request)
	});
	match result {
		Ok(response) => output::print_response(&response),
		Err(ClientError::NotRunning) => {
			eprintln!(
				"daemon not running (start it with `{} daemon start`)",
				APP_NAME
			);
			1
		}
		Err(e) => {
			eprintln!("{}: {}", "error".red(), e);
			1
		}
	}
}
