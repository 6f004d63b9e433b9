use owo_colors::OwoColorize;
use taskmaster_core::{AppliedAction, ExitReason, InstanceState, InstanceStatus, Response};

/// Prints a daemon response. Returns the process exit code.
pub fn print_response(response: &Response) -> i32 {
	match response {
		Response::Accepted { message } => println!("{}", message),
		Response::Status { instances } => print_status(instances),
		Response::Reloaded { actions } => print_actions(actions),
		Response::Pid { pid } => println!("{}", pid),
		Response::Output { text, .. } => print!("{}", text),
		Response::Pong => println!("pong"),
		Response::NotFound { name } => eprintln!("{}: {}: no such program", "error".red(), name),
		Response::AlreadyRunning { name } => eprintln!("{}: already running", name),
		Response::NotRunning { name } => eprintln!("{}: not running", name),
		Response::Busy { name } => {
			eprintln!("{}: {}: busy, try again shortly", "error".red(), name)
		}
		Response::Invalid { message } => eprintln!("{}: {}", "invalid".red(), message),
		Response::Error { message } => eprintln!("{}: {}", "error".red(), message),
	}
	if response.is_success() {
		0
	} else {
		1
	}
}

fn print_status(instances: &[InstanceStatus]) {
	if instances.is_empty() {
		eprintln!("no programs configured");
		return;
	}
	let width = instances
		.iter()
		.map(|s| instance_label(s).len())
		.max()
		.unwrap_or(0);
	for status in instances {
		println!("{}", status_line(status, width));
	}
}

fn instance_label(status: &InstanceStatus) -> String {
	format!("{}:{}", status.name, status.index)
}

fn status_line(status: &InstanceStatus, width: usize) -> String {
	let (circle, state) = match status.state {
		InstanceState::Running => ("●".green().to_string(), status.state.green().to_string()),
		InstanceState::Starting | InstanceState::Stopping | InstanceState::Backoff => {
			("●".yellow().to_string(), status.state.yellow().to_string())
		}
		InstanceState::Fatal => ("●".red().to_string(), status.state.red().to_string()),
		InstanceState::Stopped | InstanceState::Exited => {
			("○".dimmed().to_string(), status.state.dimmed().to_string())
		}
	};
	let pid = status
		.pid
		.map(|p| p.to_string())
		.unwrap_or_else(|| "-".to_string());
	let uptime = status
		.uptime_secs
		.map(format_uptime)
		.unwrap_or_else(|| "-".to_string());
	let mut detail = String::new();
	if let Some(reason) = status.last_exit {
		detail.push_str(&format!("last {}", describe_exit(reason)));
	}
	if status.failures > 0 {
		if !detail.is_empty() {
			detail.push_str(", ");
		}
		detail.push_str(&format!("{} failure(s)", status.failures));
	}
	format!(
		"{} {:<width$} {:<8} {:<8} {:<8} {}",
		circle,
		instance_label(status),
		state,
		pid,
		uptime,
		detail.dimmed(),
		width = width
	)
}

fn print_actions(actions: &[AppliedAction]) {
	if actions.is_empty() {
		println!("nothing to change");
		return;
	}
	for action in actions {
		match action.error {
			Some(ref error) => eprintln!("{} {} {}", action.action.red(), action.name, error.dimmed()),
			None if action.restarted => {
				println!("{} {} {}", action.action.yellow(), action.name, "(restarted)".dimmed())
			}
			None => println!("{} {}", action.action.green(), action.name),
		}
	}
}

fn describe_exit(reason: ExitReason) -> String {
	match reason {
		ExitReason::Code { code } => format!("exit {}", code),
		ExitReason::Signal { signal } => format!("signal {}", signal),
		ExitReason::Unknown => "exit unknown".to_string(),
	}
}

pub fn format_uptime(secs: u64) -> String {
	if secs < 60 {
		format!("{}s", secs)
	} else if secs < 3600 {
		let m = secs / 60;
		let s = secs % 60;
		if s == 0 { format!("{}m", m) } else { format!("{}m{}s", m, s) }
	} else if secs < 86400 {
		let h = secs / 3600;
		let m = (secs % 3600) / 60;
		if m == 0 { format!("{}h", h) } else { format!("{}h{}m", h, m) }
	} else {
		let d = secs / 86400;
		let h = (secs % 86400) / 3600;
		if h == 0 { format!("{}d", d) } else { format!("{}d{}h", d, h) }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn uptime_units() {
		assert_eq!(format_uptime(42), "42s");
		assert_eq!(format_uptime(120), "2m");
		assert_eq!(format_uptime(125), "2m5s");
		assert_eq!(format_uptime(3 * 3600 + 60), "3h1m");
		assert_eq!(format_uptime(2 * 86400), "2d");
	}

	#[test]
	fn status_line_shows_pid_uptime_and_failures() {
		let status = InstanceStatus {
			name: "web".into(),
			index: 1,
			state: InstanceState::Running,
			pid: Some(4242),
			uptime_secs: Some(90),
			last_exit: Some(ExitReason::Signal { signal: 9 }),
			failures: 2,
		};
		let line = status_line(&status, 8);
		assert!(line.contains("web:1"));
		assert!(line.contains("RUNNING"));
		assert!(line.contains("4242"));
		assert!(line.contains("1m30s"));
		assert!(line.contains("last signal 9, 2 failure(s)"));
	}

	#[test]
	fn stopped_instance_has_placeholders() {
		let status = InstanceStatus {
			name: "db".into(),
			index: 0,
			state: InstanceState::Stopped,
			pid: None,
			uptime_secs: None,
			last_exit: None,
			failures: 0,
		};
		let line = status_line(&status, 4);
		assert!(line.contains("db:0"));
		assert!(line.contains("STOPPED"));
		assert!(line.contains(" - "));
	}

	#[test]
	fn refusals_exit_nonzero() {
		assert_eq!(print_response(&Response::Busy { name: "web".into() }), 1);
		assert_eq!(print_response(&Response::Pong), 0);
	}
}
