//! tempo: command-line client for the tempo session daemon.
//!
//! Each invocation sends one command and prints the daemon's JSON response on
//! stdout. `watch` subscribes and prints every event line until the daemon
//! closes the connection. Any failure, including an `ok: false` response,
//! exits with status 1.

mod daemon_client;
mod logging;

use clap::{Parser, Subcommand};
use daemon_client::CliError;
use std::io::{self, Write};
use tempo_daemon_protocol::Command;

#[derive(Parser)]
#[command(name = "tempo")]
#[command(about = "Control the tempo work/break timer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Start the current session, or resume it if paused
    Start,
    Pause,
    Resume,
    /// Pause if running, otherwise start
    Toggle,
    /// Skip to the next session (disabled in strict mode)
    Skip,
    /// Restart the current session without logging it
    Reset,

    /// Reset and log the attempt if it ran for at least 10 seconds
    ResetLog {
        /// Log as completed instead of abandoned
        #[arg(long)]
        productive: bool,
    },

    /// Stop the current session and log it as abandoned
    Abandon,
    Status,

    /// Set the project tag (empty string clears it)
    Project {
        #[arg(value_name = "PROJECT")]
        project: String,
    },

    /// Set the session label (empty string clears it)
    Label {
        #[arg(value_name = "LABEL")]
        label: String,
    },

    /// Override the current session's duration
    Duration {
        #[arg(value_name = "MINUTES", allow_negative_numbers = true)]
        minutes: f64,
    },

    /// Activate a sequence defined in config.toml
    Sequence {
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// Activate an inline sequence such as "50w 10s 50w 20l"
    SequenceInline {
        #[arg(value_name = "DEFINITION")]
        definition: String,
    },

    ClearSequence,
    /// Advance to the next session without logging (idle only)
    Next,
    /// Switch the running countdown to a stopwatch
    Stopwatch,
    StopStopwatch,
    /// Reload config.toml
    Reload,
    Ping,
    /// Stop the daemon
    Shutdown,
    /// Subscribe and print events until the daemon disconnects
    Watch,
}

impl Commands {
    /// Wire command for one-shot subcommands; `None` for `watch`.
    fn into_command(self) -> Option<Command> {
        let command = match self {
            Commands::Start => Command::Start,
            Commands::Pause => Command::Pause,
            Commands::Resume => Command::Resume,
            Commands::Toggle => Command::Toggle,
            Commands::Skip => Command::Skip,
            Commands::Reset => Command::Reset,
            Commands::ResetLog { productive } => Command::ResetLog { productive },
            Commands::Abandon => Command::Abandon,
            Commands::Status => Command::Status,
            Commands::Project { project } => Command::SetProject { project },
            Commands::Label { label } => Command::SetLabel { label },
            Commands::Duration { minutes } => Command::SetDuration { minutes },
            Commands::Sequence { name } => Command::ActivateSequence { name },
            Commands::SequenceInline { definition } => {
                Command::ActivateSequenceInline { definition }
            }
            Commands::ClearSequence => Command::ClearSequence,
            Commands::Next => Command::AdvanceSession,
            Commands::Stopwatch => Command::SwitchToStopwatch,
            Commands::StopStopwatch => Command::StopStopwatch,
            Commands::Reload => Command::UpdateConfig,
            Commands::Ping => Command::Ping,
            Commands::Shutdown => Command::Shutdown,
            Commands::Watch => return None,
        };
        Some(command)
    }
}

fn main() {
    logging::init();
    let cli = Cli::parse();

    match run(cli.command) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            tracing::error!(error = %e, "tempo failed");
            eprintln!("tempo: {}", e);
            std::process::exit(1);
        }
    }
}

fn run(command: Commands) -> Result<bool, CliError> {
    let socket = daemon_client::socket_path()?;
    let stdout = io::stdout();
    let mut out = stdout.lock();

    match command.into_command() {
        None => {
            daemon_client::watch(&socket, &mut out)?;
            Ok(true)
        }
        Some(command) => {
            let response = daemon_client::send_command(&socket, &command)?;
            let line = serde_json::to_string(&response)?;
            writeln!(out, "{}", line).map_err(CliError::Write)?;
            if let Some(error) = response.error.as_deref() {
                tracing::warn!(command = command.name(), error, "Daemon rejected command");
            }
            Ok(response.ok)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Commands {
        let mut argv = vec!["tempo"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("parse args").command
    }

    #[test]
    fn subcommands_map_to_wire_commands() {
        assert_eq!(parse(&["start"]).into_command(), Some(Command::Start));
        assert_eq!(parse(&["next"]).into_command(), Some(Command::AdvanceSession));
        assert_eq!(
            parse(&["stopwatch"]).into_command(),
            Some(Command::SwitchToStopwatch)
        );
        assert_eq!(parse(&["reload"]).into_command(), Some(Command::UpdateConfig));
        assert_eq!(parse(&["watch"]).into_command(), None);
    }

    #[test]
    fn arguments_are_forwarded() {
        assert_eq!(
            parse(&["reset-log", "--productive"]).into_command(),
            Some(Command::ResetLog { productive: true })
        );
        assert_eq!(
            parse(&["reset-log"]).into_command(),
            Some(Command::ResetLog { productive: false })
        );
        assert_eq!(
            parse(&["duration", "42.5"]).into_command(),
            Some(Command::SetDuration { minutes: 42.5 })
        );
        assert_eq!(
            parse(&["sequence-inline", "50w 10s"]).into_command(),
            Some(Command::ActivateSequenceInline {
                definition: "50w 10s".to_string()
            })
        );
        assert_eq!(
            parse(&["label", ""]).into_command(),
            Some(Command::SetLabel {
                label: String::new()
            })
        );
    }

    #[test]
    fn negative_duration_reaches_the_daemon_for_validation() {
        assert_eq!(
            parse(&["duration", "-5"]).into_command(),
            Some(Command::SetDuration { minutes: -5.0 })
        );
    }
}
