//! Client helper for talking to the tempo daemon.
//!
//! One command per connection: connect, write a JSON line, read one response
//! line. `watch` keeps the connection open as a subscriber instead.

use std::env;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempo_daemon_protocol::{Command, Response, MAX_LINE_BYTES};
use thiserror::Error;

const DIR_ENV: &str = "TEMPO_DIR";
const SOCKET_ENV: &str = "TEMPO_SOCKET";
const DEFAULT_DIR_NAME: &str = ".tempo";
const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_MS: u64 = 3000;
const WRITE_TIMEOUT_MS: u64 = 600;
/// Responses carry a full state snapshot; events can be larger than commands.
const MAX_RESPONSE_BYTES: u64 = (MAX_LINE_BYTES as u64) * 4;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Home directory not found")]
    NoHome,

    #[error("Failed to connect to daemon socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to send command: {0}")]
    Write(#[source] std::io::Error),

    #[error("Timed out waiting for daemon response")]
    Timeout,

    #[error("Failed to read from daemon: {0}")]
    Read(#[source] std::io::Error),

    #[error("Daemon closed the connection without responding")]
    Closed,

    #[error("Failed to parse daemon message: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Daemon rejected subscription: {0}")]
    Rejected(String),
}

pub fn socket_path() -> Result<PathBuf, CliError> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    if let Ok(dir) = env::var(DIR_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir).join(SOCKET_NAME));
        }
    }
    let home = dirs::home_dir().ok_or(CliError::NoHome)?;
    Ok(home.join(DEFAULT_DIR_NAME).join(SOCKET_NAME))
}

fn connect(socket: &Path) -> Result<UnixStream, CliError> {
    UnixStream::connect(socket).map_err(|source| CliError::Connect {
        path: socket.to_path_buf(),
        source,
    })
}

fn write_command(stream: &mut UnixStream, command: &Command) -> Result<(), CliError> {
    let mut line = serde_json::to_vec(command)?;
    line.push(b'\n');
    stream.write_all(&line).map_err(CliError::Write)?;
    stream.flush().map_err(CliError::Write)
}

/// Reads one line. `Ok(None)` means the daemon closed the connection.
fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<String>, CliError> {
    let mut line = String::new();
    match reader.read_line(&mut line) {
        Ok(0) => Ok(None),
        Ok(_) => Ok(Some(line.trim_end().to_string())),
        Err(err)
            if matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) =>
        {
            Err(CliError::Timeout)
        }
        Err(err) => Err(CliError::Read(err)),
    }
}

pub fn send_command(socket: &Path, command: &Command) -> Result<Response, CliError> {
    let mut stream = connect(socket)?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    tracing::debug!(command = command.name(), "Sending command to daemon");
    write_command(&mut stream, command)?;

    let mut reader = BufReader::new(stream.take(MAX_RESPONSE_BYTES));
    let line = read_message(&mut reader)?.ok_or(CliError::Closed)?;
    Ok(serde_json::from_str(&line)?)
}

/// Subscribes and copies every line the daemon sends to `out` until the
/// connection closes.
pub fn watch<W: Write>(socket: &Path, out: &mut W) -> Result<(), CliError> {
    let mut stream = connect(socket)?;
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));
    write_command(&mut stream, &Command::Subscribe)?;

    let mut reader = BufReader::new(stream);
    let first = read_message(&mut reader)?.ok_or(CliError::Closed)?;
    let response: Response = serde_json::from_str(&first)?;
    if !response.ok {
        return Err(CliError::Rejected(
            response.error.unwrap_or_else(|| "unknown error".to_string()),
        ));
    }
    writeln!(out, "{}", first).map_err(CliError::Write)?;

    while let Some(line) = read_message(&mut reader)? {
        writeln!(out, "{}", line).map_err(CliError::Write)?;
        out.flush().map_err(CliError::Write)?;
    }
    Ok(())
}
