//! OS maintenance actions (`system` command).

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use astropi_agent_server::Sender;
use astropi_protocol::{Event, LogLevel, SystemKind};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

pub const DEFAULT_PULL_COMMAND: &str = "git pull";
pub const DEFAULT_UPDATE_COMMAND: &str = "sudo apt update && sudo apt upgrade -y";

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RunFuture<'a> = Pin<Box<dyn Future<Output = Result<Option<i32>, SystemError>> + Send + 'a>>;

/// Runs a maintenance action, streaming its output to `sink`.
///
/// Resolves to the exit code (`None` if the process was killed by a signal).
pub trait MaintenanceRunner: Send + Sync + 'static {
    fn run<'a>(&'a self, kind: SystemKind, sink: &'a Sender) -> RunFuture<'a>;
}

/// Executes configured shell commands through `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    pub pull: String,
    pub update: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self {
            pull: DEFAULT_PULL_COMMAND.into(),
            update: DEFAULT_UPDATE_COMMAND.into(),
        }
    }
}

impl ShellRunner {
    pub fn new(pull: impl Into<String>, update: impl Into<String>) -> Self {
        Self {
            pull: pull.into(),
            update: update.into(),
        }
    }

    pub fn command_for(&self, kind: SystemKind) -> &str {
        match kind {
            SystemKind::Pull => &self.pull,
            SystemKind::Update => &self.update,
        }
    }
}

impl MaintenanceRunner for ShellRunner {
    fn run<'a>(&'a self, kind: SystemKind, sink: &'a Sender) -> RunFuture<'a> {
        Box::pin(async move {
            let command = self.command_for(kind);
            info!(%kind, command, "running maintenance command");

            let mut child = Command::new("sh")
                .arg("-c")
                .arg(command)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|source| SystemError::Spawn {
                    command: command.to_string(),
                    source,
                })?;

            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            tokio::try_join!(
                forward_lines(stdout, LogLevel::Log, sink),
                forward_lines(stderr, LogLevel::Warning, sink),
            )?;

            let status = child.wait().await?;
            debug!(%kind, ?status, "maintenance command exited");
            Ok(status.code())
        })
    }
}

async fn forward_lines<R>(
    stream: Option<R>,
    level: LogLevel,
    sink: &Sender,
) -> Result<(), std::io::Error>
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return Ok(());
    };
    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        if sink.send(Event::log(level, line)).await.is_err() {
            debug!("controller gone; discarding maintenance output");
        }
    }
    Ok(())
}
