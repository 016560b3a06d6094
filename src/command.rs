//! External command execution
//!
//! Every privileged tool invocation goes through [`CommandRunner`]. The
//! engine treats it as opaque; callers classify its [`CommandError`]s as
//! transient or fatal.
//!
//! [`SystemRunner`] is the real implementation:
//!
//! - Spawns in a new process group via `.in_new_process_group()`
//! - Registers the child PID with `ChildRegistry::global()` while it runs
//! - Captures stdout/stderr and turns a non-zero exit into `CommandError::Failed`
//! - In dry-run mode, logs the command and reports an empty success

use crate::process_guard::{ChildRegistry, CommandProcessGroup};
use std::io::Write;
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, info};

/// Captured result of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Error, Debug)]
pub enum CommandError {
    /// The program could not be started at all
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program ran and exited non-zero
    #[error("`{command}` exited with {}: {}", exit_code.map_or("signal".to_string(), |c| c.to_string()), stderr.trim())]
    Failed {
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

impl CommandError {
    /// All text a classifier may inspect: the message plus captured output.
    pub fn text(&self) -> String {
        match self {
            Self::Spawn { .. } => self.to_string(),
            Self::Failed { stdout, stderr, .. } => {
                format!("{self}\n{stdout}\n{stderr}")
            }
        }
    }

    /// True when the program ran and reported failure.
    pub fn is_exit_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Runs external commands.
pub trait CommandRunner: Send + Sync {
    /// Run `argv`, optionally feeding `input` on stdin.
    fn run_with_input(&self, argv: &[String], input: Option<&str>)
        -> Result<CommandOutput, CommandError>;

    fn run(&self, argv: &[String]) -> Result<CommandOutput, CommandError> {
        self.run_with_input(argv, None)
    }

    /// Whether commands are only logged. Callers skip their own side effects too.
    fn is_dry_run(&self) -> bool {
        false
    }
}

/// Build an argv from anything string-like.
pub fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

/// Runs commands on the host.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner {
    dry_run: bool,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log commands instead of running them.
    pub fn dry_run() -> Self {
        Self { dry_run: true }
    }
}

impl CommandRunner for SystemRunner {
    fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn run_with_input(
        &self,
        argv: &[String],
        input: Option<&str>,
    ) -> Result<CommandOutput, CommandError> {
        let command_line = argv.join(" ");
        let Some((program, args)) = argv.split_first() else {
            return Err(CommandError::Spawn {
                program: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
            });
        };

        if self.dry_run {
            info!("[dry-run] {}", command_line);
            return Ok(CommandOutput {
                exit_code: Some(0),
                ..CommandOutput::default()
            });
        }

        debug!("Running: {}", command_line);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();

        let spawn_err = |source| CommandError::Spawn {
            program: program.clone(),
            source,
        };

        let mut child = cmd.spawn().map_err(spawn_err)?;
        let pid = child.id();
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.register(pid);
        }

        if let (Some(text), Some(mut stdin)) = (input, child.stdin.take()) {
            // A child that exits early closes the pipe; its exit status tells the story.
            let _ = stdin.write_all(text.as_bytes());
        }

        let output = child.wait_with_output();

        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.unregister(pid);
        }

        let output = output.map_err(spawn_err)?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code();

        if output.status.success() {
            Ok(CommandOutput {
                exit_code,
                stdout,
                stderr,
            })
        } else {
            Err(CommandError::Failed {
                command: command_line,
                exit_code,
                stdout,
                stderr,
            })
        }
    }
}
