// Human-readable error messages for testbed

use std::fmt;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use colored::*;

/// Number of captured output lines shown for a failed command
const ERROR_OUTPUT_LINES: usize = 10;

/// Initialize color output based on TTY detection and NO_COLOR environment variable
fn should_use_colors() -> bool {
    // Check NO_COLOR environment variable first (https://no-color.org/)
    if std::env::var("NO_COLOR").is_ok() {
        return false;
    }

    // Errors are written to stderr
    std::io::stderr().is_terminal()
}

/// All error types in testbed
#[derive(Debug)]
pub enum TestbedError {
    /// Configuration and usage errors
    General {
        message: String,
        suggestion: Option<String>,
    },

    /// Local file operations
    File {
        message: String,
        path: Option<PathBuf>,
    },

    /// Subprocess launch failure or non-zero exit
    Run(Box<RunError>),

    /// Guest specific failures (e.g. unsupported reboot mode)
    Provision {
        guest: Option<String>,
        message: String,
    },

    /// Guest did not come back after a reboot
    RebootTimeout { message: String },

    /// Control-flow signal raised by `wait()` checks, never shown to users
    WaitingIncomplete,

    /// Deadline of `wait()` exceeded
    WaitingTimedOut {
        check: String,
        timeout: Duration,
        check_success: bool,
    },

    /// Metadata and schema errors
    Specification {
        message: String,
        file: Option<String>,
    },

    /// Deliberate stop of the pipeline, nothing failed
    Exit { code: i32, message: Option<String> },
}

/// Details of a failed command
#[derive(Debug, Clone)]
pub struct RunError {
    pub message: String,
    pub command: String,
    pub returncode: i32,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl TestbedError {
    pub fn general(message: impl Into<String>) -> Self {
        TestbedError::General {
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn file(message: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        TestbedError::File {
            message: message.into(),
            path: Some(path.into()),
        }
    }

    pub fn provision(message: impl Into<String>) -> Self {
        TestbedError::Provision {
            guest: None,
            message: message.into(),
        }
    }

    pub fn specification(message: impl Into<String>) -> Self {
        TestbedError::Specification {
            message: message.into(),
            file: None,
        }
    }

    pub fn run(
        message: impl Into<String>,
        command: impl Into<String>,
        returncode: i32,
        stdout: Option<String>,
        stderr: Option<String>,
    ) -> Self {
        TestbedError::Run(Box::new(RunError {
            message: message.into(),
            command: command.into(),
            returncode,
            stdout,
            stderr,
        }))
    }

    /// Return code of a failed command, `None` for other errors
    pub fn returncode(&self) -> Option<i32> {
        match self {
            TestbedError::Run(err) => Some(err.returncode),
            _ => None,
        }
    }

    pub fn is_run(&self) -> bool {
        matches!(self, TestbedError::Run(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self, TestbedError::File { .. })
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, TestbedError::Exit { .. })
    }

    /// Plain one-line message without colors or hints
    pub fn message(&self) -> String {
        match self {
            TestbedError::General { message, .. }
            | TestbedError::File { message, .. }
            | TestbedError::Provision { message, .. }
            | TestbedError::RebootTimeout { message }
            | TestbedError::Specification { message, .. } => message.clone(),
            TestbedError::Run(err) => err.message.clone(),
            TestbedError::WaitingIncomplete => "Waiting incomplete".to_string(),
            TestbedError::WaitingTimedOut {
                check,
                timeout,
                check_success,
            } => {
                if *check_success {
                    format!(
                        "Waiting for condition '{}' succeeded but took too much time after waiting {:?}.",
                        check, timeout
                    )
                } else {
                    format!(
                        "Waiting for condition '{}' timed out after waiting {:?}.",
                        check, timeout
                    )
                }
            }
            TestbedError::Exit { code, message } => message
                .clone()
                .unwrap_or_else(|| format!("Exit requested with code {}", code)),
        }
    }
}

impl std::error::Error for TestbedError {}

impl From<std::io::Error> for TestbedError {
    fn from(err: std::io::Error) -> Self {
        TestbedError::File {
            message: err.to_string(),
            path: None,
        }
    }
}

impl fmt::Display for TestbedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !should_use_colors() {
            colored::control::set_override(false);
        }

        match self {
            TestbedError::General {
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "ERROR".red().bold(), message)?;
                if let Some(suggestion) = suggestion {
                    writeln!(f)?;
                    writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
                }
                Ok(())
            }

            TestbedError::File { message, path } => {
                writeln!(f, "{}: {}", "FILE ERROR".red().bold(), message)?;
                if let Some(path) = path {
                    writeln!(f, "  {} {}", "Path:".dimmed(), path.display())?;
                }
                Ok(())
            }

            TestbedError::Run(err) => {
                writeln!(f, "{}: {}", "RUN ERROR".red().bold(), err.message)?;
                writeln!(f, "  {} {}", "Command:".dimmed(), err.command)?;
                writeln!(f, "  {} {}", "Return code:".dimmed(), err.returncode)?;

                for (label, output) in [("stdout", &err.stdout), ("stderr", &err.stderr)] {
                    let Some(output) = output else { continue };
                    if output.trim().is_empty() {
                        continue;
                    }
                    let lines: Vec<&str> = output.lines().collect();
                    let skip = lines.len().saturating_sub(ERROR_OUTPUT_LINES);
                    writeln!(f)?;
                    writeln!(f, "  {}:", label.dimmed())?;
                    if skip > 0 {
                        writeln!(f, "    {}", format!("... {} lines skipped", skip).dimmed())?;
                    }
                    for line in &lines[skip..] {
                        writeln!(f, "    {}", line)?;
                    }
                }
                Ok(())
            }

            TestbedError::Provision { guest, message } => {
                writeln!(f, "{}: {}", "PROVISION ERROR".red().bold(), message)?;
                if let Some(guest) = guest {
                    writeln!(f, "  {} {}", "Guest:".dimmed(), guest)?;
                }
                Ok(())
            }

            TestbedError::RebootTimeout { message } => {
                writeln!(f, "{}: {}", "REBOOT TIMEOUT".red().bold(), message)
            }

            TestbedError::WaitingIncomplete | TestbedError::WaitingTimedOut { .. } => {
                writeln!(f, "{}: {}", "TIMEOUT".red().bold(), self.message())
            }

            TestbedError::Specification { message, file } => {
                writeln!(f, "{}: {}", "SPECIFICATION ERROR".red().bold(), message)?;
                if let Some(file) = file {
                    writeln!(f, "  {} {}", "-->".blue(), file.cyan())?;
                }
                Ok(())
            }

            TestbedError::Exit { .. } => writeln!(f, "{}", self.message()),
        }
    }
}
