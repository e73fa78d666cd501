// Subprocess execution with streamed output, timeouts and process groups

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{Environment, LineLogger};
use crate::output::errors::TestbedError;

/// Return code used when a command exceeds its timeout
pub const PROCESS_TIMEOUT: i32 = 124;

/// Shell used for scripts
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// Strict options prepended to shell scripts
pub const SHELL_OPTIONS: &str = "set -eo pipefail";

/// Quote a string for safe use as a single shell word
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }

    let safe = s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c));
    if safe {
        return s.to_string();
    }

    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

/// A command with its arguments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    elements: Vec<String>,
}

impl Command {
    pub fn new<I, S>(elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Command {
            elements: elements.into_iter().map(Into::into).collect(),
        }
    }

    pub fn arg(mut self, element: impl Into<String>) -> Self {
        self.elements.push(element.into());
        self
    }

    pub fn args<I, S>(mut self, elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.elements.extend(elements.into_iter().map(Into::into));
        self
    }

    pub fn extend(mut self, other: &Command) -> Self {
        self.elements.extend(other.elements.iter().cloned());
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.elements.first().map(String::as_str)
    }

    pub fn elements(&self) -> &[String] {
        &self.elements
    }

    /// Render as a single shell command line element, e.g. for `rsync -e`
    pub fn to_element(&self) -> String {
        self.elements
            .iter()
            .map(|e| shell_quote(e))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Render as a shell script
    pub fn to_script(&self) -> ShellScript {
        ShellScript::new(self.to_element())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_element())
    }
}

/// A free-form blob of text understood by a shell
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellScript(String);

impl ShellScript {
    pub fn new(script: impl Into<String>) -> Self {
        ShellScript(script.into())
    }

    /// Merge scripts into one, joined with `; `
    pub fn from_scripts(scripts: &[ShellScript]) -> Self {
        ShellScript(
            scripts
                .iter()
                .map(|s| s.0.as_str())
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn and(&self, other: &ShellScript) -> Self {
        ShellScript(format!("{} && {}", self.0, other.0))
    }

    pub fn then(&self, other: &ShellScript) -> Self {
        if self.0.is_empty() {
            return other.clone();
        }
        ShellScript(format!("{}; {}", self.0, other.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Turn the script into a command driven by the default shell
    pub fn to_shell_command(&self) -> Command {
        Command::new([DEFAULT_SHELL, "-c", self.0.as_str()])
    }
}

impl fmt::Display for ShellScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Either a command or a shell script
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Executable {
    Command(Command),
    Script(ShellScript),
}

impl Executable {
    pub fn to_script(&self) -> ShellScript {
        match self {
            Executable::Command(command) => command.to_script(),
            Executable::Script(script) => script.clone(),
        }
    }
}

impl From<Command> for Executable {
    fn from(command: Command) -> Self {
        Executable::Command(command)
    }
}

impl From<ShellScript> for Executable {
    fn from(script: ShellScript) -> Self {
        Executable::Script(script)
    }
}

impl fmt::Display for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Executable::Command(command) => command.fmt(f),
            Executable::Script(script) => script.fmt(f),
        }
    }
}

/// Captured output of a command, `None` when not captured
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// How to run a command
#[derive(Clone, Default)]
pub struct RunOptions {
    pub cwd: Option<PathBuf>,
    /// Overlay on top of the current process environment
    pub env: Option<Environment>,
    /// Merge stderr into stdout
    pub join: bool,
    /// Attach the command to the controlling terminal, no capture
    pub interactive: bool,
    pub timeout: Option<Duration>,
    pub log: Option<LineLogger>,
    /// Skip execution entirely
    pub dry: bool,
    pub friendly_command: Option<String>,
    pub silent: bool,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, env: Environment) -> Self {
        self.env = Some(env);
        self
    }

    pub fn with_join(mut self, join: bool) -> Self {
        self.join = join;
        self
    }

    pub fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_log(mut self, log: LineLogger) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_dry(mut self, dry: bool) -> Self {
        self.dry = dry;
        self
    }

    pub fn with_friendly_command(mut self, friendly: impl Into<String>) -> Self {
        self.friendly_command = Some(friendly.into());
        self
    }

    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("cwd", &self.cwd)
            .field("env", &self.env)
            .field("join", &self.join)
            .field("interactive", &self.interactive)
            .field("timeout", &self.timeout)
            .field("dry", &self.dry)
            .field("friendly_command", &self.friendly_command)
            .field("silent", &self.silent)
            .finish()
    }
}

/// Run a command, stream its output to the logger and capture it
///
/// Non-zero exit becomes a [`TestbedError::Run`] carrying the captured
/// output. A command exceeding `timeout` has its whole process group killed
/// and fails with return code [`PROCESS_TIMEOUT`].
pub async fn run(command: &Command, options: &RunOptions) -> Result<CommandOutput, TestbedError> {
    let full_command = command.to_element();
    debug!(command = %full_command, "run command");

    if !options.silent {
        if let (Some(friendly), Some(log)) = (&options.friendly_command, &options.log) {
            log("cmd", friendly);
        }
    }

    if options.dry {
        return Ok(CommandOutput::default());
    }

    if let Some(ref cwd) = options.cwd {
        if !cwd.exists() {
            return Err(TestbedError::general(format!(
                "The working directory '{}' does not exist.",
                cwd.display()
            )));
        }
    }

    let result = if options.interactive {
        run_interactive(command, options).await
    } else {
        run_captured(command, options).await
    };

    result.map_err(|err| match err {
        TestbedError::Run(mut run_error) => {
            debug!(reason = %run_error.message, "command failed");
            let friendly = options
                .friendly_command
                .clone()
                .unwrap_or_else(|| full_command.clone());
            run_error.message = format!(
                "Failed to run command: {} Reason: {}",
                friendly, run_error.message
            );
            TestbedError::Run(run_error)
        }
        other => other,
    })
}

fn prepare(command: &Command, options: &RunOptions) -> Result<tokio::process::Command, TestbedError> {
    let program = command
        .program()
        .ok_or_else(|| TestbedError::general("Cannot run an empty command."))?;

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(&command.elements()[1..]);

    if let Some(ref cwd) = options.cwd {
        cmd.current_dir(cwd);
    }
    if let Some(ref env) = options.env {
        trace!(?env, "environment overlay");
        cmd.envs(env);
    }

    Ok(cmd)
}

fn spawn_error(command: &Command, err: std::io::Error) -> TestbedError {
    let program = command.program().unwrap_or_default();
    let (message, returncode) = match err.kind() {
        std::io::ErrorKind::NotFound => (format!("File '{}' not found.", program), 127),
        std::io::ErrorKind::PermissionDenied => {
            (format!("File '{}' is not executable.", program), 126)
        }
        _ => (format!("Failed to spawn '{}': {}", program, err), 126),
    };
    TestbedError::run(message, command.to_element(), returncode, None, None)
}

async fn run_interactive(
    command: &Command,
    options: &RunOptions,
) -> Result<CommandOutput, TestbedError> {
    let mut cmd = prepare(command, options)?;
    cmd.stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    let status = cmd.status().await.map_err(|e| spawn_error(command, e))?;

    // Interactive sessions legitimately end with whatever the last command returned
    if !status.success() {
        debug!(returncode = exit_code(status), "interactive session ended");
    }

    Ok(CommandOutput::default())
}

async fn run_captured(
    command: &Command,
    options: &RunOptions,
) -> Result<CommandOutput, TestbedError> {
    let mut cmd = prepare(command, options)?;
    cmd.process_group(0)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| spawn_error(command, e))?;
    let started = Instant::now();

    let stdout_buffer = Arc::new(Mutex::new(String::new()));
    let stderr_buffer = if options.join {
        Arc::clone(&stdout_buffer)
    } else {
        Arc::new(Mutex::new(String::new()))
    };

    let stdout_task = spawn_reader(
        child.stdout.take(),
        "out",
        Arc::clone(&stdout_buffer),
        options.log.clone(),
    );
    let stderr_task = spawn_reader(
        child.stderr.take(),
        if options.join { "out" } else { "err" },
        Arc::clone(&stderr_buffer),
        options.log.clone(),
    );

    let status = match options.timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => Some(status),
            Err(_) => {
                debug!(elapsed = ?started.elapsed(), ?limit, "duration exceeded");
                if let Some(pid) = child.id() {
                    if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                        debug!(%err, "failed to kill the process group");
                    }
                }
                child.wait().await.ok();
                debug!(elapsed = ?started.elapsed(), "kill confirmed");
                None
            }
        },
        None => Some(child.wait().await),
    };

    let returncode = match status {
        Some(Ok(status)) => exit_code(status),
        Some(Err(err)) => {
            return Err(TestbedError::general(format!(
                "Failed to wait for command '{}': {}",
                command, err
            )))
        }
        None => PROCESS_TIMEOUT,
    };

    // Readers finish once every process holding the pipes is gone
    stdout_task.await.ok();
    stderr_task.await.ok();
    trace!(elapsed = ?started.elapsed(), "stream readers done");

    let stdout = stdout_buffer.lock().clone();
    let stderr = if options.join {
        None
    } else {
        Some(stderr_buffer.lock().clone())
    };

    if returncode != 0 {
        return Err(TestbedError::run(
            format!("Command returned '{}'.", returncode),
            command.to_element(),
            returncode,
            Some(stdout),
            stderr,
        ));
    }

    Ok(CommandOutput {
        stdout: Some(stdout),
        stderr,
    })
}

fn spawn_reader<R>(
    stream: Option<R>,
    header: &'static str,
    buffer: Arc<Mutex<String>>,
    log: Option<LineLogger>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(stream) = stream else { return };
        let mut reader = BufReader::new(stream);
        let mut raw = Vec::new();

        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&raw);
                    match log {
                        Some(ref log) => log(header, line.trim_end_matches('\n')),
                        None => trace!(header, line = %line.trim_end_matches('\n')),
                    }
                    buffer.lock().push_str(&line);
                }
                Err(_) => break,
            }
        }
    })
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}
