// SSH guest: persistent master connection, rsync transfers and reboots

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{Pid, Uid};
use parking_lot::Mutex;
use regex::Regex;
use tokio::process::Child;
use tracing::{debug, trace};

use super::{
    export_environment, random_suffix, ExecuteRequest, Guest, GuestContext, GuestRecord,
    GuestSshData, Transfer, CONNECTION_TIMEOUT, DEFAULT_PULL_OPTIONS, DEFAULT_PUSH_OPTIONS,
    RECONNECT_WAIT_TICK,
};
use crate::executor::wait::{DEFAULT_TICK, DEFAULT_TICK_INCREASE};
use crate::executor::{
    shell_quote, wait, Command, CommandOutput, Executable, RunOptions, ShellScript,
};
use crate::output::errors::TestbedError;

/// Grace period for the master connection to exit
const MASTER_STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// ssh exits with this code when the connection drops
const SSH_CONNECTION_CLOSED: i32 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RsyncCheck {
    AlreadyInstalled,
    Installed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Push,
    Pull,
}

pub struct GuestSsh {
    name: String,
    data: GuestSshData,
    context: GuestContext,
    /// Share one master connection between all commands
    multiplex: bool,
    /// Overrides the reboot and reconnect polling tick
    wait_tick: Option<f64>,
    master: Mutex<Option<Child>>,
    socket: Mutex<Option<PathBuf>>,
}

impl GuestSsh {
    pub fn new(name: impl Into<String>, data: GuestSshData, context: GuestContext) -> Self {
        GuestSsh {
            name: name.into(),
            data,
            context,
            multiplex: true,
            wait_tick: None,
            master: Mutex::new(None),
            socket: Mutex::new(None),
        }
    }

    pub fn with_multiplexing(mut self, multiplex: bool) -> Self {
        self.multiplex = multiplex;
        self
    }

    pub fn with_wait_tick(mut self, tick: f64) -> Self {
        self.wait_tick = Some(tick);
        self
    }

    pub fn data(&self) -> &GuestSshData {
        &self.data
    }

    /// `user@guest`
    fn ssh_guest(&self) -> String {
        format!(
            "{}@{}",
            self.data.user,
            self.data.guest.as_deref().unwrap_or_default()
        )
    }

    fn ensure_available(&self) -> Result<(), TestbedError> {
        if self.data.guest.is_none() && !self.context.options.dry {
            return Err(TestbedError::general("The guest is not available."));
        }
        Ok(())
    }

    /// Path of the master connection socket, chosen once per guest
    fn socket_path(&self) -> Result<PathBuf, TestbedError> {
        let mut socket = self.socket.lock();
        if let Some(ref path) = *socket {
            return Ok(path.clone());
        }

        let run_dir = PathBuf::from(format!("/run/user/{}", Uid::current()));
        let socket_dir = if run_dir.is_dir() {
            run_dir.join("testbed")
        } else {
            std::env::temp_dir()
        };
        std::fs::create_dir_all(&socket_dir).map_err(|e| {
            TestbedError::file(
                format!("Failed to create socket directory: {}", e),
                &socket_dir,
            )
        })?;

        let safe_name: String = self
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        let path = socket_dir.join(format!("{}-{}.socket", safe_name, random_suffix(8)));
        *socket = Some(path.clone());
        Ok(path)
    }

    fn ssh_options(&self) -> Result<Vec<String>, TestbedError> {
        let mut options: Vec<String> = [
            "-oForwardX11=no",
            "-oStrictHostKeyChecking=no",
            "-oUserKnownHostsFile=/dev/null",
            "-oServerAliveInterval=60",
            "-oServerAliveCountMax=5",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        // Skip identities offered by ssh-agent
        if !self.data.key.is_empty() || self.data.password.is_some() {
            options.push("-oIdentitiesOnly=yes".to_string());
        }
        if let Some(port) = self.data.port {
            options.push(format!("-p{}", port));
        }
        for key in &self.data.key {
            options.push("-i".to_string());
            options.push(key.display().to_string());
        }
        if self.data.password.is_some() {
            options.push("-oPasswordAuthentication=yes".to_string());
        }
        if self.multiplex {
            options.push(format!("-S{}", self.socket_path()?.display()));
        }
        options.extend(self.data.ssh_option.iter().map(|o| format!("-o{}", o)));

        Ok(options)
    }

    /// `ssh` with all options, creating the master connection on first use
    fn ssh_command(&self) -> Result<Command, TestbedError> {
        let base = match self.data.password {
            Some(ref password) => Command::new(["sshpass", "-p", password.as_str(), "ssh"]),
            None => Command::new(["ssh"]),
        };
        let command = base.args(self.ssh_options()?);

        if self.multiplex && !self.context.options.dry {
            self.ensure_master(&command);
        }

        Ok(command)
    }

    /// Start the master connection, again if the previous one exited
    fn ensure_master(&self, ssh: &Command) {
        let mut master = self.master.lock();
        if let Some(child) = master.as_mut() {
            match child.try_wait() {
                Ok(None) => return,
                Ok(Some(status)) => {
                    debug!(guest = %self.name, %status, "master connection exited, starting a new one");
                    self.remove_socket();
                }
                Err(err) => {
                    debug!(guest = %self.name, %err, "failed to check the master connection");
                    return;
                }
            }
        }
        *master = None;

        let command = ssh.clone().arg("-MNnT").arg(self.ssh_guest());
        debug!(guest = %self.name, command = %command, "create the master ssh connection");

        let Some(program) = command.program() else {
            return;
        };
        let spawned = tokio::process::Command::new(program)
            .args(&command.elements()[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(child) => *master = Some(child),
            // Plain connections still work without the master
            Err(err) => debug!(guest = %self.name, %err, "failed to start the master connection"),
        }
    }

    /// Stale sockets keep a new master from listening
    fn remove_socket(&self) {
        let socket = self.socket.lock().clone();
        if let Some(socket) = socket {
            if socket.exists() {
                debug!(socket = %socket.display(), "remove ssh socket");
                if let Err(err) = std::fs::remove_file(&socket) {
                    debug!(%err, "failed to remove the socket");
                }
            }
        }
    }

    async fn run_local(
        &self,
        command: &Command,
        options: RunOptions,
    ) -> Result<CommandOutput, TestbedError> {
        self.context
            .runner
            .run(command, &options.with_dry(self.context.options.dry))
            .await
    }

    async fn rsync(&self, direction: Direction, transfer: &Transfer) -> Result<(), TestbedError> {
        let defaults = match direction {
            Direction::Push => DEFAULT_PUSH_OPTIONS,
            Direction::Pull => DEFAULT_PULL_OPTIONS,
        };
        let source = transfer
            .source
            .clone()
            .unwrap_or_else(|| self.context.plan_workdir.clone());
        let destination = transfer
            .destination
            .clone()
            .unwrap_or_else(|| PathBuf::from("/"));

        let (from, to) = match direction {
            Direction::Push => (
                source.display().to_string(),
                format!("{}:{}", self.ssh_guest(), destination.display()),
            ),
            Direction::Pull => (
                format!("{}:{}", self.ssh_guest(), source.display()),
                destination.display().to_string(),
            ),
        };

        let command = Command::new(["rsync"])
            .args(transfer.rsync_options(defaults))
            .arg("-e")
            .arg(self.ssh_command()?.to_element())
            .arg(from)
            .arg(to);

        self.run_local(&command, RunOptions::new()).await.map(|_| ())
    }

    /// Transfer with one retry after making sure rsync is on the guest
    async fn transfer(&self, direction: Direction, transfer: Transfer) -> Result<(), TestbedError> {
        self.ensure_available()?;

        match (direction, transfer.source.as_ref()) {
            (Direction::Push, None) => debug!(guest = %self.name, "push workdir to guest"),
            (Direction::Pull, None) => debug!(guest = %self.name, "pull workdir from guest"),
            (_, Some(source)) => debug!(guest = %self.name, source = %source.display(), ?direction, "copy"),
        }

        let first = match self.rsync(direction, &transfer).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_run() => err,
            Err(err) => return Err(err),
        };

        let retried = match self.check_rsync().await {
            Ok(RsyncCheck::AlreadyInstalled) => Err(first),
            Ok(RsyncCheck::Installed) => self.rsync(direction, &transfer).await,
            Err(err) => Err(err),
        };

        retried.map_err(|err| match err {
            TestbedError::Run(mut run_error) => {
                let action = match direction {
                    Direction::Push => "push workdir to",
                    Direction::Pull => "pull workdir from",
                };
                run_error.message = format!(
                    "Failed to {} the guest. This usually means that login as '{}' to the guest does not work.",
                    action, self.data.user
                );
                TestbedError::Run(run_error)
            }
            other => other,
        })
    }

    /// Make sure rsync is installed on the guest
    ///
    /// Read-only distros get it installed under `/root/pkg`.
    async fn check_rsync(&self) -> Result<RsyncCheck, TestbedError> {
        debug!(guest = %self.name, "ensure that rsync is installed on the guest");
        if self.is_available(&["rsync", "--version"]).await? {
            return Ok(RsyncCheck::AlreadyInstalled);
        }

        let package_manager = if self.is_available(&["dnf", "--version"]).await? {
            "dnf"
        } else {
            "yum"
        };

        let readonly = if self.is_available(&["rpm-ostree", "--version"]).await? {
            " --installroot=/root/pkg --releasever / && ln -sf /root/pkg/bin/rsync /usr/local/bin/rsync"
        } else {
            ""
        };

        let script = ShellScript::new(format!("{} install -y rsync{}", package_manager, readonly));
        self.execute(ExecuteRequest::new(script)).await?;

        Ok(RsyncCheck::Installed)
    }

    /// Run a command on the guest, `false` if it fails
    async fn is_available(&self, command: &[&str]) -> Result<bool, TestbedError> {
        let request = ExecuteRequest::new(Command::new(command.iter().copied())).with_silent(true);
        match self.execute(request).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_run() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn boot_time(&self) -> Result<u64, TestbedError> {
        let request = ExecuteRequest::new(Command::new(["cat", "/proc/stat"])).with_silent(true);
        let stdout = self.execute(request).await?.stdout.unwrap_or_default();

        let regex = Regex::new(r"btime\s+(\d+)")
            .map_err(|e| TestbedError::general(format!("Invalid pattern: {}", e)))?;
        regex
            .captures(&stdout)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .ok_or_else(|| TestbedError::Provision {
                guest: Some(self.name.clone()),
                message: "Failed to retrieve boot time from guest".to_string(),
            })
    }
}

#[async_trait]
impl Guest for GuestSsh {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> Option<&str> {
        self.data.role.as_deref()
    }

    fn address(&self) -> Option<&str> {
        self.data.guest.as_deref()
    }

    fn save(&self) -> GuestRecord {
        GuestRecord::Ssh(self.data.clone())
    }

    async fn execute(&self, request: ExecuteRequest) -> Result<CommandOutput, TestbedError> {
        self.ensure_available()?;

        let mut ssh = self.ssh_command()?;
        if request.interactive {
            ssh = ssh.arg("-t");
        }
        // A single -t is not enough as ssh itself has no terminal
        if request.test_session {
            ssh = ssh.arg("-tt");
        }

        let environment = self.context.prepare_environment(&request.env);
        let mut remote = ShellScript::from_scripts(&export_environment(&environment));
        if let Some(ref cwd) = request.cwd {
            remote = remote.then(&ShellScript::new(format!(
                "cd {}",
                shell_quote(&cwd.display().to_string())
            )));
        }
        remote = remote.then(&request.executable.to_script());

        trace!(guest = %self.name, remote = %remote, "execute on guest");

        let command = ssh.arg(self.ssh_guest()).arg(remote.as_str());
        let friendly = request
            .friendly_command
            .clone()
            .unwrap_or_else(|| match request.executable {
                Executable::Command(ref command) => command.to_string(),
                Executable::Script(ref script) => script.to_string(),
            });

        let mut options = RunOptions::new()
            .with_join(request.join)
            .with_interactive(request.interactive)
            .with_timeout(request.timeout)
            .with_friendly_command(friendly)
            .with_silent(request.silent);
        options.log = request.log.clone();

        self.run_local(&command, options).await
    }

    async fn push(&self, transfer: Transfer) -> Result<(), TestbedError> {
        self.transfer(Direction::Push, transfer).await
    }

    async fn pull(&self, transfer: Transfer) -> Result<(), TestbedError> {
        self.transfer(Direction::Pull, transfer).await
    }

    async fn stop(&self) -> Result<(), TestbedError> {
        let master = self.master.lock().take();
        if let Some(mut master) = master {
            debug!(guest = %self.name, "close the master ssh connection");
            if let Some(pid) = master.id() {
                if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    debug!(%err, "failed to terminate the master connection");
                }
            }
            if tokio::time::timeout(MASTER_STOP_TIMEOUT, master.wait())
                .await
                .is_err()
            {
                debug!(guest = %self.name, "master connection still running");
            }
        }

        self.remove_socket();
        Ok(())
    }

    async fn remove(&self) -> Result<(), TestbedError> {
        debug!(guest = ?self.data.guest, "doing nothing to remove guest");
        Ok(())
    }

    async fn reboot(
        &self,
        hard: bool,
        command: Option<ShellScript>,
        timeout: Option<Duration>,
    ) -> Result<bool, TestbedError> {
        if hard {
            return Err(TestbedError::Provision {
                guest: Some(self.name.clone()),
                message: "Method does not support hard reboot.".to_string(),
            });
        }

        let command = command.unwrap_or_else(|| ShellScript::new("reboot"));
        debug!(guest = %self.name, command = %command, "reboot");

        let current_boot_time = self.boot_time().await?;

        match self.execute(ExecuteRequest::new(command)).await {
            Ok(_) => {}
            Err(err) if err.returncode() == Some(SSH_CONNECTION_CLOSED) => {
                debug!("seems the connection was closed too fast, ignoring");
            }
            Err(err) => return Err(err),
        }

        let timeout = timeout.unwrap_or(Duration::from_secs(CONNECTION_TIMEOUT));
        let result = wait(
            "boot time change",
            move || async move {
                match self.boot_time().await {
                    Ok(boot_time) if boot_time != current_boot_time => Ok(()),
                    Ok(_) => Err(TestbedError::WaitingIncomplete),
                    Err(err) if err.is_run() => {
                        debug!("failed to connect to the guest");
                        Err(TestbedError::WaitingIncomplete)
                    }
                    Err(err) => Err(err),
                }
            },
            timeout,
            self.wait_tick.unwrap_or(DEFAULT_TICK),
            DEFAULT_TICK_INCREASE,
        )
        .await;

        match result {
            Ok(()) => {
                debug!(guest = %self.name, "boot time changed, reconnecting");
                self.reconnect(Some(timeout)).await
            }
            Err(TestbedError::WaitingTimedOut { .. }) => {
                debug!(guest = %self.name, "connection to guest failed after reboot");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn reconnect(&self, timeout: Option<Duration>) -> Result<bool, TestbedError> {
        debug!(guest = %self.name, "wait for a connection to the guest");
        let timeout = timeout.unwrap_or(Duration::from_secs(CONNECTION_TIMEOUT));

        let result = wait(
            "whoami",
            move || async move {
                let request = ExecuteRequest::new(Command::new(["whoami"])).with_silent(true);
                match self.execute(request).await {
                    Ok(_) => Ok(()),
                    Err(err) if err.is_run() => Err(TestbedError::WaitingIncomplete),
                    Err(err) => Err(err),
                }
            },
            timeout,
            self.wait_tick.unwrap_or(RECONNECT_WAIT_TICK),
            DEFAULT_TICK_INCREASE,
        )
        .await;

        match result {
            Ok(()) => Ok(true),
            Err(TestbedError::WaitingTimedOut { .. }) => {
                debug!(guest = %self.name, "connection to guest failed");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CommandRunner;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    type Responder = Box<dyn Fn(&[String]) -> Result<CommandOutput, TestbedError> + Send + Sync>;

    /// Records commands and answers from a script
    struct FakeRunner {
        calls: Mutex<Vec<Vec<String>>>,
        respond: Responder,
    }

    impl FakeRunner {
        fn new(respond: Responder) -> Arc<Self> {
            Arc::new(FakeRunner {
                calls: Mutex::new(Vec::new()),
                respond,
            })
        }

        /// Local program, or the remote command for ssh invocations
        fn summary(&self) -> Vec<String> {
            self.calls
                .lock()
                .iter()
                .map(|argv| match argv[0].as_str() {
                    "ssh" => format!("ssh: {}", argv.last().cloned().unwrap_or_default()),
                    other => other.to_string(),
                })
                .collect()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(
            &self,
            command: &Command,
            _options: &RunOptions,
        ) -> Result<CommandOutput, TestbedError> {
            self.calls.lock().push(command.elements().to_vec());
            (self.respond)(command.elements())
        }
    }

    fn ok(stdout: &str) -> Result<CommandOutput, TestbedError> {
        Ok(CommandOutput {
            stdout: Some(stdout.to_string()),
            stderr: Some(String::new()),
        })
    }

    fn failed(argv: &[String], returncode: i32) -> Result<CommandOutput, TestbedError> {
        Err(TestbedError::run(
            format!("Command returned '{}'.", returncode),
            argv.join(" "),
            returncode,
            Some(String::new()),
            Some(String::new()),
        ))
    }

    fn guest(runner: Arc<FakeRunner>) -> GuestSsh {
        let data = GuestSshData {
            guest: Some("10.0.0.5".to_string()),
            ..Default::default()
        };
        let context = GuestContext::new("/var/tmp/testbed/run-001/plan", runner);
        GuestSsh::new("server", data, context)
            .with_multiplexing(false)
            .with_wait_tick(0.01)
    }

    #[tokio::test]
    async fn test_push_installs_rsync_and_retries_once() {
        let rsync_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&rsync_calls);
        let runner = FakeRunner::new(Box::new(move |argv| {
            let remote = argv.last().cloned().unwrap_or_default();
            match argv[0].as_str() {
                "rsync" if counter.fetch_add(1, Ordering::SeqCst) == 0 => failed(argv, 12),
                "rsync" => ok(""),
                _ if remote == "rsync --version" => failed(argv, 127),
                _ if remote == "dnf --version" => ok("4.14.0"),
                _ if remote == "rpm-ostree --version" => failed(argv, 127),
                _ => ok(""),
            }
        }));

        guest(Arc::clone(&runner)).push(Transfer::new()).await.unwrap();

        assert_eq!(
            runner.summary(),
            vec![
                "rsync",
                "ssh: rsync --version",
                "ssh: dnf --version",
                "ssh: rpm-ostree --version",
                "ssh: dnf install -y rsync",
                "rsync",
            ]
        );
        assert_eq!(rsync_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_push_readonly_distro_uses_installroot() {
        let rsync_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&rsync_calls);
        let runner = FakeRunner::new(Box::new(move |argv| {
            let remote = argv.last().cloned().unwrap_or_default();
            match argv[0].as_str() {
                "rsync" if counter.fetch_add(1, Ordering::SeqCst) == 0 => failed(argv, 12),
                "rsync" => ok(""),
                _ if remote.ends_with("--version") && remote.starts_with("rpm-ostree") => ok("1"),
                _ if remote.ends_with("--version") => failed(argv, 127),
                _ => ok(""),
            }
        }));

        guest(Arc::clone(&runner)).push(Transfer::new()).await.unwrap();

        let summary = runner.summary();
        assert_eq!(
            summary[4],
            "ssh: yum install -y rsync --installroot=/root/pkg --releasever / && ln -sf /root/pkg/bin/rsync /usr/local/bin/rsync"
        );
    }

    #[tokio::test]
    async fn test_push_with_rsync_present_fails_without_retry() {
        let runner = FakeRunner::new(Box::new(|argv| match argv[0].as_str() {
            "rsync" => failed(argv, 255),
            _ => ok("rsync  version 3.2.7"),
        }));

        let err = guest(Arc::clone(&runner))
            .push(Transfer::new())
            .await
            .unwrap_err();

        assert_eq!(err.returncode(), Some(255));
        assert!(err
            .message()
            .contains("This usually means that login as 'root' to the guest does not work."));
        assert_eq!(runner.summary(), vec!["rsync", "ssh: rsync --version"]);
    }

    #[tokio::test]
    async fn test_rsync_command_shape() {
        let runner = FakeRunner::new(Box::new(|_| ok("")));
        let guest = guest(Arc::clone(&runner));

        guest
            .pull(
                Transfer::from_path("/var/tmp/testbed/run-001/plan/execute/data")
                    .with_extend_options(["--exclude", "backup*"]),
            )
            .await
            .unwrap();

        let calls = runner.calls.lock();
        let argv = &calls[0];
        assert_eq!(argv[0], "rsync");
        assert!(argv.contains(&"--protect-args".to_string()));
        assert!(argv.contains(&"backup*".to_string()));
        let e = argv.iter().position(|a| a == "-e").unwrap();
        assert!(argv[e + 1].starts_with("ssh -oForwardX11=no"));
        assert_eq!(
            argv[argv.len() - 2],
            "root@10.0.0.5:/var/tmp/testbed/run-001/plan/execute/data"
        );
        assert_eq!(argv[argv.len() - 1], "/");
    }

    #[tokio::test]
    async fn test_execute_builds_remote_command() {
        let runner = FakeRunner::new(Box::new(|_| ok("")));
        let data = GuestSshData {
            guest: Some("box".to_string()),
            port: Some(2222),
            user: "fedora".to_string(),
            key: vec![PathBuf::from("/keys/id")],
            ssh_option: vec!["ConnectTimeout=5".to_string()],
            ..Default::default()
        };
        let mut plan_env = crate::executor::Environment::new();
        plan_env.insert("STAGE".into(), "plan".into());
        let context = GuestContext::new("/plan", runner.clone()).with_environment(plan_env);
        let guest = GuestSsh::new("client", data, context).with_multiplexing(false);

        guest
            .execute(
                ExecuteRequest::new(ShellScript::new("./run.sh"))
                    .with_cwd("/plan/tests dir")
                    .with_test_session(true),
            )
            .await
            .unwrap();

        let calls = runner.calls.lock();
        assert_eq!(
            calls[0],
            vec![
                "ssh",
                "-oForwardX11=no",
                "-oStrictHostKeyChecking=no",
                "-oUserKnownHostsFile=/dev/null",
                "-oServerAliveInterval=60",
                "-oServerAliveCountMax=5",
                "-oIdentitiesOnly=yes",
                "-p2222",
                "-i",
                "/keys/id",
                "-oConnectTimeout=5",
                "-tt",
                "fedora@box",
                "export STAGE=plan; cd '/plan/tests dir'; ./run.sh",
            ]
        );
    }

    #[tokio::test]
    async fn test_execute_requires_address() {
        let runner = FakeRunner::new(Box::new(|_| ok("")));
        let context = GuestContext::new("/plan", runner.clone());
        let guest = GuestSsh::new("nowhere", GuestSshData::default(), context);

        let err = guest
            .execute(ExecuteRequest::new(Command::new(["true"])))
            .await
            .unwrap_err();
        assert_eq!(err.message(), "The guest is not available.");
        assert!(runner.calls.lock().is_empty());
        assert!(!guest.is_ready());
    }

    #[tokio::test]
    async fn test_reboot_times_out_when_boot_time_unchanged() {
        let runner = FakeRunner::new(Box::new(|argv| {
            match argv.last().map(String::as_str) {
                Some("cat /proc/stat") => ok("cpu 1 2 3\nbtime 1700000000\n"),
                Some("reboot") => failed(argv, 255),
                _ => ok(""),
            }
        }));

        let rebooted = guest(Arc::clone(&runner))
            .reboot(false, None, Some(Duration::from_millis(100)))
            .await
            .unwrap();

        assert!(!rebooted);
        let summary = runner.summary();
        assert_eq!(summary[0], "ssh: cat /proc/stat");
        assert_eq!(summary[1], "ssh: reboot");
        assert!(summary.len() > 2);
    }

    #[tokio::test]
    async fn test_reboot_detects_new_boot_time() {
        let reads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reads);
        let runner = FakeRunner::new(Box::new(move |argv| {
            match argv.last().map(String::as_str) {
                Some("cat /proc/stat") => match counter.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => ok("btime 100\n"),
                    2 => failed(argv, 255),
                    _ => ok("btime 200\n"),
                },
                _ => ok(""),
            }
        }));

        let rebooted = guest(Arc::clone(&runner))
            .reboot(false, Some(ShellScript::new("systemctl reboot")), Some(Duration::from_secs(5)))
            .await
            .unwrap();

        assert!(rebooted);
        assert_eq!(reads.load(Ordering::SeqCst), 4);
        assert_eq!(runner.summary().last().map(String::as_str), Some("ssh: whoami"));
    }

    #[tokio::test]
    async fn test_hard_reboot_unsupported() {
        let runner = FakeRunner::new(Box::new(|_| ok("")));
        let err = guest(runner).reboot(true, None, None).await.unwrap_err();
        assert!(matches!(err, TestbedError::Provision { .. }));
    }

    #[tokio::test]
    async fn test_reconnect_polls_whoami() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let runner = FakeRunner::new(Box::new(move |argv| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                failed(argv, 255)
            } else {
                ok("root\n")
            }
        }));

        assert!(guest(runner).reconnect(Some(Duration::from_secs(5))).await.unwrap());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_master_restarted_after_exit() {
        let runner = FakeRunner::new(Box::new(|_| ok("")));
        let guest = guest(runner);

        // Stays up until dropped
        guest.ensure_master(&Command::new(["sh", "-c", "sleep 30"]));
        let running = guest.master.lock().as_ref().and_then(Child::id);
        assert!(running.is_some());
        guest.ensure_master(&Command::new(["sh", "-c", "sleep 30"]));
        assert_eq!(guest.master.lock().as_ref().and_then(Child::id), running);

        // Replace it with one which exits right away
        *guest.master.lock() = None;
        guest.ensure_master(&Command::new(["true"]));
        let exited = guest.master.lock().as_ref().and_then(Child::id);
        loop {
            let done = guest.master.lock().as_mut().unwrap().try_wait().unwrap();
            if done.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        guest.ensure_master(&Command::new(["sh", "-c", "sleep 30"]));
        let restarted = guest.master.lock().as_ref().and_then(Child::id);
        assert!(restarted.is_some());
        assert_ne!(restarted, exited);
    }

    #[tokio::test]
    async fn test_stop_removes_socket() {
        let runner = FakeRunner::new(Box::new(|_| ok("")));
        let data = GuestSshData {
            guest: Some("box".to_string()),
            ..Default::default()
        };
        let mut options = crate::config::Options::default();
        options.dry = true;
        let context = GuestContext::new("/plan", runner).with_options(options);
        let guest = GuestSsh::new("client", data, context);

        let ssh = guest.ssh_command().unwrap();
        let socket = guest.socket.lock().clone().unwrap();
        assert!(ssh.elements().contains(&format!("-S{}", socket.display())));
        std::fs::write(&socket, "").unwrap();

        guest.stop().await.unwrap();
        assert!(!socket.exists());
    }
}
