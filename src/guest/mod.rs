// Guest module - execution targets for tests

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use tracing::debug;

use crate::config::Options;
use crate::executor::{
    shell_quote, Command, CommandOutput, CommandRunner, Environment, Executable, LineLogger,
    ShellScript,
};
use crate::output::errors::TestbedError;

pub mod data;
pub mod local;
pub mod ssh;

pub use data::{GuestData, GuestRecord, GuestSshData};
pub use local::GuestLocal;
pub use ssh::GuestSsh;

/// How long to wait for a guest to come back, in seconds
pub const CONNECTION_TIMEOUT: u64 = 5 * 60;

/// Pause between reconnection attempts, in seconds
pub const RECONNECT_WAIT_TICK: f64 = 5.0;

/// Default rsync options for pushing the workdir to a guest
pub const DEFAULT_PUSH_OPTIONS: &[&str] = &[
    "-s", "-R", "-r", "-z", "--links", "--safe-links", "--delete",
];

/// Default rsync options for pulling the workdir from a guest
pub const DEFAULT_PULL_OPTIONS: &[&str] = &[
    "-s", "-R", "-r", "-z", "--links", "--safe-links", "--protect-args",
];

/// Runtime context shared by the guests of one plan
#[derive(Clone)]
pub struct GuestContext {
    /// Synced to the same path on remote guests
    pub plan_workdir: PathBuf,
    /// Plan environment, overrides the environment given to `execute()`
    pub environment: Environment,
    pub options: Options,
    pub runner: Arc<dyn CommandRunner>,
}

impl GuestContext {
    pub fn new(plan_workdir: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        GuestContext {
            plan_workdir: plan_workdir.into(),
            environment: Environment::new(),
            options: Options::default(),
            runner,
        }
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Execute-time environment with the plan environment applied on top
    pub fn prepare_environment(&self, env: &Environment) -> Environment {
        let mut environment = env.clone();
        environment.extend(self.environment.clone());
        environment
    }
}

/// A command to run on a guest
#[derive(Clone)]
pub struct ExecuteRequest {
    pub executable: Executable,
    /// Directory on the guest
    pub cwd: Option<PathBuf>,
    pub env: Environment,
    pub interactive: bool,
    /// Force a pseudo-terminal so remote processes die with the session
    pub test_session: bool,
    pub join: bool,
    pub timeout: Option<Duration>,
    pub log: Option<LineLogger>,
    pub friendly_command: Option<String>,
    pub silent: bool,
}

impl ExecuteRequest {
    pub fn new(executable: impl Into<Executable>) -> Self {
        ExecuteRequest {
            executable: executable.into(),
            cwd: None,
            env: Environment::new(),
            interactive: false,
            test_session: false,
            join: false,
            timeout: None,
            log: None,
            friendly_command: None,
            silent: false,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    pub fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn with_test_session(mut self, test_session: bool) -> Self {
        self.test_session = test_session;
        self
    }

    pub fn with_join(mut self, join: bool) -> Self {
        self.join = join;
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

    pub fn with_friendly_command(mut self, friendly: impl Into<String>) -> Self {
        self.friendly_command = Some(friendly.into());
        self
    }

    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }
}

/// A file transfer between the runner and a guest
///
/// Source and destination default to the plan workdir, options to the
/// default rsync option set of the direction.
#[derive(Debug, Clone, Default)]
pub struct Transfer {
    pub source: Option<PathBuf>,
    pub destination: Option<PathBuf>,
    pub options: Option<Vec<String>>,
    pub extend_options: Vec<String>,
}

impl Transfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_path(source: impl Into<PathBuf>) -> Self {
        Transfer {
            source: Some(source.into()),
            ..Default::default()
        }
    }

    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = Some(options.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_extend_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extend_options
            .extend(options.into_iter().map(Into::into));
        self
    }

    /// Options to pass to rsync given the direction defaults
    pub fn rsync_options(&self, defaults: &[&str]) -> Vec<String> {
        let mut options = self
            .options
            .clone()
            .unwrap_or_else(|| defaults.iter().map(|s| s.to_string()).collect());
        options.extend(self.extend_options.iter().cloned());
        options
    }
}

/// Distro and kernel of a guest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestFacts {
    pub distro: Option<String>,
    pub kernel: Option<String>,
}

/// An execution target: the local machine or a remote host
#[async_trait]
pub trait Guest: Send + Sync {
    /// Stable identifier, usually the provision phase name
    fn name(&self) -> &str;

    fn role(&self) -> Option<&str>;

    /// Hostname or address, `None` until provisioned
    fn address(&self) -> Option<&str>;

    fn full_name(&self) -> String {
        match self.role() {
            Some(role) => format!("{} ({})", self.name(), role),
            None => self.name().to_string(),
        }
    }

    /// Commands run on the runner itself, no transfers needed
    fn is_localhost(&self) -> bool {
        false
    }

    fn is_ready(&self) -> bool {
        self.address().is_some()
    }

    /// Serializable record the guest can be woken up from
    fn save(&self) -> GuestRecord;

    /// Attach runtime state to a guest loaded from a saved record
    async fn wake(&self) -> Result<(), TestbedError> {
        Ok(())
    }

    async fn start(&self) -> Result<(), TestbedError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), TestbedError> {
        Ok(())
    }

    async fn remove(&self) -> Result<(), TestbedError> {
        Ok(())
    }

    async fn execute(&self, request: ExecuteRequest) -> Result<CommandOutput, TestbedError>;

    async fn push(&self, transfer: Transfer) -> Result<(), TestbedError>;

    async fn pull(&self, transfer: Transfer) -> Result<(), TestbedError>;

    /// Reboot the guest, `Ok(false)` when it did not come back in time
    async fn reboot(
        &self,
        hard: bool,
        command: Option<ShellScript>,
        timeout: Option<Duration>,
    ) -> Result<bool, TestbedError>;

    /// Wait until the guest responds again
    async fn reconnect(&self, timeout: Option<Duration>) -> Result<bool, TestbedError> {
        let _ = timeout;
        Ok(true)
    }

    /// Detect distro and kernel
    async fn details(&self) -> Result<GuestFacts, TestbedError> {
        gather_facts(self).await
    }
}

/// Build a guest from its saved record
pub fn from_record(name: &str, record: GuestRecord, context: GuestContext) -> Arc<dyn Guest> {
    match record {
        GuestRecord::Local(data) => Arc::new(GuestLocal::new(name, data, context)),
        GuestRecord::Ssh(data) => Arc::new(GuestSsh::new(name, data, context)),
    }
}

const DISTRO_SOURCES: &[(&str, &str)] = &[
    ("/etc/os-release", r#"PRETTY_NAME="(.*)""#),
    ("/etc/lsb-release", r#"DISTRIB_DESCRIPTION="(.*)""#),
    ("/etc/redhat-release", r"(.+)"),
];

async fn gather_facts<G: Guest + ?Sized>(guest: &G) -> Result<GuestFacts, TestbedError> {
    let mut facts = GuestFacts::default();

    for (file, pattern) in DISTRO_SOURCES {
        let request = ExecuteRequest::new(Command::new(["cat", file])).with_silent(true);
        let output = match guest.execute(request).await {
            Ok(output) => output.stdout.unwrap_or_default(),
            Err(err) if err.is_run() => continue,
            Err(err) => return Err(err),
        };

        // Cloud images greet unsupported users instead of running the command
        if output.contains("Please login as the user") {
            return Err(TestbedError::general(format!(
                "Login to the guest failed.\n{}",
                output.trim()
            )));
        }

        let regex = Regex::new(pattern)
            .map_err(|e| TestbedError::general(format!("Invalid pattern: {}", e)))?;
        if let Some(captures) = regex.captures(&output) {
            facts.distro = captures.get(1).map(|m| m.as_str().trim().to_string());
            break;
        }
    }

    let request = ExecuteRequest::new(Command::new(["uname", "-r"])).with_silent(true);
    match guest.execute(request).await {
        Ok(output) => {
            facts.kernel = output
                .stdout
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
        }
        Err(err) if err.is_run() => debug!(guest = guest.name(), "unable to detect kernel"),
        Err(err) => return Err(err),
    }

    Ok(facts)
}

/// Render an environment as `export` statements
pub fn export_environment(environment: &Environment) -> Vec<ShellScript> {
    environment
        .iter()
        .map(|(key, value)| ShellScript::new(format!("export {}={}", key, shell_quote(value))))
        .collect()
}

/// Random alphanumeric suffix for unique names
pub fn random_suffix(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SystemRunner;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_prepare_environment_plan_wins() {
        let mut plan_env = Environment::new();
        plan_env.insert("STAGE".into(), "plan".into());
        let context = GuestContext::new("/tmp/plan", Arc::new(SystemRunner))
            .with_environment(plan_env);

        let mut env = Environment::new();
        env.insert("STAGE".into(), "test".into());
        env.insert("OTHER".into(), "x".into());

        let merged = context.prepare_environment(&env);
        assert_eq!(merged.get("STAGE").map(String::as_str), Some("plan"));
        assert_eq!(merged.get("OTHER").map(String::as_str), Some("x"));
    }

    #[test]
    fn test_export_environment() {
        let mut env = Environment::new();
        env.insert("A".into(), "1".into());
        env.insert("B".into(), "two words".into());

        let exports: Vec<String> = export_environment(&env)
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(exports, vec!["export A=1", "export B='two words'"]);
    }

    #[test]
    fn test_transfer_options() {
        let transfer = Transfer::new().with_extend_options(["--exclude", "/x/backup*"]);
        let options = transfer.rsync_options(DEFAULT_PULL_OPTIONS);
        assert_eq!(options.first().map(String::as_str), Some("-s"));
        assert_eq!(options.last().map(String::as_str), Some("/x/backup*"));

        let custom = Transfer::new().with_options(["-s", "-p"]);
        assert_eq!(custom.rsync_options(DEFAULT_PUSH_OPTIONS), vec!["-s", "-p"]);
    }

    #[test]
    fn test_random_suffix() {
        let suffix = random_suffix(8);
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(suffix, random_suffix(8));
    }
}
