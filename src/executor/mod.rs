// Executor module - running commands locally

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::output::errors::TestbedError;

pub mod command;
pub mod wait;

pub use command::{
    run, shell_quote, Command, CommandOutput, Executable, RunOptions, ShellScript, DEFAULT_SHELL,
    PROCESS_TIMEOUT, SHELL_OPTIONS,
};
pub use wait::wait;

/// Environment variables, ordered for stable output
pub type Environment = BTreeMap<String, String>;

/// Receives each output line with its stream header (`out`, `err` or `cmd`)
pub type LineLogger = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Runs local commands on behalf of guests and plugins
///
/// Production code uses [`SystemRunner`]; tests substitute scripted fakes.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        command: &Command,
        options: &RunOptions,
    ) -> Result<CommandOutput, TestbedError>;
}

/// Spawns real subprocesses
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        command: &Command,
        options: &RunOptions,
    ) -> Result<CommandOutput, TestbedError> {
        command::run(command, options).await
    }
}
