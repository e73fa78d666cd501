// Local guest: commands run directly on the runner

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{ExecuteRequest, Guest, GuestContext, GuestData, GuestRecord, Transfer};
use crate::executor::{CommandOutput, Executable, RunOptions, ShellScript};
use crate::output::errors::TestbedError;

pub struct GuestLocal {
    name: String,
    data: GuestData,
    context: GuestContext,
}

impl GuestLocal {
    pub fn new(name: impl Into<String>, data: GuestData, context: GuestContext) -> Self {
        let mut data = data;
        if data.guest.is_none() {
            data.guest = Some("localhost".to_string());
        }
        GuestLocal {
            name: name.into(),
            data,
            context,
        }
    }
}

#[async_trait]
impl Guest for GuestLocal {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> Option<&str> {
        self.data.role.as_deref()
    }

    fn address(&self) -> Option<&str> {
        self.data.guest.as_deref()
    }

    fn is_localhost(&self) -> bool {
        true
    }

    fn save(&self) -> GuestRecord {
        GuestRecord::Local(self.data.clone())
    }

    async fn execute(&self, request: ExecuteRequest) -> Result<CommandOutput, TestbedError> {
        let command = match request.executable {
            Executable::Command(ref command) => command.clone(),
            Executable::Script(ref script) => script.to_shell_command(),
        };
        let friendly = request
            .friendly_command
            .clone()
            .unwrap_or_else(|| request.executable.to_string());

        debug!(guest = %self.name, command = %friendly, "execute locally");

        let mut options = RunOptions::new()
            .with_env(self.context.prepare_environment(&request.env))
            .with_join(request.join)
            .with_interactive(request.interactive)
            .with_timeout(request.timeout)
            .with_dry(self.context.options.dry)
            .with_friendly_command(friendly)
            .with_silent(request.silent)
            .with_cwd(
                request
                    .cwd
                    .clone()
                    .unwrap_or_else(|| self.context.plan_workdir.clone()),
            );
        options.log = request.log.clone();

        self.context.runner.run(&command, &options).await
    }

    async fn push(&self, _transfer: Transfer) -> Result<(), TestbedError> {
        // Same filesystem, nothing to sync
        Ok(())
    }

    async fn pull(&self, _transfer: Transfer) -> Result<(), TestbedError> {
        Ok(())
    }

    async fn reboot(
        &self,
        _hard: bool,
        _command: Option<ShellScript>,
        _timeout: Option<Duration>,
    ) -> Result<bool, TestbedError> {
        Err(TestbedError::Provision {
            guest: Some(self.name.clone()),
            message: "Plugin 'local' does not support reboot.".to_string(),
        })
    }
}
