// Prepare step - get guests ready for testing

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::StepKind;
use crate::executor::{Command, ShellScript};
use crate::guest::{ExecuteRequest, Guest, Transfer};
use crate::output::errors::TestbedError;
use crate::output::TerminalOutput;
use crate::plugins::{
    Phase, PhaseContext, PhaseData, Plugin, PluginRegistry, PLUGIN_ORDER_RECOMMENDS,
    PLUGIN_ORDER_REQUIRES,
};
use crate::tree::Test;

pub fn register(registry: &mut PluginRegistry) {
    registry.register(StepKind::Prepare, "shell", |data| {
        Ok(Phase::Plugin(Box::new(PrepareShell::new(data))))
    });
    registry.register(StepKind::Prepare, "install", |data| {
        Ok(Phase::Plugin(Box::new(PrepareInstall::new(data)?)))
    });
}

/// Run shell scripts on every guest
pub struct PrepareShell {
    data: PhaseData,
    scripts: Vec<String>,
}

impl PrepareShell {
    pub fn new(data: PhaseData) -> Self {
        let scripts = data.get_strings("script");
        PrepareShell { data, scripts }
    }
}

#[async_trait]
impl Plugin for PrepareShell {
    fn data(&self) -> &PhaseData {
        &self.data
    }

    async fn go(&mut self, ctx: &mut PhaseContext<'_>) -> Result<(), TestbedError> {
        let guests = ctx.state.guests.clone();
        for guest in &guests {
            if guests.len() > 1 {
                ctx.output.info("guest", guest.full_name(), 2);
            }
            for script in &self.scripts {
                ctx.output.verbose("script", script, 1, 2);
                let request = ExecuteRequest::new(ShellScript::new(script.as_str()))
                    .with_log(ctx.output.command_logger(3));
                guest.execute(request).await?;
            }
        }
        Ok(())
    }
}

/// What to do when a package can't be installed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    Fail,
    Skip,
}

/// Install packages with the guest package manager
pub struct PrepareInstall {
    data: PhaseData,
    packages: Vec<String>,
    missing: Missing,
}

impl PrepareInstall {
    pub fn new(data: PhaseData) -> Result<Self, TestbedError> {
        let missing = match data.get_str("missing") {
            None | Some("fail") => Missing::Fail,
            Some("skip") => Missing::Skip,
            Some(other) => {
                return Err(TestbedError::specification(format!(
                    "Invalid value '{}' of 'missing' in phase '{}', use 'fail' or 'skip'.",
                    other,
                    data.name()
                )))
            }
        };
        let packages = data.get_strings("package");
        Ok(PrepareInstall {
            data,
            packages,
            missing,
        })
    }

    async fn package_manager(&self, guest: &dyn Guest) -> Result<&'static str, TestbedError> {
        let request = ExecuteRequest::new(Command::new(["dnf", "--version"])).with_silent(true);
        match guest.execute(request).await {
            Ok(_) => Ok("dnf"),
            Err(err) if err.is_run() => Ok("yum"),
            Err(err) => Err(err),
        }
    }

    fn install_command(&self, manager: &str) -> Command {
        let mut command = Command::new(["sudo", manager, "install", "-y"]);
        if self.missing == Missing::Skip {
            command = command.arg("--skip-broken");
        }
        command.args(&self.packages)
    }
}

#[async_trait]
impl Plugin for PrepareInstall {
    fn data(&self) -> &PhaseData {
        &self.data
    }

    async fn go(&mut self, ctx: &mut PhaseContext<'_>) -> Result<(), TestbedError> {
        if self.packages.is_empty() {
            return Ok(());
        }
        ctx.output.info("package", self.packages.join(", "), 2);

        let guests = ctx.state.guests.clone();
        for guest in &guests {
            let manager = self.package_manager(guest.as_ref()).await?;
            let request = ExecuteRequest::new(self.install_command(manager))
                .with_log(ctx.output.command_logger(3));
            match guest.execute(request).await {
                Ok(_) => {}
                Err(err) if err.is_run() && self.missing == Missing::Skip => {
                    ctx.output.warn(
                        format!("Unable to install some packages on '{}', skipping.", guest.full_name()),
                        2,
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// Install phases for the packages discovered tests require or recommend
pub fn requirement_phases(tests: &[Test]) -> Vec<PhaseData> {
    let collect = |select: fn(&Test) -> &Vec<String>| {
        let mut packages: Vec<String> = Vec::new();
        for package in tests.iter().flat_map(select) {
            if !packages.contains(package) {
                packages.push(package.clone());
            }
        }
        packages
    };

    let mut phases = Vec::new();
    let required = collect(|test| &test.require);
    if !required.is_empty() {
        phases.push(
            PhaseData::new("install")
                .with_name("requires")
                .with_order(PLUGIN_ORDER_REQUIRES)
                .with_key("package", required),
        );
    }
    let recommended = collect(|test| &test.recommend);
    if !recommended.is_empty() {
        phases.push(
            PhaseData::new("install")
                .with_name("recommends")
                .with_order(PLUGIN_ORDER_RECOMMENDS)
                .with_key("package", recommended)
                .with_key("missing", "skip"),
        );
    }
    phases
}

/// Sync the plan workdir to every remote guest
pub async fn push_workdir(
    output: &TerminalOutput,
    guests: &[Arc<dyn Guest>],
) -> Result<(), TestbedError> {
    for guest in guests.iter().filter(|guest| !guest.is_localhost()) {
        debug!(guest = %guest.full_name(), "pushing workdir");
        output.verbose("push", format!("workdir to {}", guest.full_name()), 2, 2);
        guest.push(Transfer::new()).await?;
    }
    Ok(())
}
