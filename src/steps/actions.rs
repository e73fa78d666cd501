// Actions - reboot and login phases interleaved between plugins

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use super::StepKind;
use crate::executor::{Environment, ShellScript};
use crate::guest::{ExecuteRequest, Guest};
use crate::output::errors::TestbedError;
use crate::output::TerminalOutput;
use crate::plugins::{Action, Phase, PhaseContext, PhaseData, PluginRegistry};
use crate::result::{ResultOutcome, TestResult};

/// Steps where actions can be placed
const ACTION_STEPS: [StepKind; 3] = [StepKind::Prepare, StepKind::Execute, StepKind::Finish];

pub fn register(registry: &mut PluginRegistry) {
    for step in ACTION_STEPS {
        registry.register(step, "reboot", |data| {
            Ok(Phase::Action(Box::new(Reboot::new(data))))
        });
        registry.register(step, "login", |data| {
            Ok(Phase::Action(Box::new(Login::new(data)?)))
        });
    }
}

/// Reboot every guest
pub struct Reboot {
    data: PhaseData,
    hard: bool,
}

impl Reboot {
    pub fn new(data: PhaseData) -> Self {
        let hard = data.get_bool("hard").unwrap_or(false);
        Reboot { data, hard }
    }
}

#[async_trait]
impl Action for Reboot {
    fn data(&self) -> &PhaseData {
        &self.data
    }

    async fn go(&self, ctx: &mut PhaseContext<'_>) -> Result<(), TestbedError> {
        let kind = if self.hard { "hard" } else { "soft" };
        for guest in ctx.state.guests.clone() {
            ctx.output
                .info("reboot", format!("{} reboot of {}", kind, guest.full_name()), 2);
            if ctx.options.dry {
                continue;
            }
            if !guest.reboot(self.hard, None, None).await? {
                return Err(TestbedError::RebootTimeout {
                    message: "Reboot timed out.".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Open an interactive shell on every guest
///
/// With `when` the shell only opens if some result of the plan has one of
/// the listed outcomes.
pub struct Login {
    data: PhaseData,
    when: Vec<ResultOutcome>,
}

impl Login {
    pub fn new(data: PhaseData) -> Result<Self, TestbedError> {
        let when = parse_outcomes(&data)?;
        Ok(Login { data, when })
    }

    fn command(&self) -> String {
        self.data.get_str("command").unwrap_or("bash").to_string()
    }
}

#[async_trait]
impl Action for Login {
    fn data(&self) -> &PhaseData {
        &self.data
    }

    async fn go(&self, ctx: &mut PhaseContext<'_>) -> Result<(), TestbedError> {
        if !self.when.is_empty()
            && !ctx.state.results.iter().any(|r| self.when.contains(&r.result))
        {
            debug!(phase = %self.data.name(), "no matching result, login skipped");
            return Ok(());
        }
        let command = self.command();
        for guest in ctx.state.guests.clone() {
            ctx.output.info("login", format!("Starting interactive shell on {}", guest.full_name()), 2);
            if ctx.options.dry {
                continue;
            }
            let request = ExecuteRequest::new(ShellScript::new(command.as_str())).with_interactive(true);
            guest.execute(request).await?;
            ctx.output.info("login", "Interactive shell finished", 2);
        }
        Ok(())
    }
}

/// Login into the guest after each executed test
///
/// Built from execute login phases with `test: true`, handed over to the
/// executor instead of running at the phase position.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginHook {
    pub command: String,
    pub when: Vec<ResultOutcome>,
}

impl LoginHook {
    pub fn from_data(data: &PhaseData) -> Result<Option<Self>, TestbedError> {
        if data.how != "login" || !data.get_bool("test").unwrap_or(false) {
            return Ok(None);
        }
        Ok(Some(LoginHook {
            command: data.get_str("command").unwrap_or("bash").to_string(),
            when: parse_outcomes(data)?,
        }))
    }

    pub fn matches(&self, result: &TestResult) -> bool {
        self.when.is_empty() || self.when.contains(&result.result)
    }

    /// Shell in the test directory with the test environment
    pub async fn login(
        &self,
        output: &TerminalOutput,
        guest: &dyn Guest,
        result: &TestResult,
        cwd: &Path,
        env: Environment,
    ) -> Result<(), TestbedError> {
        if !self.matches(result) {
            return Ok(());
        }
        output.info("login", format!("Starting interactive shell after {}", result.name), 2);
        let request = ExecuteRequest::new(ShellScript::new(self.command.as_str()))
            .with_cwd(cwd)
            .with_env(env)
            .with_interactive(true);
        guest.execute(request).await?;
        output.info("login", "Interactive shell finished", 2);
        Ok(())
    }
}

/// Split per-test login hooks off the phases of the execute step
pub fn split_login_hooks(
    data: Vec<PhaseData>,
) -> Result<(Vec<PhaseData>, Vec<LoginHook>), TestbedError> {
    let mut phases = Vec::with_capacity(data.len());
    let mut hooks = Vec::new();
    for phase in data {
        match LoginHook::from_data(&phase)? {
            Some(hook) => hooks.push(hook),
            None => phases.push(phase),
        }
    }
    Ok((phases, hooks))
}

fn parse_outcomes(data: &PhaseData) -> Result<Vec<ResultOutcome>, TestbedError> {
    data.get_strings("when")
        .iter()
        .map(|value| {
            value.parse::<ResultOutcome>().map_err(|_| {
                TestbedError::specification(format!(
                    "Invalid outcome '{}' in 'when' of phase '{}'.",
                    value,
                    data.name()
                ))
            })
        })
        .collect()
}
