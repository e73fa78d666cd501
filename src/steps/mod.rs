// Steps - the six stages every plan goes through
//
// A step wakes up from its persisted state, runs its phases in ascending
// order and records the outcome in `step.yaml` so a later invocation with
// the same workdir can resume.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{resolve, OptionLayer, Options};
use crate::executor::CommandRunner;
use crate::guest::GuestContext;
use crate::output::errors::TestbedError;
use crate::output::TerminalOutput;
use crate::plugins::{Phase, PhaseContext, PhaseData, PlanInfo, PlanState, PluginRegistry};

pub mod actions;
pub mod discover;
pub mod execute;
pub mod finish;
pub mod prepare;
pub mod provision;
pub mod report;

/// Name of the file holding the step status and phase data
pub const STEP_FILENAME: &str = "step.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Discover,
    Provision,
    Prepare,
    Execute,
    Report,
    Finish,
}

impl StepKind {
    /// All steps in execution order
    pub const ALL: [StepKind; 6] = [
        StepKind::Discover,
        StepKind::Provision,
        StepKind::Prepare,
        StepKind::Execute,
        StepKind::Report,
        StepKind::Finish,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Discover => "discover",
            StepKind::Provision => "provision",
            StepKind::Prepare => "prepare",
            StepKind::Execute => "execute",
            StepKind::Report => "report",
            StepKind::Finish => "finish",
        }
    }

    /// Method used for phases without an explicit `how`
    pub fn default_how(&self) -> &'static str {
        match self {
            StepKind::Discover => "fmf",
            StepKind::Provision => "local",
            StepKind::Prepare => "shell",
            StepKind::Execute => "internal",
            StepKind::Report => "display",
            StepKind::Finish => "shell",
        }
    }

    pub fn index(&self) -> usize {
        StepKind::ALL
            .iter()
            .position(|kind| kind == self)
            .unwrap_or_default()
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s.trim().to_lowercase())
            .ok_or_else(|| format!("unknown step '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Todo,
    Done,
}

#[derive(Debug, Serialize, Deserialize)]
struct StepFile {
    status: StepStatus,
    #[serde(default)]
    data: Vec<PhaseData>,
}

/// What a step needs from its plan and run
pub struct StepEnv<'a> {
    pub plan: &'a PlanInfo,
    /// Options given to the whole run
    pub layer: &'a OptionLayer,
    pub output: Arc<TerminalOutput>,
    pub runner: Arc<dyn CommandRunner>,
    pub registry: &'a PluginRegistry,
}

impl StepEnv<'_> {
    pub fn options(&self) -> Options {
        resolve(&[self.layer])
    }

    pub fn guest_context(&self) -> GuestContext {
        GuestContext::new(&self.plan.workdir, Arc::clone(&self.runner))
            .with_environment(self.plan.environment.clone())
            .with_options(self.options())
    }
}

pub struct Step {
    kind: StepKind,
    workdir: PathBuf,
    status: StepStatus,
    data: Vec<PhaseData>,
}

impl Step {
    pub fn new(kind: StepKind, plan_workdir: &Path, raw: Vec<PhaseData>) -> Self {
        Step {
            kind,
            workdir: plan_workdir.join(kind.name()),
            status: StepStatus::Todo,
            data: Self::normalize(kind, raw),
        }
    }

    /// Fill in default `how`, `name` for every phase, one default phase if none
    pub fn normalize(kind: StepKind, raw: Vec<PhaseData>) -> Vec<PhaseData> {
        let raw = if raw.is_empty() {
            vec![PhaseData::new(kind.default_how())]
        } else {
            raw
        };

        raw.into_iter()
            .enumerate()
            .map(|(index, mut data)| {
                if data.how.is_empty() {
                    data.how = kind.default_how().to_string();
                }
                if data.name.is_none() {
                    data.name = Some(format!("default-{}", index));
                }
                data
            })
            .collect()
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn data(&self) -> &[PhaseData] {
        &self.data
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Load persisted status, phase data and step specific state
    pub async fn wake(&mut self, env: &StepEnv<'_>, state: &mut PlanState) -> Result<(), TestbedError> {
        if let Some(file) = read_yaml::<StepFile>(&self.workdir.join(STEP_FILENAME))? {
            debug!(step = %self.kind, status = ?file.status, "step woken up");
            self.status = file.status;
            if !file.data.is_empty() {
                self.data = Self::normalize(self.kind, file.data);
            }
        }

        match self.kind {
            StepKind::Discover => {
                if let Some(tests) = discover::load_tests(&self.workdir)? {
                    state.tests = tests;
                }
            }
            StepKind::Provision => {
                let guests = provision::load_guests(&self.workdir, env.guest_context())?;
                for guest in &guests {
                    guest.wake().await?;
                }
                if !guests.is_empty() {
                    state.guests = guests;
                }
            }
            StepKind::Execute => {
                if let Some(results) = execute::load_results(&self.workdir)? {
                    state.results = results;
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Run all phases, skipped when already done unless forced
    pub async fn go(&mut self, env: &StepEnv<'_>, state: &mut PlanState) -> Result<(), TestbedError> {
        let options = env.options();
        env.output.print_step_header(self.kind.name());

        if self.status == StepStatus::Done && !options.rerun() {
            env.output.info("status", "done", 2);
            env.output.info("summary", self.summary(state), 2);
            return Ok(());
        }

        self.before(env, state)?;
        if self.kind == StepKind::Prepare && !options.dry {
            prepare::push_workdir(&env.output, &state.guests).await?;
        }

        let mut data = self.data.clone();
        if self.kind == StepKind::Prepare {
            data.extend(prepare::requirement_phases(&state.tests));
        }
        if self.kind == StepKind::Provision {
            provision::check_unique_names(&data)?;
        }
        let mut login_hooks = Vec::new();
        if self.kind == StepKind::Execute {
            (data, login_hooks) = actions::split_login_hooks(data)?;
        }

        let mut phases = Vec::with_capacity(data.len());
        for phase_data in data {
            let layer = OptionLayer::from_extra(&phase_data.extra);
            phases.push((env.registry.create(self.kind, phase_data)?, layer));
        }
        // Stable, ties keep the declaration order
        phases.sort_by_key(|(phase, _)| phase.order());

        let multihost = self.kind == StepKind::Provision && phases.len() > 1;

        for (phase, layer) in phases.iter_mut() {
            let options = resolve(&[env.layer, &*layer]);
            let name = phase.name().to_string();
            if multihost {
                env.output.message("", 0);
            }

            let mut ctx = PhaseContext {
                step: self.kind,
                workdir: self.workdir.join(&name),
                options,
                output: Arc::clone(&env.output),
                runner: Arc::clone(&env.runner),
                plan: env.plan,
                state: &mut *state,
                login_hooks: &login_hooks,
            };

            let result = match phase {
                Phase::Action(action) => action.go(&mut ctx).await,
                Phase::Plugin(plugin) => {
                    if multihost {
                        env.output.info("name", &name, 2);
                    }
                    env.output.info("how", plugin.how(), 2);

                    let mut result = plugin.go(&mut ctx).await;
                    if self.kind == StepKind::Provision {
                        result = provision::record_guest(&mut ctx, &**plugin, result).await;
                    }
                    result
                }
            };

            if let Err(err) = result {
                if err.is_exit() {
                    debug!(step = %self.kind, phase = %name, "exit requested, state not saved");
                    return Err(err);
                }
                if matches!(err, TestbedError::Run(_) | TestbedError::Provision { .. }) {
                    env.output.fail(format!("{} failed in phase '{}'", self.kind, name), 2);
                }
                // Keep the status and guests which made it so a resumed run can clean up
                let saved = if matches!(err, TestbedError::Specification { .. }) {
                    if self.kind == StepKind::Provision {
                        provision::save_guests(&self.workdir, &state.guests, options.dry)
                    } else {
                        Ok(())
                    }
                } else {
                    self.save(&env.options(), state)
                };
                if let Err(save_err) = saved {
                    debug!(%save_err, "failed to save step state");
                }
                return Err(err);
            }
        }

        self.after(env, state).await?;

        self.status = StepStatus::Done;
        env.output.info("summary", self.summary(state), 2);
        self.save(&options, state)
    }

    fn before(&self, env: &StepEnv<'_>, state: &mut PlanState) -> Result<(), TestbedError> {
        match self.kind {
            StepKind::Discover => state.tests.clear(),
            StepKind::Provision => state.guests.clear(),
            StepKind::Execute => state.results.clear(),
            _ => {}
        }
        if !env.options().dry {
            std::fs::create_dir_all(&self.workdir).map_err(|e| {
                TestbedError::file(format!("Failed to create step workdir: {}", e), &self.workdir)
            })?;
        }
        Ok(())
    }

    async fn after(&self, env: &StepEnv<'_>, state: &mut PlanState) -> Result<(), TestbedError> {
        match self.kind {
            StepKind::Discover => discover::show_tests(&env.output, &state.tests),
            StepKind::Finish if !env.options().dry => finish::release_guests(&env.output, state).await?,
            _ => {}
        }
        Ok(())
    }

    fn summary(&self, state: &PlanState) -> String {
        let plural = |count: usize, noun: &str| {
            if count == 1 {
                format!("{} {}", count, noun)
            } else {
                format!("{} {}s", count, noun)
            }
        };
        match self.kind {
            StepKind::Discover => format!("{} selected", plural(state.tests.len(), "test")),
            StepKind::Provision => format!("{} provisioned", plural(state.guests.len(), "guest")),
            StepKind::Prepare | StepKind::Finish => {
                format!("{} completed", plural(self.data.len(), "phase"))
            }
            StepKind::Execute => format!("{} executed", plural(state.results.len(), "test")),
            StepKind::Report => crate::result::summary(&state.results),
        }
    }

    fn save(&self, options: &Options, state: &PlanState) -> Result<(), TestbedError> {
        if options.dry {
            return Ok(());
        }

        let file = StepFile {
            status: self.status,
            data: self.data.clone(),
        };
        write_yaml(&self.workdir.join(STEP_FILENAME), &file)?;

        match self.kind {
            StepKind::Discover => discover::save_tests(&self.workdir, &state.tests),
            StepKind::Provision => provision::save_guests(&self.workdir, &state.guests, false),
            StepKind::Execute => execute::save_results(&self.workdir, &state.results),
            _ => Ok(()),
        }
    }
}

/// Read a YAML file, `None` if it does not exist
pub fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, TestbedError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| TestbedError::file(format!("Failed to read file: {}", e), path))?;
    serde_yaml::from_str(&content)
        .map(Some)
        .map_err(|e| TestbedError::Specification {
            message: format!("Invalid saved state: {}", e),
            file: Some(path.display().to_string()),
        })
}

pub fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<(), TestbedError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| TestbedError::file(format!("Failed to create directory: {}", e), parent))?;
    }
    let content = serde_yaml::to_string(value)
        .map_err(|e| TestbedError::general(format!("Failed to serialize: {}", e)))?;
    std::fs::write(path, content)
        .map_err(|e| TestbedError::file(format!("Failed to write file: {}", e), path))
}
