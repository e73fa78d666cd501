// Plugin system - interchangeable implementations of each step
//
// Every phase of a step is either a plugin selected by its `how` key or an
// action (reboot, login) interleaved between plugins.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Options;
use crate::executor::{CommandRunner, Environment};
use crate::guest::{Guest, GuestContext};
use crate::output::errors::TestbedError;
use crate::output::TerminalOutput;
use crate::result::TestResult;
use crate::steps::actions::LoginHook;
use crate::steps::StepKind;
use crate::tree::{Test, Tree};

pub mod registry;

pub use registry::PluginRegistry;

/// Default order of a phase within its step
pub const DEFAULT_PLUGIN_ORDER: i32 = 50;

/// Order of the phase installing test requirements
pub const PLUGIN_ORDER_REQUIRES: i32 = 70;

/// Order of the phase installing test recommendations
pub const PLUGIN_ORDER_RECOMMENDS: i32 = 75;

/// Configuration record of one phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseData {
    #[serde(default)]
    pub how: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Plugin specific keys
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl PhaseData {
    pub fn new(how: impl Into<String>) -> Self {
        PhaseData {
            how: how.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = Some(order);
        self
    }

    pub fn with_key(mut self, key: &str, value: impl Into<serde_yaml::Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    /// Phase name, set for every phase once its step normalized the data
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("default-0")
    }

    pub fn order(&self) -> i32 {
        self.order.unwrap_or(DEFAULT_PLUGIN_ORDER)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(serde_yaml::Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.extra.get(key).and_then(serde_yaml::Value::as_bool)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.extra.get(key).and_then(serde_yaml::Value::as_u64)
    }

    /// A key given either as a single string or a list of strings
    pub fn get_strings(&self, key: &str) -> Vec<String> {
        match self.extra.get(key) {
            Some(serde_yaml::Value::String(value)) => vec![value.clone()],
            Some(serde_yaml::Value::Sequence(values)) => values
                .iter()
                .filter_map(|v| match v {
                    serde_yaml::Value::String(s) => Some(s.clone()),
                    serde_yaml::Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Deserialize the plugin specific keys into a typed record
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, TestbedError> {
        let mapping: serde_yaml::Mapping = self
            .extra
            .iter()
            .map(|(k, v)| (serde_yaml::Value::String(k.clone()), v.clone()))
            .collect();
        serde_yaml::from_value(serde_yaml::Value::Mapping(mapping)).map_err(|e| {
            TestbedError::specification(format!(
                "Invalid data of phase '{}' (how: {}): {}",
                self.name(),
                self.how,
                e
            ))
        })
    }
}

/// Plan level information shared by all phases
#[derive(Clone)]
pub struct PlanInfo {
    pub name: String,
    pub workdir: PathBuf,
    pub environment: Environment,
    pub tree: Arc<Tree>,
}

impl PlanInfo {
    /// Directory shared by all tests of the plan
    pub fn data_directory(&self) -> PathBuf {
        self.workdir.join("data")
    }

    pub fn step_workdir(&self, step: StepKind) -> PathBuf {
        self.workdir.join(step.name())
    }
}

/// Mutable state of a plan, filled by the steps in turn
#[derive(Default)]
pub struct PlanState {
    pub tests: Vec<Test>,
    pub guests: Vec<Arc<dyn Guest>>,
    pub results: Vec<TestResult>,
}

impl PlanState {
    /// More than one guest to run on
    pub fn is_multihost(&self) -> bool {
        self.guests.len() > 1
    }
}

/// Everything a phase needs to do its work
pub struct PhaseContext<'a> {
    pub step: StepKind,
    /// Private workdir of the phase, `<step workdir>/<phase name>`
    pub workdir: PathBuf,
    pub options: Options,
    pub output: Arc<TerminalOutput>,
    pub runner: Arc<dyn CommandRunner>,
    pub plan: &'a PlanInfo,
    pub state: &'a mut PlanState,
    /// Logins to run after each executed test
    pub login_hooks: &'a [LoginHook],
}

impl PhaseContext<'_> {
    pub fn step_workdir(&self) -> PathBuf {
        self.plan.step_workdir(self.step)
    }

    /// Context for guests created or woken by this phase
    pub fn guest_context(&self) -> GuestContext {
        GuestContext::new(&self.plan.workdir, Arc::clone(&self.runner))
            .with_environment(self.plan.environment.clone())
            .with_options(self.options)
    }

    /// Write a file unless running dry
    pub fn write(&self, path: &Path, content: &str) -> Result<(), TestbedError> {
        if self.options.dry {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TestbedError::file(format!("Failed to create directory: {}", e), parent)
            })?;
        }
        std::fs::write(path, content)
            .map_err(|e| TestbedError::file(format!("Failed to write file: {}", e), path))
    }
}

/// One configured unit of work of a step
#[async_trait]
pub trait Plugin: Send + Sync {
    fn data(&self) -> &PhaseData;

    fn how(&self) -> &str {
        &self.data().how
    }

    fn name(&self) -> &str {
        self.data().name()
    }

    fn order(&self) -> i32 {
        self.data().order()
    }

    /// Problems in the phase data, reported by `lint`
    fn lint(&self) -> Vec<String> {
        Vec::new()
    }

    async fn go(&mut self, ctx: &mut PhaseContext<'_>) -> Result<(), TestbedError>;

    /// Guest started by a provision plugin
    fn guest(&self) -> Option<Arc<dyn Guest>> {
        None
    }
}

/// Ad hoc work interleaved between plugins of a step
#[async_trait]
pub trait Action: Send + Sync {
    fn data(&self) -> &PhaseData;

    fn order(&self) -> i32 {
        self.data().order()
    }

    async fn go(&self, ctx: &mut PhaseContext<'_>) -> Result<(), TestbedError>;
}

/// A phase of a step, ordered by `order()`
pub enum Phase {
    Plugin(Box<dyn Plugin>),
    Action(Box<dyn Action>),
}

impl Phase {
    pub fn order(&self) -> i32 {
        match self {
            Phase::Plugin(plugin) => plugin.order(),
            Phase::Action(action) => action.order(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Phase::Plugin(plugin) => plugin.name(),
            Phase::Action(action) => action.data().name(),
        }
    }
}


/// Helpers for exercising phases without a full run
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::Options;
    use crate::executor::SystemRunner;

    pub fn plan(workdir: &Path, tree_root: &Path, tree_yaml: &str) -> PlanInfo {
        PlanInfo {
            name: "/plans/test".to_string(),
            workdir: workdir.to_path_buf(),
            environment: Environment::new(),
            tree: Arc::new(Tree::from_yaml(tree_root, tree_yaml).unwrap()),
        }
    }

    pub fn context<'a>(
        step: StepKind,
        plan: &'a PlanInfo,
        state: &'a mut PlanState,
        options: Options,
    ) -> PhaseContext<'a> {
        PhaseContext {
            step,
            workdir: plan.step_workdir(step).join("default-0"),
            options,
            output: Arc::new(TerminalOutput::silent()),
            runner: Arc::new(SystemRunner),
            plan,
            state,
            login_hooks: &[],
        }
    }
}
