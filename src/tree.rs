// Metadata tree: tests and plans loaded from testbed.yaml

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::executor::Environment;
use crate::output::errors::TestbedError;
use crate::plugins::PhaseData;
use crate::steps::StepKind;

/// Default name of the metadata file at the tree root
pub const TREE_FILENAME: &str = "testbed.yaml";

/// Default test duration
pub const DEFAULT_DURATION: &str = "5m";

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("metadata tree not found at {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid {kind} '{name}': {message}")]
    Invalid {
        kind: &'static str,
        name: String,
        message: String,
    },
}

impl From<TreeError> for TestbedError {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::NotFound(ref path) | TreeError::Io { ref path, .. } => {
                TestbedError::file(err.to_string(), path.clone())
            }
            TreeError::Parse { ref path, .. } => TestbedError::Specification {
                message: err.to_string(),
                file: Some(path.display().to_string()),
            },
            TreeError::Invalid { .. } => TestbedError::specification(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    #[default]
    Shell,
    Beakerlib,
}

impl std::fmt::Display for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Framework::Shell => write!(f, "shell"),
            Framework::Beakerlib => write!(f, "beakerlib"),
        }
    }
}

/// How the outcome of a test is determined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultInterpret {
    /// Exit code, result file or beakerlib state
    #[default]
    Respect,
    /// The test writes its own results file
    Custom,
}

fn default_duration() -> String {
    DEFAULT_DURATION.to_string()
}

fn default_true() -> bool {
    true
}

fn is_zero(count: &u32) -> bool {
    *count == 0
}

/// A single test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Test {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub test: String,
    /// Directory of the test relative to the tree root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub framework: Framework,
    #[serde(default = "default_duration")]
    pub duration: String,
    #[serde(default, skip_serializing_if = "Environment::is_empty")]
    pub environment: Environment,
    #[serde(default)]
    pub result: ResultInterpret,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub require: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommend: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,

    // Set during execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returncode: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_duration: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub reboot_count: u32,
}

impl Test {
    pub fn new(name: impl Into<String>, test: impl Into<String>) -> Self {
        Test {
            name: name.into(),
            summary: None,
            test: test.into(),
            path: None,
            framework: Framework::Shell,
            duration: default_duration(),
            environment: Environment::new(),
            result: ResultInterpret::Respect,
            require: Vec::new(),
            recommend: Vec::new(),
            enabled: true,
            returncode: None,
            real_duration: None,
            reboot_count: 0,
        }
    }

    pub fn with_framework(mut self, framework: Framework) -> Self {
        self.framework = framework;
        self
    }

    pub fn with_duration(mut self, duration: impl Into<String>) -> Self {
        self.duration = duration.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Test directory relative to a tree root, without the leading slash
    pub fn unrooted_path(&self) -> PathBuf {
        let path = self.path.as_deref().unwrap_or("/");
        PathBuf::from(path.trim_start_matches('/'))
    }

    /// Name usable as a single path component
    pub fn safe_name(&self) -> String {
        let trimmed = self.name.trim_start_matches('/');
        let safe: String = trimmed
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || "-_.".contains(c) { c } else { '-' })
            .collect();
        if safe.is_empty() {
            "default".to_string()
        } else {
            safe
        }
    }

    pub fn lint(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.test.trim().is_empty() {
            problems.push("test script must not be empty".to_string());
        }
        if let Err(err) = duration_to_seconds(&self.duration) {
            problems.push(err.message());
        }
        if !self.name.starts_with('/') {
            problems.push("name must start with '/'".to_string());
        }
        problems
    }
}

/// Step configuration of a plan: one phase or a list of them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepConfig {
    One(PhaseData),
    Many(Vec<PhaseData>),
}

impl StepConfig {
    pub fn into_phases(self) -> Vec<PhaseData> {
        match self {
            StepConfig::One(phase) => vec![phase],
            StepConfig::Many(phases) => phases,
        }
    }
}

/// A plan as written in the tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PlanData {
    #[serde(skip)]
    pub name: String,
    pub summary: Option<String>,
    pub environment: Environment,
    pub enabled: Option<bool>,
    pub discover: Option<StepConfig>,
    pub provision: Option<StepConfig>,
    pub prepare: Option<StepConfig>,
    pub execute: Option<StepConfig>,
    pub report: Option<StepConfig>,
    pub finish: Option<StepConfig>,
}

impl PlanData {
    /// Phases configured for a step, empty when the plan leaves it out
    pub fn step(&self, kind: StepKind) -> Vec<PhaseData> {
        let config = match kind {
            StepKind::Discover => &self.discover,
            StepKind::Provision => &self.provision,
            StepKind::Prepare => &self.prepare,
            StepKind::Execute => &self.execute,
            StepKind::Report => &self.report,
            StepKind::Finish => &self.finish,
        };
        config.clone().map(StepConfig::into_phases).unwrap_or_default()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TreeFile {
    tests: serde_yaml::Mapping,
    plans: serde_yaml::Mapping,
}

/// Loaded metadata tree
#[derive(Debug, Clone)]
pub struct Tree {
    root: PathBuf,
    tests: Vec<Test>,
    plans: Vec<PlanData>,
}

impl Tree {
    /// Load `testbed.yaml` from a tree root directory, or a given file
    pub fn load(path: &Path) -> Result<Tree, TreeError> {
        let (root, file) = if path.is_dir() {
            (path.to_path_buf(), path.join(TREE_FILENAME))
        } else {
            let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
            (root, path.to_path_buf())
        };

        if !file.exists() {
            return Err(TreeError::NotFound(file));
        }

        let content = std::fs::read_to_string(&file).map_err(|source| TreeError::Io {
            path: file.clone(),
            source,
        })?;
        let tree = Tree::from_yaml(&root, &content).map_err(|err| match err {
            TreeError::Parse { source, .. } => TreeError::Parse {
                path: file.clone(),
                source,
            },
            other => other,
        })?;

        debug!(
            root = %tree.root.display(),
            tests = tree.tests.len(),
            plans = tree.plans.len(),
            "tree loaded"
        );
        Ok(tree)
    }

    pub fn from_yaml(root: &Path, content: &str) -> Result<Tree, TreeError> {
        let parse = |source| TreeError::Parse {
            path: root.join(TREE_FILENAME),
            source,
        };

        let raw: TreeFile = if content.trim().is_empty() {
            TreeFile::default()
        } else {
            serde_yaml::from_str(content).map_err(parse)?
        };

        let mut tests = Vec::new();
        for (key, value) in raw.tests {
            let name = node_name("test", key)?;
            let mut test: Test = serde_yaml::from_value(value).map_err(parse)?;
            test.name = name;
            tests.push(test);
        }

        let mut plans = Vec::new();
        for (key, value) in raw.plans {
            let name = node_name("plan", key)?;
            let mut plan: PlanData = if value.is_null() {
                PlanData::default()
            } else {
                serde_yaml::from_value(value).map_err(parse)?
            };
            plan.name = name;
            plans.push(plan);
        }

        Ok(Tree {
            root: root.to_path_buf(),
            tests,
            plans,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Enabled tests whose name matches any of the filters (all if none)
    pub fn tests(&self, filters: &[Regex]) -> Vec<Test> {
        self.tests
            .iter()
            .filter(|t| t.enabled)
            .filter(|t| filters.is_empty() || filters.iter().any(|f| f.is_match(&t.name)))
            .cloned()
            .collect()
    }

    pub fn all_tests(&self) -> &[Test] {
        &self.tests
    }

    /// Enabled plans whose name matches any of the filters (all if none)
    pub fn plans(&self, filters: &[Regex]) -> Vec<PlanData> {
        self.plans
            .iter()
            .filter(|p| p.enabled.unwrap_or(true))
            .filter(|p| filters.is_empty() || filters.iter().any(|f| f.is_match(&p.name)))
            .cloned()
            .collect()
    }
}

fn node_name(kind: &'static str, key: serde_yaml::Value) -> Result<String, TreeError> {
    match key {
        serde_yaml::Value::String(name) if name.starts_with('/') => Ok(name),
        serde_yaml::Value::String(name) => Err(TreeError::Invalid {
            kind,
            name,
            message: "name must start with '/'".to_string(),
        }),
        other => Err(TreeError::Invalid {
            kind,
            name: format!("{:?}", other),
            message: "name must be a string".to_string(),
        }),
    }
}

/// Convert a duration like `5m` or `1h 30m` into seconds
pub fn duration_to_seconds(duration: &str) -> Result<u64, TestbedError> {
    let invalid = || TestbedError::specification(format!("Invalid duration '{}'.", duration));
    let mut total = 0u64;
    let mut parts = 0;

    for part in duration.split_whitespace() {
        let split = part
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(part.len());
        let (number, unit) = part.split_at(split);
        let number: u64 = number.parse().map_err(|_| invalid())?;
        let multiplier = match unit {
            "" | "s" => 1,
            "m" => 60,
            "h" => 60 * 60,
            "d" => 60 * 60 * 24,
            _ => return Err(invalid()),
        };
        total += number * multiplier;
        parts += 1;
    }

    if parts == 0 {
        return Err(invalid());
    }
    Ok(total)
}

/// Format an elapsed time as `HH:MM:SS`
pub fn format_duration(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}
