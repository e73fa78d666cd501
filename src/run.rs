// Run orchestrator - drive every plan through the enabled steps

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info};

use crate::config::{resolve, OptionLayer, Options};
use crate::executor::CommandRunner;
use crate::output::errors::TestbedError;
use crate::output::TerminalOutput;
use crate::plugins::{PhaseData, PlanInfo, PlanState, PluginRegistry};
use crate::result::{self, TestResult};
use crate::steps::{Step, StepEnv, StepKind, StepStatus};
use crate::tree::{PlanData, StepConfig, Tree};

/// Maximum number of `run-NNN` workdirs under one root
pub const MAX_RUN_WORKDIRS: usize = 1000;

/// Name of the plan used when the tree defines none
pub const DEFAULT_PLAN_NAME: &str = "/default/plan";

/// Which steps to run, as selected on the command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepSelection {
    pub all: bool,
    /// Explicitly named steps
    pub steps: Vec<StepKind>,
    pub until: Option<StepKind>,
    pub since: Option<StepKind>,
    pub after: Option<StepKind>,
    pub before: Option<StepKind>,
    pub skip: Vec<StepKind>,
}

impl StepSelection {
    /// Resolve the enabled steps, all of them when nothing is selected
    pub fn enabled_steps(&self) -> BTreeSet<StepKind> {
        let mut enabled: BTreeSet<StepKind> = self.steps.iter().copied().collect();

        for kind in StepKind::ALL {
            let selected = self.until.is_some_and(|until| kind <= until)
                || self.since.is_some_and(|since| kind >= since)
                || self.after.is_some_and(|after| kind > after)
                || self.before.is_some_and(|before| kind < before);
            if selected {
                enabled.insert(kind);
            }
        }

        if self.all || enabled.is_empty() {
            enabled = StepKind::ALL.into_iter().collect();
        }
        for kind in &self.skip {
            enabled.remove(kind);
        }
        enabled
    }
}

/// Allocate the run workdir
///
/// A given id is used as is when it looks like a path, otherwise it names
/// a directory under `root`. Without an id the first free `run-NNN` is taken.
pub fn allocate_workdir(root: &Path, id: Option<&str>, scratch: bool) -> Result<PathBuf, TestbedError> {
    let file_error = |e: std::io::Error, path: &Path| {
        TestbedError::file(format!("Failed to create workdir: {}", e), path)
    };

    if let Some(id) = id {
        let path = if id.contains('/') {
            PathBuf::from(id)
        } else {
            root.join(id)
        };
        if scratch && path.exists() {
            debug!(workdir = %path.display(), "removing workdir");
            std::fs::remove_dir_all(&path).map_err(|e| file_error(e, &path))?;
        }
        std::fs::create_dir_all(&path).map_err(|e| file_error(e, &path))?;
        return Ok(path);
    }

    std::fs::create_dir_all(root).map_err(|e| file_error(e, root))?;
    for serial in 1..=MAX_RUN_WORKDIRS {
        let path = root.join(format!("run-{:03}", serial));
        match std::fs::create_dir(&path) {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(file_error(e, &path)),
        }
    }

    Err(TestbedError::General {
        message: "Workdir full.".to_string(),
        suggestion: Some(format!("Cleanup the '{}' directory.", root.display())),
    })
}

/// Everything a run is configured with
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub id: Option<String>,
    pub scratch: bool,
    pub workdir_root: PathBuf,
    pub layer: OptionLayer,
    pub selection: StepSelection,
    pub plan_filters: Vec<Regex>,
}

/// One plan and its steps
pub struct Plan {
    data: PlanData,
    info: PlanInfo,
    steps: Vec<Step>,
    state: PlanState,
}

impl Plan {
    pub fn new(data: PlanData, run_workdir: &Path, tree: Arc<Tree>) -> Self {
        let workdir = run_workdir.join(data.name.trim_start_matches('/'));
        let steps = StepKind::ALL
            .into_iter()
            .map(|kind| Step::new(kind, &workdir, data.step(kind)))
            .collect();
        let info = PlanInfo {
            name: data.name.clone(),
            workdir,
            environment: data.environment.clone(),
            tree,
        };
        Plan {
            data,
            info,
            steps,
            state: PlanState::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn workdir(&self) -> &Path {
        &self.info.workdir
    }

    pub fn results(&self) -> &[TestResult] {
        &self.state.results
    }

    pub fn step(&self, kind: StepKind) -> Option<&Step> {
        self.steps.iter().find(|step| step.kind() == kind)
    }

    /// Wake every step, run the enabled ones
    ///
    /// Disabled steps still load their saved state so later steps can use
    /// the tests, guests and results of a previous invocation. Finish runs
    /// even when an earlier step failed, as long as there are guests to
    /// clean up; the first error is returned afterwards.
    pub async fn go(
        &mut self,
        layer: &OptionLayer,
        enabled: &BTreeSet<StepKind>,
        output: &Arc<TerminalOutput>,
        runner: &Arc<dyn CommandRunner>,
        registry: &PluginRegistry,
    ) -> Result<(), TestbedError> {
        output.print_plan_header(&self.data.name, self.data.summary.as_deref());
        debug!(plan = %self.data.name, workdir = %self.info.workdir.display(), "plan started");

        let env = StepEnv {
            plan: &self.info,
            layer,
            output: Arc::clone(output),
            runner: Arc::clone(runner),
            registry,
        };

        let mut failure = None;
        for step in self.steps.iter_mut() {
            if step.kind() == StepKind::Finish {
                continue;
            }
            let outcome = match step.wake(&env, &mut self.state).await {
                Ok(()) if enabled.contains(&step.kind()) => step.go(&env, &mut self.state).await,
                other => other,
            };
            if let Err(err) = outcome {
                debug!(step = %step.kind(), %err, "step failed, finishing plan");
                failure = Some(err);
                break;
            }

            if step.kind() == StepKind::Discover
                && step.status() == StepStatus::Done
                && self.state.tests.is_empty()
            {
                output.message("No tests found, finishing plan.", 1);
                break;
            }
        }

        if let Some(finish) = self.steps.iter_mut().find(|step| step.kind() == StepKind::Finish) {
            let cleanup = failure.is_none() || !self.state.guests.is_empty();
            let outcome = match finish.wake(&env, &mut self.state).await {
                Ok(()) if cleanup && enabled.contains(&StepKind::Finish) => {
                    finish.go(&env, &mut self.state).await
                }
                other => other,
            };
            if let Err(err) = outcome {
                if failure.is_some() {
                    debug!(%err, "finish failed after an earlier error");
                } else {
                    failure = Some(err);
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// The default plan: tests from the tree on the local machine
pub fn default_plan() -> PlanData {
    PlanData {
        name: DEFAULT_PLAN_NAME.to_string(),
        discover: Some(StepConfig::One(PhaseData::new("fmf"))),
        execute: Some(StepConfig::One(PhaseData::new("internal"))),
        ..Default::default()
    }
}

/// A single invocation over the plans of a tree
pub struct Run {
    workdir: PathBuf,
    tree: Arc<Tree>,
    config: RunConfig,
    output: Arc<TerminalOutput>,
    runner: Arc<dyn CommandRunner>,
    registry: PluginRegistry,
    plans: Vec<Plan>,
}

impl Run {
    pub fn new(
        tree: Tree,
        config: RunConfig,
        output: Arc<TerminalOutput>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Run, TestbedError> {
        let workdir = allocate_workdir(&config.workdir_root, config.id.as_deref(), config.scratch)?;
        Ok(Run {
            workdir,
            tree: Arc::new(tree),
            config,
            output,
            runner,
            registry: PluginRegistry::with_defaults(),
            plans: Vec::new(),
        })
    }

    pub fn with_registry(mut self, registry: PluginRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn options(&self) -> Options {
        resolve(&[&self.config.layer])
    }

    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }

    /// Selected plans, the default plan when the tree has none
    fn select_plans(&self) -> Result<Vec<PlanData>, TestbedError> {
        let plans = self.tree.plans(&self.config.plan_filters);
        if !plans.is_empty() {
            return Ok(plans);
        }
        if self.config.plan_filters.is_empty() {
            return Ok(vec![default_plan()]);
        }
        Err(TestbedError::General {
            message: "No plans found.".to_string(),
            suggestion: Some("Check the plan name filters.".to_string()),
        })
    }

    /// Run every plan, return the exit code of the whole run
    pub async fn go(&mut self) -> Result<i32, TestbedError> {
        let enabled = self.config.selection.enabled_steps();
        self.output
            .print_run_header(&self.workdir.display().to_string());
        info!(workdir = %self.workdir.display(), ?enabled, "run started");

        let plans = self.select_plans()?;
        self.plans = plans
            .into_iter()
            .map(|data| Plan::new(data, &self.workdir, Arc::clone(&self.tree)))
            .collect();

        for plan in self.plans.iter_mut() {
            plan.go(
                &self.config.layer,
                &enabled,
                &self.output,
                &self.runner,
                &self.registry,
            )
            .await?;
        }

        Ok(self.exit_code(&enabled))
    }

    /// Computed once all plans are done
    fn exit_code(&self, enabled: &BTreeSet<StepKind>) -> i32 {
        if self.options().dry {
            return 0;
        }
        let executed = enabled.contains(&StepKind::Execute)
            || self.plans.iter().any(|plan| {
                plan.step(StepKind::Execute)
                    .is_some_and(|step| step.status() == StepStatus::Done)
            });
        if !executed {
            return 0;
        }

        let results: Vec<TestResult> = self
            .plans
            .iter()
            .flat_map(|plan| plan.results().iter().cloned())
            .collect();
        result::exit_code(&results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kinds(kinds: &[StepKind]) -> BTreeSet<StepKind> {
        kinds.iter().copied().collect()
    }

    #[test]
    fn test_default_selection_is_all_steps() {
        let selection = StepSelection::default();
        assert_eq!(selection.enabled_steps(), kinds(&StepKind::ALL));
    }

    #[test]
    fn test_until_since_after_before() {
        use StepKind::*;

        let until = StepSelection {
            until: Some(Prepare),
            ..Default::default()
        };
        assert_eq!(until.enabled_steps(), kinds(&[Discover, Provision, Prepare]));

        let since = StepSelection {
            since: Some(Report),
            ..Default::default()
        };
        assert_eq!(since.enabled_steps(), kinds(&[Report, Finish]));

        let after = StepSelection {
            after: Some(Report),
            ..Default::default()
        };
        assert_eq!(after.enabled_steps(), kinds(&[Finish]));

        let before = StepSelection {
            before: Some(Provision),
            ..Default::default()
        };
        assert_eq!(before.enabled_steps(), kinds(&[Discover]));
    }

    #[test]
    fn test_skip_applies_last() {
        use StepKind::*;

        let selection = StepSelection {
            skip: vec![Prepare, Report],
            ..Default::default()
        };
        assert_eq!(
            selection.enabled_steps(),
            kinds(&[Discover, Provision, Execute, Finish])
        );

        let explicit = StepSelection {
            steps: vec![Discover],
            until: Some(Provision),
            skip: vec![Provision],
            ..Default::default()
        };
        assert_eq!(explicit.enabled_steps(), kinds(&[Discover]));
    }

    #[test]
    fn test_allocate_sequential_workdirs() {
        let root = tempfile::tempdir().unwrap();

        let first = allocate_workdir(root.path(), None, false).unwrap();
        let second = allocate_workdir(root.path(), None, false).unwrap();
        assert_eq!(first, root.path().join("run-001"));
        assert_eq!(second, root.path().join("run-002"));
    }

    #[test]
    fn test_allocate_named_workdir_and_scratch() {
        let root = tempfile::tempdir().unwrap();

        let named = allocate_workdir(root.path(), Some("mine"), false).unwrap();
        assert_eq!(named, root.path().join("mine"));
        std::fs::write(named.join("leftover"), "x").unwrap();

        let again = allocate_workdir(root.path(), Some("mine"), false).unwrap();
        assert!(again.join("leftover").exists());

        let path = root.path().join("elsewhere");
        let id = path.display().to_string();
        let scratch = allocate_workdir(root.path(), Some(&id), true).unwrap();
        assert_eq!(scratch, path);

        std::fs::write(scratch.join("leftover"), "x").unwrap();
        let cleaned = allocate_workdir(root.path(), Some(&id), true).unwrap();
        assert!(!cleaned.join("leftover").exists());
    }

    #[test]
    fn test_plan_workdir_and_steps() {
        let root = tempfile::tempdir().unwrap();
        let tree = Arc::new(Tree::from_yaml(root.path(), "").unwrap());
        let plan = Plan::new(default_plan(), root.path(), tree);

        assert_eq!(plan.name(), DEFAULT_PLAN_NAME);
        assert_eq!(plan.workdir(), root.path().join("default/plan"));
        assert_eq!(
            plan.step(StepKind::Execute).map(|s| s.data()[0].how.clone()),
            Some("internal".to_string())
        );
        assert_eq!(
            plan.step(StepKind::Provision).map(|s| s.data()[0].how.clone()),
            Some("local".to_string())
        );
    }
}
