// End-to-end run of a small tree on the local machine

use std::path::Path;
use std::sync::Arc;

use pretty_assertions::assert_eq;

use testbed::config::OptionLayer;
use testbed::executor::SystemRunner;
use testbed::output::TerminalOutput;
use testbed::result::ResultOutcome;
use testbed::run::{Run, RunConfig, StepSelection};
use testbed::steps::execute::{load_results, RESULTS_FILENAME};
use testbed::steps::{StepKind, StepStatus};
use testbed::tree::Tree;

const TREE: &str = r#"
tests:
  /smoke/pass:
    summary: Always passes
    test: echo hello
  /smoke/fail:
    test: exit 1
  /smoke/disabled:
    test: exit 2
    enabled: false
plans:
  /plans/local:
    discover:
      how: fmf
    provision:
      how: local
    execute:
      how: internal
"#;

fn run_config(workdir: &Path, layer: OptionLayer, selection: StepSelection) -> RunConfig {
    RunConfig {
        id: Some(workdir.display().to_string()),
        scratch: false,
        workdir_root: workdir.parent().unwrap().to_path_buf(),
        layer,
        selection,
        plan_filters: Vec::new(),
    }
}

#[tokio::test]
async fn test_local_run_end_to_end() {
    let tree_dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let workdir = work.path().join("run");
    let tree = Tree::from_yaml(tree_dir.path(), TREE).unwrap();

    let config = run_config(&workdir, OptionLayer::default(), StepSelection::default());
    let mut run = Run::new(
        tree,
        config,
        Arc::new(TerminalOutput::silent()),
        Arc::new(SystemRunner),
    )
    .unwrap();
    let code = run.go().await.unwrap();

    assert_eq!(code, 1);
    assert_eq!(run.workdir(), workdir.as_path());

    let plan = &run.plans()[0];
    let outcomes: Vec<(&str, ResultOutcome)> = plan
        .results()
        .iter()
        .map(|r| (r.name.as_str(), r.result))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ("/smoke/pass", ResultOutcome::Pass),
            ("/smoke/fail", ResultOutcome::Fail),
        ]
    );

    let execute = workdir.join("plans/local/execute");
    let saved = load_results(&execute).unwrap().unwrap_or_default();
    assert_eq!(saved.len(), 2);
    assert!(execute.join(RESULTS_FILENAME).exists());
    assert!(workdir.join("plans/local/discover/step.yaml").exists());

    let output = std::fs::read_to_string(execute.join("data/smoke-pass/output.txt")).unwrap();
    assert!(output.contains("hello"));
}

#[tokio::test]
async fn test_resumed_run_uses_saved_state() {
    let tree_dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let workdir = work.path().join("run");

    // Stop before execute, then continue with the remaining steps
    let until = StepSelection {
        until: Some(StepKind::Prepare),
        ..Default::default()
    };
    let tree = Tree::from_yaml(tree_dir.path(), TREE).unwrap();
    let mut first = Run::new(
        tree,
        run_config(&workdir, OptionLayer::default(), until),
        Arc::new(TerminalOutput::silent()),
        Arc::new(SystemRunner),
    )
    .unwrap();
    assert_eq!(first.go().await.unwrap(), 0);
    assert!(first.plans()[0].results().is_empty());

    let since = StepSelection {
        since: Some(StepKind::Execute),
        ..Default::default()
    };
    let tree = Tree::from_yaml(tree_dir.path(), TREE).unwrap();
    let mut second = Run::new(
        tree,
        run_config(&workdir, OptionLayer::default(), since),
        Arc::new(TerminalOutput::silent()),
        Arc::new(SystemRunner),
    )
    .unwrap();
    assert_eq!(second.go().await.unwrap(), 1);
    assert_eq!(second.plans()[0].results().len(), 2);
}

#[tokio::test]
async fn test_dry_run_exits_zero_without_results() {
    let tree_dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let workdir = work.path().join("run");
    let tree = Tree::from_yaml(tree_dir.path(), TREE).unwrap();

    let dry = OptionLayer {
        dry: Some(true),
        ..Default::default()
    };
    let mut run = Run::new(
        tree,
        run_config(&workdir, dry, StepSelection::default()),
        Arc::new(TerminalOutput::silent()),
        Arc::new(SystemRunner),
    )
    .unwrap();

    assert_eq!(run.go().await.unwrap(), 0);
    assert!(run.plans()[0].results().is_empty());
    assert!(!workdir.join("plans/local/execute").join(RESULTS_FILENAME).exists());
}

#[tokio::test]
async fn test_finish_runs_after_failed_step() {
    let tree_dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let workdir = work.path().join("run");
    let marker = work.path().join("finished");

    let yaml = format!(
        r#"
tests:
  /smoke/pass:
    test: "true"
plans:
  /plans/broken:
    provision:
      how: local
    prepare:
      how: shell
      script: exit 1
    finish:
      how: shell
      script: touch {}
"#,
        marker.display()
    );
    let tree = Tree::from_yaml(tree_dir.path(), &yaml).unwrap();

    let mut run = Run::new(
        tree,
        run_config(&workdir, OptionLayer::default(), StepSelection::default()),
        Arc::new(TerminalOutput::silent()),
        Arc::new(SystemRunner),
    )
    .unwrap();
    let err = run.go().await.unwrap_err();

    assert!(err.is_run());
    assert!(marker.exists());
    let plan = &run.plans()[0];
    assert_eq!(plan.step(StepKind::Execute).unwrap().status(), StepStatus::Todo);
    assert_eq!(plan.step(StepKind::Finish).unwrap().status(), StepStatus::Done);
    assert!(plan.results().is_empty());
}

#[tokio::test]
async fn test_no_tests_skips_to_finish() {
    let tree_dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let workdir = work.path().join("run");
    let tree = Tree::from_yaml(
        tree_dir.path(),
        "plans:\n  /plans/empty:\n    provision:\n      how: local\n",
    )
    .unwrap();

    let mut run = Run::new(
        tree,
        run_config(&workdir, OptionLayer::default(), StepSelection::default()),
        Arc::new(TerminalOutput::silent()),
        Arc::new(SystemRunner),
    )
    .unwrap();
    assert_eq!(run.go().await.unwrap(), 3);

    let plan = &run.plans()[0];
    assert_eq!(plan.step(StepKind::Discover).unwrap().status(), StepStatus::Done);
    assert_eq!(plan.step(StepKind::Provision).unwrap().status(), StepStatus::Todo);
    assert_eq!(plan.step(StepKind::Execute).unwrap().status(), StepStatus::Todo);
    assert_eq!(plan.step(StepKind::Finish).unwrap().status(), StepStatus::Done);
}
