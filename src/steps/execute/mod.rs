// Execute step - run tests and collect results
//
// Every test gets its own data directory under `execute/data` holding the
// captured output, its metadata and whatever the test itself stores in
// `data/` (result files, reboot and abort markers, submitted logs).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{read_yaml, write_yaml, StepKind};
use crate::executor::Environment;
use crate::output::errors::TestbedError;
use crate::plugins::{Phase, PluginRegistry};
use crate::result::{ResultOutcome, TestResult};
use crate::tree::{Framework, ResultInterpret, Test};

pub mod internal;

pub use internal::ExecuteInternal;

/// Collected results saved in the execute workdir
pub const RESULTS_FILENAME: &str = "results.yaml";

/// Test data directories live here, relative to the execute workdir
pub const DATA_DIRECTORY: &str = "data";

/// Helper scripts are prepared here, relative to the execute workdir
pub const SCRIPTS_DIRECTORY: &str = "scripts";

/// Directory a test can write into, relative to its data directory
pub const TEST_DATA: &str = "data";

pub const TEST_METADATA_FILENAME: &str = "metadata.yaml";
pub const TEST_OUTPUT_FILENAME: &str = "output.txt";
pub const TEST_WRAPPER_FILENAME: &str = "testbed-test-wrapper.sh";

pub const REBOOT_REQUEST_FILENAME: &str = "reboot-request";
pub const ABORT_FILENAME: &str = "abort";
pub const RESULT_FILENAME: &str = "result";
pub const BEAKERLIB_RESULTS_FILENAME: &str = "TestResults";

/// Where helper scripts are installed on remote guests
pub const REMOTE_SCRIPTS_DIRECTORY: &str = "/usr/local/bin";

/// Variables exposing the reboot counter, all set to the same value
pub const REBOOT_COUNT_VARIABLES: &[&str] = &[
    "TESTBED_REBOOT_COUNT",
    "REBOOTCOUNT",
    "RSTRNT_REBOOTCOUNT",
];

pub fn register(registry: &mut PluginRegistry) {
    registry.register(StepKind::Execute, "internal", |data| {
        Ok(Phase::Plugin(Box::new(ExecuteInternal::new(data)?)))
    });
}

/// A script tests can call to talk to the executor
#[derive(Debug, Clone, Copy)]
pub struct HelperScript {
    pub name: &'static str,
    pub content: &'static str,
}

pub const REBOOT_SCRIPT: HelperScript = HelperScript {
    name: "testbed-reboot",
    content: r#"#!/bin/bash
# Ask the executor to reboot the guest once the test finishes
command=""
timeout=""
while getopts "c:t:" option; do
    case "$option" in
        c) command="$OPTARG" ;;
        t) timeout="$OPTARG" ;;
        *) echo "Usage: testbed-reboot [-c COMMAND] [-t TIMEOUT]" >&2; exit 1 ;;
    esac
done
if [ -z "$TESTBED_REBOOT_REQUEST" ]; then
    echo "TESTBED_REBOOT_REQUEST is not set" >&2
    exit 1
fi
# Keep the marker valid json whatever the command contains
command="${command//\\/\\\\}"
command="${command//\"/\\\"}"
mkdir -p "$(dirname "$TESTBED_REBOOT_REQUEST")"
printf '{"command": "%s", "timeout": "%s"}\n' "$command" "$timeout" > "$TESTBED_REBOOT_REQUEST"
"#,
};

pub const ABORT_SCRIPT: HelperScript = HelperScript {
    name: "testbed-abort",
    content: r#"#!/bin/bash
# Stop executing the remaining tests after this one
mkdir -p "$TESTBED_TEST_DATA"
touch "$TESTBED_TEST_DATA/abort"
"#,
};

pub const FILE_SUBMIT_SCRIPT: HelperScript = HelperScript {
    name: "testbed-file-submit",
    content: r#"#!/bin/bash
# Store a log file among the test data
file=""
while getopts "l:s:" option; do
    case "$option" in
        l) file="$OPTARG" ;;
        s) ;;
        *) echo "Usage: testbed-file-submit -l FILE" >&2; exit 1 ;;
    esac
done
if [ -z "$file" ] || [ ! -f "$file" ]; then
    echo "File '$file' not found" >&2
    exit 1
fi
mkdir -p "$TESTBED_TEST_DATA"
cp -f "$file" "$TESTBED_TEST_DATA/"
"#,
};

pub const HELPER_SCRIPTS: [HelperScript; 3] = [REBOOT_SCRIPT, ABORT_SCRIPT, FILE_SUBMIT_SCRIPT];

/// Paths belonging to one test run on one guest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestPaths {
    directory: PathBuf,
}

impl TestPaths {
    /// `<execute>/data/[<guest>/]<test>`, the guest level only for multihost plans
    pub fn new(execute_workdir: &Path, test: &Test, guest: Option<&str>) -> Self {
        let mut directory = execute_workdir.join(DATA_DIRECTORY);
        if let Some(guest) = guest {
            directory.push(guest);
        }
        directory.push(test.safe_name());
        TestPaths { directory }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn data(&self) -> PathBuf {
        self.directory.join(TEST_DATA)
    }

    pub fn metadata(&self) -> PathBuf {
        self.directory.join(TEST_METADATA_FILENAME)
    }

    pub fn output(&self) -> PathBuf {
        self.directory.join(TEST_OUTPUT_FILENAME)
    }

    pub fn reboot_request(&self) -> PathBuf {
        self.data().join(REBOOT_REQUEST_FILENAME)
    }

    pub fn abort(&self) -> PathBuf {
        self.data().join(ABORT_FILENAME)
    }

    pub fn result_file(&self) -> PathBuf {
        self.data().join(RESULT_FILENAME)
    }

    pub fn beakerlib_results(&self) -> PathBuf {
        self.directory.join(BEAKERLIB_RESULTS_FILENAME)
    }

    /// Path relative to `base`, used for result logs
    pub fn relative(&self, path: &Path, base: &Path) -> String {
        path.strip_prefix(base)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

/// Environment a test runs with
///
/// `scripts` is where the helper scripts live on the guest.
pub fn test_environment(
    test: &Test,
    paths: &TestPaths,
    scripts: &Path,
    extra: &Environment,
) -> Environment {
    let mut environment = extra.clone();
    environment.extend(test.environment.clone());

    let path = |p: PathBuf| p.display().to_string();
    environment.insert("TESTBED_TEST_NAME".into(), test.name.clone());
    environment.insert("TESTBED_TEST_DATA".into(), path(paths.data()));
    environment.insert("TESTBED_TEST_METADATA".into(), path(paths.metadata()));
    environment.insert("TESTBED_REBOOT_REQUEST".into(), path(paths.reboot_request()));
    for variable in REBOOT_COUNT_VARIABLES {
        environment.insert(variable.to_string(), test.reboot_count.to_string());
    }

    if test.framework == Framework::Beakerlib {
        environment.insert("BEAKERLIB_DIR".into(), path(paths.directory().to_path_buf()));
        environment.insert(
            "BEAKERLIB_COMMAND_SUBMIT_LOG".into(),
            format!("bash {}", scripts.join(FILE_SUBMIT_SCRIPT.name).display()),
        );
    }
    environment
}

/// Reboot requested by a test through the marker file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebootRequest {
    pub command: Option<String>,
    pub timeout: Option<u64>,
}

impl RebootRequest {
    /// Parse the marker content, malformed fields fall back to defaults
    pub fn parse(content: &str) -> RebootRequest {
        let value: serde_json::Value = match serde_json::from_str(content) {
            Ok(value) => value,
            Err(err) => {
                debug!(%err, "reboot request is not valid json");
                return RebootRequest::default();
            }
        };

        let command = value
            .get("command")
            .and_then(serde_json::Value::as_str)
            .filter(|command| !command.trim().is_empty())
            .map(str::to_string);
        let timeout = match value.get("timeout") {
            Some(serde_json::Value::Number(number)) => number.as_u64(),
            Some(serde_json::Value::String(text)) => text.trim().parse().ok(),
            _ => None,
        };
        RebootRequest { command, timeout }
    }
}

/// Interpret what a finished test left behind
///
/// Custom results file first, beakerlib state next, then the result file
/// with the exit code as the fallback.
pub fn check(test: &Test, paths: &TestPaths, execute_workdir: &Path) -> Vec<TestResult> {
    let log = paths.relative(&paths.output(), execute_workdir);
    let base = |outcome: ResultOutcome| {
        TestResult::new(test.name.clone(), outcome)
            .with_duration(test.real_duration.clone())
            .with_log(log.clone())
    };

    if test.result == ResultInterpret::Custom {
        return check_custom(test, paths, &base);
    }
    if test.framework == Framework::Beakerlib {
        return vec![check_beakerlib(paths, &base)];
    }
    match check_result_file(paths, &base) {
        Ok(result) => vec![result],
        Err(err) => {
            debug!(test = %test.name, %err, "no result file, using exit code");
            vec![check_shell(test, &base)]
        }
    }
}

/// Outcome from the exit code alone
pub fn check_shell(test: &Test, base: &dyn Fn(ResultOutcome) -> TestResult) -> TestResult {
    match test.returncode {
        Some(0) => base(ResultOutcome::Pass),
        Some(1) => base(ResultOutcome::Fail),
        Some(crate::executor::PROCESS_TIMEOUT) => base(ResultOutcome::Error).with_note("timeout"),
        _ => base(ResultOutcome::Error),
    }
}

/// Outcome word the test wrote into `data/result`
pub fn check_result_file(
    paths: &TestPaths,
    base: &dyn Fn(ResultOutcome) -> TestResult,
) -> Result<TestResult, TestbedError> {
    let path = paths.result_file();
    let content = std::fs::read_to_string(&path)
        .map_err(|e| TestbedError::file(format!("Result file not found: {}", e), &path))?;

    Ok(match content.trim().parse::<ResultOutcome>() {
        Ok(outcome) => base(outcome),
        Err(_) => base(ResultOutcome::Error)
            .with_note(format!("invalid result '{}'", content.trim())),
    })
}

/// Outcome from the beakerlib `TestResults` file
pub fn check_beakerlib(
    paths: &TestPaths,
    base: &dyn Fn(ResultOutcome) -> TestResult,
) -> TestResult {
    let path = paths.beakerlib_results();
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(_) => {
            return base(ResultOutcome::Error).with_note("beakerlib: TestResults FileError")
        }
    };

    let field = |key: &str| {
        content.lines().find_map(|line| {
            line.trim()
                .strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
                .map(|value| value.trim().trim_matches('\'').trim_matches('"').to_string())
        })
    };

    let (Some(state), Some(result)) = (field("TESTRESULT_STATE"), field("TESTRESULT_RESULT_STRING"))
    else {
        return base(ResultOutcome::Error).with_note("beakerlib: Result/State missing");
    };

    if state != "complete" {
        return base(ResultOutcome::Error).with_note(format!("beakerlib: State '{}'", state));
    }
    match result.parse::<ResultOutcome>() {
        Ok(outcome) => base(outcome),
        Err(_) => base(ResultOutcome::Error).with_note(format!("beakerlib: Result '{}'", result)),
    }
}

#[derive(Debug, Deserialize)]
struct CustomResult {
    name: String,
    result: ResultOutcome,
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    log: Vec<String>,
}

/// Results the test reported itself in `data/results.yaml` or `.json`
pub fn check_custom(
    test: &Test,
    paths: &TestPaths,
    base: &dyn Fn(ResultOutcome) -> TestResult,
) -> Vec<TestResult> {
    let yaml = paths.data().join("results.yaml");
    let json = paths.data().join("results.json");

    let parsed: Result<Vec<CustomResult>, String> = if yaml.exists() {
        std::fs::read_to_string(&yaml)
            .map_err(|e| e.to_string())
            .and_then(|content| serde_yaml::from_str(&content).map_err(|e| e.to_string()))
    } else if json.exists() {
        std::fs::read_to_string(&json)
            .map_err(|e| e.to_string())
            .and_then(|content| serde_json::from_str(&content).map_err(|e| e.to_string()))
    } else {
        return vec![base(ResultOutcome::Error).with_note("custom results file not found")];
    };

    let custom = match parsed {
        Ok(custom) => custom,
        Err(err) => {
            return vec![base(ResultOutcome::Error).with_note(format!("invalid custom results: {}", err))]
        }
    };
    if custom.is_empty() {
        return vec![base(ResultOutcome::Error).with_note("custom results are empty")];
    }

    custom
        .into_iter()
        .map(|item| {
            let name = if item.name == "/" || item.name.is_empty() {
                test.name.clone()
            } else if item.name.starts_with('/') {
                format!("{}{}", test.name, item.name)
            } else {
                format!("{}/{}", test.name, item.name)
            };
            let mut result = base(item.result);
            result.name = name;
            result.note = item.note;
            if item.duration.is_some() {
                result.duration = item.duration;
            }
            result.log.extend(item.log);
            result
        })
        .collect()
}

pub fn save_results(workdir: &Path, results: &[TestResult]) -> Result<(), TestbedError> {
    write_yaml(&workdir.join(RESULTS_FILENAME), &results)
}

pub fn load_results(workdir: &Path) -> Result<Option<Vec<TestResult>>, TestbedError> {
    read_yaml(&workdir.join(RESULTS_FILENAME))
}

/// Test metadata as exposed to the test through `TESTBED_TEST_METADATA`
#[derive(Debug, Serialize)]
pub struct TestMetadata<'a> {
    #[serde(flatten)]
    pub test: &'a Test,
    pub serial_number: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn paths(dir: &Path, test: &Test) -> TestPaths {
        let paths = TestPaths::new(dir, test, None);
        std::fs::create_dir_all(paths.data()).unwrap();
        paths
    }

    fn finished(returncode: i32) -> Test {
        let mut test = Test::new("/tests/smoke", "./run.sh");
        test.returncode = Some(returncode);
        test.real_duration = Some("00:00:01".into());
        test
    }

    #[test]
    fn test_paths_layout() {
        let test = Test::new("/tests/smoke", "true");
        let single = TestPaths::new(Path::new("/w/execute"), &test, None);
        assert_eq!(single.directory(), Path::new("/w/execute/data/tests-smoke"));
        assert_eq!(
            single.reboot_request(),
            PathBuf::from("/w/execute/data/tests-smoke/data/reboot-request")
        );

        let multi = TestPaths::new(Path::new("/w/execute"), &test, Some("client"));
        assert_eq!(multi.output(), PathBuf::from("/w/execute/data/client/tests-smoke/output.txt"));
    }

    #[test]
    fn test_environment_variables() {
        let mut test = Test::new("/tests/smoke", "true").with_framework(Framework::Beakerlib);
        test.reboot_count = 2;
        test.environment.insert("FOO".into(), "test".into());
        let paths = TestPaths::new(Path::new("/w/execute"), &test, None);

        let mut extra = Environment::new();
        extra.insert("FOO".into(), "extra".into());
        let env = test_environment(&test, &paths, Path::new(REMOTE_SCRIPTS_DIRECTORY), &extra);

        assert_eq!(env["FOO"], "test");
        assert_eq!(env["TESTBED_TEST_NAME"], "/tests/smoke");
        assert_eq!(env["TESTBED_TEST_DATA"], "/w/execute/data/tests-smoke/data");
        assert_eq!(env["REBOOTCOUNT"], "2");
        assert_eq!(env["RSTRNT_REBOOTCOUNT"], "2");
        assert_eq!(env["BEAKERLIB_DIR"], "/w/execute/data/tests-smoke");
        assert_eq!(
            env["BEAKERLIB_COMMAND_SUBMIT_LOG"],
            "bash /usr/local/bin/testbed-file-submit"
        );
    }

    #[test]
    fn test_reboot_request_parsing() {
        assert_eq!(RebootRequest::parse("{}"), RebootRequest::default());
        assert_eq!(
            RebootRequest::parse(r#"{"command": "systemctl kexec", "timeout": "120"}"#),
            RebootRequest {
                command: Some("systemctl kexec".into()),
                timeout: Some(120)
            }
        );
        assert_eq!(
            RebootRequest::parse(r#"{"command": "", "timeout": ""}"#),
            RebootRequest::default()
        );
        assert_eq!(
            RebootRequest::parse(r#"{"command": 42, "timeout": 30}"#),
            RebootRequest {
                command: None,
                timeout: Some(30)
            }
        );
        assert_eq!(RebootRequest::parse("not json"), RebootRequest::default());
    }

    #[tokio::test]
    async fn test_reboot_script_escapes_command() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join(REBOOT_SCRIPT.name);
        std::fs::write(&script, REBOOT_SCRIPT.content).unwrap();
        let marker = dir.path().join("data").join(REBOOT_REQUEST_FILENAME);

        let command = r#"systemctl kexec --message "x" --path C:\boot"#;
        let status = tokio::process::Command::new("bash")
            .arg(&script)
            .args(["-c", command, "-t", "60"])
            .env("TESTBED_REBOOT_REQUEST", &marker)
            .status()
            .await
            .unwrap();
        assert!(status.success());

        let content = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(
            RebootRequest::parse(&content),
            RebootRequest {
                command: Some(command.to_string()),
                timeout: Some(60)
            }
        );
    }

    #[test]
    fn test_check_shell_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = |code: i32| {
            let test = finished(code);
            let paths = paths(dir.path(), &test);
            check(&test, &paths, dir.path()).remove(0)
        };

        assert_eq!(outcome(0).result, ResultOutcome::Pass);
        assert_eq!(outcome(1).result, ResultOutcome::Fail);
        let timeout = outcome(124);
        assert_eq!(timeout.result, ResultOutcome::Error);
        assert_eq!(timeout.note.as_deref(), Some("timeout"));
        assert_eq!(outcome(2).result, ResultOutcome::Error);

        let result = outcome(0);
        assert_eq!(result.duration.as_deref(), Some("00:00:01"));
        assert_eq!(result.log, vec!["data/tests-smoke/output.txt"]);
    }

    #[test]
    fn test_check_result_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let test = finished(0);
        let paths = paths(dir.path(), &test);
        std::fs::write(paths.result_file(), "warn\n").unwrap();

        let results = check(&test, &paths, dir.path());
        assert_eq!(results[0].result, ResultOutcome::Warn);

        std::fs::write(paths.result_file(), "maybe").unwrap();
        let results = check(&test, &paths, dir.path());
        assert_eq!(results[0].result, ResultOutcome::Error);
        assert_eq!(results[0].note.as_deref(), Some("invalid result 'maybe'"));
    }

    #[test]
    fn test_check_beakerlib() {
        let dir = tempfile::tempdir().unwrap();
        let test = finished(0).with_framework(Framework::Beakerlib);
        let paths = paths(dir.path(), &test);

        let missing = check(&test, &paths, dir.path());
        assert_eq!(missing[0].result, ResultOutcome::Error);
        assert_eq!(missing[0].note.as_deref(), Some("beakerlib: TestResults FileError"));

        std::fs::write(
            paths.beakerlib_results(),
            "TESTRESULT_RESULT_STRING=FAIL\nTESTRESULT_STATE=complete\n",
        )
        .unwrap();
        assert_eq!(check(&test, &paths, dir.path())[0].result, ResultOutcome::Fail);

        std::fs::write(
            paths.beakerlib_results(),
            "TESTRESULT_RESULT_STRING=PASS\nTESTRESULT_STATE=incomplete\n",
        )
        .unwrap();
        let incomplete = check(&test, &paths, dir.path());
        assert_eq!(incomplete[0].result, ResultOutcome::Error);
        assert_eq!(incomplete[0].note.as_deref(), Some("beakerlib: State 'incomplete'"));
    }

    #[test]
    fn test_check_custom_results() {
        let dir = tempfile::tempdir().unwrap();
        let mut test = finished(1);
        test.result = ResultInterpret::Custom;
        let paths = paths(dir.path(), &test);

        let missing = check(&test, &paths, dir.path());
        assert_eq!(missing[0].note.as_deref(), Some("custom results file not found"));

        std::fs::write(
            paths.data().join("results.json"),
            r#"[{"name": "/first", "result": "pass"}, {"name": "second", "result": "fail", "note": "flaky"}]"#,
        )
        .unwrap();
        let results = check(&test, &paths, dir.path());
        let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["/tests/smoke/first", "/tests/smoke/second"]);
        assert_eq!(results[0].result, ResultOutcome::Pass);
        assert_eq!(results[1].note.as_deref(), Some("flaky"));

        std::fs::write(paths.data().join("results.yaml"), "[]").unwrap();
        let empty = check(&test, &paths, dir.path());
        assert_eq!(empty[0].note.as_deref(), Some("custom results are empty"));
    }

    #[test]
    fn test_results_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let results = vec![
            TestResult::new("/a", ResultOutcome::Pass),
            TestResult::new("/b", ResultOutcome::Error).with_note("aborted"),
        ];
        save_results(dir.path(), &results).unwrap();
        assert_eq!(load_results(dir.path()).unwrap(), Some(results));
    }
}
