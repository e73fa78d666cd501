// Internal executor - run tests one by one directly on each guest

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use super::{
    check, test_environment, RebootRequest, TestMetadata, TestPaths, HELPER_SCRIPTS,
    REMOTE_SCRIPTS_DIRECTORY, SCRIPTS_DIRECTORY, TEST_WRAPPER_FILENAME,
};
use crate::executor::{Environment, ShellScript, PROCESS_TIMEOUT, SHELL_OPTIONS};
use crate::guest::{ExecuteRequest, Guest, Transfer};
use crate::output::errors::{RunError, TestbedError};
use crate::output::TerminalOutput;
use crate::plugins::{PhaseContext, PhaseData, Plugin};
use crate::result::{ResultOutcome, TestResult};
use crate::steps::{write_yaml, StepKind};
use crate::tree::{duration_to_seconds, format_duration, Framework, Test};

pub struct ExecuteInternal {
    data: PhaseData,
}

impl ExecuteInternal {
    pub fn new(data: PhaseData) -> Result<Self, TestbedError> {
        Ok(ExecuteInternal { data })
    }

    /// Data directories and metadata of every test, before the workdir push
    fn prepare_tests(
        &self,
        ctx: &PhaseContext<'_>,
        tests: &[Test],
        guest_dir: Option<&str>,
    ) -> Result<(), TestbedError> {
        let execute_workdir = ctx.step_workdir();
        for (index, test) in tests.iter().enumerate() {
            let paths = TestPaths::new(&execute_workdir, test, guest_dir);
            std::fs::create_dir_all(paths.data()).map_err(|e| {
                TestbedError::file(format!("Failed to create test data directory: {}", e), paths.data())
            })?;
            let metadata = TestMetadata {
                test,
                serial_number: index + 1,
            };
            write_yaml(&paths.metadata(), &metadata)?;
        }
        Ok(())
    }

    /// Write helper scripts, install them on remote guests
    ///
    /// Returns the directory holding the scripts on the guest.
    async fn prepare_scripts(
        &self,
        ctx: &PhaseContext<'_>,
        guest: &dyn Guest,
    ) -> Result<PathBuf, TestbedError> {
        let local = ctx.step_workdir().join(SCRIPTS_DIRECTORY);
        for script in HELPER_SCRIPTS {
            let path = local.join(script.name);
            ctx.write(&path, script.content)?;
            make_executable(&path)?;
        }

        if guest.is_localhost() {
            return Ok(local);
        }

        for script in HELPER_SCRIPTS {
            let destination = Path::new(REMOTE_SCRIPTS_DIRECTORY).join(script.name);
            guest
                .push(
                    Transfer::from_path(local.join(script.name))
                        .with_destination(destination)
                        .with_options(["-p", "--chmod=755"]),
                )
                .await?;
        }
        Ok(PathBuf::from(REMOTE_SCRIPTS_DIRECTORY))
    }

    /// Run a single test, recording its return code and duration
    async fn execute(
        &self,
        ctx: &PhaseContext<'_>,
        test: &mut Test,
        guest: &dyn Guest,
        paths: &TestPaths,
        scripts: &Path,
    ) -> Result<(), TestbedError> {
        debug!(test = %test.name, framework = %test.framework, "execute test");
        let (workdir, environment) = test_context(ctx, test, guest, paths, scripts);

        let command = match test.framework {
            Framework::Shell => format!("{}; {}", SHELL_OPTIONS, test.test),
            Framework::Beakerlib => test.test.clone(),
        };
        let wrapper = workdir.join(TEST_WRAPPER_FILENAME);
        ctx.write(&wrapper, &command)?;
        make_executable(&wrapper)?;
        guest
            .push(
                Transfer::from_path(&wrapper)
                    .with_destination(&wrapper)
                    .with_options(["-s", "-p", "--chmod=755"]),
            )
            .await?;

        let remote = if ctx.options.interactive {
            format!("./{}", TEST_WRAPPER_FILENAME)
        } else {
            format!(
                "{}; ./{} </dev/null |& cat",
                SHELL_OPTIONS, TEST_WRAPPER_FILENAME
            )
        };

        let timeout = duration_to_seconds(&test.duration)?;
        let request = ExecuteRequest::new(ShellScript::new(remote))
            .with_cwd(&workdir)
            .with_env(environment)
            .with_join(true)
            .with_interactive(ctx.options.interactive)
            .with_log(ctx.output.test_output_logger(2))
            .with_timeout(Some(Duration::from_secs(timeout)))
            .with_test_session(true)
            .with_friendly_command(test.test.clone());

        let start = Instant::now();
        let stdout = match guest.execute(request).await {
            Ok(output) => {
                test.returncode = Some(0);
                output.stdout
            }
            Err(TestbedError::Run(err)) => {
                let RunError {
                    returncode, stdout, ..
                } = *err;
                if returncode == PROCESS_TIMEOUT {
                    debug!(test = %test.name, duration = %test.duration, "test duration exceeded");
                }
                test.returncode = Some(returncode);
                stdout
            }
            Err(err) => return Err(err),
        };
        test.real_duration = Some(format_duration(start.elapsed()));

        append_output(&paths.output(), stdout.as_deref().unwrap_or_default())
    }

    async fn run_tests(
        &self,
        ctx: &PhaseContext<'_>,
        guest: Arc<dyn Guest>,
        multihost: bool,
    ) -> Result<Vec<TestResult>, TestbedError> {
        let execute_workdir = ctx.step_workdir();
        let guest_dir = multihost.then(|| guest.name().to_string());
        let mut tests = ctx.state.tests.clone();

        self.prepare_tests(ctx, &tests, guest_dir.as_deref())?;
        let scripts = self.prepare_scripts(ctx, guest.as_ref()).await?;
        guest.push(Transfer::new()).await?;

        let shift = if ctx.options.verbose < 2 { 1 } else { 2 };
        let mut results = Vec::new();
        let mut index = 0;

        // Reboot repeats the same index, no enumerate here
        while index < tests.len() {
            let progress = format!("{}/{}", index + 1, tests.len());
            let test = &mut tests[index];
            ctx.output.progress(&progress, &test.name);
            ctx.output.verbose(
                "test",
                test.summary.clone().unwrap_or_else(|| test.name.clone()),
                2,
                1,
            );

            let paths = TestPaths::new(&execute_workdir, test, guest_dir.as_deref());
            self.execute(ctx, test, guest.as_ref(), &paths, &scripts).await?;

            // Beakerlib backups are of no use on the runner
            let mut pull = Transfer::from_path(paths.directory());
            if test.framework == Framework::Beakerlib {
                pull = pull.with_extend_options([
                    "--exclude".to_string(),
                    paths.directory().join("backup*").display().to_string(),
                ]);
            }
            guest.pull(pull).await?;

            let mut test_results = check(test, &paths, &execute_workdir);
            if multihost {
                test_results = test_results
                    .into_iter()
                    .map(|result| result.with_guest(guest.name()))
                    .collect();
            }

            if paths.reboot_request().exists() {
                debug!(test = %test.name, %progress, "reboot requested");
                if ctx.output.verbosity() > 0 {
                    ctx.output.print_test(test.real_duration.as_deref(), &test.name, &progress, shift);
                }
                match handle_reboot(&ctx.output, test, guest.as_ref(), &paths).await {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(TestbedError::RebootTimeout { .. }) => {
                        for result in &mut test_results {
                            result.result = ResultOutcome::Error;
                            result.note = Some("reboot timeout".to_string());
                        }
                    }
                    Err(err) => return Err(err),
                }
            }

            let abort = paths.abort().exists();
            if abort {
                for result in &mut test_results {
                    result.note = Some("aborted".to_string());
                }
            }
            let failed = ctx.options.exit_first
                && test_results.iter().any(|result| !result.result.is_success());

            if ctx.output.verbosity() > 0 {
                for result in &test_results {
                    ctx.output.print_result(result, Some(&progress), shift);
                }
            }
            let last = test_results.last().cloned();
            results.extend(test_results);

            if abort || failed {
                ctx.output.clear_progress();
                let what = if abort { "aborted" } else { "failed" };
                ctx.output.warn(
                    format!("Test {} {}, stopping execution.", test.name, what),
                    2,
                );
                break;
            }
            index += 1;

            // Login hooks look at the last result of the test
            if let (Some(result), false) = (&last, ctx.login_hooks.is_empty()) {
                let (cwd, environment) = test_context(ctx, test, guest.as_ref(), &paths, &scripts);
                for hook in ctx.login_hooks {
                    hook.login(&ctx.output, guest.as_ref(), result, &cwd, environment.clone())
                        .await?;
                }
            }
        }

        ctx.output.clear_progress();

        debug!(guest = %guest.full_name(), "pull the plan data directory");
        guest
            .pull(Transfer::from_path(ctx.plan.data_directory()))
            .await?;
        Ok(results)
    }
}

#[async_trait]
impl Plugin for ExecuteInternal {
    fn data(&self) -> &PhaseData {
        &self.data
    }

    async fn go(&mut self, ctx: &mut PhaseContext<'_>) -> Result<(), TestbedError> {
        if ctx.options.exit_first {
            ctx.output.verbose("exit-first", "true", 1, 2);
        }
        // Nothing to do in dry mode
        if ctx.options.dry {
            return Ok(());
        }

        let guests = ctx.state.guests.clone();
        if guests.is_empty() {
            ctx.output.warn("No guests available, no tests executed.", 2);
            return Ok(());
        }

        let multihost = ctx.state.is_multihost();
        for guest in guests {
            if multihost {
                ctx.output.info("guest", guest.full_name(), 2);
            }
            let results = self.run_tests(ctx, guest, multihost).await?;
            ctx.state.results.extend(results);
        }
        Ok(())
    }
}

/// Working directory and environment of a test on the guest
fn test_context(
    ctx: &PhaseContext<'_>,
    test: &Test,
    guest: &dyn Guest,
    paths: &TestPaths,
    scripts: &Path,
) -> (PathBuf, Environment) {
    // Tests run in their own directory inside the discover workdir
    let workdir = ctx
        .plan
        .step_workdir(StepKind::Discover)
        .join(test.unrooted_path());

    let mut extra = Environment::new();
    if guest.is_localhost() {
        let path = std::env::var("PATH").unwrap_or_default();
        extra.insert("PATH".into(), format!("{}:{}", scripts.display(), path));
    }
    (workdir, test_environment(test, paths, scripts, &extra))
}

/// Reboot the guest if the test asked for it
///
/// Returns `true` when the guest was rebooted and the test should run
/// again with the increased reboot counter.
pub async fn handle_reboot(
    output: &TerminalOutput,
    test: &mut Test,
    guest: &dyn Guest,
    paths: &TestPaths,
) -> Result<bool, TestbedError> {
    let marker = paths.reboot_request();
    if !marker.exists() {
        return Ok(false);
    }

    test.reboot_count += 1;
    debug!(test = %test.name, count = test.reboot_count, "reboot during test");

    let content = std::fs::read_to_string(&marker)
        .map_err(|e| TestbedError::file(format!("Failed to read reboot request: {}", e), &marker))?;
    let request = RebootRequest::parse(&content);
    std::fs::remove_file(&marker)
        .map_err(|e| TestbedError::file(format!("Failed to remove reboot request: {}", e), &marker))?;

    // The marker removal must reach the guest before it comes back
    guest.push(Transfer::from_path(paths.data())).await?;

    let command = request.command.map(ShellScript::new);
    let timeout = request.timeout.map(Duration::from_secs);

    let rebooted = match guest.reboot(false, command.clone(), timeout).await {
        Ok(rebooted) => rebooted,
        Err(err) if err.is_run() => {
            let command = command.map(|c| c.to_string()).unwrap_or_else(|| "reboot".into());
            output.fail(
                format!("Failed to reboot guest using the custom command '{}'.", command),
                2,
            );
            return Err(err);
        }
        Err(TestbedError::Provision { .. }) => {
            output.warn("Guest does not support soft reboot, trying hard reboot.", 2);
            guest.reboot(true, None, timeout).await?
        }
        Err(err) => return Err(err),
    };

    if !rebooted {
        return Err(TestbedError::RebootTimeout {
            message: "Reboot timed out.".to_string(),
        });
    }
    Ok(true)
}

fn make_executable(path: &Path) -> Result<(), TestbedError> {
    if !path.exists() {
        return Ok(());
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| TestbedError::file(format!("Failed to set permissions: {}", e), path))
}

fn append_output(path: &Path, output: &str) -> Result<(), TestbedError> {
    let file_error = |e: std::io::Error| TestbedError::file(format!("Failed to save test output: {}", e), path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(file_error)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(file_error)?;
    file.write_all(output.as_bytes()).map_err(file_error)
}
