// Discover step - gather the tests to run

use std::path::Path;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use super::{read_yaml, write_yaml, StepKind};
use crate::output::errors::TestbedError;
use crate::output::TerminalOutput;
use crate::plugins::{Phase, PhaseContext, PhaseData, Plugin, PluginRegistry};
use crate::tree::Test;

/// Discovered tests saved in the discover workdir
pub const TESTS_FILENAME: &str = "tests.yaml";

pub fn register(registry: &mut PluginRegistry) {
    registry.register(StepKind::Discover, "fmf", |data| {
        Ok(Phase::Plugin(Box::new(DiscoverFmf::new(data)?)))
    });
    registry.register(StepKind::Discover, "shell", |data| {
        Ok(Phase::Plugin(Box::new(DiscoverShell::new(data)?)))
    });
}

/// Tests selected from the metadata tree
pub struct DiscoverFmf {
    data: PhaseData,
    filters: Vec<Regex>,
}

impl DiscoverFmf {
    pub fn new(data: PhaseData) -> Result<Self, TestbedError> {
        let filters = data
            .get_strings("test")
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    TestbedError::specification(format!("Invalid test filter '{}': {}", pattern, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DiscoverFmf { data, filters })
    }
}

#[async_trait]
impl Plugin for DiscoverFmf {
    fn data(&self) -> &PhaseData {
        &self.data
    }

    async fn go(&mut self, ctx: &mut PhaseContext<'_>) -> Result<(), TestbedError> {
        let tree = ctx.plan.tree.clone();
        ctx.output.info("directory", tree.root().display().to_string(), 2);
        if !self.filters.is_empty() {
            ctx.output
                .info("tests", self.data.get_strings("test").join(", "), 2);
        }

        let tests = tree
            .tests(&self.filters)
            .into_iter()
            .filter(|test| test.enabled)
            .collect();
        collect(ctx, self.name(), tree.root(), tests)
    }
}

/// Tests listed inline in the plan
pub struct DiscoverShell {
    data: PhaseData,
    tests: Vec<Test>,
}

impl DiscoverShell {
    pub fn new(data: PhaseData) -> Result<Self, TestbedError> {
        let raw = data.extra.get("tests").cloned().unwrap_or_default();
        let tests: Vec<Test> = if raw.is_null() {
            Vec::new()
        } else {
            serde_yaml::from_value(raw).map_err(|e| {
                TestbedError::specification(format!("Invalid tests of phase '{}': {}", data.name(), e))
            })?
        };

        for test in &tests {
            if test.name.is_empty() {
                return Err(TestbedError::specification(format!(
                    "Every test of phase '{}' needs a name.",
                    data.name()
                )));
            }
        }

        Ok(DiscoverShell { data, tests })
    }
}

#[async_trait]
impl Plugin for DiscoverShell {
    fn data(&self) -> &PhaseData {
        &self.data
    }

    fn lint(&self) -> Vec<String> {
        self.tests
            .iter()
            .flat_map(|test| {
                test.lint()
                    .into_iter()
                    .map(move |problem| format!("test '{}': {}", test.name, problem))
            })
            .collect()
    }

    async fn go(&mut self, ctx: &mut PhaseContext<'_>) -> Result<(), TestbedError> {
        let root = ctx.plan.tree.root().to_path_buf();
        let tests = self
            .tests
            .iter()
            .map(|test| {
                let mut test = test.clone();
                if !test.name.starts_with('/') {
                    test.name = format!("/{}", test.name);
                }
                test
            })
            .collect();
        collect(ctx, self.name(), &root, tests)
    }
}

/// Copy the tree into the phase workdir and point tests into the copy
fn collect(
    ctx: &mut PhaseContext<'_>,
    phase: &str,
    root: &Path,
    tests: Vec<Test>,
) -> Result<(), TestbedError> {
    let destination = ctx.workdir.join("tests");
    if !ctx.options.dry {
        if destination.exists() {
            std::fs::remove_dir_all(&destination).map_err(|e| {
                TestbedError::file(format!("Failed to clean test directory: {}", e), &destination)
            })?;
        }
        copy_tree(root, &destination, &ctx.plan.workdir)?;
    }

    for mut test in tests {
        let relative = test.path.clone().unwrap_or_default();
        let relative = relative.trim_matches('/');
        test.path = Some(if relative.is_empty() {
            format!("/{}/tests", phase)
        } else {
            format!("/{}/tests/{}", phase, relative)
        });
        debug!(test = %test.name, path = ?test.path, "test discovered");
        ctx.state.tests.push(test);
    }
    Ok(())
}

/// Recursively copy a directory, skipping VCS metadata and `skip` itself
pub fn copy_tree(source: &Path, destination: &Path, skip: &Path) -> Result<(), TestbedError> {
    let file_error = |e: std::io::Error, path: &Path| {
        TestbedError::file(format!("Failed to copy tests: {}", e), path)
    };

    std::fs::create_dir_all(destination).map_err(|e| file_error(e, destination))?;
    let entries = std::fs::read_dir(source).map_err(|e| file_error(e, source))?;

    for entry in entries {
        let entry = entry.map_err(|e| file_error(e, source))?;
        let path = entry.path();
        if entry.file_name() == ".git" || path == skip {
            continue;
        }

        let target = destination.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| file_error(e, &path))?;
        if file_type.is_dir() {
            copy_tree(&path, &target, skip)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(&path).map_err(|e| file_error(e, &path))?;
            std::os::unix::fs::symlink(link, &target).map_err(|e| file_error(e, &target))?;
        } else {
            std::fs::copy(&path, &target).map_err(|e| file_error(e, &path))?;
        }
    }
    Ok(())
}

pub fn show_tests(output: &TerminalOutput, tests: &[Test]) {
    for test in tests {
        output.verbose("test", &test.name, 1, 3);
    }
}

pub fn save_tests(workdir: &Path, tests: &[Test]) -> Result<(), TestbedError> {
    write_yaml(&workdir.join(TESTS_FILENAME), &tests)
}

pub fn load_tests(workdir: &Path) -> Result<Option<Vec<Test>>, TestbedError> {
    read_yaml(&workdir.join(TESTS_FILENAME))
}
