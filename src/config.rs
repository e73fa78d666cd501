// Layered run options and user configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::output::errors::TestbedError;

/// Environment variable selecting the parent directory of run workdirs
pub const WORKDIR_ROOT_ENV: &str = "TESTBED_WORKDIR_ROOT";

/// Default parent directory of run workdirs
pub const WORKDIR_ROOT: &str = "/var/tmp/testbed";

/// Environment variable overriding the debug level
pub const DEBUG_ENV: &str = "TESTBED_DEBUG";

/// One layer of options, as given on the command line, in the user
/// configuration or in plan/step/phase data. Unset keys are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct OptionLayer {
    pub verbose: Option<u8>,
    pub debug: Option<u8>,
    pub quiet: Option<bool>,
    pub force: Option<bool>,
    pub dry: Option<bool>,
    pub again: Option<bool>,
    pub interactive: Option<bool>,
    pub exit_first: Option<bool>,
    pub no_progress_bar: Option<bool>,
}

impl OptionLayer {
    /// Take every key set in `self`, fall back to `base` for the rest
    pub fn over(&self, base: &OptionLayer) -> OptionLayer {
        OptionLayer {
            verbose: self.verbose.or(base.verbose),
            debug: self.debug.or(base.debug),
            quiet: self.quiet.or(base.quiet),
            force: self.force.or(base.force),
            dry: self.dry.or(base.dry),
            again: self.again.or(base.again),
            interactive: self.interactive.or(base.interactive),
            exit_first: self.exit_first.or(base.exit_first),
            no_progress_bar: self.no_progress_bar.or(base.no_progress_bar),
        }
    }

    /// Apply `TESTBED_DEBUG` on top of this layer
    pub fn with_env(mut self) -> OptionLayer {
        if let Some(level) = std::env::var(DEBUG_ENV)
            .ok()
            .and_then(|value| value.trim().parse::<u8>().ok())
        {
            self.debug = Some(level);
        }
        self
    }

    /// Extract option keys from a free-form phase data mapping
    pub fn from_extra(extra: &std::collections::BTreeMap<String, serde_yaml::Value>) -> OptionLayer {
        let flag = |key: &str| extra.get(key).and_then(serde_yaml::Value::as_bool);
        OptionLayer {
            interactive: flag("interactive"),
            exit_first: flag("exit-first"),
            no_progress_bar: flag("no-progress-bar"),
            ..OptionLayer::default()
        }
    }
}

/// Resolved options in effect at one level of the hierarchy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    pub verbose: u8,
    pub debug: u8,
    pub quiet: bool,
    pub force: bool,
    pub dry: bool,
    pub again: bool,
    pub interactive: bool,
    pub exit_first: bool,
    pub no_progress_bar: bool,
}

impl Options {
    /// Re-run the step even if already done
    pub fn rerun(&self) -> bool {
        self.force || self.again
    }
}

/// Resolve options from a parent chain ordered from the root down to the leaf
///
/// `quiet`, `force` and `dry` are on if any layer turns them on. `verbose`
/// and `debug` take the nearest non-zero value. Other keys take the value of
/// the outermost layer which sets them.
pub fn resolve(chain: &[&OptionLayer]) -> Options {
    let any = |get: fn(&OptionLayer) -> Option<bool>| chain.iter().any(|l| get(l) == Some(true));
    let nearest = |get: fn(&OptionLayer) -> Option<u8>| {
        chain
            .iter()
            .rev()
            .filter_map(|l| get(l))
            .find(|level| *level > 0)
            .unwrap_or(0)
    };
    let outermost = |get: fn(&OptionLayer) -> Option<bool>| {
        chain.iter().find_map(|l| get(l)).unwrap_or(false)
    };

    Options {
        verbose: nearest(|l| l.verbose),
        debug: nearest(|l| l.debug),
        quiet: any(|l| l.quiet),
        force: any(|l| l.force),
        dry: any(|l| l.dry),
        again: outermost(|l| l.again),
        interactive: outermost(|l| l.interactive),
        exit_first: outermost(|l| l.exit_first),
        no_progress_bar: outermost(|l| l.no_progress_bar),
    }
}

/// Contents of the user configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct UserConfig {
    pub options: OptionLayer,
    pub workdir_root: Option<PathBuf>,
}

impl UserConfig {
    /// Default location, `$XDG_CONFIG_HOME/testbed/config.yaml`
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
            if !dir.is_empty() {
                return Some(PathBuf::from(dir).join("testbed").join("config.yaml"));
            }
        }
        std::env::var("HOME")
            .ok()
            .map(|home| PathBuf::from(home).join(".config").join("testbed").join("config.yaml"))
    }

    /// Load the configuration, a missing file gives the defaults
    pub fn load(path: &Path) -> Result<UserConfig, TestbedError> {
        if !path.exists() {
            debug!(path = %path.display(), "no user configuration");
            return Ok(UserConfig::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| TestbedError::file(format!("Failed to read config: {}", e), path))?;
        if content.trim().is_empty() {
            return Ok(UserConfig::default());
        }

        serde_yaml::from_str(&content).map_err(|e| TestbedError::Specification {
            message: format!("Invalid configuration: {}", e),
            file: Some(path.display().to_string()),
        })
    }

    /// Parent directory for run workdirs: environment, then config, then default
    pub fn workdir_root(&self) -> PathBuf {
        match std::env::var(WORKDIR_ROOT_ENV) {
            Ok(root) if !root.is_empty() => PathBuf::from(root),
            _ => self
                .workdir_root
                .clone()
                .unwrap_or_else(|| PathBuf::from(WORKDIR_ROOT)),
        }
    }
}
