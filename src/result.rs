// Test results

use std::fmt;
use std::str::FromStr;

use colored::*;
use serde::{Deserialize, Serialize};

use crate::output::errors::TestbedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultOutcome {
    Pass,
    Fail,
    Error,
    Warn,
    Info,
}

impl ResultOutcome {
    pub const ALL: [ResultOutcome; 5] = [
        ResultOutcome::Pass,
        ResultOutcome::Fail,
        ResultOutcome::Info,
        ResultOutcome::Warn,
        ResultOutcome::Error,
    ];

    /// Outcome that does not stop an `--exit-first` run
    pub fn is_success(&self) -> bool {
        matches!(self, ResultOutcome::Pass | ResultOutcome::Info)
    }

    fn colored(&self) -> ColoredString {
        let text = self.to_string();
        match self {
            ResultOutcome::Pass => text.green(),
            ResultOutcome::Fail => text.red(),
            ResultOutcome::Error => text.magenta(),
            ResultOutcome::Warn => text.yellow(),
            ResultOutcome::Info => text.blue(),
        }
    }
}

impl fmt::Display for ResultOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ResultOutcome::Pass => "pass",
            ResultOutcome::Fail => "fail",
            ResultOutcome::Error => "error",
            ResultOutcome::Warn => "warn",
            ResultOutcome::Info => "info",
        };
        write!(f, "{}", text)
    }
}

impl FromStr for ResultOutcome {
    type Err = TestbedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pass" => Ok(ResultOutcome::Pass),
            "fail" => Ok(ResultOutcome::Fail),
            "error" => Ok(ResultOutcome::Error),
            "warn" => Ok(ResultOutcome::Warn),
            "info" => Ok(ResultOutcome::Info),
            other => Err(TestbedError::specification(format!(
                "Invalid result outcome '{}'.",
                other
            ))),
        }
    }
}

/// Outcome of one test, or of one subtest reported by a custom results file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub result: ResultOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest: Option<String>,
    /// Log files relative to the execute step workdir
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<String>,
}

impl TestResult {
    pub fn new(name: impl Into<String>, result: ResultOutcome) -> Self {
        TestResult {
            name: name.into(),
            result,
            note: None,
            duration: None,
            guest: None,
            log: Vec::new(),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_duration(mut self, duration: Option<String>) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_guest(mut self, guest: impl Into<String>) -> Self {
        self.guest = Some(guest.into());
        self
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log.push(log.into());
        self
    }

    /// One-line colored summary, e.g. `pass /tests/smoke (on client)`
    pub fn show(&self) -> String {
        let mut line = format!("{} {}", self.result.colored(), self.name);
        if let Some(ref guest) = self.guest {
            line.push_str(&format!(" (on {})", guest));
        }
        if let Some(ref note) = self.note {
            line.push_str(&format!(" ({})", note));
        }
        line
    }
}

/// Human summary of outcomes, e.g. `1 test passed, 2 tests failed`
pub fn summary(results: &[TestResult]) -> String {
    let mut parts = Vec::new();
    for outcome in ResultOutcome::ALL {
        let count = results.iter().filter(|r| r.result == outcome).count();
        if count == 0 {
            continue;
        }
        let noun = if count == 1 { "test" } else { "tests" };
        let verb = match outcome {
            ResultOutcome::Pass => "passed",
            ResultOutcome::Fail => "failed",
            ResultOutcome::Info => "info",
            ResultOutcome::Warn => "warn",
            ResultOutcome::Error => "errored",
        };
        parts.push(format!("{} {} {}", count, noun, verb));
    }

    if parts.is_empty() {
        "no results found".to_string()
    } else {
        parts.join(", ")
    }
}

/// Process exit code for a set of results
///
/// 0 when everything passed, 1 on any failure, 2 on errors or warnings
/// without failures, 3 when there is nothing to report.
pub fn exit_code(results: &[TestResult]) -> i32 {
    if results.is_empty() {
        return 3;
    }
    if results.iter().any(|r| r.result == ResultOutcome::Fail) {
        return 1;
    }
    if results
        .iter()
        .any(|r| matches!(r.result, ResultOutcome::Error | ResultOutcome::Warn))
    {
        return 2;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_outcome_parsing() {
        assert_eq!("PASS".parse::<ResultOutcome>().unwrap(), ResultOutcome::Pass);
        assert_eq!(" fail\n".parse::<ResultOutcome>().unwrap(), ResultOutcome::Fail);
        assert!("skipped".parse::<ResultOutcome>().is_err());
        assert!(ResultOutcome::Info.is_success());
        assert!(!ResultOutcome::Warn.is_success());
    }

    #[test]
    fn test_show() {
        let result = TestResult::new("/tests/smoke", ResultOutcome::Error)
            .with_guest("client")
            .with_note("timeout");
        let shown = result.show();
        let clean = console::strip_ansi_codes(&shown);
        assert_eq!(clean, "error /tests/smoke (on client) (timeout)");
    }

    #[test]
    fn test_summary_and_exit_code() {
        let results = vec![
            TestResult::new("/a", ResultOutcome::Pass),
            TestResult::new("/b", ResultOutcome::Pass),
            TestResult::new("/c", ResultOutcome::Error),
        ];
        assert_eq!(summary(&results), "2 tests passed, 1 test errored");
        assert_eq!(exit_code(&results), 2);

        let failed = vec![
            TestResult::new("/a", ResultOutcome::Error),
            TestResult::new("/b", ResultOutcome::Fail),
        ];
        assert_eq!(exit_code(&failed), 1);
        assert_eq!(exit_code(&[]), 3);
        assert_eq!(summary(&[]), "no results found");
        assert_eq!(exit_code(&[TestResult::new("/i", ResultOutcome::Info)]), 0);
    }

    #[test]
    fn test_yaml_shape() {
        let result = TestResult::new("/a", ResultOutcome::Pass).with_duration(Some("00:00:01".into()));
        let yaml = serde_yaml::to_string(&result).unwrap();
        assert!(yaml.contains("result: pass"));
        assert!(!yaml.contains("note"));
        let back: TestResult = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, result);
    }
}
