// Testbed - test execution orchestrator
//
// Plans go through six steps: discover tests, provision guests, prepare
// them, execute the tests, report results and finish by cleaning up.

pub mod config;
pub mod executor;
pub mod guest;
pub mod lint;
pub mod logging;
pub mod output;
pub mod plugins;
pub mod result;
pub mod run;
pub mod steps;
pub mod tree;

pub use config::{OptionLayer, Options, UserConfig};
pub use output::{TerminalOutput, TestbedError};
pub use result::{ResultOutcome, TestResult};
pub use run::{Run, RunConfig, StepSelection};
pub use steps::StepKind;
pub use tree::{Test, Tree};

/// Version of the testbed tool
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{OptionLayer, Options};
    pub use crate::executor::{Command, ShellScript, SystemRunner};
    pub use crate::guest::Guest;
    pub use crate::output::{TerminalOutput, TestbedError};
    pub use crate::run::{Run, RunConfig, StepSelection};
    pub use crate::tree::Tree;
}
