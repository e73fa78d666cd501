// Rich terminal output for testbed

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;

use crate::config::Options;
use crate::executor::LineLogger;
use crate::result::TestResult;

/// Spaces per indentation level
const INDENT: usize = 4;

/// Terminal output manager
///
/// Everything user-facing goes to stdout except warnings and failures,
/// which go to stderr. Diagnostic logging is left to `tracing`.
pub struct TerminalOutput {
    verbose: u8,
    debug: u8,
    quiet: bool,
    no_progress_bar: bool,
    is_tty: bool,
    progress: Mutex<Option<ProgressBar>>,
}

impl TerminalOutput {
    pub fn new(options: &Options) -> Self {
        let is_tty = std::io::stdout().is_terminal();

        // Respect NO_COLOR environment variable (https://no-color.org/)
        // Also disable colors if not a TTY
        if std::env::var("NO_COLOR").is_ok() || !is_tty {
            colored::control::set_override(false);
        }

        TerminalOutput {
            verbose: options.verbose,
            debug: options.debug,
            quiet: options.quiet,
            no_progress_bar: options.no_progress_bar,
            is_tty,
            progress: Mutex::new(None),
        }
    }

    /// Output which prints nothing, for tests and nested runs
    pub fn silent() -> Self {
        TerminalOutput {
            verbose: 0,
            debug: 0,
            quiet: true,
            no_progress_bar: true,
            is_tty: false,
            progress: Mutex::new(None),
        }
    }

    pub fn verbosity(&self) -> u8 {
        self.verbose
    }

    fn indent(shift: usize) -> String {
        " ".repeat(shift * INDENT)
    }

    fn line(&self, shift: usize, key: &str, value: Option<&str>, color: Option<Color>) -> String {
        let key = match color {
            Some(color) => key.color(color).to_string(),
            None => key.to_string(),
        };
        match value {
            Some(value) => format!("{}{}: {}", Self::indent(shift), key.green(), value),
            None => format!("{}{}", Self::indent(shift), key),
        }
    }

    fn print(&self, line: String) {
        let progress = self.progress.lock();
        match progress.as_ref() {
            Some(bar) => bar.suspend(|| println!("{}", line)),
            None => println!("{}", line),
        }
    }

    /// Run header with the workdir
    pub fn print_run_header(&self, workdir: &str) {
        if self.quiet {
            return;
        }
        println!("{}", workdir.magenta());
    }

    /// Plan name and summary
    pub fn print_plan_header(&self, name: &str, summary: Option<&str>) {
        if self.quiet {
            return;
        }
        println!();
        println!("{}", name.green().bold());
        if let Some(summary) = summary {
            self.print(self.line(1, "summary", Some(summary), None));
        }
    }

    /// Step name, e.g. `discover`
    pub fn print_step_header(&self, step: &str) {
        if self.quiet {
            return;
        }
        println!();
        self.print(format!("{}{}", Self::indent(1), step.blue().bold()));
    }

    pub fn info(&self, key: &str, value: impl AsRef<str>, shift: usize) {
        if self.quiet {
            return;
        }
        self.print(self.line(shift, key, Some(value.as_ref()), None));
    }

    /// Plain message without a key
    pub fn message(&self, message: impl AsRef<str>, shift: usize) {
        if self.quiet {
            return;
        }
        self.print(format!("{}{}", Self::indent(shift), message.as_ref()));
    }

    /// Shown only with at least `level` verbosity (or in debug mode)
    pub fn verbose(&self, key: &str, value: impl AsRef<str>, level: u8, shift: usize) {
        if self.quiet || (self.verbose < level && self.debug < level) {
            return;
        }
        self.print(self.line(shift, key, Some(value.as_ref()), None));
    }

    pub fn warn(&self, message: impl AsRef<str>, shift: usize) {
        self.clear_progress();
        eprintln!("{}{} {}", Self::indent(shift), "warn:".yellow().bold(), message.as_ref());
    }

    pub fn fail(&self, message: impl AsRef<str>, shift: usize) {
        self.clear_progress();
        eprintln!("{}{} {}", Self::indent(shift), "fail:".red().bold(), message.as_ref());
    }

    /// Result line, with an optional `index/total` marker
    pub fn print_result(&self, result: &TestResult, progress: Option<&str>, shift: usize) {
        if self.quiet {
            return;
        }
        self.print(Self::test_line(shift, result.duration.as_deref(), &result.show(), progress));
    }

    /// Line of a test which has no result yet, e.g. before a reboot
    pub fn print_test(&self, duration: Option<&str>, name: &str, progress: &str, shift: usize) {
        if self.quiet {
            return;
        }
        self.print(Self::test_line(shift, duration, name, Some(progress)));
    }

    fn test_line(shift: usize, duration: Option<&str>, text: &str, progress: Option<&str>) -> String {
        // Missing duration keeps the column aligned
        let duration = match duration {
            Some(duration) => duration.cyan().to_string(),
            None => " ".repeat(8),
        };
        let mut line = format!("{}{} {}", Self::indent(shift), duration, text);
        if let Some(progress) = progress {
            line.push_str(&format!(" [{}]", progress));
        }
        line
    }

    /// Update the single-line test progress indicator
    ///
    /// Suppressed in verbose mode, without a terminal or when disabled. In
    /// debug mode each update becomes a plain line instead.
    pub fn progress(&self, progress: &str, test_name: &str) {
        if self.quiet || self.verbose > 0 || !self.is_tty || self.no_progress_bar {
            return;
        }

        let message = format!("{} [{}]", test_name, progress);
        if self.debug > 0 {
            println!("{}{}", Self::indent(1), message);
            return;
        }

        let mut slot = self.progress.lock();
        let bar = slot.get_or_insert_with(|| {
            let bar = ProgressBar::new_spinner();
            let style = ProgressStyle::default_spinner()
                .template("{prefix:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            bar.set_style(style);
            bar.set_prefix(format!("{}progress:", Self::indent(2)));
            bar.enable_steady_tick(Duration::from_millis(200));
            bar
        });
        bar.set_message(message);
    }

    /// Remove the progress line from the screen
    pub fn clear_progress(&self) {
        if let Some(bar) = self.progress.lock().take() {
            bar.finish_and_clear();
        }
    }

    /// Line logger for test output, shown from verbosity level 3
    pub fn test_output_logger(self: &Arc<Self>, shift: usize) -> LineLogger {
        let output = Arc::clone(self);
        Arc::new(move |header: &str, line: &str| {
            output.verbose(header, line, 3, shift);
        })
    }

    /// Line logger for command output of prepare/finish scripts
    pub fn command_logger(self: &Arc<Self>, shift: usize) -> LineLogger {
        let output = Arc::clone(self);
        Arc::new(move |header: &str, line: &str| {
            output.verbose(header, line, 2, shift);
        })
    }
}
