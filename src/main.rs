// Testbed CLI - run tests through plans of six steps

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::*;
use regex::Regex;

use testbed::config::{resolve, OptionLayer, UserConfig};
use testbed::executor::SystemRunner;
use testbed::lint::lint_tree;
use testbed::logging::init_logging;
use testbed::output::{TerminalOutput, TestbedError};
use testbed::plugins::PluginRegistry;
use testbed::run::{Run, RunConfig, StepSelection};
use testbed::steps::{Step, StepKind};
use testbed::tree::Tree;

#[derive(Parser)]
#[command(
    name = "testbed",
    about = "Run tests on local and remote guests",
    version,
    disable_colored_help = true,
    term_width = 0,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the metadata tree
    #[arg(short, long, global = true, default_value = ".")]
    root: PathBuf,

    /// Show more details, repeat for even more
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Turn on debugging output, repeat for more
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    debug: u8,

    /// Show only errors and results
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
#[command(disable_colored_help = true)]
enum Commands {
    /// Run plans through the selected steps
    Run {
        /// Steps to run, all of them by default
        #[arg(value_parser = parse_step)]
        steps: Vec<StepKind>,

        /// Run id, a name under the workdir root or a full path
        #[arg(short, long)]
        id: Option<String>,

        /// Remove the run workdir before starting
        #[arg(long)]
        scratch: bool,

        /// Run done steps again
        #[arg(short, long)]
        force: bool,

        /// Run steps again, keeping the provisioned guests
        #[arg(long)]
        again: bool,

        /// Show what would be done without changing anything
        #[arg(long)]
        dry: bool,

        /// Run tests with the terminal attached
        #[arg(long)]
        interactive: bool,

        /// Stop after the first test which does not pass
        #[arg(short = 'x', long)]
        exit_first: bool,

        /// Do not show the progress line while tests run
        #[arg(long)]
        no_progress_bar: bool,

        /// Run all steps
        #[arg(short, long)]
        all: bool,

        /// Run steps up to and including this one
        #[arg(long, value_parser = parse_step)]
        until: Option<StepKind>,

        /// Run steps from this one on
        #[arg(long, value_parser = parse_step)]
        since: Option<StepKind>,

        /// Run steps after this one
        #[arg(long, value_parser = parse_step)]
        after: Option<StepKind>,

        /// Run steps before this one
        #[arg(long, value_parser = parse_step)]
        before: Option<StepKind>,

        /// Skip the given step (can repeat)
        #[arg(long, value_parser = parse_step)]
        skip: Vec<StepKind>,

        /// Run only plans matching the regular expression (can repeat)
        #[arg(short, long = "plan")]
        plans: Vec<Regex>,
    },

    /// Check tests and plans for problems
    Lint,

    /// List plans
    Plans {
        /// Regular expressions the plan names should match
        filters: Vec<Regex>,
    },

    /// List tests
    Tests {
        /// Regular expressions the test names should match
        filters: Vec<Regex>,
    },
}

fn parse_step(value: &str) -> Result<StepKind, String> {
    value.parse()
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = run_cli(cli).await;

    match result {
        Ok(code) => std::process::exit(code),
        Err(TestbedError::Exit { code, message }) => {
            if let Some(message) = message {
                eprintln!("{}", message);
            }
            std::process::exit(code);
        }
        Err(e) => {
            eprint!("{}", e);
            std::process::exit(2);
        }
    }
}

async fn run_cli(cli: Cli) -> Result<i32, TestbedError> {
    let user_config = match UserConfig::default_path() {
        Some(path) => UserConfig::load(&path)?,
        None => UserConfig::default(),
    };

    let global = OptionLayer {
        verbose: (cli.verbose > 0).then_some(cli.verbose),
        debug: (cli.debug > 0).then_some(cli.debug),
        quiet: cli.quiet.then_some(true),
        ..Default::default()
    };

    match cli.command {
        Commands::Run {
            steps,
            id,
            scratch,
            force,
            again,
            dry,
            interactive,
            exit_first,
            no_progress_bar,
            all,
            until,
            since,
            after,
            before,
            skip,
            plans,
        } => {
            let cli_layer = OptionLayer {
                force: force.then_some(true),
                again: again.then_some(true),
                dry: dry.then_some(true),
                interactive: interactive.then_some(true),
                exit_first: exit_first.then_some(true),
                no_progress_bar: no_progress_bar.then_some(true),
                ..global
            };
            let layer = cli_layer.over(&user_config.options).with_env();
            setup_logging(&layer);

            let config = RunConfig {
                id,
                scratch,
                workdir_root: user_config.workdir_root(),
                layer,
                selection: StepSelection {
                    all,
                    steps,
                    until,
                    since,
                    after,
                    before,
                    skip,
                },
                plan_filters: plans,
            };
            run_plans(&cli.root, config).await
        }
        Commands::Lint => {
            setup_logging(&global.over(&user_config.options).with_env());
            lint(&cli.root)
        }
        Commands::Plans { filters } => {
            let layer = global.over(&user_config.options).with_env();
            setup_logging(&layer);
            list_plans(&cli.root, &filters, resolve(&[&layer]).verbose)
        }
        Commands::Tests { filters } => {
            let layer = global.over(&user_config.options).with_env();
            setup_logging(&layer);
            list_tests(&cli.root, &filters, resolve(&[&layer]).verbose)
        }
    }
}

fn setup_logging(layer: &OptionLayer) {
    if let Err(e) = init_logging(resolve(&[layer]).debug) {
        eprintln!("{}", e);
    }
}

async fn run_plans(root: &Path, config: RunConfig) -> Result<i32, TestbedError> {
    let tree = Tree::load(root)?;
    let output = Arc::new(TerminalOutput::new(&resolve(&[&config.layer])));

    let mut run = Run::new(tree, config, output, Arc::new(SystemRunner))?;
    run.go().await
}

fn lint(root: &Path) -> Result<i32, TestbedError> {
    let tree = Tree::load(root)?;
    let problems = lint_tree(&tree, &PluginRegistry::with_defaults());

    if problems.is_empty() {
        println!("{} No problems found", "✓".green());
        return Ok(0);
    }

    for problem in &problems {
        println!("{} {}", "✗".red(), problem);
    }
    println!();
    println!("{} problem(s) found", problems.len().to_string().red().bold());
    Ok(1)
}

fn list_plans(root: &Path, filters: &[Regex], verbose: u8) -> Result<i32, TestbedError> {
    let tree = Tree::load(root)?;

    for plan in tree.plans(filters) {
        println!("{}", plan.name.green());
        if verbose == 0 {
            continue;
        }
        if let Some(summary) = &plan.summary {
            println!("    {} {}", "summary:".dimmed(), summary);
        }
        for kind in StepKind::ALL {
            let methods: Vec<String> = Step::normalize(kind, plan.step(kind))
                .into_iter()
                .map(|data| data.how)
                .collect();
            println!("    {} {}", format!("{}:", kind).dimmed(), methods.join(", "));
        }
    }
    Ok(0)
}

fn list_tests(root: &Path, filters: &[Regex], verbose: u8) -> Result<i32, TestbedError> {
    let tree = Tree::load(root)?;

    for test in tree.tests(filters) {
        println!("{}", test.name.green());
        if verbose == 0 {
            continue;
        }
        if let Some(summary) = &test.summary {
            println!("    {} {}", "summary:".dimmed(), summary);
        }
        println!("    {} {}", "test:".dimmed(), test.test);
        println!("    {} {}", "duration:".dimmed(), test.duration);
    }
    Ok(0)
}
