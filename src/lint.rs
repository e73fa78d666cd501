// Lint - check tests and plans without running anything

use std::fmt;

use crate::plugins::{Phase, PluginRegistry};
use crate::steps::provision::check_unique_names;
use crate::steps::{Step, StepKind};
use crate::tree::Tree;

/// A problem found in one test or plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintProblem {
    pub node: String,
    pub message: String,
}

impl LintProblem {
    fn new(node: &str, message: impl Into<String>) -> Self {
        LintProblem {
            node: node.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for LintProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.node, self.message)
    }
}

/// Collect every problem in the tree, never stopping at the first one
pub fn lint_tree(tree: &Tree, registry: &PluginRegistry) -> Vec<LintProblem> {
    let mut problems = Vec::new();

    for test in tree.all_tests() {
        for message in test.lint() {
            problems.push(LintProblem::new(&test.name, message));
        }
    }

    for plan in tree.plans(&[]) {
        for kind in StepKind::ALL {
            let phases = Step::normalize(kind, plan.step(kind));

            if kind == StepKind::Provision {
                if let Err(err) = check_unique_names(&phases) {
                    problems.push(LintProblem::new(&plan.name, err.message()));
                }
            }

            for data in phases {
                let phase_name = format!("{} phase '{}'", kind, data.name());
                match registry.create(kind, data) {
                    Ok(Phase::Plugin(plugin)) => {
                        for message in plugin.lint() {
                            problems.push(LintProblem::new(
                                &plan.name,
                                format!("{}: {}", phase_name, message),
                            ));
                        }
                    }
                    Ok(Phase::Action(_)) => {}
                    Err(err) => problems.push(LintProblem::new(&plan.name, err.message())),
                }
            }
        }
    }

    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    const BROKEN: &str = r#"
tests:
  /good:
    test: "true"
  /slow:
    test: "sleep 1"
    duration: forever
  /empty:
    test: ""
plans:
  /fine:
    provision:
      how: local
  /broken:
    provision:
      - how: connect
        name: box
      - how: local
        name: box
    execute:
      how: magic
"#;

    #[test]
    fn test_clean_tree_has_no_problems() {
        let tree = Tree::from_yaml(
            Path::new("/tree"),
            "tests:\n  /a:\n    test: \"true\"\nplans:\n  /p:\n    discover:\n      how: fmf\n",
        )
        .unwrap();
        assert!(lint_tree(&tree, &PluginRegistry::with_defaults()).is_empty());
    }

    #[test]
    fn test_problems_are_aggregated() {
        let tree = Tree::from_yaml(Path::new("/tree"), BROKEN).unwrap();
        let problems = lint_tree(&tree, &PluginRegistry::with_defaults());

        let nodes: Vec<&str> = problems.iter().map(|p| p.node.as_str()).collect();
        assert_eq!(nodes, vec!["/slow", "/empty", "/broken", "/broken", "/broken"]);

        assert!(problems[0].message.contains("Invalid duration 'forever'"));
        assert!(problems[2].message.contains("must be unique"));
        assert!(problems[3].message.contains("'guest' is required"));
        assert!(problems[4].message.contains("Unsupported execute method 'magic'"));
    }
}
