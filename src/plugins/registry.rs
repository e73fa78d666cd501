// Registry mapping a step and a `how` key to a phase factory

use std::collections::HashMap;

use super::{Phase, PhaseData};
use crate::output::errors::TestbedError;
use crate::steps::{self, StepKind};

/// Builds a phase from its configuration, validating the data
pub type PhaseFactory = fn(PhaseData) -> Result<Phase, TestbedError>;

/// Known phase implementations, filled by explicit registration
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: HashMap<(StepKind, String), PhaseFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in plugin and action
    pub fn with_defaults() -> Self {
        let mut registry = PluginRegistry::new();
        steps::discover::register(&mut registry);
        steps::provision::register(&mut registry);
        steps::prepare::register(&mut registry);
        steps::execute::register(&mut registry);
        steps::report::register(&mut registry);
        steps::finish::register(&mut registry);
        steps::actions::register(&mut registry);
        registry
    }

    pub fn register(&mut self, step: StepKind, how: &str, factory: PhaseFactory) {
        self.factories.insert((step, how.to_string()), factory);
    }

    pub fn supports(&self, step: StepKind, how: &str) -> bool {
        self.factories.contains_key(&(step, how.to_string()))
    }

    /// Supported `how` values of a step, sorted
    pub fn methods(&self, step: StepKind) -> Vec<String> {
        let mut methods: Vec<String> = self
            .factories
            .keys()
            .filter(|(kind, _)| *kind == step)
            .map(|(_, how)| how.clone())
            .collect();
        methods.sort();
        methods
    }

    pub fn create(&self, step: StepKind, data: PhaseData) -> Result<Phase, TestbedError> {
        match self.factories.get(&(step, data.how.clone())) {
            Some(factory) => factory(data),
            None => Err(TestbedError::General {
                message: format!("Unsupported {} method '{}'.", step, data.how),
                suggestion: Some(format!(
                    "Supported methods: {}",
                    self.methods(step).join(", ")
                )),
            }),
        }
    }
}
