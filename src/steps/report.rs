// Report step - show the results

use async_trait::async_trait;

use super::StepKind;
use crate::output::errors::TestbedError;
use crate::plugins::{Phase, PhaseContext, PhaseData, Plugin, PluginRegistry};

pub fn register(registry: &mut PluginRegistry) {
    registry.register(StepKind::Report, "display", |data| {
        Ok(Phase::Plugin(Box::new(ReportDisplay::new(data))))
    });
}

/// Print results to the terminal
pub struct ReportDisplay {
    data: PhaseData,
}

impl ReportDisplay {
    pub fn new(data: PhaseData) -> Self {
        ReportDisplay { data }
    }
}

#[async_trait]
impl Plugin for ReportDisplay {
    fn data(&self) -> &PhaseData {
        &self.data
    }

    async fn go(&mut self, ctx: &mut PhaseContext<'_>) -> Result<(), TestbedError> {
        for result in &ctx.state.results {
            ctx.output.print_result(result, None, 2);
            for log in &result.log {
                ctx.output.verbose("log", log, 1, 3);
            }
        }
        Ok(())
    }
}
