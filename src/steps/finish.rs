// Finish step - final scripts and guest cleanup

use super::prepare::PrepareShell;
use super::StepKind;
use crate::output::errors::TestbedError;
use crate::output::TerminalOutput;
use crate::plugins::{Phase, PlanState, PluginRegistry};

pub fn register(registry: &mut PluginRegistry) {
    // Same as prepare scripts, just at the end of the plan
    registry.register(StepKind::Finish, "shell", |data| {
        Ok(Phase::Plugin(Box::new(PrepareShell::new(data))))
    });
}

/// Stop and remove every guest of the plan
pub async fn release_guests(
    output: &TerminalOutput,
    state: &PlanState,
) -> Result<(), TestbedError> {
    for guest in &state.guests {
        output.verbose("guest", format!("stopping {}", guest.full_name()), 1, 2);
        guest.stop().await?;
        guest.remove().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::testing::FakeGuest;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_release_guests() {
        let dir = tempfile::tempdir().unwrap();
        let guest = Arc::new(FakeGuest::local("default-0", dir.path()));
        let mut state = PlanState::default();
        state.guests.push(guest.clone());

        release_guests(&TerminalOutput::silent(), &state)
            .await
            .unwrap();
        assert!(guest.executed.lock().is_empty());
        assert_eq!(state.guests.len(), 1);
    }
}
