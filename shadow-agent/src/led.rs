use std::{sync::Arc, time::Duration};

use derive_more::Display;
use tracing::warn;

use crate::{process::CommandRunner, state::FsmState};

/// Out-of-process helper owning the LED IPC file.
pub const LED_CLI: &str = "cnc-led-cli";

const LED_CLI_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum LedMode {
    #[display("READY")]
    Ready,
    #[display("SYNC")]
    Sync,
    #[display("BUSY")]
    Busy,
    #[display("ERROR")]
    Error,
}

/// Fixed FSM-to-LED mapping.
pub fn mode_for(state: FsmState) -> LedMode {
    match state {
        FsmState::Idle | FsmState::Ready => LedMode::Ready,
        FsmState::ChangeDetected => LedMode::Sync,
        FsmState::BuildSlotA
        | FsmState::BuildSlotB
        | FsmState::ExportStop
        | FsmState::ExportStart => LedMode::Busy,
        FsmState::Error => LedMode::Error,
    }
}

/// Best-effort LED mode publisher; failures never disturb the FSM.
pub struct LedSink {
    runner: Arc<dyn CommandRunner>,
}

impl LedSink {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub fn publish(&self, mode: LedMode) {
        let mode = mode.to_string();
        let output = self
            .runner
            .run_with_timeout(LED_CLI, &[&mode], LED_CLI_TIMEOUT);
        if !output.success() {
            warn!(%mode, detail = %output.detail(), "LED mode update failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{process::CmdOutput, test_utils::FakeRunner};

    #[test]
    fn it_maps_every_fsm_state_to_a_mode() {
        assert_eq!(mode_for(FsmState::Idle), LedMode::Ready);
        assert_eq!(mode_for(FsmState::Ready), LedMode::Ready);
        assert_eq!(mode_for(FsmState::ChangeDetected), LedMode::Sync);
        assert_eq!(mode_for(FsmState::BuildSlotA), LedMode::Busy);
        assert_eq!(mode_for(FsmState::BuildSlotB), LedMode::Busy);
        assert_eq!(mode_for(FsmState::ExportStop), LedMode::Busy);
        assert_eq!(mode_for(FsmState::ExportStart), LedMode::Busy);
        assert_eq!(mode_for(FsmState::Error), LedMode::Error);
    }

    #[test]
    fn it_publishes_the_upper_case_mode_name() {
        let runner = Arc::new(FakeRunner::new());
        LedSink::new(Arc::clone(&runner) as Arc<dyn CommandRunner>).publish(LedMode::Sync);

        assert_eq!(
            runner.calls(),
            vec![vec![LED_CLI.to_owned(), "SYNC".to_owned()]]
        );
    }

    #[test]
    fn it_swallows_helper_failures() {
        let runner = Arc::new(FakeRunner::new());
        runner.script(LED_CLI, CmdOutput::err(2, "unknown mode"));
        // Must not panic or surface the error.
        LedSink::new(runner).publish(LedMode::Error);
    }
}
