use std::{
    fs,
    path::{Path, PathBuf},
};

use cnc_slot_ctrl::Slot;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::atomic;

pub type Result<T> = std::result::Result<T, StateError>;

#[allow(missing_docs)]
#[derive(thiserror::Error, Debug)]
pub enum StateError {
    #[error("failed reading shadow state file")]
    Read(#[source] std::io::Error),
    #[error("failed writing shadow state file")]
    Write(#[source] std::io::Error),
    #[error("malformed shadow state file")]
    Parse(#[source] serde_json::Error),
    #[error("failed encoding shadow state")]
    Encode(#[source] serde_json::Error),
    #[error("inconsistent shadow state: {0}")]
    Invalid(&'static str),
}

/// The finite state machine a rebuild cycle walks through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FsmState {
    #[display("IDLE")]
    Idle,
    #[display("CHANGE_DETECTED")]
    ChangeDetected,
    #[display("BUILD_SLOT_A")]
    BuildSlotA,
    #[display("BUILD_SLOT_B")]
    BuildSlotB,
    #[display("EXPORT_STOP")]
    ExportStop,
    #[display("EXPORT_START")]
    ExportStart,
    #[display("READY")]
    Ready,
    #[display("ERROR")]
    Error,
}

impl FsmState {
    /// The build state targeting `slot`.
    pub fn building(slot: Slot) -> FsmState {
        match slot {
            Slot::A => FsmState::BuildSlotA,
            Slot::B => FsmState::BuildSlotB,
        }
    }
}

/// Closed classification of everything that can go wrong in a cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum ErrorCode {
    #[serde(rename = "ERR_MISSING_DEPENDENCY")]
    #[display("ERR_MISSING_DEPENDENCY")]
    MissingDependency,
    #[serde(rename = "ERR_REBUILD_TIMEOUT")]
    #[display("ERR_REBUILD_TIMEOUT")]
    RebuildTimeout,
    #[serde(rename = "ERR_LOCK_CONFLICT")]
    #[display("ERR_LOCK_CONFLICT")]
    LockConflict,
    #[serde(rename = "ERR_USB_STOP_TIMEOUT")]
    #[display("ERR_USB_STOP_TIMEOUT")]
    UsbStopTimeout,
    #[serde(rename = "ERR_USB_START_TIMEOUT")]
    #[display("ERR_USB_START_TIMEOUT")]
    UsbStartTimeout,
    #[serde(rename = "ERR_FAT_INVALID")]
    #[display("ERR_FAT_INVALID")]
    FatInvalid,
    #[serde(rename = "ERR_MISSING_SUDO")]
    #[display("ERR_MISSING_SUDO")]
    MissingSudo,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub code: ErrorCode,
    pub message: String,
}

/// The persisted FSM record. Mutated only by the orchestrator, always through
/// [`StateStore::save`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowState {
    pub fsm_state: FsmState,
    pub active_slot: Slot,
    pub rebuild_slot: Option<Slot>,
    pub run_id: u64,
    pub last_error: Option<LastError>,
    pub rebuild_counter: u64,
}

impl ShadowState {
    pub fn initial(active_slot: Slot) -> Self {
        Self {
            fsm_state: FsmState::Idle,
            active_slot,
            rebuild_slot: None,
            run_id: 0,
            last_error: None,
            rebuild_counter: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.rebuild_counter != self.run_id {
            return Err(StateError::Invalid("rebuild_counter must equal run_id"));
        }
        if self.rebuild_slot == Some(self.active_slot) {
            return Err(StateError::Invalid(
                "rebuild_slot must differ from active_slot",
            ));
        }
        Ok(())
    }
}

/// Single JSON document holding the [`ShadowState`].
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no state has ever been persisted.
    pub fn load(&self) -> Result<Option<ShadowState>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StateError::Read(err)),
        };
        let state: ShadowState =
            serde_json::from_slice(&raw).map_err(StateError::Parse)?;
        state.validate()?;
        Ok(Some(state))
    }

    /// Like [`StateStore::load`], but a missing or malformed record is
    /// replaced with a fresh default.
    pub fn load_or_initialize(&self, initial_slot: Slot) -> Result<ShadowState> {
        match self.load() {
            Ok(Some(state)) => Ok(state),
            Ok(None) => self.reset(initial_slot),
            Err(err @ (StateError::Parse(_) | StateError::Invalid(_))) => {
                warn!(%err, path = %self.path.display(), "resetting unusable shadow state");
                self.reset(initial_slot)
            }
            Err(err) => Err(err),
        }
    }

    /// Atomic replace with fsync of the file and its parent directory.
    pub fn save(&self, state: &ShadowState) -> Result<()> {
        state.validate()?;
        let mut payload = serde_json::to_vec(state).map_err(StateError::Encode)?;
        payload.push(b'\n');
        atomic::replace_file(&self.path, &payload, "shadow-state-")
            .map_err(StateError::Write)
    }

    fn reset(&self, initial_slot: Slot) -> Result<ShadowState> {
        let state = ShadowState::initial(initial_slot);
        self.save(&state)?;
        Ok(state)
    }
}
