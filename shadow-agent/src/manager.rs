use std::{
    fs, io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use cnc_slot_ctrl::{Slot, SlotCtrl};
use tracing::{debug, error, info, warn};

use crate::{
    history::{HistoryEntry, HistoryLog, Outcome, Trigger},
    led::{self, LedSink},
    lock::LockManager,
    process::{CommandRunner, SystemRunner},
    rebuild::{RebuildConfig, RebuildEngine, RebuildError},
    settings::Settings,
    state::{ErrorCode, FsmState, LastError, ShadowState, StateError, StateStore},
    usb::{UsbError, UsbManager},
    watcher::{WatcherError, WatcherService},
};

const WATCH_POLL_TIMEOUT: Duration = Duration::from_secs(1);

#[allow(missing_docs)]
#[derive(thiserror::Error, Debug)]
pub enum StartError {
    #[error(transparent)]
    Slot(#[from] cnc_slot_ctrl::Error),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("failed creating the master directory")]
    MasterDir(#[source] io::Error),
    #[error(transparent)]
    Watcher(#[from] WatcherError),
    #[error("failed spawning the watch loop")]
    Spawn(#[source] io::Error),
}

/// A failed step inside one rebuild cycle.
#[allow(missing_docs)]
#[derive(thiserror::Error, Debug)]
pub enum CycleError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Slot(#[from] cnc_slot_ctrl::Error),
    #[error(transparent)]
    Rebuild(RebuildError),
    #[error("failed to stop the USB export: {0}")]
    UsbStop(UsbError),
    #[error("failed to start the USB export: {0}")]
    UsbStart(UsbError),
}

/// Classify a failed cycle step into the closed error-code set.
pub fn error_code(error: &CycleError) -> ErrorCode {
    match error {
        CycleError::UsbStop(UsbError::MissingSudo)
        | CycleError::UsbStart(UsbError::MissingSudo) => ErrorCode::MissingSudo,
        CycleError::UsbStop(_) => ErrorCode::UsbStopTimeout,
        CycleError::UsbStart(_) => ErrorCode::UsbStartTimeout,
        CycleError::Rebuild(_) | CycleError::State(_) | CycleError::Slot(_) => {
            ErrorCode::RebuildTimeout
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed,
    Failed(ErrorCode),
    LockConflict,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManualTrigger {
    Started,
    AlreadyRunning,
}

struct CycleReport {
    run_id: u64,
    active_before: Slot,
    rebuild_slot: Slot,
}

/// Owns the FSM, the debounce loop and the rebuild cycle. Created once at
/// bootstrap and shared by reference with the watch-loop thread, the
/// manual-trigger worker and any status reader.
pub struct ShadowManager {
    settings: Settings,
    state_store: StateStore,
    slots: SlotCtrl,
    rebuild: RebuildEngine,
    usb: UsbManager,
    lock: LockManager,
    history: HistoryLog,
    led: LedSink,
    manual_busy: AtomicBool,
    debounce: Duration,
}

impl ShadowManager {
    pub fn new(settings: Settings) -> Result<Self, RebuildError> {
        Self::with_runners(
            settings,
            Arc::new(SystemRunner::new()),
            Arc::new(SystemRunner::escalating()),
        )
    }

    /// Test seam: route every external binary through the given runners. The
    /// privileged runner serves the gadget module operations.
    pub fn with_runners(
        settings: Settings,
        runner: Arc<dyn CommandRunner>,
        privileged_runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, RebuildError> {
        let rebuild = RebuildEngine::new(
            RebuildConfig {
                master_dir: settings.master_dir.clone(),
                slot_size_mb: settings.shadow_slot_size_mb,
                tmp_suffix: settings.shadow_tmp_suffix.clone(),
                volume_label: settings.usb_label.clone(),
            },
            Arc::clone(&runner),
        )?;
        let usb = UsbManager::new(
            privileged_runner,
            settings.usb_stop_timeout(),
            settings.usb_start_timeout(),
        );
        let slots = SlotCtrl::new(settings.slot_config());
        let state_store = StateStore::new(settings.shadow_state_file.clone());
        let lock = LockManager::new(settings.shadow_lock_file.clone());
        let history = HistoryLog::new(
            settings.shadow_history_file.clone(),
            settings.shadow_history_limit,
        );
        let led = LedSink::new(runner);
        let debounce = settings.debounce();

        Ok(Self {
            settings,
            state_store,
            slots,
            rebuild,
            usb,
            lock,
            history,
            led,
            manual_busy: AtomicBool::new(false),
            debounce,
        })
    }

    /// Bootstrap the FSM and spawn the watch loop.
    pub fn start(self: &Arc<Self>) -> Result<(), StartError> {
        self.slots.cleanup_tmp_files()?;
        if let Err(err) = fs::create_dir_all(&self.settings.master_dir) {
            self.set_error(
                ErrorCode::MissingDependency,
                &format!("cannot create master directory: {err}"),
            );
            return Err(StartError::MasterDir(err));
        }

        let state = self
            .state_store
            .load_or_initialize(self.settings.active_slot)?;
        let active_slot = self.read_or_heal_active_slot()?;
        let state = self.normalize_state(state, active_slot)?;

        let mut watcher = WatcherService::new(self.settings.master_dir.clone());
        if let Err(err) = watcher.start() {
            self.set_error(ErrorCode::MissingDependency, &err.to_string());
            return Err(err.into());
        }

        info!(
            state = %state.fsm_state,
            %active_slot,
            state_file = %self.state_store.path().display(),
            lock_file = %self.lock.path().display(),
            watch_dir = %self.settings.master_dir.display(),
            "shadow bootstrap complete"
        );

        let manager = Arc::clone(self);
        thread::Builder::new()
            .name("cnc-shadow-watch".into())
            .spawn(move || manager.watch_loop(watcher))
            .map_err(StartError::Spawn)?;
        Ok(())
    }

    fn watch_loop(&self, watcher: WatcherService) {
        loop {
            let Some(event) = watcher.poll_event(WATCH_POLL_TIMEOUT) else {
                continue;
            };
            info!(%event, "change detected");
            self.debounce_window(&watcher);
            self.run_cycle(Trigger::Watch);
        }
    }

    /// Trailing-edge debounce: every further event restarts the window, the
    /// cycle begins once a full window passes quietly.
    fn debounce_window(&self, watcher: &WatcherService) {
        if self.debounce.is_zero() {
            return;
        }
        let mut deadline = Instant::now() + self.debounce;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            match watcher.poll_event(deadline - now) {
                Some(event) => {
                    debug!(%event, "debounce coalesced event");
                    deadline = Instant::now() + self.debounce;
                }
                None => return,
            }
        }
    }

    /// Request a rebuild independently of the watcher. At most one manual
    /// request is in flight; further requests report `AlreadyRunning` and do
    /// not queue.
    pub fn trigger_manual_rebuild(self: &Arc<Self>) -> io::Result<ManualTrigger> {
        if self
            .manual_busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(ManualTrigger::AlreadyRunning);
        }

        let manager = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("cnc-shadow-manual".into())
            .spawn(move || {
                manager.run_cycle(Trigger::Manual);
                manager.manual_busy.store(false, Ordering::SeqCst);
            });
        match spawned {
            Ok(_) => Ok(ManualTrigger::Started),
            Err(err) => {
                self.manual_busy.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// One synchronous manual cycle, used by `--oneshot`.
    pub fn run_manual_blocking(&self) -> CycleOutcome {
        self.run_cycle(Trigger::Manual)
    }

    /// One full rebuild cycle under the exclusive rebuild lock.
    pub fn run_cycle(&self, trigger: Trigger) -> CycleOutcome {
        let started_at = crate::history::utc_timestamp();
        let begun = Instant::now();

        let guard = match self.lock.try_acquire() {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                return self.handle_lock_conflict(
                    trigger,
                    "another rebuild holds the shadow lock".to_owned(),
                    started_at,
                    begun,
                )
            }
            Err(err) => {
                return self.handle_lock_conflict(
                    trigger,
                    format!("cannot acquire the shadow lock: {err}"),
                    started_at,
                    begun,
                )
            }
        };

        let outcome = match self.run_cycle_locked() {
            Ok(report) => {
                self.append_history(
                    trigger,
                    Outcome::Ok,
                    report.active_before,
                    report.rebuild_slot,
                    report.rebuild_slot,
                    started_at,
                    begun,
                    None,
                );
                info!(run_id = report.run_id, "rebuild cycle done");
                CycleOutcome::Completed
            }
            Err(err) => {
                let code = error_code(&err);
                let message = err.to_string();
                error!(%code, %message, "rebuild cycle failed");
                self.set_error(code, &message);
                let active = self.persisted_active_slot();
                self.append_history(
                    trigger,
                    Outcome::Error,
                    active,
                    active.opposite(),
                    active,
                    started_at,
                    begun,
                    Some(LastError { code, message }),
                );
                CycleOutcome::Failed(code)
            }
        };
        drop(guard);
        outcome
    }

    fn run_cycle_locked(&self) -> Result<CycleReport, CycleError> {
        let mut state = self
            .state_store
            .load_or_initialize(self.settings.active_slot)?;
        let active_slot = self.slots.read_active_slot()?;
        let rebuild_slot = self.slots.rebuild_slot_for(active_slot);
        let rebuild_path = self.slots.slot_path(rebuild_slot).to_path_buf();

        state.fsm_state = FsmState::ChangeDetected;
        state.active_slot = active_slot;
        state.rebuild_slot = Some(rebuild_slot);
        state.last_error = None;
        self.save_state(&state)?;

        state.fsm_state = FsmState::building(rebuild_slot);
        state.run_id += 1;
        state.rebuild_counter = state.run_id;
        self.save_state(&state)?;
        info!(
            run_id = state.run_id,
            %active_slot,
            %rebuild_slot,
            "rebuild started"
        );

        self.rebuild
            .full_rebuild(&rebuild_path)
            .map_err(CycleError::Rebuild)?;

        state.fsm_state = FsmState::ExportStop;
        self.save_state(&state)?;
        self.usb.stop_export().map_err(CycleError::UsbStop)?;

        state.fsm_state = FsmState::ExportStart;
        self.save_state(&state)?;
        self.usb
            .start_export(&rebuild_path)
            .map_err(CycleError::UsbStart)?;

        self.slots.write_active_slot(rebuild_slot)?;
        state.active_slot = rebuild_slot;
        state.rebuild_slot = None;
        state.fsm_state = FsmState::Ready;
        self.save_state(&state)?;

        Ok(CycleReport {
            run_id: state.run_id,
            active_before: active_slot,
            rebuild_slot,
        })
    }

    fn handle_lock_conflict(
        &self,
        trigger: Trigger,
        message: String,
        started_at: String,
        begun: Instant,
    ) -> CycleOutcome {
        warn!(?trigger, %message, "rebuild lock conflict");
        // A manual conflict is observational: a rebuild is already running
        // and will produce its own outcome.
        if trigger == Trigger::Watch {
            self.set_error(ErrorCode::LockConflict, &message);
        }
        let active = self.persisted_active_slot();
        self.append_history(
            trigger,
            Outcome::LockConflict,
            active,
            active.opposite(),
            active,
            started_at,
            begun,
            None,
        );
        CycleOutcome::LockConflict
    }

    /// Persisted state for status readers (the upload UI reads this file
    /// directly as well).
    pub fn state(&self) -> Result<Option<ShadowState>, StateError> {
        self.state_store.load()
    }

    /// Recent history, newest first.
    pub fn history(&self, limit: usize) -> Vec<HistoryEntry> {
        self.history.recent(limit)
    }

    fn read_or_heal_active_slot(&self) -> Result<Slot, cnc_slot_ctrl::Error> {
        match self.slots.read_active_slot() {
            Ok(slot) => Ok(slot),
            Err(cnc_slot_ctrl::Error::InvalidMarker { path, value }) => {
                let initial = self.slots.initial_slot();
                warn!(
                    marker = %path.display(),
                    %value,
                    %initial,
                    "healing invalid active-slot marker"
                );
                self.slots.write_active_slot(initial)?;
                Ok(initial)
            }
            Err(err) => Err(err),
        }
    }

    /// Keep a persisted IDLE/READY state that agrees with the marker;
    /// anything else (a crash mid-cycle) forces IDLE with no rebuild slot.
    fn normalize_state(
        &self,
        mut state: ShadowState,
        active_slot: Slot,
    ) -> Result<ShadowState, StateError> {
        if state.active_slot == active_slot
            && matches!(state.fsm_state, FsmState::Idle | FsmState::Ready)
        {
            return Ok(state);
        }
        state.active_slot = active_slot;
        state.rebuild_slot = None;
        state.fsm_state = FsmState::Idle;
        self.save_state(&state)?;
        Ok(state)
    }

    fn save_state(&self, state: &ShadowState) -> Result<(), StateError> {
        self.state_store.save(state)?;
        self.led.publish(led::mode_for(state.fsm_state));
        Ok(())
    }

    /// ERROR is sticky until the next cycle's CHANGE_DETECTED clears it.
    fn set_error(&self, code: ErrorCode, message: &str) {
        let mut state = match self
            .state_store
            .load_or_initialize(self.settings.active_slot)
        {
            Ok(state) => state,
            Err(err) => {
                error!(%err, "cannot persist error state");
                return;
            }
        };
        state.fsm_state = FsmState::Error;
        state.rebuild_slot = None;
        state.last_error = Some(LastError {
            code,
            message: message.to_owned(),
        });
        if let Err(err) = self.save_state(&state) {
            error!(%err, "cannot persist error state");
        }
    }

    fn persisted_active_slot(&self) -> Slot {
        self.state_store
            .load()
            .ok()
            .flatten()
            .map(|state| state.active_slot)
            .unwrap_or(self.settings.active_slot)
    }

    #[allow(clippy::too_many_arguments)]
    fn append_history(
        &self,
        trigger: Trigger,
        result: Outcome,
        active_slot_before: Slot,
        rebuild_slot: Slot,
        active_slot_after: Slot,
        started_at: String,
        begun: Instant,
        error: Option<LastError>,
    ) {
        let run_id = self
            .state_store
            .load()
            .ok()
            .flatten()
            .map(|state| state.run_id)
            .unwrap_or(0);
        let entry = HistoryEntry {
            trigger,
            result,
            run_id,
            active_slot_before,
            rebuild_slot,
            active_slot_after,
            started_at,
            finished_at: crate::history::utc_timestamp(),
            duration_ms: begun.elapsed().as_millis() as u64,
            error,
        };
        if let Err(err) = self.history.append(entry) {
            warn!(%err, "failed appending shadow history entry");
        }
    }
}
