//! End-to-end rebuild cycles against a tempdir layout, with every external
//! binary faked.

use std::{
    fs,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use cnc_shadow_agent::{
    history::{Outcome, Trigger},
    lock::LockManager,
    manager::{CycleOutcome, ShadowManager},
    process::{CmdOutput, CommandRunner},
    state::{ErrorCode, FsmState, ShadowState},
    test_utils::FakeRunner,
    Settings, Slot,
};
use tempfile::TempDir;

const LSMOD_WITH_GADGET: &str = "Module                  Size  Used by\n\
                                 g_mass_storage         16384  0\n";

fn test_settings(dir: &TempDir) -> Settings {
    Settings {
        master_dir: dir.path().join("master"),
        usb_img_a: dir.path().join("cnc_usb_a.img"),
        usb_img_b: dir.path().join("cnc_usb_b.img"),
        active_slot_file: dir.path().join("shadow_active_slot.state"),
        shadow_state_file: dir.path().join("shadow_state.json"),
        shadow_lock_file: dir.path().join("cnc-shadow.lock"),
        shadow_history_file: dir.path().join("shadow_history.json"),
        shadow_slot_size_mb: 16,
        shadow_debounce_seconds: 0,
        shadow_usb_stop_timeout: 0,
        shadow_usb_start_timeout: 0,
        ..Settings::default()
    }
}

/// Makes the faked `truncate` create its target file so the fsync and rename
/// tail of the rebuild pipeline runs for real.
fn touch_on_truncate(program: &str, args: &[&str]) {
    if program == "truncate" {
        if let Some(path) = args.last() {
            fs::write(path, b"").unwrap();
        }
    }
}

/// Fakes enough of the toolchain for successful cycles: `truncate` creates
/// its target and a simulated gadget module tracks `modprobe` state, which
/// `lsmod` reports.
fn runner_for_success() -> Arc<FakeRunner> {
    let runner = Arc::new(FakeRunner::new());
    let module_loaded = Arc::new(AtomicBool::new(true));
    runner.on(move |program, args| match program {
        "truncate" => {
            touch_on_truncate(program, args);
            None
        }
        "modprobe" => {
            let unloading = args.first() == Some(&"-r");
            module_loaded.store(!unloading, Ordering::SeqCst);
            Some(CmdOutput::ok(""))
        }
        "lsmod" => Some(CmdOutput::ok(if module_loaded.load(Ordering::SeqCst) {
            LSMOD_WITH_GADGET
        } else {
            ""
        })),
        _ => None,
    });
    runner
}

fn manager_with(dir: &TempDir, runner: Arc<FakeRunner>) -> Arc<ShadowManager> {
    Arc::new(
        ShadowManager::with_runners(
            test_settings(dir),
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            runner,
        )
        .unwrap(),
    )
}

fn read_state(dir: &TempDir) -> ShadowState {
    let raw = fs::read(dir.path().join("shadow_state.json")).unwrap();
    serde_json::from_slice(&raw).unwrap()
}

#[test]
fn first_boot_initializes_state_marker_and_master_dir() {
    let dir = TempDir::new().unwrap();
    let manager = manager_with(&dir, Arc::new(FakeRunner::new()));

    manager.start().unwrap();

    let state = read_state(&dir);
    assert_eq!(state.fsm_state, FsmState::Idle);
    assert_eq!(state.active_slot, Slot::A);
    assert_eq!(state.rebuild_slot, None);
    assert_eq!(state.run_id, 0);
    assert_eq!(
        fs::read_to_string(dir.path().join("shadow_active_slot.state")).unwrap(),
        "A\n"
    );
    assert!(dir.path().join("master").is_dir());
}

#[test]
fn a_watch_cycle_builds_the_opposite_slot_and_flips_the_marker() {
    let dir = TempDir::new().unwrap();
    let runner = runner_for_success();
    let manager = manager_with(&dir, Arc::clone(&runner));

    fs::create_dir_all(dir.path().join("master")).unwrap();
    fs::write(dir.path().join("master/part.nc"), b"G0 X0").unwrap();

    assert_eq!(manager.run_cycle(Trigger::Watch), CycleOutcome::Completed);

    let state = read_state(&dir);
    assert_eq!(state.fsm_state, FsmState::Ready);
    assert_eq!(state.active_slot, Slot::B);
    assert_eq!(state.rebuild_slot, None);
    assert_eq!(state.run_id, 1);
    assert_eq!(state.rebuild_counter, 1);
    assert_eq!(state.last_error, None);
    assert_eq!(
        fs::read_to_string(dir.path().join("shadow_active_slot.state")).unwrap(),
        "B\n"
    );
    // The rebuilt image was promoted and its temporary is gone.
    assert!(dir.path().join("cnc_usb_b.img").exists());
    assert!(!dir.path().join("cnc_usb_b.img.tmp").exists());

    let history = manager.history(10);
    assert_eq!(history.len(), 1);
    let entry = &history[0];
    assert_eq!(entry.trigger, Trigger::Watch);
    assert_eq!(entry.result, Outcome::Ok);
    assert_eq!(entry.run_id, 1);
    assert_eq!(entry.active_slot_before, Slot::A);
    assert_eq!(entry.rebuild_slot, Slot::B);
    assert_eq!(entry.active_slot_after, Slot::B);
    assert_eq!(entry.error, None);

    // The gadget was torn down and re-bound to the fresh slot B image.
    let modprobe = runner.calls_for("modprobe");
    assert_eq!(modprobe.len(), 2);
    assert_eq!(modprobe[0][1], "-r");
    assert!(modprobe[1][2].ends_with("cnc_usb_b.img"));
    assert_eq!(modprobe[1][3], "ro=1");

    // The LED walked through SYNC and BUSY and settled on READY.
    let led: Vec<String> = runner
        .calls_for("cnc-led-cli")
        .into_iter()
        .map(|call| call[1].clone())
        .collect();
    assert_eq!(led.first().map(String::as_str), Some("SYNC"));
    assert_eq!(led.last().map(String::as_str), Some("READY"));
    assert!(led.contains(&"BUSY".to_owned()));
}

#[test]
fn two_cycles_alternate_slots_and_keep_run_id_strictly_increasing() {
    let dir = TempDir::new().unwrap();
    let runner = runner_for_success();
    let manager = manager_with(&dir, runner);
    fs::create_dir_all(dir.path().join("master")).unwrap();

    assert_eq!(manager.run_cycle(Trigger::Watch), CycleOutcome::Completed);
    assert_eq!(read_state(&dir).active_slot, Slot::B);

    assert_eq!(manager.run_cycle(Trigger::Watch), CycleOutcome::Completed);
    let state = read_state(&dir);
    assert_eq!(state.active_slot, Slot::A);
    assert_eq!(state.run_id, 2);
    assert_eq!(
        fs::read_to_string(dir.path().join("shadow_active_slot.state")).unwrap(),
        "A\n"
    );
}

#[test]
fn a_usb_start_failure_keeps_the_active_slot_and_records_the_error() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(FakeRunner::new());
    runner.on(|program, args| {
        touch_on_truncate(program, args);
        None
    });
    // Unload succeeds, re-load fails; lsmod agrees the module is gone.
    runner.script("modprobe", CmdOutput::ok(""));
    runner.script("modprobe", CmdOutput::err(1, "modprobe: can't load module"));
    runner.script("lsmod", CmdOutput::ok(""));
    let manager = manager_with(&dir, Arc::clone(&runner));
    fs::create_dir_all(dir.path().join("master")).unwrap();

    assert_eq!(
        manager.run_cycle(Trigger::Watch),
        CycleOutcome::Failed(ErrorCode::UsbStartTimeout)
    );

    let state = read_state(&dir);
    assert_eq!(state.fsm_state, FsmState::Error);
    assert_eq!(state.active_slot, Slot::A);
    assert_eq!(state.rebuild_slot, None);
    assert_eq!(state.run_id, 1);
    assert_eq!(
        state.last_error.as_ref().map(|err| err.code),
        Some(ErrorCode::UsbStartTimeout)
    );
    // The marker never flipped.
    assert_eq!(
        fs::read_to_string(dir.path().join("shadow_active_slot.state")).unwrap(),
        "A\n"
    );

    let history = manager.history(10);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].result, Outcome::Error);
    assert_eq!(history[0].active_slot_after, Slot::A);

    // The next event recovers with a full successful cycle.
    let manager = manager_with(&dir, runner_for_success());
    assert_eq!(manager.run_cycle(Trigger::Watch), CycleOutcome::Completed);
    let state = read_state(&dir);
    assert_eq!(state.fsm_state, FsmState::Ready);
    assert_eq!(state.last_error, None);
    assert_eq!(state.run_id, 2);
}

#[test]
fn a_rebuild_failure_cleans_the_temporary_and_classifies_as_rebuild_error() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(FakeRunner::new());
    runner.on(|program, args| {
        touch_on_truncate(program, args);
        None
    });
    runner.script("mkfs.vfat", CmdOutput::err(1, "mkfs.vfat: no space left"));
    let manager = manager_with(&dir, Arc::clone(&runner));
    fs::create_dir_all(dir.path().join("master")).unwrap();

    assert_eq!(
        manager.run_cycle(Trigger::Watch),
        CycleOutcome::Failed(ErrorCode::RebuildTimeout)
    );
    assert!(!dir.path().join("cnc_usb_b.img.tmp").exists());
    assert!(!dir.path().join("cnc_usb_b.img").exists());
    // The USB export was never touched.
    assert!(runner.calls_for("modprobe").is_empty());
}

#[test]
fn restart_after_a_crash_mid_build_cleans_up_and_recovers() {
    let dir = TempDir::new().unwrap();

    // Simulated crash while building slot B: persisted mid-cycle state plus
    // a stale image temporary.
    let crashed = ShadowState {
        fsm_state: FsmState::BuildSlotB,
        active_slot: Slot::A,
        rebuild_slot: Some(Slot::B),
        run_id: 5,
        last_error: None,
        rebuild_counter: 5,
    };
    fs::write(
        dir.path().join("shadow_state.json"),
        serde_json::to_vec(&crashed).unwrap(),
    )
    .unwrap();
    fs::write(dir.path().join("shadow_active_slot.state"), "A\n").unwrap();
    fs::write(dir.path().join("cnc_usb_b.img.tmp"), b"partial").unwrap();

    let manager = manager_with(&dir, runner_for_success());
    manager.start().unwrap();

    assert!(!dir.path().join("cnc_usb_b.img.tmp").exists());
    let state = read_state(&dir);
    assert_eq!(state.fsm_state, FsmState::Idle);
    assert_eq!(state.rebuild_slot, None);
    assert_eq!(state.run_id, 5);

    // The first subsequent cycle completes and run_id keeps growing.
    assert_eq!(manager.run_cycle(Trigger::Watch), CycleOutcome::Completed);
    let state = read_state(&dir);
    assert_eq!(state.fsm_state, FsmState::Ready);
    assert_eq!(state.run_id, 6);
}

#[test]
fn an_invalid_marker_is_healed_at_startup() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("shadow_active_slot.state"), "bogus\n").unwrap();

    let manager = manager_with(&dir, Arc::new(FakeRunner::new()));
    manager.start().unwrap();

    assert_eq!(
        fs::read_to_string(dir.path().join("shadow_active_slot.state")).unwrap(),
        "A\n"
    );
    assert_eq!(read_state(&dir).active_slot, Slot::A);
}

#[test]
fn a_watch_conflict_sets_error_but_a_manual_conflict_does_not() {
    let dir = TempDir::new().unwrap();
    let manager = manager_with(&dir, Arc::new(FakeRunner::new()));

    // Another rebuilder (e.g. a second process) holds the lock.
    let foreign = LockManager::new(dir.path().join("cnc-shadow.lock"));
    let _held = foreign.try_acquire().unwrap().expect("foreign lock");

    assert_eq!(
        manager.run_cycle(Trigger::Manual),
        CycleOutcome::LockConflict
    );
    // Manual conflicts are observational only: nothing was persisted.
    assert_eq!(manager.state().unwrap(), None);
    let history = manager.history(10);
    assert_eq!(history[0].result, Outcome::LockConflict);
    assert_eq!(history[0].trigger, Trigger::Manual);
    assert_eq!(history[0].run_id, 0);

    assert_eq!(manager.run_cycle(Trigger::Watch), CycleOutcome::LockConflict);
    let state = read_state(&dir);
    assert_eq!(state.fsm_state, FsmState::Error);
    assert_eq!(
        state.last_error.map(|err| err.code),
        Some(ErrorCode::LockConflict)
    );
    assert_eq!(manager.history(10).len(), 2);
}

#[test]
fn a_burst_of_events_coalesces_into_one_rebuild() {
    let dir = TempDir::new().unwrap();
    let runner = runner_for_success();
    let mut settings = test_settings(&dir);
    settings.shadow_debounce_seconds = 1;
    let manager = Arc::new(
        ShadowManager::with_runners(
            settings,
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
        )
        .unwrap(),
    );
    manager.start().unwrap();

    // Several uploads inside one debounce window.
    for name in ["a.nc", "b.nc", "c.nc"] {
        fs::write(dir.path().join("master").join(name), b"G0").unwrap();
        thread::sleep(Duration::from_millis(150));
    }

    // Wait out the poll interval, the debounce window and the (faked, fast)
    // rebuild itself.
    thread::sleep(Duration::from_secs(4));

    let state = read_state(&dir);
    assert_eq!(state.run_id, 1, "exactly one rebuild for the burst");
    assert_eq!(state.fsm_state, FsmState::Ready);
    assert_eq!(manager.history(10).len(), 1);
}
