//! The shadow agent keeps the FAT image exported to the CNC machine over the
//! USB mass-storage gadget in sync with the master directory the network side
//! uploads into.
//!
//! It is a double-buffered A/B image service: the network side freely mutates
//! the master directory while the USB host always sees a consistent,
//! atomically swapped image. One rebuild cycle walks a small state machine:
//!
//! 1. a watcher event (or a manual trigger) enters `CHANGE_DETECTED`;
//! 2. the non-active slot image is rebuilt from the master directory into a
//!    temporary file and atomically promoted (`BUILD_SLOT_A`/`BUILD_SLOT_B`);
//! 3. the gadget module is unloaded (`EXPORT_STOP`) and re-loaded bound to
//!    the fresh image (`EXPORT_START`);
//! 4. the active-slot marker flips and the machine lands in `READY`.
//!
//! Every transition is persisted before the action it announces, so a crash
//! observer sees intent, never a half-applied side effect.

mod atomic;
pub mod history;
pub mod led;
pub mod lock;
pub mod manager;
pub mod process;
pub mod rebuild;
pub mod settings;
pub mod state;
pub mod test_utils;
pub mod usb;
pub mod watcher;

pub use cnc_slot_ctrl::Slot;
pub use settings::{Args, Settings};
