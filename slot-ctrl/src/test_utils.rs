use std::fs;

use crate::{
    program::{self, Cli},
    Slot, SlotConfig, SlotCtrl,
};
use bon::bon;
use clap::Parser;
use tempfile::TempDir;

/// A Fixture that initializes a slot layout inside a tempdir.
pub struct Fixture {
    _tempdir: TempDir,
    pub config: SlotConfig,
    pub slot_ctrl: SlotCtrl,
}

#[bon]
impl Fixture {
    #[builder]
    pub fn new(
        #[builder(default = Slot::A)] initial_slot: Slot,
        /// Raw marker content written before the fixture is handed out.
        marker: Option<&str>,
        #[builder(default = ".tmp")] tmp_suffix: &str,
    ) -> Fixture {
        let tempdir = TempDir::new().unwrap();
        let config = SlotConfig {
            image_a: tempdir.path().join("cnc_usb_a.img"),
            image_b: tempdir.path().join("cnc_usb_b.img"),
            active_slot_file: tempdir.path().join("shadow_active_slot.state"),
            initial_slot,
            tmp_suffix: tmp_suffix.to_owned(),
        };
        if let Some(marker) = marker {
            fs::write(&config.active_slot_file, marker).unwrap();
        }
        let slot_ctrl = SlotCtrl::new(config.clone());

        Self {
            _tempdir: tempdir,
            config,
            slot_ctrl,
        }
    }

    pub fn run(&self, cmd: &str) -> color_eyre::Result<String> {
        let cmd: Vec<_> = cmd.split(" ").collect();
        let mut vec = Vec::from(&["cnc-slot-ctrl"]);
        vec.extend_from_slice(&cmd);

        let cli = Cli::try_parse_from(&vec)?;
        program::run(&self.slot_ctrl, cli)
    }
}
