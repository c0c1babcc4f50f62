use std::{path::PathBuf, time::Duration};

use cnc_slot_ctrl::{Slot, SlotConfig};
use figment::providers::Format as _;
use serde::{Deserialize, Serialize};

mod args;
pub use args::Args;


const CFG_DEFAULT_PATH: &str = "/etc/cnc-control/cnc-shadow-agent.toml";
/// Prefix under which every field is also an environment variable, e.g.
/// `CNC_MASTER_DIR` or `CNC_SHADOW_DEBOUNCE_SECONDS`.
const ENV_VAR_PREFIX: &str = "CNC_";

/// `Settings` are the configurable options for running the shadow agent.
///
/// The only entry point to construct `Settings` is `Settings::get`. Field
/// names are chosen so the `CNC_`-prefixed environment variables are exactly
/// the documented appliance names.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Settings {
    pub master_dir: PathBuf,
    pub usb_img_a: PathBuf,
    pub usb_img_b: PathBuf,
    pub active_slot_file: PathBuf,
    /// Initial active slot when no marker file exists yet.
    pub active_slot: Slot,
    pub shadow_state_file: PathBuf,
    pub shadow_lock_file: PathBuf,
    pub shadow_history_file: PathBuf,
    pub shadow_history_limit: usize,
    pub shadow_slot_size_mb: u64,
    pub shadow_tmp_suffix: String,
    pub shadow_debounce_seconds: u64,
    pub shadow_usb_stop_timeout: u64,
    pub shadow_usb_start_timeout: u64,
    pub usb_label: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            master_dir: "/var/lib/cnc-control/master".into(),
            usb_img_a: "/var/lib/cnc-control/cnc_usb_a.img".into(),
            usb_img_b: "/var/lib/cnc-control/cnc_usb_b.img".into(),
            active_slot_file: "/var/lib/cnc-control/shadow_active_slot.state".into(),
            active_slot: Slot::A,
            shadow_state_file: "/var/lib/cnc-control/shadow_state.json".into(),
            shadow_lock_file: "/var/run/cnc-shadow.lock".into(),
            shadow_history_file: "/var/lib/cnc-control/shadow_history.json".into(),
            shadow_history_limit: 50,
            shadow_slot_size_mb: 256,
            shadow_tmp_suffix: ".tmp".into(),
            shadow_debounce_seconds: 4,
            shadow_usb_stop_timeout: 10,
            shadow_usb_start_timeout: 10,
            usb_label: "CNC_USB".into(),
        }
    }
}

impl Settings {
    /// Constructs `Settings` from defaults, an optional config file,
    /// environment variables, and command line arguments. Command line
    /// arguments always take precedence over environment variables, which in
    /// turn take precedence over the config file.
    pub fn get(args: &Args) -> figment::error::Result<Settings> {
        let config_path = args
            .config
            .clone()
            .unwrap_or_else(|| CFG_DEFAULT_PATH.to_owned());
        figment::Figment::new()
            .merge(figment::providers::Serialized::defaults(Settings::default()))
            .merge(figment::providers::Toml::file(config_path))
            .merge(figment::providers::Env::prefixed(ENV_VAR_PREFIX))
            .merge(figment::providers::Serialized::defaults(args))
            .extract()
    }

    pub fn slot_config(&self) -> SlotConfig {
        SlotConfig {
            image_a: self.usb_img_a.clone(),
            image_b: self.usb_img_b.clone(),
            active_slot_file: self.active_slot_file.clone(),
            initial_slot: self.active_slot,
            tmp_suffix: self.shadow_tmp_suffix.clone(),
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.shadow_debounce_seconds)
    }

    pub fn usb_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.shadow_usb_stop_timeout)
    }

    pub fn usb_start_timeout(&self) -> Duration {
        Duration::from_secs(self.shadow_usb_start_timeout)
    }
}
