//! API for reading and switching the SHADOW A/B slot state.
pub use domain::{Error, Result, Slot};
use std::{
    env,
    ffi::OsString,
    fs,
    io::Write as _,
    path::{Path, PathBuf},
};

mod domain;

pub mod program;
pub mod test_utils;

/// Environment variables understood by [`SlotConfig::from_env`], with their
/// defaults. The same names are honored by the shadow agent settings.
pub const ENV_IMG_A: &str = "CNC_USB_IMG_A";
pub const ENV_IMG_B: &str = "CNC_USB_IMG_B";
pub const ENV_ACTIVE_SLOT_FILE: &str = "CNC_ACTIVE_SLOT_FILE";
pub const ENV_ACTIVE_SLOT: &str = "CNC_ACTIVE_SLOT";
pub const ENV_TMP_SUFFIX: &str = "CNC_SHADOW_TMP_SUFFIX";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotConfig {
    pub image_a: PathBuf,
    pub image_b: PathBuf,
    pub active_slot_file: PathBuf,
    pub initial_slot: Slot,
    pub tmp_suffix: String,
}

impl SlotConfig {
    /// Reads the slot configuration from the process environment, falling
    /// back to the appliance defaults.
    pub fn from_env() -> Result<Self> {
        let var = |name: &str, default: &str| {
            env::var(name).unwrap_or_else(|_| default.to_owned())
        };
        Ok(Self {
            image_a: var(ENV_IMG_A, "/var/lib/cnc-control/cnc_usb_a.img").into(),
            image_b: var(ENV_IMG_B, "/var/lib/cnc-control/cnc_usb_b.img").into(),
            active_slot_file: var(
                ENV_ACTIVE_SLOT_FILE,
                "/var/lib/cnc-control/shadow_active_slot.state",
            )
            .into(),
            initial_slot: var(ENV_ACTIVE_SLOT, "A").parse()?,
            tmp_suffix: var(ENV_TMP_SUFFIX, ".tmp"),
        })
    }
}

pub struct SlotCtrl {
    config: SlotConfig,
}

impl SlotCtrl {
    pub fn new(config: SlotConfig) -> Self {
        Self { config }
    }

    /// Get the currently active slot.
    ///
    /// A missing marker file is healed by writing the configured initial
    /// slot. Invalid non-empty content is surfaced as
    /// [`Error::InvalidMarker`]; callers decide whether to heal it.
    pub fn read_active_slot(&self) -> Result<Slot> {
        let path = &self.config.active_slot_file;
        if !path.is_file() {
            let initial = self.config.initial_slot;
            self.write_active_slot(initial)?;
            return Ok(initial);
        }
        let raw = fs::read_to_string(path).map_err(Error::ReadMarker)?;
        let value = raw.trim().to_uppercase();
        value.parse().map_err(|_| Error::InvalidMarker {
            path: path.clone(),
            value,
        })
    }

    /// Record `slot` as active.
    ///
    /// The marker is replaced atomically (sibling temporary, fsync, rename,
    /// fsync of the parent directory), so a concurrent reader observes either
    /// the previous value or the new one.
    pub fn write_active_slot(&self, slot: Slot) -> Result<()> {
        let target = &self.config.active_slot_file;
        let directory = parent_dir(target);
        fs::create_dir_all(directory).map_err(Error::WriteMarker)?;

        let mut tmp = tempfile::Builder::new()
            .prefix("shadow-active-slot-")
            .suffix(".tmp")
            .tempfile_in(directory)
            .map_err(Error::WriteMarker)?;
        tmp.write_all(format!("{slot}\n").as_bytes())
            .map_err(Error::WriteMarker)?;
        tmp.as_file().sync_all().map_err(Error::WriteMarker)?;
        tmp.persist(target)
            .map_err(|err| Error::WriteMarker(err.error))?;
        fs::File::open(directory)
            .and_then(|dir| dir.sync_all())
            .map_err(Error::WriteMarker)?;
        Ok(())
    }

    /// Image path backing `slot`.
    pub fn slot_path(&self, slot: Slot) -> &Path {
        match slot {
            Slot::A => &self.config.image_a,
            Slot::B => &self.config.image_b,
        }
    }

    /// Promotion temporary for `slot`'s image.
    pub fn tmp_image_path(&self, slot: Slot) -> PathBuf {
        let mut path = OsString::from(self.slot_path(slot).as_os_str());
        path.push(&self.config.tmp_suffix);
        path.into()
    }

    /// The slot the next rebuild targets while `active` is exported.
    pub fn rebuild_slot_for(&self, active: Slot) -> Slot {
        active.opposite()
    }

    /// Remove stale promotion temporaries for both slots. Missing files are
    /// not an error.
    pub fn cleanup_tmp_files(&self) -> Result<()> {
        for slot in [Slot::A, Slot::B] {
            match fs::remove_file(self.tmp_image_path(slot)) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(Error::CleanupTmp(err)),
            }
        }
        Ok(())
    }

    pub fn active_slot_file(&self) -> &Path {
        &self.config.active_slot_file
    }

    pub fn initial_slot(&self) -> Slot {
        self.config.initial_slot
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if parent != Path::new("") => parent,
        _ => Path::new("."),
    }
}
