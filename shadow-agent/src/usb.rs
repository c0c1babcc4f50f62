use std::{
    path::Path,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use tracing::debug;

use crate::process::{sudo_refused, CommandRunner};

/// Kernel module implementing the USB mass-storage gadget.
pub const GADGET_MODULE: &str = "g_mass_storage";
/// Kernel-exposed parameter naming the image the gadget currently exports.
pub const GADGET_LUN_FILE: &str = "/sys/module/g_mass_storage/parameters/file";

const MODULE_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub type Result<T> = std::result::Result<T, UsbError>;

#[allow(missing_docs)]
#[derive(thiserror::Error, Debug)]
pub enum UsbError {
    #[error("no cached sudo credential for the gadget module helper")]
    MissingSudo,
    #[error("modprobe failed: {0}")]
    Modprobe(String),
    #[error("gadget module did not reach the expected state within {0}s")]
    Timeout(u64),
    #[error("refusing to export an empty image path")]
    EmptyImagePath,
}

/// Loads and unloads the mass-storage gadget with deterministic timeouts.
pub struct UsbManager {
    runner: Arc<dyn CommandRunner>,
    stop_timeout: Duration,
    start_timeout: Duration,
}

impl UsbManager {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        stop_timeout: Duration,
        start_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            stop_timeout,
            start_timeout,
        }
    }

    /// Unload the gadget module and wait until it is gone.
    pub fn stop_export(&self) -> Result<()> {
        let output = self.runner.run("modprobe", &["-r", GADGET_MODULE]);
        if sudo_refused(&output) {
            return Err(UsbError::MissingSudo);
        }
        if !output.success() {
            return Err(UsbError::Modprobe(output.detail()));
        }
        if self.wait_for_module(false, self.stop_timeout) {
            debug!("gadget module unloaded");
            Ok(())
        } else {
            Err(UsbError::Timeout(self.stop_timeout.as_secs()))
        }
    }

    /// Load the gadget module bound read-only to `image_path` and wait until
    /// it is present.
    pub fn start_export(&self, image_path: &Path) -> Result<()> {
        if image_path.as_os_str().is_empty() {
            return Err(UsbError::EmptyImagePath);
        }
        let file_arg = format!("file={}", image_path.display());
        let output = self
            .runner
            .run("modprobe", &[GADGET_MODULE, &file_arg, "ro=1", "removable=1"]);
        if sudo_refused(&output) {
            return Err(UsbError::MissingSudo);
        }
        if !output.success() {
            return Err(UsbError::Modprobe(output.detail()));
        }
        if self.wait_for_module(true, self.start_timeout) {
            debug!(image = %image_path.display(), "gadget module loaded");
            Ok(())
        } else {
            Err(UsbError::Timeout(self.start_timeout.as_secs()))
        }
    }

    pub fn module_loaded(&self) -> bool {
        let output = self.runner.run("lsmod", &[]);
        if !output.success() {
            return false;
        }
        output
            .stdout
            .lines()
            .any(|line| line.split_whitespace().next() == Some(GADGET_MODULE))
    }

    fn wait_for_module(&self, expect_loaded: bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.module_loaded() == expect_loaded {
                return true;
            }
            thread::sleep(MODULE_POLL_INTERVAL);
        }
        // The final check is definitive.
        self.module_loaded() == expect_loaded
    }
}
