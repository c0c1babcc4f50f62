use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use cnc_shadow_agent::{
    process::{is_root, sudo_refused, CommandRunner},
    usb::{GADGET_LUN_FILE, GADGET_MODULE},
};
use cnc_slot_ctrl::Slot;

use crate::{
    envfile,
    report::{CheckStatus, SectionReport, Severity},
};

pub const DEFAULT_ENV_FILE: &str = "/etc/cnc-control/cnc-control.env";
pub const DEFAULT_VALIDATE_ROOT: &str = "/run/cnc-shadow-validate";

const ROOT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the shadow checks look and whether the one-shot gadget repair may
/// run.
#[derive(Debug, Clone)]
pub struct ShadowCheckConfig {
    pub env_file: PathBuf,
    pub validate_root: PathBuf,
    pub lun_file: PathBuf,
    pub auto_repair: bool,
}

impl Default for ShadowCheckConfig {
    fn default() -> Self {
        Self {
            env_file: DEFAULT_ENV_FILE.into(),
            validate_root: DEFAULT_VALIDATE_ROOT.into(),
            lun_file: GADGET_LUN_FILE.into(),
            auto_repair: true,
        }
    }
}

/// Validate the shadow invariants without mutating them (except the optional
/// one-shot gadget re-bind).
pub fn run_shadow_checks(
    runner: &dyn CommandRunner,
    config: &ShadowCheckConfig,
) -> SectionReport {
    let mut report = SectionReport::default();

    let env = match envfile::parse(&config.env_file) {
        Ok(env) if !env.is_empty() => env,
        _ => {
            fail(
                &mut report,
                "Environment file",
                format!("Missing or empty env file: {}", config.env_file.display()),
            );
            return report;
        }
    };
    let value = |key: &str, default: &str| -> String {
        env.get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| default.to_owned())
    };

    let master_dir = PathBuf::from(value("CNC_MASTER_DIR", "/var/lib/cnc-control/master"));
    let image_a = PathBuf::from(value(
        "CNC_USB_IMG_A",
        "/var/lib/cnc-control/cnc_usb_a.img",
    ));
    let image_b = PathBuf::from(value(
        "CNC_USB_IMG_B",
        "/var/lib/cnc-control/cnc_usb_b.img",
    ));
    let active_slot_file = PathBuf::from(value(
        "CNC_ACTIVE_SLOT_FILE",
        "/var/lib/cnc-control/shadow_active_slot.state",
    ));
    let tmp_suffix = value("CNC_SHADOW_TMP_SUFFIX", ".tmp");
    let slot_images = [(Slot::A, &image_a), (Slot::B, &image_b)];

    if master_dir.is_dir() {
        pass(&mut report, "CNC_MASTER_DIR exists", master_dir.display());
    } else {
        fail(
            &mut report,
            "CNC_MASTER_DIR exists",
            format!("Missing directory: {}", master_dir.display()),
        );
    }

    for (slot, image) in slot_images {
        let name = format!("SHADOW slot {slot} exists");
        if image.is_file() {
            pass(&mut report, name, image.display());
        } else {
            fail(
                &mut report,
                name,
                format!("Missing file: {}", image.display()),
            );
        }
    }

    let stale: Vec<String> = slot_images
        .iter()
        .map(|(_, image)| format!("{}{tmp_suffix}", image.display()))
        .filter(|tmp| Path::new(tmp).exists())
        .collect();
    if stale.is_empty() {
        pass(
            &mut report,
            "No stale .tmp files",
            "No temporary slot artifacts",
        );
    } else {
        fail(&mut report, "No stale .tmp files", stale.join(", "));
    }

    // Everything from here that shells out needs root; one refused sudo probe
    // short-circuits those checks instead of failing each one noisily.
    let have_root = probe_root(runner);
    if !have_root {
        fail(
            &mut report,
            "Root privileges",
            "ERR_MISSING_SUDO: sudo -n has no cached credential, skipping mount and repair checks",
        );
    } else {
        for (slot, image) in slot_images {
            if image.is_file() {
                let mount_point = config
                    .validate_root
                    .join(format!("slot_{}", slot.to_string().to_lowercase()));
                check_mount_ro(runner, &mut report, image, &mount_point);
            }
        }
    }

    let active_slot = check_active_slot_marker(&mut report, &active_slot_file);
    check_module_loaded(runner, &mut report);
    if let Some(active_slot) = active_slot {
        let expected = match active_slot {
            Slot::A => &image_a,
            Slot::B => &image_b,
        };
        check_runtime_lun(runner, &mut report, config, expected, have_root);
    }

    report
}

fn pass(report: &mut SectionReport, name: impl Into<String>, detail: impl ToString) {
    report.push(
        name,
        CheckStatus::Pass,
        Severity::Critical,
        detail.to_string(),
    );
}

fn fail(report: &mut SectionReport, name: impl Into<String>, detail: impl ToString) {
    report.push(
        name,
        CheckStatus::Fail,
        Severity::Critical,
        detail.to_string(),
    );
}

/// True when root-requiring commands will work, either directly or through a
/// cached non-interactive sudo credential.
fn probe_root(runner: &dyn CommandRunner) -> bool {
    if is_root() {
        return true;
    }
    let output = runner.run_with_timeout("true", &[], ROOT_COMMAND_TIMEOUT);
    output.success() && !sudo_refused(&output)
}

fn check_mount_ro(
    runner: &dyn CommandRunner,
    report: &mut SectionReport,
    image: &Path,
    mount_point: &Path,
) {
    let name = format!(
        "Mount RO validation {}",
        image
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    );
    if let Err(err) = fs::create_dir_all(mount_point) {
        fail(
            report,
            name,
            format!("ERR_FAT_INVALID: cannot create {}: {err}", mount_point.display()),
        );
        return;
    }

    let image_str = image.display().to_string();
    let mount_str = mount_point.display().to_string();
    let mounted = runner.run_with_timeout(
        "mount",
        &["-o", "loop,ro", "-t", "vfat", &image_str, &mount_str],
        ROOT_COMMAND_TIMEOUT,
    );
    if !mounted.success() {
        fail(report, name, format!("ERR_FAT_INVALID: {}", mounted.detail()));
        return;
    }

    let unmounted = runner.run_with_timeout("umount", &[&mount_str], ROOT_COMMAND_TIMEOUT);
    if !unmounted.success() {
        fail(
            report,
            name,
            format!("ERR_FAT_INVALID: {}", unmounted.detail()),
        );
        return;
    }

    pass(report, name, format!("Validated via {mount_str}"));
}

fn check_active_slot_marker(
    report: &mut SectionReport,
    active_slot_file: &Path,
) -> Option<Slot> {
    let name = "CNC_ACTIVE_SLOT_FILE valid";
    let raw = match fs::read_to_string(active_slot_file) {
        Ok(raw) => raw,
        Err(_) => {
            fail(
                report,
                name,
                format!("Missing file: {}", active_slot_file.display()),
            );
            return None;
        }
    };
    let value = raw.trim().to_uppercase();
    match value.parse::<Slot>() {
        Ok(slot) => {
            pass(
                report,
                name,
                format!("{}: {slot}", active_slot_file.display()),
            );
            Some(slot)
        }
        Err(_) => {
            fail(
                report,
                name,
                format!(
                    "ERR_FAT_INVALID: {}: invalid value '{value}'",
                    active_slot_file.display()
                ),
            );
            None
        }
    }
}

fn check_module_loaded(runner: &dyn CommandRunner, report: &mut SectionReport) {
    let name = format!("{GADGET_MODULE} loaded");
    let output = runner.run_with_timeout("lsmod", &[], ROOT_COMMAND_TIMEOUT);
    if !output.success() {
        fail(report, name, output.detail());
        return;
    }
    let loaded = output
        .stdout
        .lines()
        .any(|line| line.split_whitespace().next() == Some(GADGET_MODULE));
    if loaded {
        pass(report, name, GADGET_MODULE);
    } else {
        fail(report, name, "Module not present in lsmod");
    }
}

/// The kernel-exposed LUN parameter must point at the active slot's image.
/// One optional auto-repair re-binds the gadget before failing for good.
fn check_runtime_lun(
    runner: &dyn CommandRunner,
    report: &mut SectionReport,
    config: &ShadowCheckConfig,
    expected: &Path,
    have_root: bool,
) {
    let name = "Runtime LUN matches active slot";
    let read_lun = || {
        fs::read_to_string(&config.lun_file)
            .map(|content| content.trim().to_owned())
    };

    let current = match read_lun() {
        Ok(current) => current,
        Err(err) => {
            fail(
                report,
                name,
                format!("cannot read {}: {err}", config.lun_file.display()),
            );
            return;
        }
    };
    let expected_str = expected.display().to_string();
    if current == expected_str {
        pass(report, name, expected_str);
        return;
    }
    if !(config.auto_repair && have_root) {
        fail(
            report,
            name,
            format!("exported `{current}`, expected `{expected_str}`"),
        );
        return;
    }

    let _ = runner.run_with_timeout(
        "modprobe",
        &["-r", GADGET_MODULE],
        ROOT_COMMAND_TIMEOUT,
    );
    let file_arg = format!("file={expected_str}");
    let reloaded = runner.run_with_timeout(
        "modprobe",
        &[GADGET_MODULE, &file_arg, "ro=1", "removable=1"],
        ROOT_COMMAND_TIMEOUT,
    );
    match read_lun() {
        Ok(current) if reloaded.success() && current == expected_str => pass(
            report,
            name,
            format!("repaired: rebound gadget to {expected_str}"),
        ),
        _ => fail(
            report,
            name,
            format!("exported `{current}`, expected `{expected_str}` (auto-repair failed)"),
        ),
    }
}
