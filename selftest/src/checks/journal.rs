use std::time::Duration;

use cnc_shadow_agent::process::CommandRunner;
use serde_json::Value;

use crate::report::{CheckStatus, SectionReport, Severity};

/// Units with this prefix belong to the appliance.
const PROJECT_UNIT_PREFIX: &str = "cnc-";

/// A priority<=3 message mentioning any of these concerns the shadow path.
const CRITICAL_MESSAGE_KEYWORDS: [&str; 6] =
    ["shadow", "g_mass_storage", "dwc2", "fsm", "rebuild", "export"];

/// Known benign chatter on the appliance image.
const SYSTEM_NOISE_KEYWORDS: [&str; 7] = [
    "bluetoothd",
    "wpa_supplicant",
    "dhcpcd",
    "networkmanager",
    "avahi-daemon",
    "modemmanager",
    "systemd-resolved",
];

const JOURNALCTL_TIMEOUT: Duration = Duration::from_secs(10);

/// Scan the priority<=3 journal and triage each entry into critical, system
/// noise or unrelated.
pub fn run_journal_checks(runner: &dyn CommandRunner) -> SectionReport {
    let mut report = SectionReport {
        system_noise: Some(0),
        ..Default::default()
    };

    let output = runner.run_with_timeout(
        "journalctl",
        &["-p", "3", "-o", "json", "--no-pager"],
        JOURNALCTL_TIMEOUT,
    );
    if !output.success() {
        // A broken journal reader degrades the selftest, it does not fail it.
        report.push(
            "journalctl command",
            CheckStatus::Warn,
            Severity::Warn,
            output.detail(),
        );
        return report;
    }

    let payloads: Vec<Value> = output
        .stdout
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            serde_json::from_str(line).ok()
        })
        .filter(Value::is_object)
        .collect();

    if payloads.is_empty() {
        report.push(
            "journalctl entries",
            CheckStatus::Pass,
            Severity::Warn,
            "No priority<=3 entries",
        );
        return report;
    }

    for payload in &payloads {
        let detail = entry_detail(payload);
        if is_critical(payload) {
            report.push(
                "journal critical entry",
                CheckStatus::Fail,
                Severity::Critical,
                detail,
            );
        } else if is_system_noise(payload) {
            report.note_system_noise();
            report.push(
                "journal system noise",
                CheckStatus::Warn,
                Severity::Warn,
                detail,
            );
        } else {
            report.push(
                "journal unrelated error",
                CheckStatus::Warn,
                Severity::Warn,
                detail,
            );
        }
    }

    report
}

fn field(payload: &Value, keys: &[&str]) -> String {
    for key in keys {
        if let Some(value) = payload.get(key).and_then(Value::as_str) {
            let value = value.trim();
            if !value.is_empty() {
                return value.to_owned();
            }
        }
    }
    String::new()
}

fn entry_detail(payload: &Value) -> String {
    let unit = field(payload, &["_SYSTEMD_UNIT", "UNIT"]);
    let identifier = field(payload, &["SYSLOG_IDENTIFIER", "_COMM"]);
    let message = field(payload, &["MESSAGE"]);

    let source = if !unit.is_empty() {
        unit
    } else if !identifier.is_empty() {
        identifier
    } else {
        "journal".to_owned()
    };
    if message.is_empty() {
        source
    } else {
        format!("{source}: {message}")
    }
}

fn is_critical(payload: &Value) -> bool {
    let unit = field(payload, &["_SYSTEMD_UNIT", "UNIT"]).to_lowercase();
    if unit.starts_with(PROJECT_UNIT_PREFIX) {
        return true;
    }
    let message = field(payload, &["MESSAGE"]).to_lowercase();
    CRITICAL_MESSAGE_KEYWORDS
        .iter()
        .any(|keyword| message.contains(keyword))
}

fn is_system_noise(payload: &Value) -> bool {
    let unit = field(payload, &["_SYSTEMD_UNIT", "UNIT"]).to_lowercase();
    let identifier = field(payload, &["SYSLOG_IDENTIFIER", "_COMM"]).to_lowercase();
    let message = field(payload, &["MESSAGE"]).to_lowercase();
    SYSTEM_NOISE_KEYWORDS.iter().any(|keyword| {
        unit.contains(keyword) || identifier.contains(keyword) || message.contains(keyword)
    })
}
