//! Offline diagnostic of the SHADOW subsystem: triages the priority<=3
//! journal and validates the invariants between the env file, the filesystem
//! layout, the active-slot marker and the exported gadget LUN. Never mutates
//! state except for the optional one-shot gadget re-bind.

pub mod checks;
pub mod envfile;
pub mod report;

use checks::shadow::ShadowCheckConfig;
use cnc_shadow_agent::process::CommandRunner;
use report::SelfTestReport;
use tracing::info;

pub fn run_selftest(
    runner: &dyn CommandRunner,
    config: &ShadowCheckConfig,
) -> SelfTestReport {
    let journal = checks::journal::run_journal_checks(runner);
    let shadow = checks::shadow::run_shadow_checks(runner, config);
    let report = SelfTestReport::from_sections(journal, shadow);
    info!(
        critical = report.critical,
        warnings = report.warnings,
        system_noise = report.system_noise,
        status = %report.status,
        "selftest finished"
    );
    report
}
