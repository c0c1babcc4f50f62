use derive_more::Display;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    #[display("PASS")]
    Pass,
    #[display("WARN")]
    Warn,
    #[display("FAIL")]
    Fail,
}

/// How a failing check counts: `Critical` failures flip the overall result,
/// `Warn` entries only accumulate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[display("CRITICAL")]
    Critical,
    #[display("WARN")]
    Warn,
}

#[derive(Clone, Debug, Serialize)]
pub struct Check {
    pub name: String,
    pub status: CheckStatus,
    pub severity: Severity,
    pub detail: String,
}

/// One check group (journal or shadow) with its aggregate counters.
#[derive(Debug, Serialize)]
pub struct SectionReport {
    pub status: CheckStatus,
    pub critical: u32,
    pub warnings: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_noise: Option<u32>,
    pub checks: Vec<Check>,
}

impl Default for SectionReport {
    fn default() -> Self {
        Self {
            status: CheckStatus::Pass,
            critical: 0,
            warnings: 0,
            system_noise: None,
            checks: Vec::new(),
        }
    }
}

impl SectionReport {
    pub fn push(
        &mut self,
        name: impl Into<String>,
        status: CheckStatus,
        severity: Severity,
        detail: impl Into<String>,
    ) {
        if status == CheckStatus::Fail && severity == Severity::Critical {
            self.critical += 1;
        } else if status == CheckStatus::Warn {
            self.warnings += 1;
        }
        self.checks.push(Check {
            name: name.into(),
            status,
            severity,
            detail: detail.into(),
        });
        self.status = if self.critical > 0 {
            CheckStatus::Fail
        } else if self.warnings > 0 {
            CheckStatus::Warn
        } else {
            CheckStatus::Pass
        };
    }

    pub fn note_system_noise(&mut self) {
        *self.system_noise.get_or_insert(0) += 1;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "UPPERCASE")]
pub enum OverallStatus {
    #[display("OK")]
    Ok,
    #[display("FAILED")]
    Failed,
}

#[derive(Debug, Serialize)]
pub struct Details {
    pub journal: SectionReport,
    pub shadow: SectionReport,
}

/// The aggregate report. `FAILED` iff any critical check failed; warnings
/// alone keep the result `OK`.
#[derive(Debug, Serialize)]
pub struct SelfTestReport {
    pub critical: u32,
    pub warnings: u32,
    pub system_noise: u32,
    pub status: OverallStatus,
    pub details: Details,
}

impl SelfTestReport {
    pub fn from_sections(journal: SectionReport, shadow: SectionReport) -> Self {
        let critical = journal.critical + shadow.critical;
        let warnings = journal.warnings + shadow.warnings;
        let system_noise =
            journal.system_noise.unwrap_or(0) + shadow.system_noise.unwrap_or(0);
        Self {
            critical,
            warnings,
            system_noise,
            status: if critical > 0 {
                OverallStatus::Failed
            } else {
                OverallStatus::Ok
            },
            details: Details { journal, shadow },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_counts_critical_failures_and_warnings_separately() {
        let mut section = SectionReport::default();
        section.push("a", CheckStatus::Pass, Severity::Critical, "fine");
        assert_eq!(section.status, CheckStatus::Pass);

        section.push("b", CheckStatus::Warn, Severity::Warn, "meh");
        assert_eq!((section.critical, section.warnings), (0, 1));
        assert_eq!(section.status, CheckStatus::Warn);

        section.push("c", CheckStatus::Fail, Severity::Critical, "broken");
        assert_eq!((section.critical, section.warnings), (1, 1));
        assert_eq!(section.status, CheckStatus::Fail);
    }

    #[test]
    fn warnings_alone_keep_the_overall_result_ok() {
        let mut journal = SectionReport::default();
        journal.push("noise", CheckStatus::Warn, Severity::Warn, "bluetoothd");
        journal.note_system_noise();

        let report = SelfTestReport::from_sections(journal, SectionReport::default());
        assert_eq!(report.status, OverallStatus::Ok);
        assert_eq!(report.warnings, 1);
        assert_eq!(report.system_noise, 1);
    }

    #[test]
    fn any_critical_failure_fails_the_report() {
        let mut shadow = SectionReport::default();
        shadow.push("slot", CheckStatus::Fail, Severity::Critical, "missing");

        let report = SelfTestReport::from_sections(SectionReport::default(), shadow);
        assert_eq!(report.status, OverallStatus::Failed);
        assert_eq!(report.critical, 1);
    }

    #[test]
    fn it_serializes_the_documented_labels() {
        let mut shadow = SectionReport::default();
        shadow.push("slot", CheckStatus::Fail, Severity::Critical, "missing");
        let report = SelfTestReport::from_sections(SectionReport::default(), shadow);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "FAILED");
        assert_eq!(json["details"]["shadow"]["status"], "FAIL");
        assert_eq!(json["details"]["shadow"]["checks"][0]["severity"], "CRITICAL");
        // The shadow section carries no noise counter.
        assert!(json["details"]["shadow"].get("system_noise").is_none());
    }
}
