use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use cnc_selftest::{
    checks::shadow::ShadowCheckConfig,
    report::SelfTestReport,
};
use cnc_shadow_agent::process::SystemRunner;

const SYSLOG_IDENTIFIER: &str = "cnc-selftest";

/// Offline diagnostic of the SHADOW invariants.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Print the JSON report.
    #[arg(long)]
    json: bool,
    /// Print the detailed per-check report.
    #[arg(long)]
    verbose: bool,
    /// Environment file to validate.
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// Skip the one-shot gadget auto-repair.
    #[arg(long)]
    no_repair: bool,
}

fn main() -> ExitCode {
    let telemetry = cnc_telemetry::TelemetryConfig::new()
        .with_journald(SYSLOG_IDENTIFIER)
        .init();
    let cli = Cli::parse();

    let mut config = ShadowCheckConfig::default();
    if let Some(env_file) = cli.env_file {
        config.env_file = env_file;
    }
    config.auto_repair = !cli.no_repair;

    let runner = SystemRunner::escalating();
    let report = cnc_selftest::run_selftest(&runner, &config);

    if cli.json {
        match serde_json::to_string_pretty(&report) {
            Ok(payload) => println!("{payload}"),
            Err(err) => {
                eprintln!("failed serializing the selftest report: {err}");
                telemetry.flush_blocking();
                return ExitCode::FAILURE;
            }
        }
    } else {
        print_text_report(&report, cli.verbose);
    }

    telemetry.flush_blocking();
    if report.critical > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn print_text_report(report: &SelfTestReport, verbose: bool) {
    println!("==============================");
    println!(" CNC SELFTEST (SHADOW)");
    println!("==============================");
    println!("CRITICAL: {}", report.critical);
    println!("WARNINGS: {}", report.warnings);
    println!("SYSTEM_NOISE: {}", report.system_noise);
    println!("RESULT: {}", report.status);

    if !verbose {
        return;
    }

    for (name, section) in [
        ("journal", &report.details.journal),
        ("shadow", &report.details.shadow),
    ] {
        println!();
        println!("[{name}]");
        for check in &section.checks {
            println!("- [{}] {}", check.status, check.name);
            if !check.detail.is_empty() {
                println!("  {}", check.detail);
            }
        }
    }
}
