use std::{sync::Arc, thread};

use clap::Parser as _;
use cnc_shadow_agent::{
    manager::{CycleOutcome, ShadowManager},
    Args, Settings,
};
use color_eyre::eyre::{self, WrapErr as _};
use tracing::{debug, warn};

const SYSLOG_IDENTIFIER: &str = "cnc-shadow-agent";

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let telemetry = cnc_telemetry::TelemetryConfig::new()
        .with_journald(SYSLOG_IDENTIFIER)
        .init();

    let args = Args::parse();
    let result = run(&args);
    telemetry.flush_blocking();
    result
}

fn run(args: &Args) -> eyre::Result<()> {
    let settings = Settings::get(args).wrap_err("failed reading settings")?;
    match serde_json::to_string(&settings) {
        Ok(settings) => debug!("running with the following settings: {settings}"),
        Err(err) => {
            warn!("failed serializing settings as json, printing debug string: {err:?}");
            debug!("running with the following settings: {settings:?}");
        }
    }

    if args.oneshot {
        std::fs::create_dir_all(&settings.master_dir)
            .wrap_err("failed creating the master directory")?;
    }
    let manager = Arc::new(
        ShadowManager::new(settings).wrap_err("failed constructing the shadow manager")?,
    );

    if args.oneshot {
        return match manager.run_manual_blocking() {
            CycleOutcome::Completed => Ok(()),
            CycleOutcome::LockConflict => {
                eyre::bail!("another rebuild holds the shadow lock")
            }
            CycleOutcome::Failed(code) => eyre::bail!("rebuild cycle failed: {code}"),
        };
    }

    manager
        .start()
        .wrap_err("failed starting the shadow manager")?;

    // The watch loop owns the lifecycle from here; this thread only keeps the
    // process alive.
    loop {
        thread::park();
    }
}
