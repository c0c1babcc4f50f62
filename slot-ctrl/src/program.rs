use crate::{Slot, SlotCtrl};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    author,
    version,
    long_about = "This tool is designed to read and write the SHADOW A/B slot state of the appliance."
)]
#[allow(missing_docs)]
pub struct Cli {
    #[command(subcommand)]
    subcmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Get the current active slot.
    #[command(name = "current", short_flag = 'c')]
    GetSlot,
    /// Get the slot the next rebuild will target.
    #[command(name = "rebuild-target", short_flag = 'r')]
    GetRebuildTarget,
    /// Set the active slot marker.
    #[command(name = "set", short_flag = 's')]
    SetSlot { slot: String },
    /// Print the image path backing a slot.
    #[command(name = "path", short_flag = 'p')]
    GetPath { slot: String },
    /// Remove stale temporary slot images.
    Cleanup,
}

fn parse_slot(slot: &str) -> eyre::Result<Slot> {
    match slot.to_lowercase().as_str() {
        // Slot A alias.
        "a" | "0" => Ok(Slot::A),
        // Slot B alias.
        "b" | "1" => Ok(Slot::B),
        _ => eyre::bail!("Invalid slot provided, please use either A/a/0 or B/b/1."),
    }
}

/// Runs one CLI invocation and returns the text it would print.
pub fn run(slot_ctrl: &SlotCtrl, cli: Cli) -> eyre::Result<String> {
    let output = match cli.subcmd {
        Commands::GetSlot => slot_ctrl.read_active_slot()?.to_string(),
        Commands::GetRebuildTarget => {
            let active = slot_ctrl.read_active_slot()?;
            slot_ctrl.rebuild_slot_for(active).to_string()
        }
        Commands::SetSlot { slot } => {
            slot_ctrl.write_active_slot(parse_slot(&slot)?)?;
            String::new()
        }
        Commands::GetPath { slot } => {
            slot_ctrl.slot_path(parse_slot(&slot)?).display().to_string()
        }
        Commands::Cleanup => {
            slot_ctrl.cleanup_tmp_files()?;
            String::new()
        }
    };

    Ok(output)
}
