use cnc_slot_ctrl::{
    program::{self, Cli},
    SlotConfig, SlotCtrl,
};

use clap::Parser;
use color_eyre::eyre::Result;

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let slot_ctrl = SlotCtrl::new(SlotConfig::from_env()?);

    let output = program::run(&slot_ctrl, cli)?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}
