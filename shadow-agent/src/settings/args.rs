use clap::Parser;
use serde::Serialize;

/// Shadow daemon keeping the USB-exported FAT image in sync with the master
/// directory.
///
/// All options can also be provided through `CNC_*` environment variables or
/// an optional TOML config file; command line arguments take precedence.
#[derive(Debug, Parser, Serialize)]
#[command(author, version)]
pub struct Args {
    /// The path to an optional TOML config file.
    #[arg(long)]
    #[serde(skip_serializing)]
    pub config: Option<String>,
    /// Override the master directory watched and mirrored into the slot
    /// images.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_dir: Option<String>,
    /// Override the debounce window in seconds.
    #[arg(long = "debounce-seconds")]
    #[serde(
        rename = "shadow_debounce_seconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub debounce_seconds: Option<u64>,
    /// Run exactly one rebuild cycle and exit with its outcome.
    #[arg(long)]
    #[serde(skip_serializing)]
    pub oneshot: bool,
}
