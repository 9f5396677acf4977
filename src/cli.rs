use clap::Parser;
use std::path::PathBuf;

/// Well-known config location, overridable with `--config`.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/oswizard/config.yaml";

/// oswizard - guided workflow engine for a desktop OS installer
#[derive(Parser)]
#[command(name = "oswizard")]
#[command(about = "Guided workflow engine for a desktop OS installer wizard")]
#[command(version)]
pub struct Cli {
    /// Custom path to config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Run in demo mode. Does not alter the system
    #[arg(short, long)]
    pub demo_mode: bool,

    /// Run in testing mode. Does not alter system settings, but runs scripts
    #[arg(short, long)]
    pub test_mode: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
