use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "overseerd")]
#[command(about = "overseer reconciliation daemon", long_about = None)]
pub struct Cli {
    /// Path to the config file. If not provided, the daemon looks for $OVERSEER_CONFIG, then
    /// overseer.toml in the current working directory, the home config dir
    /// ($HOME/.config/overseer/config.toml) and the system config dir
    /// (/etc/overseer/config.toml), falling back to defaults.
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<PathBuf>,

    /// Create a demo `Sample` resource after startup.
    #[arg(long = "demo")]
    pub demo: bool,
}
