use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "keeld")]
#[command(about = "keel node agent", long_about = None)]
pub struct Cli {
    /// Path to the config file. If not provided, the daemon will look for keel.toml in the
    /// current working directory, then in the home config dir ($HOME/.config/keel/config.toml)
    /// and finally in the system config dir (/etc/keel/config.toml)
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<PathBuf>,
}
