use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "kamal-napper")]
#[command(version = concat!("Ver:", env!("CARGO_PKG_VERSION")))]
#[command(about = "Naps idle Kamal app containers and wakes them when traffic returns")]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Override the state directory from the configuration
    #[arg(long = "state-dir")]
    pub state_dir: Option<PathBuf>,

    /// Override the log level (debug, info, warn, error)
    #[arg(long = "log-level")]
    pub log_level: Option<String>,

    /// Validate the configuration, print it, and exit
    #[arg(long = "check-config")]
    pub check_config: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
