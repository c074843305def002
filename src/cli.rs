use clap::Parser;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Automatic OBS scene switching driven by SRT ingest state",
    name = "obs-autoscene"
)]
pub struct Cli {
    /// Path to the JSON configuration file. Defaults to config.json inside
    /// the data directory; created with default settings if missing.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Data directory for the config file and logs. Default to $HOME/.obs-autoscene
    #[arg(long, env = "OBS_AUTOSCENE_DATA_DIR")]
    pub data_dir: Option<String>,

    /// Enable debug logging regardless of the configured log level
    #[arg(long)]
    pub debug: bool,
}
