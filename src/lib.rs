pub mod cli;
pub mod config;
pub mod monitor;
pub mod obs;
pub mod status;

pub use cli::Cli;
pub use config::{BitrateConfig, Config, LoadOutcome, LogLevel};
pub use monitor::{Monitor, MonitorSettings, MonitorState, TickReport};
pub use obs::{ObsError, ObsResult, ObsSession, SceneController};
pub use status::{SrtConnection, StatusClient, StatusError, StatusResult, StatusSource};
