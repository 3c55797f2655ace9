//! Operator CLI surface (§6.4): `run`, `status`, `override`, `validate`.
//! The CLI is the primary operator interface; the HTTP `/status`/`/override`
//! routes in [`crate::server`] are a secondary, optional surface.

use clap::{Parser, Subcommand};

use crate::state_machine::OverrideMode;

#[derive(Parser, Debug)]
#[command(name = "hag-controller", about = "Home Assistant HVAC supervisory controller")]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, env = "HAG_CONFIG_FILE", default_value = "config.yaml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the controller daemon in the foreground.
    Run {
        /// Address for the optional status/override HTTP surface.
        #[arg(long, default_value = "0.0.0.0:3000")]
        bind: String,
    },
    /// Query the running daemon's status over its HTTP surface.
    Status {
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        url: String,
    },
    /// Issue a manual override to the running daemon.
    Override {
        mode: OverrideMode,
        #[arg(long)]
        target_temp: Option<f64>,
        #[arg(long)]
        duration_minutes: Option<i64>,
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        url: String,
    },
    /// Parse and validate a configuration file without connecting to the gateway.
    Validate {
        path: String,
    },
}

impl std::str::FromStr for OverrideMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "heat" => Ok(OverrideMode::Heat),
            "cool" => Ok(OverrideMode::Cool),
            "off" => Ok(OverrideMode::Off),
            "auto" => Ok(OverrideMode::Auto),
            other => Err(format!("unknown override mode '{other}', expected heat|cool|off|auto")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    Other = 1,
    Configuration = 2,
    Connection = 3,
}

impl From<&crate::error::HagError> for ExitCode {
    fn from(err: &crate::error::HagError) -> Self {
        match err {
            crate::error::HagError::Configuration(_) => ExitCode::Configuration,
            crate::error::HagError::Connection(_) => ExitCode::Connection,
            _ => ExitCode::Other,
        }
    }
}
