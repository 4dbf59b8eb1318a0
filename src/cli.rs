use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "recast", about = "Control and playback gateway for set-top-box receivers")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway server
    Start {
        /// Bind host
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Bind port
        #[arg(long, default_value_t = 8089)]
        port: u16,
    },

    /// Validate a configuration file
    Validate {
        /// Config file to validate (falls back to --config)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Generate a bcrypt hash for the login password
    HashPassword { password: String },

    /// Generate a random API bearer token
    GenerateApiToken,

    /// Print the version
    Version,

    /// Internal: probe a storage path and print rw/ro/none.
    /// Run as a child process so hung filesystem calls stay isolated.
    #[command(hide = true)]
    StorageProbe { path: PathBuf },
}
