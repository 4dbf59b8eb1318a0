mod cli;

use std::path::Path;

use clap::Parser;
use cli::{Cli, Commands};
use recast::config::Config;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // The storage probe must stay silent and cheap: no logging, no runtime.
    if let Commands::StorageProbe { path } = &cli.command {
        let access = recast::storage::probe_access(path);
        println!("{}", access.verdict());
        return Ok(());
    }

    // Initialize tracing. Respect RUST_LOG env var; otherwise use defaults
    // based on the verbose flag.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "recast=trace,recast_common=debug,tower_http=debug".to_string()
        } else {
            "recast=info,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&env_filter))
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(host, port, cli.config.as_deref()))
        }
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::HashPassword { password } => hash_password(&password),
        Commands::GenerateApiToken => {
            println!("{}", recast::server::auth::generate_api_token());
            Ok(())
        }
        Commands::Version => {
            println!("recast {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::StorageProbe { .. } => unreachable!("handled above"),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn start_server(
    host: String,
    port: u16,
    config_path: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::load_or_default(config_path);

    // Override host/port from CLI flags.
    config.server.host = host;
    config.server.port = port;
    config.validate()?;

    tracing::info!("Starting recast gateway");
    tracing::info!(
        "Server will listen on {}:{}",
        config.server.host,
        config.server.port
    );

    recast::server::start_server(config).await?;
    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(path) = path else {
        return Err("no config file given; pass --config".into());
    };
    let config = Config::load(path)?;
    config.validate()?;
    println!("{} is valid", path.display());
    Ok(())
}

fn hash_password(password: &str) -> Result<(), Box<dyn std::error::Error>> {
    let hash = recast::server::auth::hash_password(password)?;
    println!("{hash}");
    Ok(())
}
