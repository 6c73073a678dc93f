//! Container registry server
//!
//! Run with: cargo run -p container-registry --features cli -- --config registry.toml

use std::net::SocketAddr;

use camino::Utf8PathBuf;
use clap::Parser;
use registry::{RegistryBuilder, ServerConfig};
use tracing_subscriber::EnvFilter;

const DEFAULT_LISTEN: &str = "127.0.0.1:5000";

#[derive(Debug, Parser)]
#[command(version, about = "Versioned OCI container registry")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long, short)]
    config: Option<Utf8PathBuf>,

    /// Address to listen on, overriding the configuration file
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn load_config(path: Option<&Utf8PathBuf>) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let Some(path) = path else {
        return Ok(ServerConfig::default());
    };
    let text = tokio::fs::read_to_string(path).await?;
    let config = toml_edit::de::from_str(&text)?;
    tracing::debug!(%path, "loaded configuration");
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = load_config(args.config.as_ref()).await?;
    let addr = match (args.listen, config.listen) {
        (Some(addr), _) | (None, Some(addr)) => addr,
        (None, None) => DEFAULT_LISTEN.parse()?,
    };

    let storage = config.storage.build()?;
    let app = RegistryBuilder::new()
        .config(config.registry)
        .storage(storage)
        .build()
        .router();

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("OCI Registry listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
