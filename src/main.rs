use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

use voicecast_lib::Config;

#[derive(Debug, Parser)]
#[command(name = "voicecast", version, about = "Streams synthesized speech to WebRTC peers")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "VOICECAST_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `server.bind`
    #[arg(short, long, env = "VOICECAST_BIND")]
    bind: Option<SocketAddr>,

    /// Overrides `logging.filter` (RUST_LOG still wins)
    #[arg(long, env = "VOICECAST_LOG")]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(filter) = cli.log {
        config.logging.filter = Some(filter);
    }

    voicecast_lib::run(config).await
}
