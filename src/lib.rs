pub mod config;
pub mod error;
pub mod logger;
pub mod peer;
pub mod registry;
pub mod server;
pub mod session;
pub mod signaling;
pub mod streaming;
pub mod synthesis;
pub mod utils;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use registry::SessionRegistry;
pub use session::{Session, SessionState};

/// Loads logging from `config` and serves until a shutdown signal.
pub async fn run(config: Config) -> anyhow::Result<()> {
    logger::init(config.logging.filter.as_deref());
    server::serve(config).await
}
