mod banner;
mod config;
mod content_type;
mod error;
mod listing;
mod no_cache;
mod server;
mod static_files;

use tracing_subscriber::EnvFilter;

use crate::{
    config::{enter_root, ServerConfig},
    server::Server,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_launch_dir()?;
    enter_root(&config.root)?;
    tracing::debug!(root = %config.root.display(), "Serving directory");

    let server = Server::bind(config)?;
    print!("{}", banner::banner(server.local_addr()?.port()));

    server.run_until(interrupted()).await?;
    println!("{}", banner::SHUTDOWN);
    Ok(())
}

async fn interrupted() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "Could not listen for Ctrl+C, stop the process another way");
        std::future::pending::<()>().await;
    }
}
