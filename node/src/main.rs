use anyhow::Result;
use node::{Node, NodeConfig};
use std::path::Path;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("node=debug,tower_http=info")),
        )
        .init();

    // configuración: archivo JSON si se pasa como argumento, si no variables de entorno
    let config = match std::env::args().nth(1) {
        Some(path) => NodeConfig::from_file(Path::new(&path))?,
        None => NodeConfig::from_env()?,
    };

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    info!(
        "nodo {} en {} (pares: {}, raíz: {})",
        config.node_id,
        hostname,
        config.peers.len(),
        config.root_dir().display()
    );

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    let node = Node::with_defaults(config);

    let on_signal = node.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.stop();
        }
    });

    node.serve(listener).await
}
