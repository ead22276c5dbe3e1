mod cli;

// un Err sale con código 1 (conexión, respuesta del nodo, archivos)
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::run().await
}
