use checkpointer::config::Config;
use checkpointer::Checkpointer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize the logger, RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::new_from_flags(env!("CARGO_PKG_VERSION"))?;

    // Read the environment. Note that this tries a KubeConfig file first, then
    // falls back on an in-cluster configuration.
    let kube_config = kube::Config::infer().await?;

    let mut checkpointer = Checkpointer::new(&config, kube_config)?;
    checkpointer.run().await
}
