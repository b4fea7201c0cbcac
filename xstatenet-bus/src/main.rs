#[cfg(unix)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::EnvFilter;
    use xstatenet_bus::server::MessageBusServer;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let pipe_name = parse_pipe_name();
    let server = MessageBusServer::bind(&pipe_name).await?;
    tracing::info!(
        pipe = %pipe_name,
        path = %server.local_path().display(),
        "message bus server listening"
    );
    server.run().await?;
    Ok(())
}

/// Pipe name from `--pipe-name <name>` CLI arg or `XSTATENET_PIPE` env var.
#[cfg(unix)]
fn parse_pipe_name() -> String {
    let args: Vec<String> = std::env::args().collect();
    if let Some(name) = args
        .windows(2)
        .find(|w| w[0] == "--pipe-name")
        .map(|w| w[1].clone())
    {
        return name;
    }
    std::env::var("XSTATENET_PIPE")
        .unwrap_or_else(|_| xstatenet_bus::DEFAULT_PIPE_NAME.to_string())
}

#[cfg(not(unix))]
fn main() {
    eprintln!("the message bus server requires a unix platform");
    std::process::exit(1);
}
