#![deny(rust_2018_idioms)]
#![deny(clippy::all, clippy::pedantic)]

#[derive(Debug, clap::Parser)]
#[command(name = "burst-echo", version, about = "Echoes every received byte back to its sender")]
struct Options {
    /// TOML file with server settings
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Port to listen on, overriding the config file
    #[arg(long)]
    port: Option<u16>,

    /// Number of event loops, overriding the config file
    #[arg(long)]
    loops: Option<usize>,
}

struct EchoHandler;

#[async_trait::async_trait(?Send)]
impl burst::Handler for EchoHandler {
    async fn on_read(&self, buffer: &mut burst::Buffer, channel: &burst::Channel) -> Result<(), burst::Error> {
        tracing::debug!(channel = %channel.id(), received = %String::from_utf8_lossy(buffer.readable()?), "echo");

        let mut reply = buffer.duplicate()?;
        let _ = channel.send(&mut reply).await?;
        Ok(())
    }
}

fn main() -> Result<(), burst::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let options = <Options as clap::Parser>::parse();

    let mut config = match &options.config {
        Some(path) => burst::ServerConfig::load(path)?,
        None => burst::ServerConfig::default(),
    };
    if let Some(port) = options.port {
        config.port = port;
    }
    if let Some(loops) = options.loops {
        config.loops = loops;
    }

    let group = std::sync::Arc::new(burst::EventLoopGroup::new(config.loops)?);
    let acceptor = burst::Acceptor::bind(&config, group.clone(), |pipeline| {
        pipeline.add_handler(EchoHandler);
    })?;

    let result = acceptor.run();
    group.shutdown();
    group.join();
    result
}
