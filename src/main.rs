use anyhow::Context;
use clap::Parser;
use trident::config::{Config, ProviderKind, ServiceConfig};
use trident::server::TridentServer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "trident")]
#[command(about = "HTTP, SOCKS4 and fixed-destination relay proxy")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long)]
    config: Option<String>,

    #[arg(short, long)]
    verbose: bool,

    /// Add an HTTP proxy listening on ADDR:PORT
    #[arg(long, value_name = "ADDR:PORT")]
    http: Option<String>,

    /// Add a SOCKS proxy listening on ADDR:PORT
    #[arg(long, value_name = "ADDR:PORT")]
    socks: Option<String>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,
}

fn build_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path))?,
        None => Config::default(),
    };

    if let Some(listen) = &cli.http {
        config
            .services
            .push(ServiceConfig::from_listen_arg("http", ProviderKind::Http, listen)?);
    }
    if let Some(listen) = &cli.socks {
        config
            .services
            .push(ServiceConfig::from_listen_arg("socks", ProviderKind::Socks, listen)?);
    }
    if config.services.is_empty() {
        config
            .services
            .push(ServiceConfig::new("http", ProviderKind::Http, "127.0.0.1", 8080));
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = build_config(&cli)?;
    if cli.print_config {
        println!("{}", config.to_json()?);
        return Ok(());
    }

    info!("Starting trident");
    let server = TridentServer::new(config).context("failed to set up services")?;
    server.run().await.context("server error")?;

    Ok(())
}
