use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod logging;

#[derive(Parser)]
#[command(name = "dubbo-registry")]
#[command(about = "Run a dubbo service registry or talk to one")]
#[command(version)]
struct Cli {
    /// Configuration file (YAML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a registry server
    Server {
        /// Listen address, overrides the configuration file
        #[arg(short, long)]
        listen: Option<String>,

        /// Registry address advertised to clients on login (repeatable)
        #[arg(long = "sync")]
        sync: Vec<String>,
    },

    /// Publish a provider and keep it registered until interrupted
    Publish {
        #[command(flatten)]
        session: SessionArgs,

        #[command(flatten)]
        service: ServiceArgs,

        /// Provider export URL, e.g. dubbo://10.0.0.1:20880/com.foo.Bar
        #[arg(short, long)]
        url: String,
    },

    /// Subscribe to a service and print every provider list
    Subscribe {
        #[command(flatten)]
        session: SessionArgs,

        #[command(flatten)]
        service: ServiceArgs,
    },
}

/// Connection settings shared by the client commands
#[derive(Args)]
pub struct SessionArgs {
    /// Comma-separated registry addresses, overrides the configuration file
    #[arg(short, long)]
    pub registry: Option<String>,

    /// Application name reported to the registry
    #[arg(short, long, default_value = "dubbo-registry-cli")]
    pub app: String,

    /// Directory for the durable provider cache
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
}

/// Identity of the service being published or watched
#[derive(Args)]
pub struct ServiceArgs {
    /// Service interface name
    #[arg(short, long)]
    pub interface: String,

    /// Service version
    #[arg(short = 'v', long, default_value = "1.0.0")]
    pub service_version: String,

    /// Service group
    #[arg(short, long)]
    pub group: Option<String>,
}

fn main() -> Result<()> {
    smol::block_on(async {
        let cli = Cli::parse();
        let _guard = logging::init(&cli.log_level, cli.log_file.as_deref())?;
        let config = commands::load_config(cli.config.as_deref()).await?;

        match cli.command {
            Commands::Server { listen, sync } => commands::server::run(config, listen, sync).await,
            Commands::Publish {
                session,
                service,
                url,
            } => commands::publish::run(config, session, service, url).await,
            Commands::Subscribe { session, service } => {
                commands::subscribe::run(config, session, service).await
            }
        }
    })
}
