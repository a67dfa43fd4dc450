use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use techlog_pump::config::Config;
use techlog_pump::{logging, service, supervisor};

#[derive(Parser)]
#[command(
    name = "techlog-pump",
    version,
    about = "Ships 1C technology logs into ClickHouse"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<ServiceCommand>,
}

#[derive(Subcommand)]
enum ServiceCommand {
    /// Register the service with systemd and enable it.
    Install,
    /// Start the installed service.
    Start,
    /// Stop the installed service.
    Stop,
    /// Disable the service and remove its unit file.
    Uninstall,
}

impl From<ServiceCommand> for service::Action {
    fn from(command: ServiceCommand) -> Self {
        match command {
            ServiceCommand::Install => service::Action::Install,
            ServiceCommand::Start => service::Action::Start,
            ServiceCommand::Stop => service::Action::Stop,
            ServiceCommand::Uninstall => service::Action::Uninstall,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(command) = cli.command {
        return service::control(command.into(), &cli.config);
    }

    let config = Config::load(&cli.config)
        .with_context(|| format!("invalid configuration {}", cli.config.display()))?;
    let _logging = logging::init(&config.logging)?;

    supervisor::run(&cli.config, config).await
}
