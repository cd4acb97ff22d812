use clap::{Parser, ValueEnum};
use credbroker_core::install_signal_handler;
use credbroker_credhub::CredhubClient;
use credbroker_server::{Broker, BrokerConfig, ServerError};
use credbroker_store::{CredentialStore, FileStore, MemoryStore};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StoreKind {
    /// CredHub, as configured in `[credhub]`.
    Credhub,
    /// In-process, lost on exit.
    Memory,
    /// Local directory under `--data-dir`.
    File,
}

#[derive(Parser)]
#[command(
    name = "credbroker-server",
    version,
    about = "Open Service Broker for secrets held in CredHub"
)]
struct Cli {
    /// Broker config file (TOML).
    #[arg(long, default_value = "credbroker.toml")]
    config: PathBuf,

    /// Port to listen on; overrides `[api] port`.
    #[arg(long)]
    port: Option<u16>,

    /// Credential store backend.
    #[arg(long, value_enum, default_value_t = StoreKind::Credhub)]
    store: StoreKind,

    /// Directory for the `file` store.
    #[arg(long, default_value = "./credbroker-data")]
    data_dir: PathBuf,
}

fn open_store(
    kind: StoreKind,
    config: &BrokerConfig,
    data_dir: PathBuf,
) -> Result<Arc<dyn CredentialStore>, ServerError> {
    Ok(match kind {
        StoreKind::Credhub => Arc::new(CredhubClient::new(config.credhub.client_config()?)?),
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::File => Arc::new(FileStore::open(data_dir)?),
    })
}

fn run(cli: Cli) -> Result<(), ServerError> {
    let mut config = BrokerConfig::load(&cli.config)?;
    if let Some(port) = cli.port {
        config.api.port = port;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.api.log_level)),
        )
        .init();

    install_signal_handler();

    let store = open_store(cli.store, &config, cli.data_dir)?;
    let addr = format!("0.0.0.0:{}", config.api.port);
    info!("starting credbroker-server on {addr}");

    let broker = Arc::new(Broker::new(config, store)?);
    credbroker_server::run_server(&broker, &addr, broker.config().api.workers)
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
