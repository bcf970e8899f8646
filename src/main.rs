use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use eyre::WrapErr;
use tokio_util::sync::CancellationToken;

use lockmint_relayer::api::{self, AppState};
use lockmint_relayer::config::Config;
use lockmint_relayer::coordinator::{CoordinatorConfig, RelayCoordinator};
use lockmint_relayer::dispatch::{DispatchEngine, EvmMintSubmitter, LocalKeySigner};
use lockmint_relayer::finality::FinalityGate;
use lockmint_relayer::metrics;
use lockmint_relayer::reader::evm::FinalityTag;
use lockmint_relayer::reader::{ChainClient, ChainReader, EvmChainClient};
use lockmint_relayer::rpc::JsonRpcClient;
use lockmint_relayer::store::{postgres, EventStore, PgEventStore};

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting Lockmint Relayer");

    let config = Config::load()?;
    tracing::info!(
        source_chain = %config.source.chain_id,
        destination_chain_id = config.destination.chain_id,
        source_confirmations = config.source.required_confirmations,
        destination_confirmations = config.destination.required_confirmations,
        "Configuration loaded"
    );

    let pool = postgres::create_pool(&config.database.url).await?;
    tracing::info!("Database connected");

    postgres::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    let store: Arc<dyn EventStore> = Arc::new(PgEventStore::new(pool));

    // Source side
    let source_rpc = JsonRpcClient::new(config.source.rpc_urls.clone())?;
    let source_contract = Address::from_str(&config.source.contract_address)
        .wrap_err("Invalid SOURCE_CONTRACT_ADDRESS")?;
    let finality_tag = FinalityTag::from_str(&config.source.finality_tag)?;
    let source_client: Arc<dyn ChainClient> = Arc::new(EvmChainClient::new(
        config.source.chain_id.clone(),
        source_rpc,
        source_contract,
        config.source.asset_id.clone(),
        finality_tag,
    ));
    let reader = ChainReader::new(source_client.clone(), config.reader_config());
    let gate = FinalityGate::new(
        source_client,
        store.clone(),
        config.source.required_confirmations,
        config.poll_interval(),
    );

    // Destination side
    let dest_rpc = JsonRpcClient::new(config.destination.rpc_urls.clone())?;
    let gateway = Address::from_str(&config.destination.contract_address)
        .wrap_err("Invalid DEST_CONTRACT_ADDRESS")?;
    let signer = LocalKeySigner::from_private_key(&config.destination.private_key)?;
    let submitter = EvmMintSubmitter::new(
        dest_rpc,
        gateway,
        signer,
        config.destination.chain_id,
        config.mint_lookup_config(),
    )?;
    submitter.verify_chain_id().await?;
    let engine = DispatchEngine::new(store.clone(), Arc::new(submitter), config.dispatch_config());

    let coordinator = RelayCoordinator::new(
        store.clone(),
        reader,
        gate,
        engine,
        CoordinatorConfig {
            start_block: config.source.start_block,
            dispatch_workers: config.relay.dispatch_workers,
            queue_capacity: config.relay.dispatch_queue_capacity,
            sweep_interval: config.poll_interval(),
            ..Default::default()
        },
    );

    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_token.cancel();
    });

    let api_state = AppState {
        stats: coordinator.stats(),
        store,
    };
    let api_bind = config.api.bind_address.clone();
    let api_port = config.api.port;
    let api_token = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api::start_server(&api_bind, api_port, api_state, api_token).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    metrics::UP.set(1.0);
    let result = coordinator.run(shutdown.clone()).await;
    metrics::UP.set(0.0);

    shutdown.cancel();
    if tokio::time::timeout(Duration::from_secs(5), api_handle)
        .await
        .is_err()
    {
        tracing::warn!("API server did not stop in time");
    }

    if let Err(e) = result {
        tracing::error!(error = %e, "Relay coordinator stopped with error");
        return Err(e.into());
    }

    tracing::info!("Lockmint Relayer stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
///
/// `LOG_FORMAT=json` switches to JSON lines.
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,lockmint_relayer=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
