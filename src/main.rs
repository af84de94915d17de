use clap::Parser;
use fleet_monitor::api;
use fleet_monitor::config::{AppConfig, CliArgs, ConnectionMode};
use fleet_monitor::endpoint::EndpointResolver;
use fleet_monitor::logging;
use fleet_monitor::notifier::{DesktopBackend, Notifier};
use fleet_monitor::poller::PollConnector;
use fleet_monitor::realtime::{ConnectionManager, Connector, ManagerConfig, WsConnector};
use fleet_monitor::registry::Registry;
use fleet_monitor::sentry_init;
use fleet_monitor::sink::{ConsoleSink, FanoutSink, RenderSink, SnapshotSink};
use fleet_monitor::store::JsonFileStore;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let config = AppConfig::from_cli(&args)?;

    let _log_guard = logging::init(Some(config.log_path().as_path()));

    info!("========================================");
    info!("Moonraker Fleet Monitor Starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("========================================");

    // Must stay alive until exit
    let _sentry_guard = sentry_init::init();

    let store = JsonFileStore::open(config.registry_path());
    info!("Registry store at: {:?}", store.path());
    let mut registry = Registry::load(store);
    let registry_events = registry.subscribe();

    let notifier = if config.notifications {
        Notifier::new(Arc::new(DesktopBackend::new()))
    } else {
        Notifier::disabled()
    };

    let cards = SnapshotSink::new();
    let sink: Arc<dyn RenderSink> = Arc::new(FanoutSink::new(vec![
        Arc::new(ConsoleSink::new()),
        Arc::new(cards.clone()),
    ]));

    let resolver = EndpointResolver::from_config(&config);
    let connector: Arc<dyn Connector> = match config.mode {
        ConnectionMode::Push => Arc::new(WsConnector::new(resolver, config.connect_timeout())),
        ConnectionMode::Poll => Arc::new(PollConnector::new(
            resolver,
            registry.refresh_interval_secs(),
            config.connect_timeout(),
        )),
    };
    info!("Connection mode: {:?}", config.mode);

    let (manager, manager_task) = ConnectionManager::spawn(
        registry.records().to_vec(),
        registry_events,
        connector,
        sink,
        notifier.clone(),
        ManagerConfig {
            reconnect_delay: config.reconnect_delay(),
        },
    );
    manager.start_all();

    let registry = Arc::new(Mutex::new(registry));

    if let Some(addr) = config.api_address() {
        let api_state = api::ApiState {
            registry: registry.clone(),
            manager: manager.clone(),
            cards,
            notifier,
            mode: config.mode,
            start_time: Instant::now(),
        };
        let addr = addr.to_string();
        tokio::spawn(async move {
            if let Err(e) = api::start_api_server(&addr, api_state).await {
                error!("Failed to start HTTP API server: {}", e);
            }
        });
    } else {
        info!("Local command API disabled");
    }

    info!("Monitoring started");

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Moonraker Fleet Monitor shutting down...");
    manager.stop_all();
    manager.shutdown();
    if let Err(e) = manager_task.await {
        error!("Connection manager task failed: {}", e);
    }

    Ok(())
}
