use std::sync::Arc;
use tokio::sync::watch;
use wallet_background_bridge::dispatch::FeatureService;
use wallet_background_bridge::transport::SocketConnector;
use wallet_background_bridge::{BackgroundClient, Config, DispatchSink, FeatureFlags, InMemoryStore};

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(err) = run().await {
        tracing::error!(error = %err, "fatal");
        std::process::exit(1);
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}

struct Bridge {
    client: BackgroundClient,
    store: Arc<InMemoryStore>,
    flags: Arc<FeatureFlags>,
    // keeps the visibility channel open for the status reporter
    _visible: watch::Sender<bool>,
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let command = std::env::args().nth(1);
    match command.as_deref() {
        Some("config-init") => return handle_config_init(),
        None | Some("status" | "lock" | "features") => {}
        Some(other) => return Err(format!("unknown command: {other}").into()),
    }

    let config = Config::load()?;
    let bridge = connect(&config).await?;

    let result = match command.as_deref() {
        Some("status") => handle_status(&bridge).await,
        Some("lock") => handle_lock(&bridge).await,
        Some("features") => handle_features(&bridge),
        _ => watch_state(&bridge).await,
    };
    bridge.client.shutdown();
    result
}

async fn connect(config: &Config) -> Result<Bridge, Box<dyn std::error::Error>> {
    let store = Arc::new(InMemoryStore::new());
    let flags = Arc::new(FeatureFlags::new());
    let (visible, visibility) = watch::channel(true);
    let connector = Arc::new(SocketConnector::new(config.socket_dir()));
    tracing::info!(
        endpoint = %connector.endpoint(&config.transport.channel_name).display(),
        "connecting to background service"
    );

    let client = BackgroundClient::new(
        config.client_options(),
        connector,
        DispatchSink::new(store.clone(), flags.clone()),
        visibility,
    );
    client.init().await?;
    Ok(Bridge {
        client,
        store,
        flags,
        _visible: visible,
    })
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

async fn handle_status(bridge: &Bridge) -> Result<(), Box<dyn std::error::Error>> {
    let wallet = bridge.client.get_wallet_status().await?;
    println!("{}", serde_json::to_string_pretty(&wallet)?);
    println!("{}", serde_json::to_string_pretty(&bridge.store.snapshot())?);
    Ok(())
}

async fn handle_lock(bridge: &Bridge) -> Result<(), Box<dyn std::error::Error>> {
    bridge.client.lock_wallet().await?;
    println!("wallet locked");
    Ok(())
}

fn handle_features(bridge: &Bridge) -> Result<(), Box<dyn std::error::Error>> {
    let features = bridge.client.sink().features();
    for name in bridge.flags.names() {
        println!("{name}\t{}", if features.is_on(&name) { "on" } else { "off" });
    }
    Ok(())
}

async fn watch_state(bridge: &Bridge) -> Result<(), Box<dyn std::error::Error>> {
    let mut changes = bridge.store.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                return Ok(());
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let state = changes.borrow_and_update().clone();
                tracing::info!(
                    permissions = state.permissions.len(),
                    transactions = state.transaction_requests.len(),
                    origin = state.active_origin.origin.as_deref().unwrap_or("-"),
                    locked = ?state.keyring_status.is_locked,
                    "state updated"
                );
            }
        }
    }
}
