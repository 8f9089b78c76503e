use std::sync::Arc;

use poolgate::entities::StaticEntityStore;
use poolgate::{
    AccountSelector, AdmissionPipeline, AppState, Config, ConcurrencyManager, HttpForwarder,
    IdleCleaner, NoopBillingGate, SessionScheduler, SlotStore,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let mut config_path: Option<String> = None;
    let mut listen_override: Option<String> = None;
    let mut redis_override: Option<String> = None;
    let mut json_logs = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen_override = Some(args.next().ok_or("missing value for --listen/--addr")?);
            }
            "--redis" => {
                redis_override = Some(args.next().ok_or("missing value for --redis")?);
            }
            "--json-logs" => json_logs = true,
            other if config_path.is_none() && !other.starts_with("--") => {
                config_path = Some(other.to_string());
            }
            other => {
                return Err(format!(
                    "unknown arg: {other}\nusage: poolgate [config.json] [--listen HOST:PORT] [--redis URL] [--json-logs]"
                )
                .into());
            }
        }
    }

    init_tracing(json_logs);

    let mut config: Config = match &config_path {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => Config::default(),
    };
    if let Some(listen) = listen_override {
        config.listen = listen;
    }
    if let Some(redis) = redis_override {
        config.redis_url = redis;
    }

    let store = SlotStore::new(
        &config.redis_url,
        config.concurrency.slot_ttl_minutes,
        config.concurrency.wait_queue_ttl_seconds,
    )?;
    store.ping().await?;

    IdleCleaner::new(store.clone(), config.concurrency.cleanup_interval_seconds)
        .start()
        .await;

    let config = Arc::new(config);
    let entities: Arc<StaticEntityStore> = Arc::new(StaticEntityStore::new(config.entities.clone()));
    let concurrency = Arc::new(ConcurrencyManager::new(store.clone(), config.concurrency.clone()));
    let scheduler = SessionScheduler::new(store.clone(), config.concurrency.haiku_max_parallel);
    let selector = AccountSelector::new(
        entities.clone(),
        concurrency.clone(),
        scheduler.clone(),
        config.load_balancing.clone(),
    );
    let pipeline = Arc::new(AdmissionPipeline::new(
        concurrency,
        scheduler,
        selector,
        entities.clone(),
        Arc::new(NoopBillingGate),
        Arc::new(HttpForwarder::new()?),
        config.clone(),
    ));

    let app = poolgate::router(AppState {
        pipeline,
        entities,
        store,
    });
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(listen = %config.listen, "poolgate listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}

fn init_tracing(json_logs: bool) {
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;
    use tracing_subscriber::Layer as _;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer().json().with_target(false).boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
}
