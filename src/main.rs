use std::{process, sync::Arc};

use hostpilot::{
    application::error::AppError,
    cache::{
        CacheConfig, CacheManager, FastCache, HttpQueryFetcher, MemoryQueryCache, QueryKey,
        ResourceGraph,
    },
    config,
    infra::{
        error::InfraError,
        http::{self, RealtimeState},
        telemetry,
    },
    realtime::{EventBus, RealtimeConfig},
    subscription::{
        EventObserver, HttpTransport, SubscriptionClient, SubscriptionConfig, SubscriptionState,
    },
    types::RealtimeEvent,
};
use tokio::sync::oneshot;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

const EVENTS_PATH: &str = "/api/realtime/events";

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Subscribe(args) => run_subscribe(settings, *args).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let bus = Arc::new(EventBus::new(RealtimeConfig::from(&settings.realtime)));
    let router = http::build_router(RealtimeState::new(Arc::clone(&bus)));

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(addr = %settings.server.addr, "Realtime service listening");

    let (signalled_tx, signalled_rx) = oneshot::channel::<()>();
    let shutdown_bus = Arc::clone(&bus);
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!(
                clients = shutdown_bus.client_count(),
                "Shutdown requested; closing realtime subscribers"
            );
            shutdown_bus.close_all();
            let _ = signalled_tx.send(());
        })
        .into_future();

    let grace = settings.server.graceful_shutdown;
    let deadline = async move {
        match signalled_rx.await {
            Ok(()) => tokio::time::sleep(grace).await,
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = server => {
            result.map_err(|err| AppError::from(InfraError::from(err)))?;
            info!("Realtime service stopped");
            Ok(())
        }
        _ = deadline => Err(InfraError::ShutdownTimeout {
            seconds: grace.as_secs(),
        }
        .into()),
    }
}

async fn run_subscribe(
    settings: config::Settings,
    args: config::SubscribeArgs,
) -> Result<(), AppError> {
    let cache_config = CacheConfig::from(&settings.cache);
    let fast = Arc::new(FastCache::new(&cache_config));
    let manager = Arc::new(CacheManager::new(
        ResourceGraph::standard(),
        Arc::clone(&fast),
    ));

    let client = reqwest::Client::builder()
        .build()
        .map_err(|err| AppError::from(InfraError::configuration(err.to_string())))?;
    let fetcher = Arc::new(HttpQueryFetcher::new(
        client.clone(),
        args.url.clone(),
        Arc::clone(&fast),
    ));
    let queries = Arc::new(MemoryQueryCache::new(&cache_config, fetcher));
    manager.set_query_cache(queries.clone());

    let mut observers = Vec::with_capacity(args.watch.len());
    for endpoint in &args.watch {
        let key = QueryKey::new(endpoint.as_str());
        if let Err(err) = queries.fetch(&key).await {
            warn!(endpoint = %endpoint, error = %err, "Initial fetch failed");
        }
        observers.push(queries.observe(key));
    }

    let endpoint = args
        .url
        .join(EVENTS_PATH)
        .map_err(|err| AppError::validation(format!("invalid server url: {err}")))?;
    let transport = Arc::new(HttpTransport::with_client(client, endpoint));
    let observer: EventObserver = Arc::new(|event: &RealtimeEvent| {
        info!(
            resource = %event.resource,
            action = ?event.action,
            entity_id = ?event.entity_id,
            "Change received"
        );
    });

    let mut subscription = SubscriptionClient::new(
        SubscriptionConfig::from(&settings.subscription),
        transport,
        manager,
    )
    .with_organization(args.organization_id)
    .with_observer(observer);
    subscription.connect();

    let mut state = subscription.subscribe_state();
    let mut gc = tokio::time::interval(settings.cache.query_gc_time);
    let outcome = loop {
        tokio::select! {
            _ = shutdown_signal() => break Ok(()),
            changed = state.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let current = *state.borrow_and_update();
                info!(state = %current, "Subscription state changed");
                if current == SubscriptionState::Failed {
                    break Err(AppError::unexpected("realtime subscription failed"));
                }
            }
            _ = gc.tick() => {
                let collected = queries.gc();
                if collected > 0 {
                    info!(collected, "Collected unobserved queries");
                }
            }
        }
    };

    subscription.disconnect();
    drop(observers);
    outcome
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
