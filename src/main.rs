use anyhow::Context;
use mmpay_orchestrator::api::{router, AppState};
use mmpay_orchestrator::cache::{IdempotencyStore, InMemoryIdempotencyStore};
use mmpay_orchestrator::clock::{SharedClock, SystemClock};
use mmpay_orchestrator::config::AppConfig;
use mmpay_orchestrator::database::{
    InMemoryLedger, InMemoryPaymentMethodStore, PaymentMethodStore, TransactionLedger,
};
use mmpay_orchestrator::health::HealthChecker;
use mmpay_orchestrator::logging::init_tracing;
use mmpay_orchestrator::payments::credentials::ProviderCredential;
use mmpay_orchestrator::payments::registry::ProviderRegistry;
use mmpay_orchestrator::services::balance::{BalanceStore, InMemoryBalanceStore};
use mmpay_orchestrator::services::notification::{logging_handler, EventHandler};
use mmpay_orchestrator::services::{PaymentOrchestrator, WebhookProcessor};
use mmpay_orchestrator::workers::ReconciliationWorker;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

const EVENT_BUFFER: usize = 1024;

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

/// Ledger, payout destinations and balances share one backend.
struct Storage {
    ledger: Arc<dyn TransactionLedger>,
    payment_methods: Arc<dyn PaymentMethodStore>,
    balances: Arc<dyn BalanceStore>,
}

async fn build_storage(config: &AppConfig) -> anyhow::Result<Storage> {
    #[cfg(feature = "database")]
    if let Some(db) = &config.database {
        use mmpay_orchestrator::database::{
            init_pool_from_config, run_migrations, PostgresLedger, PostgresPaymentMethodStore,
        };
        use mmpay_orchestrator::services::balance::PostgresBalanceStore;

        info!("Initializing database connection pool...");
        let pool = init_pool_from_config(db)
            .await
            .context("failed to initialize database pool")?;
        run_migrations(&pool)
            .await
            .context("failed to run migrations")?;
        info!(
            max_connections = pool.options().get_max_connections(),
            "Database connection pool initialized"
        );
        return Ok(Storage {
            ledger: Arc::new(PostgresLedger::new(pool.clone())),
            payment_methods: Arc::new(PostgresPaymentMethodStore::new(pool.clone())),
            balances: Arc::new(PostgresBalanceStore::new(pool)),
        });
    }

    if config.database.is_some() {
        warn!("DATABASE_URL set but the database feature is disabled");
    }
    warn!("Using in-memory storage; transactions and balances are lost on restart");
    Ok(Storage {
        ledger: Arc::new(InMemoryLedger::new()),
        payment_methods: Arc::new(InMemoryPaymentMethodStore::new()),
        balances: Arc::new(InMemoryBalanceStore::new()),
    })
}

async fn build_idempotency_store(
    config: &AppConfig,
    clock: SharedClock,
) -> anyhow::Result<Arc<dyn IdempotencyStore>> {
    let ttl_secs = config.orchestrator.idempotency_key_ttl_secs;

    #[cfg(feature = "cache")]
    if let Some(cache) = &config.cache {
        use mmpay_orchestrator::cache::{init_cache_pool, RedisIdempotencyStore};

        info!("Initializing Redis connection pool...");
        let pool = init_cache_pool(cache)
            .await
            .context("failed to initialize redis pool")?;
        return Ok(Arc::new(RedisIdempotencyStore::new(pool, ttl_secs)));
    }

    if config.cache.is_some() {
        warn!("REDIS_URL set but the cache feature is disabled");
    }
    info!("Using in-memory idempotency store");
    Ok(Arc::new(InMemoryIdempotencyStore::new(
        chrono::Duration::seconds(ttl_secs as i64),
        clock,
    )))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    init_tracing(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        "Starting payment orchestrator"
    );

    let clock: SharedClock = Arc::new(SystemClock);

    let registry = ProviderRegistry::from_env().context("no payment provider could be configured")?;
    let qr_merchants: HashMap<_, _> = registry
        .names()
        .into_iter()
        .filter_map(|name| {
            ProviderCredential::from_env(name)
                .ok()
                .map(|credential| (name, credential.merchant_id))
        })
        .collect();
    info!(providers = ?registry.names(), "Payment providers registered");

    let Storage {
        ledger,
        payment_methods,
        balances,
    } = build_storage(&config).await?;
    let idempotency = build_idempotency_store(&config, clock.clone()).await?;

    let events = EventHandler::new(EVENT_BUFFER, logging_handler());
    let producer = events.subscribe();
    tokio::spawn(events.start_handler());

    let orchestrator = PaymentOrchestrator::new(
        registry.clone(),
        ledger.clone(),
        idempotency.clone(),
        config.orchestrator.clone(),
    )
    .with_balances(balances)
    .with_payment_methods(payment_methods)
    .with_events(producer)
    .with_clock(clock);

    let webhooks = WebhookProcessor::new(orchestrator.clone(), config.webhook.clone());
    let health = HealthChecker::new(ledger, idempotency, registry);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = ReconciliationWorker::new(orchestrator.clone(), config.reconciliation.clone());
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));
    info!(
        interval_secs = config.reconciliation.interval_secs,
        "Reconciliation worker started"
    );

    let app = router(AppState {
        orchestrator,
        webhooks,
        health,
        qr_merchants: Arc::new(qr_merchants),
    });

    let addr: SocketAddr = config
        .server
        .bind_address()
        .parse()
        .context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(address = %addr, "Server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal_with_notify(shutdown_tx))
    .await
    .context("server error")?;

    if let Err(e) = worker_handle.await {
        error!(error = %e, "reconciliation worker panicked");
    }

    info!("Server shutdown complete");
    Ok(())
}
