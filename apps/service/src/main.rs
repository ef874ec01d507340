use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use wordclaw_service::config::{Config, Environment};
use wordclaw_service::db::Db;
use wordclaw_service::workers::Workers;
use wordclaw_service::{AppState, build_router, provider, store};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("load configuration")?;
    init_tracing(&config);

    let db = match &config.database_url {
        Some(url) => {
            let db = Db::connect(url).await.context("connect database")?;
            if config.migrate_on_start {
                let applied = db.migrate().await.context("apply migrations")?;
                if applied > 0 {
                    tracing::info!(applied, "schema migrations applied");
                }
            }
            Some(db)
        }
        None => {
            tracing::info!("no WC_DATABASE_URL configured; using the in-memory store");
            None
        }
    };

    let store = match &db {
        Some(db) => store::postgres_store(db.clone()),
        None => store::memory(),
    };
    let payment_provider =
        provider::from_config(&config).context("configure payment provider")?;

    let state = AppState::build(config.clone(), store, db, payment_provider);
    state.spawn_webhook_dispatcher();

    if config.dev_bootstrap_enabled
        && config.environment == Environment::Development
        && config.database_url.is_none()
    {
        let (tenant, issued) = state
            .auth
            .bootstrap_tenant("root", "root")
            .await
            .context("bootstrap development tenant")?;
        tracing::info!(
            tenant_id = tenant.id,
            api_key = %issued.secret,
            "development tenant bootstrapped (key shown once)"
        );
    }

    let workers = Workers::new();
    workers
        .start(
            &config,
            state.payments.clone(),
            state.entitlements.clone(),
            state.revenue.clone(),
            state.webhooks.clone(),
        )
        .await;

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "wordclaw service listening");

    let router = build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;

    workers.stop().await;
    tracing::info!("shutdown complete");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_filter)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
