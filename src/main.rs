use std::sync::Arc;

use anyhow::{Context, anyhow};
use secrecy::ExposeSecret;
use tokio::signal;
use workspace_billing::billing::{
    AccessStatusCache, CheckoutConfig, LimitResolver, LiveStripeClient, LiveStripeClientConfig,
    PlanCatalog, PriceResolver, SeaOrmSubscriptionStore, SeaOrmUserDirectory,
    SubscriptionLifecycle, TracingAuditLogger, WebhookHandler, WorkspaceAccessGate,
    ensure_billing_tables,
};
use workspace_billing::{BillingState, ConfigBuilder, billing_router, init_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ConfigBuilder::new().from_env().build()?;
    tracing::info!(environment = ?config.environment, "Starting workspace billing");

    let database_url = config
        .database
        .url
        .as_ref()
        .ok_or_else(|| anyhow!("DATABASE_URL is not set"))?;
    let db = sea_orm::Database::connect(database_url.expose_secret())
        .await
        .context("failed to connect to database")?;
    ensure_billing_tables(&db)
        .await
        .context("failed to create billing tables")?;

    let catalog = Arc::new(
        PlanCatalog::open(
            &config.billing.plans_path,
            config.environment,
            PriceResolver::new(config.billing.home_country.clone()),
            LimitResolver::from_env(),
        )
        .await
        .context("failed to load plan catalog")?,
    );

    let secret_key = config
        .stripe
        .secret_key
        .clone()
        .ok_or_else(|| anyhow!("STRIPE_SECRET_KEY is not set"))?;
    let webhook_secret = config
        .stripe
        .webhook_secret
        .clone()
        .ok_or_else(|| anyhow!("STRIPE_WEBHOOK_SECRET is not set"))?;
    let gateway = LiveStripeClient::new(
        secret_key,
        LiveStripeClientConfig::new()
            .max_retries(config.stripe.max_retries)
            .timeout_seconds(config.stripe.timeout_secs),
    )?;
    if !gateway.is_live_mode() {
        tracing::warn!("Stripe is running in test mode");
    }

    let checkout = CheckoutConfig::new(
        config.billing.checkout_success_url.clone(),
        config.billing.checkout_cancel_url.clone(),
    )
    .allowed_redirect_domains(config.billing.allowed_redirect_domains.clone());
    checkout.validate()?;

    let store = SeaOrmSubscriptionStore::new(db.clone());
    let directory = SeaOrmUserDirectory::new(db.clone());
    let access_cache = AccessStatusCache::new(config.billing.access_cache_ttl());

    let lifecycle = Arc::new(
        SubscriptionLifecycle::new(
            store.clone(),
            directory.clone(),
            gateway,
            catalog,
            checkout,
        )
        .with_audit_logger(Arc::new(TracingAuditLogger))
        .with_access_cache(access_cache.clone()),
    );
    let gate = Arc::new(WorkspaceAccessGate::new(store, directory).with_cache(access_cache.clone()));
    let webhooks =
        Arc::new(WebhookHandler::new(lifecycle.clone(), webhook_secret).with_access_cache(access_cache));

    let app = billing_router(BillingState {
        lifecycle,
        gate,
        webhooks,
    });

    let addr = config.server.addr().context("invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(%addr, "Billing server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down, closing database connection");
    db.close().await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, starting graceful shutdown");
        },
    }
}
