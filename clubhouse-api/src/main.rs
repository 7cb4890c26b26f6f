use anyhow::Context;
use clubhouse_api::{app, worker, AppState, AuthConfig, LedgerSettings, RateLimit, Repositories};
use clubhouse_core::payment::PaymentProcessor;
use clubhouse_core::MockPaymentProcessor;
use clubhouse_store::app_config::{Config, ProcessorProvider};
use clubhouse_store::{DbClient, RedisClient, StripeProcessor};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clubhouse_api=debug,clubhouse_ledger=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Clubhouse ledger on port {}", config.server.port);

    let db = DbClient::new(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;
    config.business_rules = db
        .fetch_business_rules(config.business_rules.clone())
        .await
        .context("Failed to read business rules")?;

    let processor: Arc<dyn PaymentProcessor> = match config.processor.provider {
        ProcessorProvider::Stripe => Arc::new(StripeProcessor::new(&config.processor)?),
        ProcessorProvider::Mock => {
            tracing::warn!("Using the in-process mock payment processor; no real money moves");
            Arc::new(MockPaymentProcessor::new())
        }
    };

    let settings = LedgerSettings::from_config(&config);
    let mut state = AppState::new(
        Repositories::postgres(db.pool.clone()),
        processor,
        &settings,
        AuthConfig {
            secret: config.auth.jwt_secret.clone(),
        },
    )?;

    if let Some(redis) = &config.redis {
        match RedisClient::new(&redis.url) {
            Ok(client) => {
                state = state.with_rate_limit(RateLimit {
                    redis: Arc::new(client),
                    requests_per_minute: redis.requests_per_minute,
                });
            }
            Err(e) => tracing::warn!(error = %e, "Redis unavailable; rate limiting disabled"),
        }
    }

    if config.scheduler.enabled {
        worker::start_scheduler(state.clone(), &config.scheduler);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state).into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
