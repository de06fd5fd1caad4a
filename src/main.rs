use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use axum::http::Method;
use envconfig::Envconfig;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zenith::{
    auth::JwtKeys, cleanup, config::Config, crypto::ChatCipher, db::DbRouter, email::Mailer,
    rate_limit::Limiters, AppContext,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zenith=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::init_from_env().context("failed to read configuration")?;
    tracing::info!("Zenith v{} starting", env!("CARGO_PKG_VERSION"));

    let keys = JwtKeys::from_base64_secret(&config.jwt_secret)
        .context("JWT_SECRET must be valid base64")?;

    let mailer = Mailer::new(
        config.smtp_host.as_deref(),
        config.smtp_username.as_deref(),
        config.smtp_password.as_deref(),
        &config.frontend_host,
    )?;
    if mailer.is_enabled() {
        if let Err(e) = mailer.sanity_check().await {
            tracing::warn!(error = %e, "email sanity check failed, password resets will not work");
        }
    }

    let db = DbRouter::connect(&config.db_url, &config.replica_urls(), config.db_pool_max)?;
    let health = db.health_check().await;
    if !health.healthy {
        tracing::warn!(?health, "database is not healthy at startup");
    }

    tokio::spawn(cleanup::run(db.clone(), config.chat_retention_days));

    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
        .allow_origin(Any);

    let app = zenith::app(AppContext {
        db,
        keys: Arc::new(keys),
        mailer,
        cipher: ChatCipher::new(&config.chat_secret),
        limiters: Arc::new(Limiters::new(
            config.rate_limit_window(),
            config.rate_limit_max_requests,
        )),
        assets_dir: PathBuf::from(&config.assets_dir),
    })
    .layer(TraceLayer::new_for_http())
    .layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "listening");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
            }
        })
        .await?;

    Ok(())
}
