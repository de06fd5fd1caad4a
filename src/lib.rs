use std::{io, path::PathBuf, sync::Arc};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::{self, Next},
    routing::get_service,
    Extension, Router,
};
use tokio::sync::Mutex;
use tower_http::services::ServeDir;

pub mod api;
pub mod auth;
pub mod cleanup;
pub mod config;
pub mod crypto;
pub mod db;
pub mod email;
pub mod error;
pub mod grading;
pub mod models;
pub mod notify;
pub mod policy;
pub mod rate_limit;
pub mod schema;
pub mod validation;

/// Everything the handlers reach through request extensions.
#[derive(Clone)]
pub struct AppContext {
    pub db: db::DbRouter,
    pub keys: Arc<auth::JwtKeys>,
    pub mailer: email::Mailer,
    pub cipher: crypto::ChatCipher,
    pub limiters: Arc<rate_limit::Limiters>,
    pub assets_dir: PathBuf,
}

pub fn app(ctx: AppContext) -> Router {
    let serve = get_service(ServeDir::new(&ctx.assets_dir)).handle_error(handle_error);
    let resets: api::password::SharedResets = Arc::new(Mutex::new(api::password::Resets::default()));

    let limiters = ctx.limiters.clone();
    let api = api::app().layer(middleware::from_fn(
        move |req: Request<Body>, next: Next<Body>| {
            rate_limit::limit_api(limiters.clone(), req, next)
        },
    ));

    Router::new()
        .nest("/api", api)
        .nest("/assets", serve)
        .layer(Extension(ctx.db))
        .layer(Extension(ctx.keys))
        .layer(Extension(ctx.mailer))
        .layer(Extension(ctx.cipher))
        .layer(Extension(ctx.limiters))
        .layer(Extension(api::upload::UploadDir(ctx.assets_dir.join("uploads"))))
        .layer(Extension(resets))
}

async fn handle_error(_: io::Error) -> error::AppError {
    error::AppError::from(StatusCode::INTERNAL_SERVER_ERROR, "failed to fetch asset")
}
