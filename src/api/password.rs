use crate::{
    api::auth::normalize_email,
    auth,
    db::DbRouter,
    email::{self, Mailer},
    error::{AppError, AppResult},
    models::User,
    schema::*,
    validation,
};
use axum::{
    extract::Path,
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use nanoid::nanoid;
use serde::Deserialize;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use uuid::Uuid;

// 1 hour
pub const RESET_ALLOWED_TIME: Duration = Duration::from_secs(60 * 60);
// 7 days, for accounts created by an admin
pub const WELCOME_ALLOWED_TIME: Duration = Duration::from_secs(60 * 60 * 24 * 7);

#[derive(Debug, Clone, Copy)]
struct Reset {
    issued: Instant,
    valid_for: Duration,
    user_id: Uuid,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResetLookup {
    Valid(Uuid),
    Expired,
    Unknown,
}

/// Outstanding password reset codes. They live in memory, so a restart
/// invalidates every link.
#[derive(Debug, Default)]
pub struct Resets(HashMap<String, Reset>);

pub type SharedResets = Arc<Mutex<Resets>>;

impl Resets {
    pub fn issue(&mut self, user_id: Uuid, valid_for: Duration) -> String {
        self.issue_at(user_id, valid_for, Instant::now())
    }

    fn issue_at(&mut self, user_id: Uuid, valid_for: Duration, now: Instant) -> String {
        // a fresh link replaces any older one for the same account, and
        // codes nobody came back for are dropped
        self.0.retain(|_, r| {
            r.user_id != user_id && now.saturating_duration_since(r.issued) <= r.valid_for
        });
        let uid = nanoid!();
        self.0.insert(
            uid.clone(),
            Reset {
                issued: now,
                valid_for,
                user_id,
            },
        );
        uid
    }

    pub fn lookup(&mut self, uid: &str) -> ResetLookup {
        self.lookup_at(uid, Instant::now())
    }

    fn lookup_at(&mut self, uid: &str, now: Instant) -> ResetLookup {
        match self.0.get(uid) {
            None => ResetLookup::Unknown,
            Some(reset) if now.duration_since(reset.issued) > reset.valid_for => {
                self.0.remove(uid);
                ResetLookup::Expired
            }
            Some(reset) => ResetLookup::Valid(reset.user_id),
        }
    }

    pub fn consume(&mut self, uid: &str) {
        self.0.remove(uid);
    }
}

#[derive(Deserialize)]
struct PwdRequest {
    email: String,
}

#[derive(Deserialize)]
struct NewPwdRequest {
    password: String,
}

async fn password_request(
    Extension(db): Extension<DbRouter>,
    Extension(mailer): Extension<Mailer>,
    Extension(resets): Extension<SharedResets>,
    Json(req): Json<PwdRequest>,
) -> AppResult<()> {
    if !mailer.is_enabled() {
        return Err(AppError::from(
            StatusCode::SERVICE_UNAVAILABLE,
            "password resets are unavailable because email is not configured",
        ));
    }

    let conn = &mut db.read().await?;

    let Some(user) = users::table
        .filter(users::email.eq(normalize_email(&req.email)))
        .first::<User>(conn)
        .await
        .optional()? else {
        return Err(AppError::from(
            StatusCode::NOT_FOUND,
            "could not find a matching account",
        ));
    };

    let uid = resets.lock().await.issue(user.id, RESET_ALLOWED_TIME);
    let link = mailer.link(&format!("reset-password/{uid}"))?;
    let body = email::password_reset_body(&user.name, RESET_ALLOWED_TIME.as_secs() / 60, &link);

    if let Err(e) = mailer
        .send(&user.name, &user.email, "Zenith Password Reset", body)
        .await
    {
        resets.lock().await.consume(&uid);
        tracing::error!(user_id = %user.id, error = %e, "failed to send password reset email");
        return Err(AppError::from(
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to send email",
        ));
    }

    Ok(())
}

fn lookup_error(lookup: ResetLookup) -> AppError {
    match lookup {
        ResetLookup::Expired => AppError::from(StatusCode::UNAUTHORIZED, "password reset expired"),
        _ => AppError::from(StatusCode::UNAUTHORIZED, "invalid password reset url"),
    }
}

async fn password_reset(
    Extension(db): Extension<DbRouter>,
    Extension(resets): Extension<SharedResets>,
    Path(uid): Path<String>,
    Json(req): Json<NewPwdRequest>,
) -> AppResult<()> {
    let report = validation::password_strength(&req.password);
    if !report.is_valid {
        return Err(AppError::from(
            StatusCode::BAD_REQUEST,
            format!("password is too weak: {}", report.errors.join(", ")),
        ));
    }

    let mut resets = resets.lock().await;
    let user_id = match resets.lookup(&uid) {
        ResetLookup::Valid(user_id) => user_id,
        other => return Err(lookup_error(other)),
    };

    let conn = &mut db.write().await?;

    diesel::update(users::table.find(user_id))
        .set((
            users::password_hash.eq(auth::hash_password(req.password)?),
            users::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await?;

    resets.consume(&uid);
    tracing::info!(%user_id, "password reset");

    Ok(())
}

async fn check_uid(
    Extension(resets): Extension<SharedResets>,
    Path(uid): Path<String>,
) -> AppResult<()> {
    match resets.lock().await.lookup(&uid) {
        ResetLookup::Valid(_) => Ok(()),
        other => Err(lookup_error(other)),
    }
}

pub fn app() -> Router {
    Router::new()
        .route("/reset", post(password_request))
        .route("/reset/:uid", get(check_uid).post(password_reset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_expire() {
        let mut resets = Resets::default();
        let user = Uuid::new_v4();
        let start = Instant::now();
        let uid = resets.issue_at(user, RESET_ALLOWED_TIME, start);

        assert_eq!(
            resets.lookup_at(&uid, start + Duration::from_secs(59 * 60)),
            ResetLookup::Valid(user)
        );
        assert_eq!(
            resets.lookup_at(&uid, start + Duration::from_secs(61 * 60)),
            ResetLookup::Expired
        );
        // expired codes are dropped
        assert_eq!(resets.lookup_at(&uid, start), ResetLookup::Unknown);
    }

    #[test]
    fn new_code_replaces_old_one() {
        let mut resets = Resets::default();
        let user = Uuid::new_v4();
        let first = resets.issue(user, WELCOME_ALLOWED_TIME);
        let second = resets.issue(user, RESET_ALLOWED_TIME);

        assert_eq!(resets.lookup(&first), ResetLookup::Unknown);
        assert_eq!(resets.lookup(&second), ResetLookup::Valid(user));
        resets.consume(&second);
        assert_eq!(resets.lookup(&second), ResetLookup::Unknown);
    }

    #[test]
    fn issuing_purges_abandoned_codes() {
        let mut resets = Resets::default();
        let start = Instant::now();
        let abandoned = resets.issue_at(Uuid::new_v4(), RESET_ALLOWED_TIME, start);
        let welcome = resets.issue_at(Uuid::new_v4(), WELCOME_ALLOWED_TIME, start);

        let later = start + Duration::from_secs(2 * 60 * 60);
        let fresh = resets.issue_at(Uuid::new_v4(), RESET_ALLOWED_TIME, later);

        assert_eq!(resets.0.len(), 2);
        assert!(!resets.0.contains_key(&abandoned));
        assert!(resets.0.contains_key(&welcome));
        assert!(resets.0.contains_key(&fresh));
    }
}
