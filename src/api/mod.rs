use crate::{
    auth::{AuthUser, Role},
    error::{AppError, AppResult},
    policy::{Actor, Verdict},
    schema::*,
};
use axum::{http::StatusCode, routing::get, Router};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Deserialize;
use uuid::Uuid;

pub mod admin;
pub mod assignment;
pub mod auth;
pub mod chat;
pub mod club;
pub mod comment;
pub mod event;
pub mod notification;
pub mod password;
pub mod post;
pub mod profile;
pub mod upload;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Default, Deserialize)]
pub struct Pagination {
    limit: Option<i64>,
    offset: Option<i64>,
}

impl Pagination {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

/// Loads the caller's current role and club. Tokens can outlive a role
/// change, so permission checks read both from the database.
pub(crate) async fn load_actor(conn: &mut AsyncPgConnection, user: &AuthUser) -> AppResult<Actor> {
    let (role, club_id) = users::table
        .find(user.id)
        .select((users::role, users::club_id))
        .first::<(String, Option<Uuid>)>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::from(StatusCode::UNAUTHORIZED, "your account no longer exists"))?;

    Ok(Actor {
        id: user.id,
        role: role.parse::<Role>()?,
        club_id,
    })
}

pub(crate) fn require(verdict: Verdict, what: &str) -> AppResult<()> {
    match verdict {
        Verdict::Allowed => Ok(()),
        Verdict::NotOwner => Err(AppError::from(
            StatusCode::FORBIDDEN,
            format!("you are not allowed to modify this {what}"),
        )),
        Verdict::WindowClosed => Err(AppError::from(
            StatusCode::FORBIDDEN,
            format!("the edit window for this {what} has closed"),
        )),
    }
}

pub(crate) fn require_manager(actor: &Actor, club_id: Uuid) -> AppResult<()> {
    if actor.manages_club(club_id) {
        Ok(())
    } else {
        Err(AppError::from(
            StatusCode::FORBIDDEN,
            "only managers of this club can do that",
        ))
    }
}

pub fn app() -> Router {
    Router::new()
        .nest("/auth", auth::app())
        .nest("/password", password::app())
        .nest("/profile", profile::app())
        .nest("/users", profile::users())
        .nest("/clubs", club::app())
        .nest("/membership", club::membership())
        .nest("/posts", post::app())
        .nest("/comments", comment::app())
        .nest("/events", event::app())
        .nest("/assignments", assignment::app())
        .nest("/attempts", assignment::attempts())
        .nest("/chat", chat::app())
        .nest("/notifications", notification::app())
        .nest("/uploads", upload::app())
        .nest("/admin", admin::app())
        .nest("/home", admin::home())
        .route("/health", get(admin::health))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_is_clamped() {
        let page = Pagination::default();
        assert_eq!((page.limit(), page.offset()), (50, 0));

        let page = Pagination {
            limit: Some(1000),
            offset: Some(-5),
        };
        assert_eq!((page.limit(), page.offset()), (100, 0));

        let page = Pagination {
            limit: Some(0),
            offset: Some(20),
        };
        assert_eq!((page.limit(), page.offset()), (1, 20));
    }
}
