use super::Pagination;
use crate::{
    auth::AuthUser,
    db::DbRouter,
    error::{AppError, AppResult},
    models::Notification,
    schema::*,
};
use axum::{
    extract::{Path, Query},
    http::StatusCode,
    routing::{get, put},
    Extension, Json, Router,
};
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Deserialize)]
struct NotificationFilter {
    #[serde(default)]
    unread_only: bool,
}

#[derive(Deserialize)]
struct ReadRequest {
    read: bool,
}

#[derive(Serialize)]
struct NotificationList {
    notifications: Vec<Notification>,
    unread_count: i64,
}

#[derive(Serialize)]
struct MarkedResponse {
    updated: usize,
}

async fn list(
    Extension(db): Extension<DbRouter>,
    Query(filter): Query<NotificationFilter>,
    Query(page): Query<Pagination>,
    user: AuthUser,
) -> AppResult<Json<NotificationList>> {
    let conn = &mut db.read().await?;

    let mut query = notifications::table
        .filter(notifications::user_id.eq(user.id))
        .into_boxed();
    if filter.unread_only {
        query = query.filter(notifications::read.eq(false));
    }
    let notifications = query
        .order(notifications::created_at.desc())
        .limit(page.limit())
        .offset(page.offset())
        .load::<Notification>(conn)
        .await?;

    let unread_count = notifications::table
        .filter(notifications::user_id.eq(user.id))
        .filter(notifications::read.eq(false))
        .count()
        .get_result::<i64>(conn)
        .await?;

    Ok(Json(NotificationList {
        notifications,
        unread_count,
    }))
}

async fn mark(
    Extension(db): Extension<DbRouter>,
    Path(notification_id): Path<Uuid>,
    user: AuthUser,
    Json(req): Json<ReadRequest>,
) -> AppResult<Json<Notification>> {
    let conn = &mut db.write().await?;

    let read_at = req.read.then(Utc::now);
    diesel::update(
        notifications::table
            .filter(notifications::id.eq(notification_id))
            .filter(notifications::user_id.eq(user.id)),
    )
    .set((
        notifications::read.eq(req.read),
        notifications::read_at.eq(read_at),
    ))
    .get_result::<Notification>(conn)
    .await
    .optional()?
    .map(Json)
    .ok_or_else(|| AppError::from(StatusCode::NOT_FOUND, "notification not found"))
}

async fn mark_all_read(
    Extension(db): Extension<DbRouter>,
    user: AuthUser,
) -> AppResult<Json<MarkedResponse>> {
    let conn = &mut db.write().await?;

    let updated = diesel::update(
        notifications::table
            .filter(notifications::user_id.eq(user.id))
            .filter(notifications::read.eq(false)),
    )
    .set((
        notifications::read.eq(true),
        notifications::read_at.eq(Some(Utc::now())),
    ))
    .execute(conn)
    .await?;

    Ok(Json(MarkedResponse { updated }))
}

async fn remove(
    Extension(db): Extension<DbRouter>,
    Path(notification_id): Path<Uuid>,
    user: AuthUser,
) -> AppResult<()> {
    let conn = &mut db.write().await?;

    let deleted = diesel::delete(
        notifications::table
            .filter(notifications::id.eq(notification_id))
            .filter(notifications::user_id.eq(user.id)),
    )
    .execute(conn)
    .await?;

    if deleted == 0 {
        return Err(AppError::from(
            StatusCode::NOT_FOUND,
            "notification not found",
        ));
    }
    Ok(())
}

pub fn app() -> Router {
    Router::new()
        .route("/", get(list).put(mark_all_read))
        .route("/:notification_id", put(mark).delete(remove))
}
