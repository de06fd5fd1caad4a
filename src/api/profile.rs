use crate::{
    auth::{self, AuthUser},
    db::DbRouter,
    error::{AppError, AppResult},
    models::{Club, PublicUser, User},
    schema::*,
    validation,
};
use axum::{
    extract::Path,
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize)]
struct ProfileResponse {
    #[serde(flatten)]
    user: PublicUser,
    club: Option<Club>,
}

#[derive(Deserialize, AsChangeset)]
#[diesel(table_name = users)]
struct ProfileEdit {
    name: Option<String>,
    bio: Option<String>,
    avatar_url: Option<String>,
}

#[derive(Deserialize)]
struct PasswordChange {
    current_password: String,
    new_password: String,
}

/// What other users may see about someone.
#[derive(Serialize)]
struct PublicProfile {
    id: Uuid,
    name: String,
    role: String,
    club: Option<Club>,
    avatar_url: Option<String>,
    bio: Option<String>,
    created_at: DateTime<Utc>,
}

async fn get_profile(
    Extension(db): Extension<DbRouter>,
    user: AuthUser,
) -> AppResult<Json<ProfileResponse>> {
    let conn = &mut db.read().await?;

    let (user, club) = users::table
        .left_join(clubs::table)
        .filter(users::id.eq(user.id))
        .first::<(User, Option<Club>)>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::from(StatusCode::NOT_FOUND, "user not found"))?;

    Ok(Json(ProfileResponse {
        user: PublicUser::from(&user),
        club,
    }))
}

async fn edit_profile(
    Extension(db): Extension<DbRouter>,
    user: AuthUser,
    Json(mut req): Json<ProfileEdit>,
) -> AppResult<Json<PublicUser>> {
    if let Some(name) = &req.name {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::from(StatusCode::BAD_REQUEST, "name cannot be empty"));
        }
        req.name = Some(name.to_string());
    }

    let conn = &mut db.write().await?;

    let updated = diesel::update(users::table.find(user.id))
        .set((&req, users::updated_at.eq(Utc::now())))
        .get_result::<User>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::from(StatusCode::NOT_FOUND, "user not found"))?;

    Ok(Json(PublicUser::from(&updated)))
}

async fn change_password(
    Extension(db): Extension<DbRouter>,
    user: AuthUser,
    Json(req): Json<PasswordChange>,
) -> AppResult<()> {
    let conn = &mut db.write().await?;

    let hash = users::table
        .find(user.id)
        .select(users::password_hash)
        .first::<String>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::from(StatusCode::NOT_FOUND, "user not found"))?;

    if !auth::verify_password(&req.current_password, &hash)? {
        return Err(AppError::from(
            StatusCode::UNAUTHORIZED,
            "current password is incorrect",
        ));
    }

    let report = validation::password_strength(&req.new_password);
    if !report.is_valid {
        return Err(AppError::from(
            StatusCode::BAD_REQUEST,
            format!("password is too weak: {}", report.errors.join(", ")),
        ));
    }

    diesel::update(users::table.find(user.id))
        .set((
            users::password_hash.eq(auth::hash_password(req.new_password)?),
            users::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await?;

    Ok(())
}

async fn public_profile(
    Extension(db): Extension<DbRouter>,
    Path(user_id): Path<Uuid>,
    _user: AuthUser,
) -> AppResult<Json<PublicProfile>> {
    let conn = &mut db.read().await?;

    let (user, club) = users::table
        .left_join(clubs::table)
        .filter(users::id.eq(user_id))
        .first::<(User, Option<Club>)>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::from(StatusCode::NOT_FOUND, "user not found"))?;

    Ok(Json(PublicProfile {
        id: user.id,
        name: user.name,
        role: user.role,
        club,
        avatar_url: user.avatar_url,
        bio: user.bio,
        created_at: user.created_at,
    }))
}

pub fn app() -> Router {
    Router::new()
        .route("/", get(get_profile).put(edit_profile))
        .route("/password", post(change_password))
}

pub fn users() -> Router {
    Router::new().route("/:user_id/profile", get(public_profile))
}
