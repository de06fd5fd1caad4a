use crate::{
    auth::{self, AuthUser, JwtKeys, Role, TOKEN_LIFETIME},
    db::DbRouter,
    error::{AppError, AppResult},
    models::{Club, PublicUser, User},
    rate_limit::{client_ip, Limiters},
    schema::*,
    validation,
};
use axum::{
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Extension, Json, Router,
};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Deserialize)]
struct RegisterRequest {
    email: String,
    password: String,
    name: String,
    club_id: Option<Uuid>,
}

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Serialize)]
struct AuthorizedResponse {
    token: String,
    user: PublicUser,
    #[serde(skip_serializing_if = "Option::is_none")]
    club: Option<Club>,
}

#[derive(Serialize)]
struct MessageResponse {
    message: &'static str,
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn issue_token(keys: &JwtKeys, user: &User) -> AppResult<String> {
    let role = user.role.parse::<Role>()?;
    Ok(auth::generate_jwt(
        keys,
        user.id,
        &user.email,
        role,
        TOKEN_LIFETIME,
    )?)
}

async fn register(
    Extension(db): Extension<DbRouter>,
    Extension(keys): Extension<Arc<JwtKeys>>,
    Json(req): Json<RegisterRequest>,
) -> AppResult<Json<AuthorizedResponse>> {
    #[derive(Insertable)]
    #[diesel(table_name = users)]
    struct NewUser {
        email: String,
        password_hash: String,
        name: String,
        role: &'static str,
        club_id: Option<Uuid>,
    }

    let email = validation::parse_email(&normalize_email(&req.email))?.to_string();
    let name = req.name.trim();
    if name.is_empty() {
        return Err(AppError::from(StatusCode::BAD_REQUEST, "name is required"));
    }
    let report = validation::password_strength(&req.password);
    if !report.is_valid {
        return Err(AppError::from(
            StatusCode::BAD_REQUEST,
            format!("password is too weak: {}", report.errors.join(", ")),
        ));
    }

    let conn = &mut db.write().await?;

    let club = match req.club_id {
        Some(club_id) => Some(
            clubs::table
                .find(club_id)
                .first::<Club>(conn)
                .await
                .optional()?
                .ok_or_else(|| {
                    AppError::from(StatusCode::BAD_REQUEST, "the selected club does not exist")
                })?,
        ),
        None => None,
    };

    let user = diesel::insert_into(users::table)
        .values(NewUser {
            email,
            password_hash: auth::hash_password(req.password)?,
            name: name.to_string(),
            role: Role::Student.as_str(),
            club_id: req.club_id,
        })
        .on_conflict(users::email)
        .do_nothing()
        .get_result::<User>(conn)
        .await
        .optional()?;

    let Some(user) = user else {
        return Err(AppError::from(
            StatusCode::CONFLICT,
            "an account with this email already exists",
        ));
    };
    tracing::info!(user_id = %user.id, "registered user");

    Ok(Json(AuthorizedResponse {
        token: issue_token(&keys, &user)?,
        user: PublicUser::from(&user),
        club,
    }))
}

async fn login(
    Extension(db): Extension<DbRouter>,
    Extension(keys): Extension<Arc<JwtKeys>>,
    Extension(limiters): Extension<Arc<Limiters>>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> AppResult<Json<AuthorizedResponse>> {
    limiters
        .auth
        .enforce(&format!("{}:login", client_ip(&headers)))?;

    let conn = &mut db.read().await?;

    let found = users::table
        .left_join(clubs::table)
        .filter(users::email.eq(normalize_email(&req.email)))
        .first::<(User, Option<Club>)>(conn)
        .await
        .optional()?;

    if let Some((user, club)) = found {
        if auth::verify_password(req.password, &user.password_hash)? {
            return Ok(Json(AuthorizedResponse {
                token: issue_token(&keys, &user)?,
                user: PublicUser::from(&user),
                club,
            }));
        }
    }
    Err(AppError::from(
        StatusCode::UNAUTHORIZED,
        "invalid email or password",
    ))
}

async fn check(
    Extension(db): Extension<DbRouter>,
    user: AuthUser,
) -> AppResult<Json<PublicUser>> {
    let conn = &mut db.read().await?;

    let user = users::table
        .find(user.id)
        .first::<User>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::from(StatusCode::UNAUTHORIZED, "your account no longer exists"))?;

    Ok(Json(PublicUser::from(&user)))
}

// tokens are stateless, the client just forgets it
async fn logout(_user: AuthUser) -> Json<MessageResponse> {
    Json(MessageResponse {
        message: "logged out",
    })
}

pub fn app() -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/check", get(check))
        .route("/logout", post(logout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emails_are_normalized() {
        assert_eq!(normalize_email("  Ada@College.EDU "), "ada@college.edu");
    }
}
