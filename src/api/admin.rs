use super::{
    club::member_counts,
    password::{SharedResets, WELCOME_ALLOWED_TIME},
};
use crate::{
    auth::{self, AdminOnly, Role},
    db::{DbRouter, RouterHealth, RouterStats},
    email::{self, Mailer},
    error::{AppError, AppResult},
    models::{Club, PublicUser, User},
    schema::*,
    validation,
};
use axum::{
    extract::Path,
    http::StatusCode,
    routing::{get, put},
    Extension, Json, Router,
};
use chrono::Utc;
use diesel::{
    dsl::count_star,
    prelude::*,
    result::{DatabaseErrorKind, Error as DieselError},
};
use diesel_async::{scoped_futures::ScopedFutureExt, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Serialize)]
struct HomeStats {
    clubs: i64,
    users: i64,
    upcoming_events: i64,
    posts: i64,
}

#[derive(Serialize)]
struct PlatformStats {
    users: i64,
    clubs: i64,
    posts: i64,
    comments: i64,
    events: i64,
    assignments: i64,
    completed_attempts: i64,
    chat_messages: i64,
    users_by_role: HashMap<String, i64>,
}

#[derive(Serialize)]
struct AdminClub {
    #[serde(flatten)]
    club: Club,
    member_count: i64,
    post_count: i64,
    event_count: i64,
}

#[derive(Deserialize)]
struct NewClubRequest {
    name: String,
    slug: String,
    #[serde(default)]
    description: String,
    club_type: Option<String>,
    color: Option<String>,
    coordinator_email: Option<String>,
    coordinator_name: Option<String>,
}

#[derive(Serialize)]
struct NewClubResponse {
    club: Club,
    coordinator: Option<PublicUser>,
    message: String,
}

#[derive(Deserialize)]
struct RoleRequest {
    role: Role,
}

#[derive(Serialize)]
struct SystemResponse {
    replicas: usize,
    pools: RouterStats,
    health: RouterHealth,
}

#[derive(Serialize)]
pub(crate) struct HealthResponse {
    status: &'static str,
    version: &'static str,
    database: &'static str,
}

pub(crate) fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

async fn home_stats(Extension(db): Extension<DbRouter>) -> AppResult<Json<HomeStats>> {
    let conn = &mut db.read().await?;

    Ok(Json(HomeStats {
        clubs: clubs::table.count().get_result(conn).await?,
        users: users::table.count().get_result(conn).await?,
        upcoming_events: events::table
            .filter(events::starts_at.gt(Utc::now()))
            .count()
            .get_result(conn)
            .await?,
        posts: posts::table.count().get_result(conn).await?,
    }))
}

async fn platform_stats(
    Extension(db): Extension<DbRouter>,
    AdminOnly(_admin): AdminOnly,
) -> AppResult<Json<PlatformStats>> {
    let conn = &mut db.read().await?;

    let users_by_role = users::table
        .group_by(users::role)
        .select((users::role, count_star()))
        .load::<(String, i64)>(conn)
        .await?;

    Ok(Json(PlatformStats {
        users: users::table.count().get_result(conn).await?,
        clubs: clubs::table.count().get_result(conn).await?,
        posts: posts::table.count().get_result(conn).await?,
        comments: comments::table.count().get_result(conn).await?,
        events: events::table.count().get_result(conn).await?,
        assignments: assignments::table.count().get_result(conn).await?,
        completed_attempts: assignment_attempts::table
            .filter(assignment_attempts::status.eq("completed"))
            .count()
            .get_result(conn)
            .await?,
        chat_messages: chat_messages::table.count().get_result(conn).await?,
        users_by_role: users_by_role.into_iter().collect(),
    }))
}

async fn list_clubs(
    Extension(db): Extension<DbRouter>,
    AdminOnly(_admin): AdminOnly,
) -> AppResult<Json<Vec<AdminClub>>> {
    let conn = &mut db.read().await?;

    let clubs = clubs::table
        .order(clubs::name.asc())
        .load::<Club>(conn)
        .await?;
    let members = member_counts(conn).await?;
    let posts: HashMap<Uuid, i64> = posts::table
        .group_by(posts::club_id)
        .select((posts::club_id, count_star()))
        .load::<(Uuid, i64)>(conn)
        .await?
        .into_iter()
        .collect();
    let events: HashMap<Uuid, i64> = events::table
        .group_by(events::club_id)
        .select((events::club_id, count_star()))
        .load::<(Uuid, i64)>(conn)
        .await?
        .into_iter()
        .collect();

    Ok(Json(
        clubs
            .into_iter()
            .map(|club| AdminClub {
                member_count: members.get(&club.id).copied().unwrap_or(0),
                post_count: posts.get(&club.id).copied().unwrap_or(0),
                event_count: events.get(&club.id).copied().unwrap_or(0),
                club,
            })
            .collect(),
    ))
}

async fn create_club(
    Extension(db): Extension<DbRouter>,
    Extension(mailer): Extension<Mailer>,
    Extension(resets): Extension<SharedResets>,
    AdminOnly(admin): AdminOnly,
    Json(req): Json<NewClubRequest>,
) -> AppResult<Json<NewClubResponse>> {
    #[derive(Insertable)]
    #[diesel(table_name = clubs)]
    struct NewClub {
        slug: String,
        name: String,
        description: String,
        club_type: Option<String>,
        color: Option<String>,
    }

    #[derive(Insertable)]
    #[diesel(table_name = users)]
    struct NewCoordinator {
        email: String,
        password_hash: String,
        name: String,
        role: &'static str,
        club_id: Option<Uuid>,
    }

    let name = req.name.trim();
    if name.is_empty() {
        return Err(AppError::from(StatusCode::BAD_REQUEST, "club name is required"));
    }
    if !is_valid_slug(&req.slug) {
        return Err(AppError::from(
            StatusCode::BAD_REQUEST,
            "slug may only contain lowercase letters, digits and dashes",
        ));
    }

    let coordinator = match (&req.coordinator_email, &req.coordinator_name) {
        (Some(email), Some(name)) => {
            let email =
                validation::parse_email(&super::auth::normalize_email(email))?.to_string();
            if !mailer.is_enabled() {
                return Err(AppError::from(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "coordinator accounts need email, which is not configured",
                ));
            }
            Some((email, name.trim().to_string()))
        }
        (None, None) => None,
        _ => {
            return Err(AppError::from(
                StatusCode::BAD_REQUEST,
                "coordinator email and name must be given together",
            ))
        }
    };

    let coordinator = match coordinator {
        Some((email, name)) => Some(NewCoordinator {
            email,
            // unusable until the welcome link is used
            password_hash: auth::hash_password(rand::random::<[u8; 32]>())?,
            name,
            role: Role::Coordinator.as_str(),
            club_id: None,
        }),
        None => None,
    };

    let conn = &mut db.write().await?;

    if let Some(coordinator) = &coordinator {
        let taken = users::table
            .filter(users::email.eq(&coordinator.email))
            .count()
            .get_result::<i64>(conn)
            .await?;
        if taken > 0 {
            return Err(AppError::from(
                StatusCode::CONFLICT,
                "an account with the coordinator's email already exists",
            ));
        }
    }

    let new_club = NewClub {
        slug: req.slug,
        name: name.to_string(),
        description: req.description,
        club_type: req.club_type,
        color: req.color,
    };

    // the club and its coordinator are created together or not at all
    let created = conn
        .transaction::<_, DieselError, _>(|conn| {
            async move {
                let Some(club) = diesel::insert_into(clubs::table)
                    .values(new_club)
                    .on_conflict(clubs::slug)
                    .do_nothing()
                    .get_result::<Club>(conn)
                    .await
                    .optional()?
                else {
                    return Ok(None);
                };

                let user = match coordinator {
                    Some(coordinator) => Some(
                        diesel::insert_into(users::table)
                            .values(NewCoordinator {
                                club_id: Some(club.id),
                                ..coordinator
                            })
                            .get_result::<User>(conn)
                            .await?,
                    ),
                    None => None,
                };

                Ok(Some((club, user)))
            }
            .scope_boxed()
        })
        .await;

    let (club, user) = match created {
        Ok(Some(created)) => created,
        Ok(None) => {
            return Err(AppError::from(
                StatusCode::CONFLICT,
                "a club with this slug already exists",
            ))
        }
        Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            return Err(AppError::from(
                StatusCode::CONFLICT,
                "an account with the coordinator's email already exists",
            ))
        }
        Err(e) => return Err(e.into()),
    };
    tracing::info!(club_id = %club.id, by = %admin.id, "created club");

    let Some(user) = user else {
        return Ok(Json(NewClubResponse {
            message: format!("Created club {}.", club.name),
            club,
            coordinator: None,
        }));
    };

    let uid = resets.lock().await.issue(user.id, WELCOME_ALLOWED_TIME);
    let sent = match mailer.link(&format!("reset-password/{uid}")) {
        Ok(link) => {
            let body = email::welcome_body(&user.name, &user.email, &club.name, &link);
            mailer
                .send(&user.name, &user.email, "Welcome to Zenith!", body)
                .await
        }
        Err(e) => Err(e),
    };

    if let Err(e) = sent {
        tracing::error!(user_id = %user.id, error = %e, "failed to send welcome email, rolling back club");
        resets.lock().await.consume(&uid);
        discard_club(conn, club.id, user.id).await?;
        return Err(AppError::from(
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to send email",
        ));
    }

    Ok(Json(NewClubResponse {
        message: format!(
            "Created club {}, sent a welcome email to {}.",
            club.name, user.email
        ),
        club,
        coordinator: Some(PublicUser::from(&user)),
    }))
}

/// Removes a freshly created club and its coordinator.
async fn discard_club(
    conn: &mut AsyncPgConnection,
    club_id: Uuid,
    coordinator_id: Uuid,
) -> QueryResult<()> {
    conn.transaction::<_, DieselError, _>(|conn| {
        async move {
            diesel::delete(users::table.find(coordinator_id))
                .execute(conn)
                .await?;
            diesel::delete(clubs::table.find(club_id))
                .execute(conn)
                .await?;
            Ok(())
        }
        .scope_boxed()
    })
    .await
}

async fn set_role(
    Extension(db): Extension<DbRouter>,
    Path(user_id): Path<Uuid>,
    AdminOnly(admin): AdminOnly,
    Json(req): Json<RoleRequest>,
) -> AppResult<Json<PublicUser>> {
    if user_id == admin.id {
        return Err(AppError::from(
            StatusCode::BAD_REQUEST,
            "you cannot change your own role",
        ));
    }

    let conn = &mut db.write().await?;

    let user = diesel::update(users::table.find(user_id))
        .set((
            users::role.eq(req.role.as_str()),
            users::updated_at.eq(Utc::now()),
        ))
        .get_result::<User>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::from(StatusCode::NOT_FOUND, "user not found"))?;
    tracing::info!(%user_id, role = %req.role, by = %admin.id, "changed user role");

    Ok(Json(PublicUser::from(&user)))
}

async fn system(
    Extension(db): Extension<DbRouter>,
    AdminOnly(_admin): AdminOnly,
) -> Json<SystemResponse> {
    Json(SystemResponse {
        replicas: db.replica_count(),
        pools: db.stats(),
        health: db.health_check().await,
    })
}

pub(crate) async fn health(Extension(db): Extension<DbRouter>) -> Json<HealthResponse> {
    let health = db.health_check().await;
    Json(HealthResponse {
        status: if health.healthy { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        database: if health.primary {
            "connected"
        } else {
            "disconnected"
        },
    })
}

pub fn app() -> Router {
    Router::new()
        .route("/stats", get(platform_stats))
        .route("/clubs", get(list_clubs).post(create_club))
        .route("/users/:user_id/role", put(set_role))
        .route("/system", get(system))
}

pub fn home() -> Router {
    Router::new().route("/stats", get(home_stats))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs() {
        assert!(is_valid_slug("robotics-club"));
        assert!(is_valid_slug("cs50"));
        assert!(!is_valid_slug("Robotics"));
        assert!(!is_valid_slug("-edge"));
        assert!(!is_valid_slug("a b"));
        assert!(!is_valid_slug(""));
    }
}
