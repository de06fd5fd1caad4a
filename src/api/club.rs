use super::{load_actor, require_manager, Pagination};
use crate::{
    api::post,
    auth::AuthUser,
    db::DbRouter,
    error::{AppError, AppResult},
    models::{Club, PublicUser, User},
    schema::*,
};
use axum::{
    extract::{Path, Query},
    http::StatusCode,
    routing::{get, post as post_route},
    Extension, Json, Router,
};
use diesel::{dsl::count_star, prelude::*};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Serialize)]
pub(crate) struct ClubResponse {
    #[serde(flatten)]
    pub club: Club,
    pub member_count: i64,
}

#[derive(Serialize)]
struct ClubStats {
    member_count: i64,
    post_count: i64,
    event_count: i64,
    assignment_count: i64,
}

#[derive(Deserialize, AsChangeset)]
#[diesel(table_name = clubs)]
struct ClubEdit {
    name: Option<String>,
    description: Option<String>,
    color: Option<String>,
    logo_url: Option<String>,
}

#[derive(Deserialize)]
struct MembershipRequest {
    club_id: Uuid,
}

pub(crate) async fn member_counts(conn: &mut AsyncPgConnection) -> AppResult<HashMap<Uuid, i64>> {
    Ok(users::table
        .filter(users::club_id.is_not_null())
        .group_by(users::club_id)
        .select((users::club_id, count_star()))
        .load::<(Option<Uuid>, i64)>(conn)
        .await?
        .into_iter()
        .filter_map(|(club_id, count)| club_id.map(|id| (id, count)))
        .collect())
}

pub(crate) async fn find_club(conn: &mut AsyncPgConnection, club_id: Uuid) -> AppResult<Club> {
    clubs::table
        .find(club_id)
        .first::<Club>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::from(StatusCode::NOT_FOUND, "the club does not exist"))
}

async fn list(Extension(db): Extension<DbRouter>) -> AppResult<Json<Vec<ClubResponse>>> {
    let conn = &mut db.read().await?;

    let clubs = clubs::table
        .order(clubs::name.asc())
        .load::<Club>(conn)
        .await?;
    let counts = member_counts(conn).await?;

    Ok(Json(
        clubs
            .into_iter()
            .map(|club| ClubResponse {
                member_count: counts.get(&club.id).copied().unwrap_or(0),
                club,
            })
            .collect(),
    ))
}

async fn info(
    Extension(db): Extension<DbRouter>,
    Path(club_id): Path<Uuid>,
) -> AppResult<Json<ClubResponse>> {
    let conn = &mut db.read().await?;

    let club = find_club(conn, club_id).await?;
    let member_count = users::table
        .filter(users::club_id.eq(club_id))
        .count()
        .get_result::<i64>(conn)
        .await?;

    Ok(Json(ClubResponse { club, member_count }))
}

async fn edit_club(
    Extension(db): Extension<DbRouter>,
    Path(club_id): Path<Uuid>,
    user: AuthUser,
    Json(req): Json<ClubEdit>,
) -> AppResult<Json<Club>> {
    let conn = &mut db.write().await?;

    let actor = load_actor(conn, &user).await?;
    require_manager(&actor, club_id)?;

    if req.name.is_none() && req.description.is_none() && req.color.is_none() && req.logo_url.is_none() {
        return Ok(Json(find_club(conn, club_id).await?));
    }
    if req.name.as_deref().map_or(false, |n| n.trim().is_empty()) {
        return Err(AppError::from(StatusCode::BAD_REQUEST, "club name cannot be empty"));
    }

    let club = diesel::update(clubs::table.find(club_id))
        .set(&req)
        .get_result::<Club>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::from(StatusCode::NOT_FOUND, "the club does not exist"))?;
    tracing::info!(%club_id, editor = %user.id, "edited club");

    Ok(Json(club))
}

async fn members(
    Extension(db): Extension<DbRouter>,
    Path(club_id): Path<Uuid>,
    Query(page): Query<Pagination>,
    _user: AuthUser,
) -> AppResult<Json<Vec<PublicUser>>> {
    let conn = &mut db.read().await?;

    find_club(conn, club_id).await?;
    let members = users::table
        .filter(users::club_id.eq(club_id))
        .order(users::name.asc())
        .limit(page.limit())
        .offset(page.offset())
        .load::<User>(conn)
        .await?;

    Ok(Json(members.iter().map(PublicUser::from).collect()))
}

async fn stats(
    Extension(db): Extension<DbRouter>,
    Path(club_id): Path<Uuid>,
) -> AppResult<Json<ClubStats>> {
    let conn = &mut db.read().await?;

    find_club(conn, club_id).await?;
    let member_count = users::table
        .filter(users::club_id.eq(club_id))
        .count()
        .get_result::<i64>(conn)
        .await?;
    let post_count = posts::table
        .filter(posts::club_id.eq(club_id))
        .count()
        .get_result::<i64>(conn)
        .await?;
    let event_count = events::table
        .filter(events::club_id.eq(club_id))
        .count()
        .get_result::<i64>(conn)
        .await?;
    let assignment_count = assignments::table
        .filter(assignments::club_id.eq(club_id))
        .count()
        .get_result::<i64>(conn)
        .await?;

    Ok(Json(ClubStats {
        member_count,
        post_count,
        event_count,
        assignment_count,
    }))
}

async fn join(
    Extension(db): Extension<DbRouter>,
    user: AuthUser,
    Json(req): Json<MembershipRequest>,
) -> AppResult<Json<Club>> {
    let conn = &mut db.write().await?;

    let club = find_club(conn, req.club_id).await?;

    // only succeeds while the user has no club
    let updated = diesel::update(
        users::table
            .filter(users::id.eq(user.id))
            .filter(users::club_id.is_null()),
    )
    .set(users::club_id.eq(club.id))
    .execute(conn)
    .await?;

    if updated == 0 {
        return Err(AppError::from(
            StatusCode::BAD_REQUEST,
            "you are already a member of a club, switch clubs instead",
        ));
    }
    tracing::info!(user_id = %user.id, club_id = %club.id, "joined club");

    Ok(Json(club))
}

async fn leave(Extension(db): Extension<DbRouter>, user: AuthUser) -> AppResult<()> {
    let conn = &mut db.write().await?;

    let updated = diesel::update(
        users::table
            .filter(users::id.eq(user.id))
            .filter(users::club_id.is_not_null()),
    )
    .set(users::club_id.eq(None::<Uuid>))
    .execute(conn)
    .await?;

    if updated == 0 {
        return Err(AppError::from(
            StatusCode::BAD_REQUEST,
            "you are not a member of any club",
        ));
    }
    tracing::info!(user_id = %user.id, "left club");

    Ok(())
}

async fn switch(
    Extension(db): Extension<DbRouter>,
    user: AuthUser,
    Json(req): Json<MembershipRequest>,
) -> AppResult<Json<Club>> {
    let conn = &mut db.write().await?;

    let club = find_club(conn, req.club_id).await?;
    diesel::update(users::table.find(user.id))
        .set(users::club_id.eq(club.id))
        .execute(conn)
        .await?;
    tracing::info!(user_id = %user.id, club_id = %club.id, "switched club");

    Ok(Json(club))
}

pub fn app() -> Router {
    Router::new()
        .route("/", get(list))
        .route("/:club_id", get(info).put(edit_club))
        .route("/:club_id/members", get(members))
        .route("/:club_id/stats", get(stats))
        .route(
            "/:club_id/posts",
            get(post::list_for_club).post(post::create),
        )
}

pub fn membership() -> Router {
    Router::new().route("/", post_route(join).put(switch).delete(leave))
}
