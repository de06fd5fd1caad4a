use super::{comment, load_actor, require, Pagination};
use crate::{
    auth::{AuthUser, MaybeAuthUser},
    db::DbRouter,
    error::{AppError, AppResult},
    models::Post,
    notify::{self, NotificationKind},
    policy,
    schema::*,
};
use axum::{
    extract::{Path, Query},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::Utc;
use diesel::{dsl::count_star, prelude::*};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Serialize)]
pub(crate) struct PostResponse {
    #[serde(flatten)]
    post: Post,
    author_name: String,
    like_count: i64,
    comment_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    is_liked: Option<bool>,
}

#[derive(Deserialize)]
pub(crate) struct NewPostRequest {
    title: String,
    content: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Deserialize, AsChangeset)]
#[diesel(table_name = posts)]
struct PostEdit {
    title: Option<String>,
    content: Option<String>,
    tags: Option<Vec<String>>,
}

#[derive(Serialize)]
struct LikeResponse {
    liked: bool,
    like_count: i64,
}

pub(crate) async fn find_post(conn: &mut AsyncPgConnection, post_id: Uuid) -> AppResult<Post> {
    posts::table
        .find(post_id)
        .first::<Post>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::from(StatusCode::NOT_FOUND, "the post does not exist"))
}

async fn like_counts(conn: &mut AsyncPgConnection, ids: &[Uuid]) -> AppResult<HashMap<Uuid, i64>> {
    Ok(post_likes::table
        .filter(post_likes::post_id.eq_any(ids))
        .group_by(post_likes::post_id)
        .select((post_likes::post_id, count_star()))
        .load::<(Uuid, i64)>(conn)
        .await?
        .into_iter()
        .collect())
}

async fn comment_counts(
    conn: &mut AsyncPgConnection,
    ids: &[Uuid],
) -> AppResult<HashMap<Uuid, i64>> {
    Ok(comments::table
        .filter(comments::post_id.eq_any(ids))
        .group_by(comments::post_id)
        .select((comments::post_id, count_star()))
        .load::<(Uuid, i64)>(conn)
        .await?
        .into_iter()
        .collect())
}

async fn with_counts(
    conn: &mut AsyncPgConnection,
    posts: Vec<(Post, String)>,
    viewer: Option<Uuid>,
) -> AppResult<Vec<PostResponse>> {
    let ids: Vec<Uuid> = posts.iter().map(|(p, _)| p.id).collect();
    let likes = like_counts(conn, &ids).await?;
    let comments = comment_counts(conn, &ids).await?;

    let liked: Vec<Uuid> = match viewer {
        Some(viewer) => {
            post_likes::table
                .filter(post_likes::post_id.eq_any(&ids))
                .filter(post_likes::user_id.eq(viewer))
                .select(post_likes::post_id)
                .load(conn)
                .await?
        }
        None => Vec::new(),
    };

    Ok(posts
        .into_iter()
        .map(|(post, author_name)| PostResponse {
            like_count: likes.get(&post.id).copied().unwrap_or(0),
            comment_count: comments.get(&post.id).copied().unwrap_or(0),
            is_liked: viewer.map(|_| liked.contains(&post.id)),
            author_name,
            post,
        })
        .collect())
}

pub(crate) async fn list_for_club(
    Extension(db): Extension<DbRouter>,
    Path(club_id): Path<Uuid>,
    Query(page): Query<Pagination>,
    MaybeAuthUser(user): MaybeAuthUser,
) -> AppResult<Json<Vec<PostResponse>>> {
    let conn = &mut db.read().await?;

    let posts = posts::table
        .inner_join(users::table)
        .filter(posts::club_id.eq(club_id))
        .order(posts::created_at.desc())
        .limit(page.limit())
        .offset(page.offset())
        .select((posts::all_columns, users::name))
        .load::<(Post, String)>(conn)
        .await?;

    Ok(Json(with_counts(conn, posts, user.map(|u| u.id)).await?))
}

pub(crate) async fn create(
    Extension(db): Extension<DbRouter>,
    Path(club_id): Path<Uuid>,
    user: AuthUser,
    Json(req): Json<NewPostRequest>,
) -> AppResult<Json<Post>> {
    #[derive(Insertable)]
    #[diesel(table_name = posts)]
    struct NewPost {
        club_id: Uuid,
        author_id: Uuid,
        title: String,
        content: String,
        tags: Vec<String>,
    }

    let title = req.title.trim();
    if title.is_empty() || req.content.trim().is_empty() {
        return Err(AppError::from(
            StatusCode::BAD_REQUEST,
            "title and content are required",
        ));
    }

    let conn = &mut db.write().await?;

    let actor = load_actor(conn, &user).await?;
    if !actor.is_member_of(club_id) && !actor.manages_club(club_id) {
        return Err(AppError::from(
            StatusCode::FORBIDDEN,
            "only members of this club can post here",
        ));
    }
    super::club::find_club(conn, club_id).await?;

    let post = diesel::insert_into(posts::table)
        .values(NewPost {
            club_id,
            author_id: user.id,
            title: title.to_string(),
            content: req.content,
            tags: req.tags,
        })
        .get_result::<Post>(conn)
        .await?;

    notify::notify_club(
        conn,
        club_id,
        user.id,
        NotificationKind::Announcement,
        "New post",
        &post.title,
        Some(post.id),
    )
    .await;

    Ok(Json(post))
}

async fn get_post(
    Extension(db): Extension<DbRouter>,
    Path(post_id): Path<Uuid>,
    MaybeAuthUser(user): MaybeAuthUser,
) -> AppResult<Json<PostResponse>> {
    let conn = &mut db.write().await?;

    let post = diesel::update(posts::table.find(post_id))
        .set(posts::view_count.eq(posts::view_count + 1))
        .get_result::<Post>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::from(StatusCode::NOT_FOUND, "the post does not exist"))?;

    let author_name = users::table
        .find(post.author_id)
        .select(users::name)
        .first::<String>(conn)
        .await?;

    let mut posts = with_counts(conn, vec![(post, author_name)], user.map(|u| u.id)).await?;
    Ok(Json(posts.pop().ok_or_else(|| {
        anyhow::anyhow!("`with_counts` should return one post")
    })?))
}

async fn edit_post(
    Extension(db): Extension<DbRouter>,
    Path(post_id): Path<Uuid>,
    user: AuthUser,
    Json(req): Json<PostEdit>,
) -> AppResult<Json<Post>> {
    let conn = &mut db.write().await?;

    let post = find_post(conn, post_id).await?;
    let actor = load_actor(conn, &user).await?;
    require(
        policy::can_edit_post(&actor, post.club_id, post.author_id, post.created_at, Utc::now()),
        "post",
    )?;

    if req.title.as_deref().map_or(false, |t| t.trim().is_empty())
        || req.content.as_deref().map_or(false, |c| c.trim().is_empty())
    {
        return Err(AppError::from(
            StatusCode::BAD_REQUEST,
            "title and content cannot be empty",
        ));
    }

    let post = diesel::update(posts::table.find(post_id))
        .set((&req, posts::updated_at.eq(Utc::now())))
        .get_result::<Post>(conn)
        .await?;

    Ok(Json(post))
}

async fn delete_post(
    Extension(db): Extension<DbRouter>,
    Path(post_id): Path<Uuid>,
    user: AuthUser,
) -> AppResult<()> {
    let conn = &mut db.write().await?;

    let post = find_post(conn, post_id).await?;
    let actor = load_actor(conn, &user).await?;
    require(
        policy::can_delete_post(&actor, post.club_id, post.author_id),
        "post",
    )?;

    diesel::delete(posts::table.find(post_id))
        .execute(conn)
        .await?;
    tracing::info!(%post_id, by = %user.id, "deleted post");

    Ok(())
}

async fn toggle_like(
    Extension(db): Extension<DbRouter>,
    Path(post_id): Path<Uuid>,
    user: AuthUser,
) -> AppResult<Json<LikeResponse>> {
    #[derive(Insertable)]
    #[diesel(table_name = post_likes)]
    struct NewLike {
        post_id: Uuid,
        user_id: Uuid,
    }

    let conn = &mut db.write().await?;

    let post = find_post(conn, post_id).await?;

    let removed = diesel::delete(
        post_likes::table
            .filter(post_likes::post_id.eq(post_id))
            .filter(post_likes::user_id.eq(user.id)),
    )
    .execute(conn)
    .await?;

    let liked = removed == 0;
    if liked {
        diesel::insert_into(post_likes::table)
            .values(NewLike {
                post_id,
                user_id: user.id,
            })
            .on_conflict_do_nothing()
            .execute(conn)
            .await?;

        if post.author_id != user.id {
            notify::notify_user(
                conn,
                post.author_id,
                NotificationKind::Like,
                "New like",
                &format!("Someone liked your post \"{}\"", post.title),
                Some(post.id),
            )
            .await;
        }
    }

    let like_count = post_likes::table
        .filter(post_likes::post_id.eq(post_id))
        .count()
        .get_result::<i64>(conn)
        .await?;

    Ok(Json(LikeResponse { liked, like_count }))
}

pub fn app() -> Router {
    Router::new()
        .route("/:post_id", get(get_post).put(edit_post).delete(delete_post))
        .route("/:post_id/like", post(toggle_like))
        .route(
            "/:post_id/comments",
            get(comment::list_for_post).post(comment::create),
        )
}
