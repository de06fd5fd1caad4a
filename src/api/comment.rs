use super::{load_actor, post::find_post, require};
use crate::{
    auth::AuthUser,
    db::DbRouter,
    error::{AppError, AppResult},
    models::Comment,
    notify::{self, NotificationKind},
    policy,
    schema::*,
};
use axum::{extract::Path, http::StatusCode, routing::put, Extension, Json, Router};
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize)]
pub(crate) struct CommentResponse {
    #[serde(flatten)]
    comment: Comment,
    author_name: String,
    author_avatar_url: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct CommentRequest {
    content: String,
}

fn content_of(req: &CommentRequest) -> AppResult<&str> {
    let content = req.content.trim();
    if content.is_empty() {
        Err(AppError::from(
            StatusCode::BAD_REQUEST,
            "comment cannot be empty",
        ))
    } else {
        Ok(content)
    }
}

/// Loads a comment together with the club its post belongs to.
async fn find_comment(
    conn: &mut AsyncPgConnection,
    comment_id: Uuid,
) -> AppResult<(Comment, Uuid)> {
    comments::table
        .inner_join(posts::table)
        .filter(comments::id.eq(comment_id))
        .select((comments::all_columns, posts::club_id))
        .first::<(Comment, Uuid)>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::from(StatusCode::NOT_FOUND, "the comment does not exist"))
}

pub(crate) async fn list_for_post(
    Extension(db): Extension<DbRouter>,
    Path(post_id): Path<Uuid>,
) -> AppResult<Json<Vec<CommentResponse>>> {
    let conn = &mut db.read().await?;

    find_post(conn, post_id).await?;
    let comments = comments::table
        .inner_join(users::table)
        .filter(comments::post_id.eq(post_id))
        .order(comments::created_at.asc())
        .select((comments::all_columns, users::name, users::avatar_url))
        .load::<(Comment, String, Option<String>)>(conn)
        .await?;

    Ok(Json(
        comments
            .into_iter()
            .map(|(comment, author_name, author_avatar_url)| CommentResponse {
                comment,
                author_name,
                author_avatar_url,
            })
            .collect(),
    ))
}

pub(crate) async fn create(
    Extension(db): Extension<DbRouter>,
    Path(post_id): Path<Uuid>,
    user: AuthUser,
    Json(req): Json<CommentRequest>,
) -> AppResult<Json<Comment>> {
    #[derive(Insertable)]
    #[diesel(table_name = comments)]
    struct NewComment<'a> {
        post_id: Uuid,
        author_id: Uuid,
        content: &'a str,
    }

    let content = content_of(&req)?;
    let conn = &mut db.write().await?;

    let post = find_post(conn, post_id).await?;
    let comment = diesel::insert_into(comments::table)
        .values(NewComment {
            post_id,
            author_id: user.id,
            content,
        })
        .get_result::<Comment>(conn)
        .await?;

    if post.author_id != user.id {
        notify::notify_user(
            conn,
            post.author_id,
            NotificationKind::Comment,
            "New comment",
            &format!("Someone commented on your post \"{}\"", post.title),
            Some(post.id),
        )
        .await;
    }

    Ok(Json(comment))
}

async fn edit_comment(
    Extension(db): Extension<DbRouter>,
    Path(comment_id): Path<Uuid>,
    user: AuthUser,
    Json(req): Json<CommentRequest>,
) -> AppResult<Json<Comment>> {
    let content = content_of(&req)?;
    let conn = &mut db.write().await?;

    let (comment, club_id) = find_comment(conn, comment_id).await?;
    let actor = load_actor(conn, &user).await?;
    require(
        policy::can_modify_comment(&actor, club_id, comment.author_id, comment.created_at, Utc::now()),
        "comment",
    )?;

    let comment = diesel::update(comments::table.find(comment_id))
        .set((
            comments::content.eq(content),
            comments::updated_at.eq(Utc::now()),
        ))
        .get_result::<Comment>(conn)
        .await?;

    Ok(Json(comment))
}

async fn delete_comment(
    Extension(db): Extension<DbRouter>,
    Path(comment_id): Path<Uuid>,
    user: AuthUser,
) -> AppResult<()> {
    let conn = &mut db.write().await?;

    let (comment, club_id) = find_comment(conn, comment_id).await?;
    let actor = load_actor(conn, &user).await?;
    require(
        policy::can_modify_comment(&actor, club_id, comment.author_id, comment.created_at, Utc::now()),
        "comment",
    )?;

    diesel::delete(comments::table.find(comment_id))
        .execute(conn)
        .await?;

    Ok(())
}

pub fn app() -> Router {
    Router::new().route("/:comment_id", put(edit_comment).delete(delete_comment))
}
