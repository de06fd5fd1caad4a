use super::{load_actor, Pagination};
use crate::{
    auth::AuthUser,
    crypto::ChatCipher,
    db::DbRouter,
    error::{AppError, AppResult},
    models::{ChatMessage, ChatRoom},
    policy::{self, Actor, RoomKind},
    rate_limit::Limiters,
    schema::*,
};
use axum::{
    extract::{Path, Query},
    http::StatusCode,
    routing::{get, post, put},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

const MAX_MESSAGE_LEN: usize = 4000;
const MESSAGE_TYPES: [&str; 3] = ["text", "image", "file"];

#[derive(Deserialize)]
struct NewRoomRequest {
    name: String,
    kind: String,
    club_id: Option<Uuid>,
    #[serde(default)]
    members: Vec<Uuid>,
}

#[derive(Deserialize)]
struct AddMemberRequest {
    user_id: Uuid,
}

#[derive(Deserialize)]
struct NewMessageRequest {
    content: String,
    message_type: Option<String>,
}

#[derive(Deserialize)]
struct EditMessageRequest {
    content: String,
}

#[derive(Serialize)]
struct MessageResponse {
    id: Uuid,
    room_id: Uuid,
    user_id: Uuid,
    user_name: String,
    content: String,
    message_type: String,
    is_edited: bool,
    is_expired: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl MessageResponse {
    fn from(cipher: &ChatCipher, message: ChatMessage, user_name: String) -> Self {
        // expired rows hold a plain placeholder, not an envelope
        let content = if message.is_expired {
            message.body.clone()
        } else {
            cipher.decrypt_or_placeholder(message.room_id, &message.body)
        };
        Self::with_content(message, user_name, content)
    }

    fn with_content(message: ChatMessage, user_name: String, content: String) -> Self {
        Self {
            id: message.id,
            room_id: message.room_id,
            user_id: message.user_id,
            user_name,
            content,
            message_type: message.message_type,
            is_edited: message.is_edited,
            is_expired: message.is_expired,
            created_at: message.created_at,
            updated_at: message.updated_at,
        }
    }
}

// Key derivation costs a PBKDF2 run per message; keep it off the async workers.
async fn seal(cipher: &ChatCipher, room_id: Uuid, content: &str) -> AppResult<String> {
    let cipher = cipher.clone();
    let content = content.to_string();
    Ok(tokio::task::spawn_blocking(move || cipher.encrypt(room_id, &content)).await??)
}

async fn open_page(
    cipher: &ChatCipher,
    rows: Vec<(ChatMessage, String)>,
) -> AppResult<Vec<MessageResponse>> {
    let cipher = cipher.clone();
    Ok(tokio::task::spawn_blocking(move || {
        rows.into_iter()
            .map(|(message, name)| MessageResponse::from(&cipher, message, name))
            .collect::<Vec<_>>()
    })
    .await?)
}

fn message_content(content: &str) -> AppResult<&str> {
    let content = content.trim();
    if content.is_empty() {
        return Err(AppError::from(
            StatusCode::BAD_REQUEST,
            "message cannot be empty",
        ));
    }
    if content.chars().count() > MAX_MESSAGE_LEN {
        return Err(AppError::from(
            StatusCode::BAD_REQUEST,
            format!("messages are limited to {MAX_MESSAGE_LEN} characters"),
        ));
    }
    Ok(content)
}

fn room_kind(room: &ChatRoom) -> AppResult<RoomKind> {
    RoomKind::parse(&room.kind)
        .ok_or_else(|| anyhow::anyhow!("room {} has unknown kind `{}`", room.id, room.kind).into())
}

async fn is_member(conn: &mut AsyncPgConnection, room_id: Uuid, user_id: Uuid) -> AppResult<bool> {
    let count = chat_room_members::table
        .find((room_id, user_id))
        .count()
        .get_result::<i64>(conn)
        .await?;
    Ok(count > 0)
}

/// Loads a room the actor is allowed to see.
async fn accessible_room(
    conn: &mut AsyncPgConnection,
    room_id: Uuid,
    actor: &Actor,
) -> AppResult<ChatRoom> {
    let room = chat_rooms::table
        .find(room_id)
        .first::<ChatRoom>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::from(StatusCode::NOT_FOUND, "the chat room does not exist"))?;

    let member = is_member(conn, room_id, actor.id).await?;
    if !policy::can_access_room(actor, room_kind(&room)?, room.club_id, room.created_by, member) {
        return Err(AppError::from(
            StatusCode::FORBIDDEN,
            "you do not have access to this chat room",
        ));
    }
    Ok(room)
}

async fn find_message(
    conn: &mut AsyncPgConnection,
    room_id: Uuid,
    message_id: Uuid,
) -> AppResult<ChatMessage> {
    chat_messages::table
        .filter(chat_messages::id.eq(message_id))
        .filter(chat_messages::room_id.eq(room_id))
        .first::<ChatMessage>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::from(StatusCode::NOT_FOUND, "the message does not exist"))
}

async fn list_rooms(
    Extension(db): Extension<DbRouter>,
    user: AuthUser,
) -> AppResult<Json<Vec<ChatRoom>>> {
    let conn = &mut db.read().await?;
    let actor = load_actor(conn, &user).await?;

    let rooms = chat_rooms::table
        .order(chat_rooms::name.asc())
        .load::<ChatRoom>(conn)
        .await?;
    let joined: Vec<Uuid> = chat_room_members::table
        .filter(chat_room_members::user_id.eq(user.id))
        .select(chat_room_members::room_id)
        .load(conn)
        .await?;

    Ok(Json(
        rooms
            .into_iter()
            .filter(|room| {
                RoomKind::parse(&room.kind).map_or(false, |kind| {
                    policy::can_access_room(
                        &actor,
                        kind,
                        room.club_id,
                        room.created_by,
                        joined.contains(&room.id),
                    )
                })
            })
            .collect(),
    ))
}

async fn create_room(
    Extension(db): Extension<DbRouter>,
    user: AuthUser,
    Json(req): Json<NewRoomRequest>,
) -> AppResult<Json<ChatRoom>> {
    #[derive(Insertable)]
    #[diesel(table_name = chat_rooms)]
    struct NewRoom {
        name: String,
        kind: &'static str,
        club_id: Option<Uuid>,
        created_by: Uuid,
    }

    #[derive(Insertable)]
    #[diesel(table_name = chat_room_members)]
    struct NewMember {
        room_id: Uuid,
        user_id: Uuid,
    }

    let name = req.name.trim();
    if name.is_empty() {
        return Err(AppError::from(StatusCode::BAD_REQUEST, "room name is required"));
    }
    let kind = RoomKind::parse(&req.kind).ok_or_else(|| {
        AppError::from(
            StatusCode::BAD_REQUEST,
            "room kind must be public, club or private",
        )
    })?;

    let conn = &mut db.write().await?;
    let actor = load_actor(conn, &user).await?;

    let club_id = match kind {
        RoomKind::Club => {
            let club_id = req.club_id.ok_or_else(|| {
                AppError::from(StatusCode::BAD_REQUEST, "club rooms need a club_id")
            })?;
            super::require_manager(&actor, club_id)?;
            Some(club_id)
        }
        RoomKind::Public | RoomKind::Private => None,
    };

    let room = diesel::insert_into(chat_rooms::table)
        .values(NewRoom {
            name: name.to_string(),
            kind: kind.as_str(),
            club_id,
            created_by: user.id,
        })
        .get_result::<ChatRoom>(conn)
        .await?;

    if kind == RoomKind::Private {
        let mut members = req.members;
        members.push(user.id);
        members.sort();
        members.dedup();

        let rows: Vec<_> = members
            .into_iter()
            .map(|user_id| NewMember {
                room_id: room.id,
                user_id,
            })
            .collect();
        diesel::insert_into(chat_room_members::table)
            .values(&rows)
            .on_conflict_do_nothing()
            .execute(conn)
            .await?;
    }
    tracing::info!(room_id = %room.id, kind = kind.as_str(), "created chat room");

    Ok(Json(room))
}

async fn room_info(
    Extension(db): Extension<DbRouter>,
    Path(room_id): Path<Uuid>,
    user: AuthUser,
) -> AppResult<Json<ChatRoom>> {
    let conn = &mut db.read().await?;
    let actor = load_actor(conn, &user).await?;
    Ok(Json(accessible_room(conn, room_id, &actor).await?))
}

async fn add_member(
    Extension(db): Extension<DbRouter>,
    Path(room_id): Path<Uuid>,
    user: AuthUser,
    Json(req): Json<AddMemberRequest>,
) -> AppResult<()> {
    #[derive(Insertable)]
    #[diesel(table_name = chat_room_members)]
    struct NewMember {
        room_id: Uuid,
        user_id: Uuid,
    }

    let conn = &mut db.write().await?;
    let actor = load_actor(conn, &user).await?;

    let room = accessible_room(conn, room_id, &actor).await?;
    let may_add = room.created_by == actor.id
        || actor.role.is_admin()
        || room.club_id.map_or(false, |club| actor.manages_club(club));
    if !may_add {
        return Err(AppError::from(
            StatusCode::FORBIDDEN,
            "only the room creator or a club manager can add members",
        ));
    }

    let exists = users::table
        .find(req.user_id)
        .count()
        .get_result::<i64>(conn)
        .await?;
    if exists == 0 {
        return Err(AppError::from(StatusCode::NOT_FOUND, "user not found"));
    }

    diesel::insert_into(chat_room_members::table)
        .values(NewMember {
            room_id,
            user_id: req.user_id,
        })
        .on_conflict_do_nothing()
        .execute(conn)
        .await?;

    Ok(())
}

async fn list_messages(
    Extension(db): Extension<DbRouter>,
    Extension(cipher): Extension<ChatCipher>,
    Path(room_id): Path<Uuid>,
    Query(page): Query<Pagination>,
    user: AuthUser,
) -> AppResult<Json<Vec<MessageResponse>>> {
    let conn = &mut db.read().await?;
    let actor = load_actor(conn, &user).await?;
    accessible_room(conn, room_id, &actor).await?;

    let mut rows = chat_messages::table
        .inner_join(users::table)
        .filter(chat_messages::room_id.eq(room_id))
        .order(chat_messages::created_at.desc())
        .limit(page.limit())
        .offset(page.offset())
        .select((chat_messages::all_columns, users::name))
        .load::<(ChatMessage, String)>(conn)
        .await?;
    // newest page first from the db, oldest first to the client
    rows.reverse();

    Ok(Json(open_page(&cipher, rows).await?))
}

async fn send_message(
    Extension(db): Extension<DbRouter>,
    Extension(cipher): Extension<ChatCipher>,
    Extension(limiters): Extension<Arc<Limiters>>,
    Path(room_id): Path<Uuid>,
    user: AuthUser,
    Json(req): Json<NewMessageRequest>,
) -> AppResult<(StatusCode, Json<MessageResponse>)> {
    #[derive(Insertable)]
    #[diesel(table_name = chat_messages)]
    struct NewMessage {
        room_id: Uuid,
        user_id: Uuid,
        body: String,
        message_type: String,
    }

    limiters.chat.enforce(&format!("chat:{}", user.id))?;

    let content = message_content(&req.content)?;
    let message_type = req.message_type.unwrap_or_else(|| "text".to_string());
    if !MESSAGE_TYPES.contains(&message_type.as_str()) {
        return Err(AppError::from(
            StatusCode::BAD_REQUEST,
            "message type must be text, image or file",
        ));
    }

    let conn = &mut db.write().await?;
    let actor = load_actor(conn, &user).await?;
    accessible_room(conn, room_id, &actor).await?;

    let body = seal(&cipher, room_id, content).await?;
    let message = diesel::insert_into(chat_messages::table)
        .values(NewMessage {
            room_id,
            user_id: user.id,
            body,
            message_type,
        })
        .get_result::<ChatMessage>(conn)
        .await?;

    let name = users::table
        .find(user.id)
        .select(users::name)
        .first::<String>(conn)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(MessageResponse::with_content(message, name, content.to_string())),
    ))
}

async fn edit_message(
    Extension(db): Extension<DbRouter>,
    Extension(cipher): Extension<ChatCipher>,
    Path((room_id, message_id)): Path<(Uuid, Uuid)>,
    user: AuthUser,
    Json(req): Json<EditMessageRequest>,
) -> AppResult<Json<MessageResponse>> {
    let content = message_content(&req.content)?;

    let conn = &mut db.write().await?;
    let actor = load_actor(conn, &user).await?;
    accessible_room(conn, room_id, &actor).await?;

    let message = find_message(conn, room_id, message_id).await?;
    if message.user_id != user.id {
        return Err(AppError::from(
            StatusCode::FORBIDDEN,
            "you can only edit your own messages",
        ));
    }
    if message.is_expired {
        return Err(AppError::from(
            StatusCode::BAD_REQUEST,
            "expired messages cannot be edited",
        ));
    }

    let body = seal(&cipher, room_id, content).await?;
    let message = diesel::update(chat_messages::table.find(message_id))
        .set((
            chat_messages::body.eq(body),
            chat_messages::is_edited.eq(true),
            chat_messages::updated_at.eq(Utc::now()),
        ))
        .get_result::<ChatMessage>(conn)
        .await?;

    let name = users::table
        .find(user.id)
        .select(users::name)
        .first::<String>(conn)
        .await?;

    Ok(Json(MessageResponse::with_content(
        message,
        name,
        content.to_string(),
    )))
}

async fn delete_message(
    Extension(db): Extension<DbRouter>,
    Path((room_id, message_id)): Path<(Uuid, Uuid)>,
    user: AuthUser,
) -> AppResult<()> {
    let conn = &mut db.write().await?;
    let actor = load_actor(conn, &user).await?;
    let room = accessible_room(conn, room_id, &actor).await?;

    let message = find_message(conn, room_id, message_id).await?;
    if !policy::can_delete_message(&actor, message.user_id, room.club_id) {
        return Err(AppError::from(
            StatusCode::FORBIDDEN,
            "you are not allowed to delete this message",
        ));
    }

    diesel::delete(chat_messages::table.find(message_id))
        .execute(conn)
        .await?;

    Ok(())
}

pub fn app() -> Router {
    Router::new()
        .route("/rooms", get(list_rooms).post(create_room))
        .route("/rooms/:room_id", get(room_info))
        .route("/rooms/:room_id/members", post(add_member))
        .route(
            "/rooms/:room_id/messages",
            get(list_messages).post(send_message),
        )
        .route(
            "/rooms/:room_id/messages/:message_id",
            put(edit_message).delete(delete_message),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_content_is_trimmed_and_bounded() {
        assert_eq!(message_content("  hi there \n").unwrap(), "hi there");
        assert!(message_content("   ").is_err());
        assert!(message_content(&"x".repeat(MAX_MESSAGE_LEN + 1)).is_err());
    }

    #[test]
    fn expired_messages_skip_decryption() {
        let cipher = ChatCipher::new("test-secret").with_iterations(10);
        let room_id = Uuid::new_v4();
        let now = Utc::now();
        let message = ChatMessage {
            id: Uuid::new_v4(),
            room_id,
            user_id: Uuid::new_v4(),
            body: crate::cleanup::EXPIRED_PLACEHOLDER.to_string(),
            message_type: "text".to_string(),
            is_edited: false,
            is_expired: true,
            created_at: now,
            updated_at: now,
        };
        let response = MessageResponse::from(&cipher, message.clone(), "Ada".to_string());
        assert_eq!(response.content, crate::cleanup::EXPIRED_PLACEHOLDER);

        let live = ChatMessage {
            body: cipher.encrypt(room_id, "see you at the meetup").unwrap(),
            is_expired: false,
            ..message
        };
        assert_eq!(
            MessageResponse::from(&cipher, live, "Ada".to_string()).content,
            "see you at the meetup"
        );
    }

    #[tokio::test]
    async fn pages_decrypt_on_the_blocking_pool() {
        let cipher = ChatCipher::new("test-secret").with_iterations(10);
        let room_id = Uuid::new_v4();
        let body = seal(&cipher, room_id, "first").await.unwrap();
        let now = Utc::now();
        let message = |body: String, is_expired: bool| ChatMessage {
            id: Uuid::new_v4(),
            room_id,
            user_id: Uuid::new_v4(),
            body,
            message_type: "text".to_string(),
            is_edited: false,
            is_expired,
            created_at: now,
            updated_at: now,
        };

        let rows = vec![
            (message(body, false), "Ada".to_string()),
            (message("not an envelope".to_string(), false), "Grace".to_string()),
            (
                message(crate::cleanup::EXPIRED_PLACEHOLDER.to_string(), true),
                "Linus".to_string(),
            ),
        ];
        let page = open_page(&cipher, rows).await.unwrap();

        let contents: Vec<_> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            [
                "first",
                crate::crypto::UNREADABLE_PLACEHOLDER,
                crate::cleanup::EXPIRED_PLACEHOLDER,
            ]
        );
        assert_eq!(page[0].user_name, "Ada");
    }
}
