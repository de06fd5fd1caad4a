use super::{club::find_club, load_actor, require_manager};
use crate::{
    auth::AuthUser,
    db::DbRouter,
    error::{AppError, AppResult},
    models::Event,
    notify::{self, NotificationKind},
    schema::*,
};
use axum::{
    extract::{Path, Query},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use diesel::{
    prelude::*,
    result::{DatabaseErrorKind, Error as DieselError},
    sql_types::Uuid as SqlUuid,
};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const EVENT_TYPES: [&str; 5] = ["meeting", "workshop", "social", "competition", "presentation"];

#[derive(Deserialize)]
struct EventFilter {
    club_id: Option<Uuid>,
    #[serde(default)]
    upcoming: bool,
}

#[derive(Deserialize)]
struct NewEventRequest {
    club_id: Uuid,
    title: String,
    description: Option<String>,
    location: Option<String>,
    #[serde(default = "default_event_type")]
    event_type: String,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    max_attendees: Option<i32>,
}

fn default_event_type() -> String {
    "meeting".to_string()
}

#[derive(Deserialize, AsChangeset)]
#[diesel(table_name = events)]
struct EventEdit {
    title: Option<String>,
    description: Option<String>,
    location: Option<String>,
    event_type: Option<String>,
    starts_at: Option<DateTime<Utc>>,
    ends_at: Option<DateTime<Utc>>,
    max_attendees: Option<i32>,
}

impl EventEdit {
    fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.location.is_none()
            && self.event_type.is_none()
            && self.starts_at.is_none()
            && self.ends_at.is_none()
            && self.max_attendees.is_none()
    }
}

#[derive(Deserialize)]
struct AttendanceRequest {
    user_id: Uuid,
    attended: bool,
}

#[derive(Serialize)]
struct Attendee {
    user_id: Uuid,
    name: String,
    email: String,
    registered_at: DateTime<Utc>,
    attended: bool,
}

fn validate_event(
    event_type: &str,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    max_attendees: Option<i32>,
) -> AppResult<()> {
    if !EVENT_TYPES.contains(&event_type) {
        return Err(AppError::from(
            StatusCode::BAD_REQUEST,
            format!("event type must be one of {}", EVENT_TYPES.join(", ")),
        ));
    }
    if ends_at <= starts_at {
        return Err(AppError::from(
            StatusCode::BAD_REQUEST,
            "an event must end after it starts",
        ));
    }
    if max_attendees.map_or(false, |max| max <= 0) {
        return Err(AppError::from(
            StatusCode::BAD_REQUEST,
            "max attendees must be positive",
        ));
    }
    Ok(())
}

async fn find_event(conn: &mut AsyncPgConnection, event_id: Uuid) -> AppResult<Event> {
    events::table
        .find(event_id)
        .first::<Event>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::from(StatusCode::NOT_FOUND, "the event does not exist"))
}

async fn list(
    Extension(db): Extension<DbRouter>,
    Query(filter): Query<EventFilter>,
) -> AppResult<Json<Vec<Event>>> {
    let conn = &mut db.read().await?;

    let mut query = events::table.into_boxed();
    if let Some(club_id) = filter.club_id {
        query = query.filter(events::club_id.eq(club_id));
    }
    if filter.upcoming {
        query = query.filter(events::starts_at.gt(Utc::now()));
    }

    Ok(Json(
        query
            .order(events::starts_at.asc())
            .load::<Event>(conn)
            .await?,
    ))
}

async fn create(
    Extension(db): Extension<DbRouter>,
    user: AuthUser,
    Json(req): Json<NewEventRequest>,
) -> AppResult<Json<Event>> {
    #[derive(Insertable)]
    #[diesel(table_name = events)]
    struct NewEvent {
        club_id: Uuid,
        created_by: Uuid,
        title: String,
        description: Option<String>,
        location: Option<String>,
        event_type: String,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        max_attendees: Option<i32>,
    }

    if req.title.trim().is_empty() {
        return Err(AppError::from(StatusCode::BAD_REQUEST, "title is required"));
    }
    validate_event(&req.event_type, req.starts_at, req.ends_at, req.max_attendees)?;

    let conn = &mut db.write().await?;

    let actor = load_actor(conn, &user).await?;
    require_manager(&actor, req.club_id)?;
    find_club(conn, req.club_id).await?;

    let event = diesel::insert_into(events::table)
        .values(NewEvent {
            club_id: req.club_id,
            created_by: user.id,
            title: req.title.trim().to_string(),
            description: req.description,
            location: req.location,
            event_type: req.event_type,
            starts_at: req.starts_at,
            ends_at: req.ends_at,
            max_attendees: req.max_attendees,
        })
        .get_result::<Event>(conn)
        .await?;
    tracing::info!(event_id = %event.id, club_id = %event.club_id, "created event");

    notify::notify_club(
        conn,
        event.club_id,
        user.id,
        NotificationKind::Event,
        "New event",
        &format!("{} on {}", event.title, event.starts_at.format("%b %e, %H:%M UTC")),
        Some(event.id),
    )
    .await;

    Ok(Json(event))
}

async fn info(
    Extension(db): Extension<DbRouter>,
    Path(event_id): Path<Uuid>,
) -> AppResult<Json<Event>> {
    let conn = &mut db.read().await?;
    Ok(Json(find_event(conn, event_id).await?))
}

async fn edit(
    Extension(db): Extension<DbRouter>,
    Path(event_id): Path<Uuid>,
    user: AuthUser,
    Json(req): Json<EventEdit>,
) -> AppResult<Json<Event>> {
    let conn = &mut db.write().await?;

    let event = find_event(conn, event_id).await?;
    let actor = load_actor(conn, &user).await?;
    require_manager(&actor, event.club_id)?;

    if req.is_empty() {
        return Ok(Json(event));
    }
    validate_event(
        req.event_type.as_deref().unwrap_or(&event.event_type),
        req.starts_at.unwrap_or(event.starts_at),
        req.ends_at.unwrap_or(event.ends_at),
        req.max_attendees.or(event.max_attendees),
    )?;
    if req.max_attendees.map_or(false, |max| max < event.attendee_count) {
        return Err(AppError::from(
            StatusCode::BAD_REQUEST,
            "more people have already registered than the new limit allows",
        ));
    }

    let event = diesel::update(events::table.find(event_id))
        .set(&req)
        .get_result::<Event>(conn)
        .await?;

    Ok(Json(event))
}

async fn remove(
    Extension(db): Extension<DbRouter>,
    Path(event_id): Path<Uuid>,
    user: AuthUser,
) -> AppResult<()> {
    let conn = &mut db.write().await?;

    let event = find_event(conn, event_id).await?;
    let actor = load_actor(conn, &user).await?;
    require_manager(&actor, event.club_id)?;

    diesel::delete(events::table.find(event_id))
        .execute(conn)
        .await?;
    tracing::info!(%event_id, by = %user.id, "deleted event");

    Ok(())
}

async fn register(
    Extension(db): Extension<DbRouter>,
    Path(event_id): Path<Uuid>,
    user: AuthUser,
) -> AppResult<Json<Event>> {
    let conn = &mut db.write().await?;

    let already = event_attendees::table
        .find((event_id, user.id))
        .count()
        .get_result::<i64>(conn)
        .await?;
    if already > 0 {
        return Err(AppError::from(
            StatusCode::CONFLICT,
            "you are already registered for this event",
        ));
    }

    // the seat is claimed on the event row, so concurrent registrations
    // cannot push the count past max_attendees
    let claimed = diesel::sql_query(
        "WITH claimed AS ( \
             UPDATE events SET attendee_count = attendee_count + 1 \
             WHERE id = $1 AND ends_at > NOW() \
               AND (max_attendees IS NULL OR attendee_count < max_attendees) \
             RETURNING id) \
         INSERT INTO event_attendees (event_id, user_id) SELECT id, $2 FROM claimed",
    )
    .bind::<SqlUuid, _>(event_id)
    .bind::<SqlUuid, _>(user.id)
    .execute(conn)
    .await;

    let claimed = match claimed {
        Ok(rows) => rows,
        Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            return Err(AppError::from(
                StatusCode::CONFLICT,
                "you are already registered for this event",
            ))
        }
        Err(e) => return Err(e.into()),
    };

    let event = find_event(conn, event_id).await?;
    if claimed == 0 {
        let message = if event.ends_at <= Utc::now() {
            "this event has already ended"
        } else {
            "this event is full"
        };
        return Err(AppError::from(StatusCode::BAD_REQUEST, message));
    }
    tracing::debug!(%event_id, user_id = %user.id, "registered for event");

    Ok(Json(event))
}

async fn unregister(
    Extension(db): Extension<DbRouter>,
    Path(event_id): Path<Uuid>,
    user: AuthUser,
) -> AppResult<()> {
    let conn = &mut db.write().await?;

    let released = diesel::sql_query(
        "WITH removed AS ( \
             DELETE FROM event_attendees WHERE event_id = $1 AND user_id = $2 \
             RETURNING event_id) \
         UPDATE events SET attendee_count = attendee_count - 1 \
         WHERE id IN (SELECT event_id FROM removed)",
    )
    .bind::<SqlUuid, _>(event_id)
    .bind::<SqlUuid, _>(user.id)
    .execute(conn)
    .await?;

    if released == 0 {
        return Err(AppError::from(
            StatusCode::NOT_FOUND,
            "you are not registered for this event",
        ));
    }

    Ok(())
}

async fn attendees(
    Extension(db): Extension<DbRouter>,
    Path(event_id): Path<Uuid>,
    user: AuthUser,
) -> AppResult<Json<Vec<Attendee>>> {
    let conn = &mut db.read().await?;

    let event = find_event(conn, event_id).await?;
    let actor = load_actor(conn, &user).await?;
    require_manager(&actor, event.club_id)?;

    let rows = event_attendees::table
        .inner_join(users::table)
        .filter(event_attendees::event_id.eq(event_id))
        .order(event_attendees::registered_at.asc())
        .select((
            users::id,
            users::name,
            users::email,
            event_attendees::registered_at,
            event_attendees::attended,
        ))
        .load::<(Uuid, String, String, DateTime<Utc>, bool)>(conn)
        .await?;

    Ok(Json(
        rows.into_iter()
            .map(|(user_id, name, email, registered_at, attended)| Attendee {
                user_id,
                name,
                email,
                registered_at,
                attended,
            })
            .collect(),
    ))
}

async fn mark_attendance(
    Extension(db): Extension<DbRouter>,
    Path(event_id): Path<Uuid>,
    user: AuthUser,
    Json(req): Json<AttendanceRequest>,
) -> AppResult<()> {
    let conn = &mut db.write().await?;

    let event = find_event(conn, event_id).await?;
    let actor = load_actor(conn, &user).await?;
    require_manager(&actor, event.club_id)?;

    let updated = diesel::update(event_attendees::table.find((event_id, req.user_id)))
        .set(event_attendees::attended.eq(req.attended))
        .execute(conn)
        .await?;

    if updated == 0 {
        return Err(AppError::from(
            StatusCode::NOT_FOUND,
            "that user is not registered for this event",
        ));
    }

    Ok(())
}

pub fn app() -> Router {
    Router::new()
        .route("/", get(list).post(create))
        .route("/:event_id", get(info).put(edit).delete(remove))
        .route("/:event_id/register", post(register).delete(unregister))
        .route("/:event_id/attendees", get(attendees))
        .route("/:event_id/attendance", post(mark_attendance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn events_must_end_after_they_start() {
        let start = Utc::now();
        assert!(validate_event("workshop", start, start + Duration::hours(2), Some(30)).is_ok());
        assert_eq!(
            validate_event("workshop", start, start, None).unwrap_err().status(),
            StatusCode::BAD_REQUEST
        );
        assert!(validate_event("party", start, start + Duration::hours(1), None).is_err());
        assert!(validate_event("social", start, start + Duration::hours(1), Some(0)).is_err());
    }

    #[test]
    fn empty_edits_skip_the_update() {
        let edit: EventEdit = serde_json::from_str("{}").unwrap();
        assert!(edit.is_empty());

        let edit: EventEdit = serde_json::from_str(r#"{"max_attendees": 40}"#).unwrap();
        assert!(!edit.is_empty());
        let sql = diesel::debug_query::<diesel::pg::Pg, _>(
            &diesel::update(events::table.find(Uuid::nil())).set(&edit),
        )
        .to_string();
        assert!(sql.contains("\"max_attendees\" = $1"), "{sql}");
    }
}
