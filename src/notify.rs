use crate::schema::*;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Announcement,
    Event,
    Assignment,
    Comment,
    Like,
    System,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Announcement => "announcement",
            NotificationKind::Event => "event",
            NotificationKind::Assignment => "assignment",
            NotificationKind::Comment => "comment",
            NotificationKind::Like => "like",
            NotificationKind::System => "system",
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = notifications)]
struct NewNotification<'a> {
    user_id: Uuid,
    title: &'a str,
    message: &'a str,
    kind: &'a str,
    related_id: Option<Uuid>,
}

/// Notifications are a side effect; a failure here is logged, never returned.
pub async fn notify_user(
    conn: &mut AsyncPgConnection,
    user_id: Uuid,
    kind: NotificationKind,
    title: &str,
    message: &str,
    related_id: Option<Uuid>,
) {
    let result = diesel::insert_into(notifications::table)
        .values(NewNotification {
            user_id,
            title,
            message,
            kind: kind.as_str(),
            related_id,
        })
        .execute(conn)
        .await;

    if let Err(e) = result {
        tracing::warn!(%user_id, error = %e, "failed to create notification");
    }
}

/// Notifies every member of `club_id` except `skip` (usually the actor).
pub async fn notify_club(
    conn: &mut AsyncPgConnection,
    club_id: Uuid,
    skip: Uuid,
    kind: NotificationKind,
    title: &str,
    message: &str,
    related_id: Option<Uuid>,
) {
    let members = users::table
        .filter(users::club_id.eq(club_id))
        .filter(users::id.ne(skip))
        .select(users::id)
        .load::<Uuid>(conn)
        .await;

    let members = match members {
        Ok(members) => members,
        Err(e) => {
            tracing::warn!(%club_id, error = %e, "failed to load club members for notification");
            return;
        }
    };
    if members.is_empty() {
        return;
    }

    let rows: Vec<_> = members
        .iter()
        .map(|user_id| NewNotification {
            user_id: *user_id,
            title,
            message,
            kind: kind.as_str(),
            related_id,
        })
        .collect();

    match diesel::insert_into(notifications::table)
        .values(&rows)
        .execute(conn)
        .await
    {
        Ok(count) => tracing::debug!(%club_id, count, kind = kind.as_str(), "notified club"),
        Err(e) => tracing::warn!(%club_id, error = %e, "failed to notify club"),
    }
}
