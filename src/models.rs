use crate::schema::*;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
pub struct Club {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub description: String,
    pub club_type: String,
    pub color: String,
    pub logo_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(belongs_to(Club))]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub name: String,
    pub role: String,
    pub club_id: Option<Uuid>,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Serialize)]
#[diesel(belongs_to(Club))]
pub struct Post {
    pub id: Uuid,
    pub club_id: Uuid,
    pub author_id: Uuid,
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub view_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Serialize)]
#[diesel(belongs_to(Post))]
pub struct Comment {
    pub id: Uuid,
    pub post_id: Uuid,
    pub author_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Serialize)]
#[diesel(belongs_to(Club))]
pub struct Event {
    pub id: Uuid,
    pub club_id: Uuid,
    pub created_by: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub event_type: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub max_attendees: Option<i32>,
    pub attendee_count: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Serialize)]
pub struct EventAttendee {
    pub event_id: Uuid,
    pub user_id: Uuid,
    pub registered_at: DateTime<Utc>,
    pub attended: bool,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Serialize)]
#[diesel(belongs_to(Club))]
pub struct Assignment {
    pub id: Uuid,
    pub club_id: Uuid,
    pub created_by: Uuid,
    pub title: String,
    pub description: String,
    pub instructions: Option<String>,
    pub due_date: DateTime<Utc>,
    pub time_limit_minutes: Option<i32>,
    pub max_attempts: i32,
    pub passing_score: i32,
    pub is_published: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(belongs_to(Assignment))]
pub struct AssignmentQuestion {
    pub id: Uuid,
    pub assignment_id: Uuid,
    pub position: i32,
    pub kind: String,
    pub prompt: String,
    pub options: serde_json::Value,
    pub correct_answer: Option<serde_json::Value>,
    pub points: i32,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Serialize)]
#[diesel(belongs_to(Assignment))]
pub struct AssignmentAttempt {
    pub id: Uuid,
    pub assignment_id: Uuid,
    pub user_id: Uuid,
    pub attempt_number: i32,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub answers: serde_json::Value,
    pub graded_answers: Option<serde_json::Value>,
    pub score: Option<i32>,
    pub max_score: Option<i32>,
    pub percentage: Option<f64>,
    pub is_passing: Option<bool>,
    pub violations: serde_json::Value,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
pub struct ChatRoom {
    pub id: Uuid,
    pub name: String,
    pub kind: String,
    pub club_id: Option<Uuid>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(belongs_to(ChatRoom, foreign_key = room_id))]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub body: String,
    pub message_type: String,
    pub is_edited: bool,
    pub is_expired: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub message: String,
    pub kind: String,
    pub related_id: Option<Uuid>,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// The user fields that are safe to hand back to clients.
#[derive(Debug, Clone, Serialize)]
pub struct PublicUser {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub role: String,
    pub club_id: Option<Uuid>,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for PublicUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            name: user.name.clone(),
            role: user.role.clone(),
            club_id: user.club_id,
            avatar_url: user.avatar_url.clone(),
            bio: user.bio.clone(),
            created_at: user.created_at,
        }
    }
}
