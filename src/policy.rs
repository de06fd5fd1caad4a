//! Who may touch what, and for how long.

use crate::auth::Role;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

pub fn post_edit_window() -> Duration {
    Duration::days(3)
}

pub fn comment_edit_window() -> Duration {
    Duration::hours(3)
}

/// The parts of a user that permission checks look at.
#[derive(Debug, Clone, Copy)]
pub struct Actor {
    pub id: Uuid,
    pub role: Role,
    pub club_id: Option<Uuid>,
}

impl Actor {
    pub fn manages_club(&self, club_id: Uuid) -> bool {
        self.role.is_admin() || (self.role.is_manager() && self.club_id == Some(club_id))
    }

    pub fn is_member_of(&self, club_id: Uuid) -> bool {
        self.club_id == Some(club_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    NotOwner,
    WindowClosed,
}

fn authored_within(
    actor: &Actor,
    author_id: Uuid,
    created_at: DateTime<Utc>,
    window: Duration,
    now: DateTime<Utc>,
) -> Verdict {
    if actor.id != author_id {
        Verdict::NotOwner
    } else if now - created_at > window {
        Verdict::WindowClosed
    } else {
        Verdict::Allowed
    }
}

pub fn can_edit_post(
    actor: &Actor,
    club_id: Uuid,
    author_id: Uuid,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Verdict {
    if actor.manages_club(club_id) {
        return Verdict::Allowed;
    }
    authored_within(actor, author_id, created_at, post_edit_window(), now)
}

pub fn can_delete_post(actor: &Actor, club_id: Uuid, author_id: Uuid) -> Verdict {
    if actor.manages_club(club_id) || actor.id == author_id {
        Verdict::Allowed
    } else {
        Verdict::NotOwner
    }
}

/// Comments share one rule for editing and deleting.
pub fn can_modify_comment(
    actor: &Actor,
    club_id: Uuid,
    author_id: Uuid,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Verdict {
    if actor.manages_club(club_id) {
        return Verdict::Allowed;
    }
    authored_within(actor, author_id, created_at, comment_edit_window(), now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomKind {
    Public,
    Club,
    Private,
}

impl RoomKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(RoomKind::Public),
            "club" => Some(RoomKind::Club),
            "private" => Some(RoomKind::Private),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoomKind::Public => "public",
            RoomKind::Club => "club",
            RoomKind::Private => "private",
        }
    }
}

pub fn can_access_room(
    actor: &Actor,
    kind: RoomKind,
    room_club_id: Option<Uuid>,
    created_by: Uuid,
    is_member: bool,
) -> bool {
    if actor.role.is_admin() || created_by == actor.id || is_member {
        return true;
    }
    match kind {
        RoomKind::Public => true,
        RoomKind::Club => room_club_id.map_or(false, |club| actor.is_member_of(club)),
        RoomKind::Private => false,
    }
}

pub fn can_delete_message(actor: &Actor, author_id: Uuid, room_club_id: Option<Uuid>) -> bool {
    actor.id == author_id || actor.role.is_admin() || room_club_id.map_or(false, |club| actor.manages_club(club))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(role: Role, club_id: Option<Uuid>) -> Actor {
        Actor {
            id: Uuid::new_v4(),
            role,
            club_id,
        }
    }

    #[test]
    fn managers_are_scoped_to_their_club() {
        let club = Uuid::new_v4();
        let other = Uuid::new_v4();
        let coordinator = actor(Role::Coordinator, Some(club));
        assert!(coordinator.manages_club(club));
        assert!(!coordinator.manages_club(other));
        assert!(actor(Role::Admin, None).manages_club(other));
        assert!(!actor(Role::Student, Some(club)).manages_club(club));
    }

    #[test]
    fn post_authors_get_three_days() {
        let club = Uuid::new_v4();
        let author = actor(Role::Student, Some(club));
        let now = Utc::now();

        assert_eq!(
            can_edit_post(&author, club, author.id, now - Duration::days(2), now),
            Verdict::Allowed
        );
        assert_eq!(
            can_edit_post(&author, club, author.id, now - Duration::days(4), now),
            Verdict::WindowClosed
        );
        assert_eq!(
            can_edit_post(&author, club, Uuid::new_v4(), now, now),
            Verdict::NotOwner
        );
        // deleting has no window
        assert_eq!(can_delete_post(&author, club, author.id), Verdict::Allowed);

        let secretary = actor(Role::Secretary, Some(club));
        assert_eq!(
            can_edit_post(&secretary, club, author.id, now - Duration::days(30), now),
            Verdict::Allowed
        );
    }

    #[test]
    fn comment_authors_get_three_hours() {
        let club = Uuid::new_v4();
        let author = actor(Role::Student, None);
        let now = Utc::now();

        assert_eq!(
            can_modify_comment(&author, club, author.id, now - Duration::minutes(170), now),
            Verdict::Allowed
        );
        assert_eq!(
            can_modify_comment(&author, club, author.id, now - Duration::hours(4), now),
            Verdict::WindowClosed
        );
        let outsider_manager = actor(Role::Media, Some(Uuid::new_v4()));
        assert_eq!(
            can_modify_comment(&outsider_manager, club, author.id, now, now),
            Verdict::NotOwner
        );
    }

    #[test]
    fn room_access() {
        let club = Uuid::new_v4();
        let member = actor(Role::Student, Some(club));
        let outsider = actor(Role::Student, None);
        let creator = Uuid::new_v4();

        assert!(can_access_room(&outsider, RoomKind::Public, None, creator, false));
        assert!(can_access_room(&member, RoomKind::Club, Some(club), creator, false));
        assert!(!can_access_room(&outsider, RoomKind::Club, Some(club), creator, false));
        assert!(!can_access_room(&outsider, RoomKind::Private, None, creator, false));
        assert!(can_access_room(&outsider, RoomKind::Private, None, creator, true));
        assert!(can_access_room(&outsider, RoomKind::Private, None, outsider.id, false));
        assert!(can_access_room(
            &actor(Role::Admin, None),
            RoomKind::Private,
            None,
            creator,
            false
        ));
    }

    #[test]
    fn message_deletion() {
        let club = Uuid::new_v4();
        let author = Uuid::new_v4();
        assert!(can_delete_message(&actor(Role::President, Some(club)), author, Some(club)));
        assert!(!can_delete_message(&actor(Role::Student, Some(club)), author, Some(club)));
        assert!(!can_delete_message(&actor(Role::President, Some(club)), author, None));
    }
}
