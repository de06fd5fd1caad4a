//! End-to-end flows against a real database. See `common` for how they are
//! enabled.

mod common;

use axum::http::{Method, StatusCode};
use chrono::{Duration, Utc};
use common::{request, send, unique_email, unique_slug, TestContext};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde_json::{json, Value};
use zenith::{auth::Role, email::Mailer, schema::{clubs, users}};

async fn create_event(ctx: &TestContext, manager: &common::TestUser, club_id: uuid::Uuid, max: i32) -> Value {
    let starts_at = Utc::now() + Duration::days(1);
    let (status, event) = ctx
        .call(
            Method::POST,
            "/api/events",
            manager,
            Some(json!({
                "club_id": club_id,
                "title": "Robot build night",
                "event_type": "workshop",
                "starts_at": starts_at,
                "ends_at": starts_at + Duration::hours(2),
                "max_attendees": max,
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{event}");
    event
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_event_capacity_holds_under_concurrent_registration() {
    let Some(ctx) = TestContext::new().await else { return };
    let club = ctx.club().await;
    let manager = ctx.user(Role::Coordinator, Some(club.id)).await;
    let event = create_event(&ctx, &manager, club.id, 2).await;
    let uri = format!("/api/events/{}/register", event["id"].as_str().unwrap());

    let mut handles = Vec::new();
    for _ in 0..6 {
        let student = ctx.user(Role::Student, None).await;
        let app = ctx.app.clone();
        let req = request(Method::POST, &uri, Some(&student.token), None);
        handles.push(tokio::spawn(send(app, req)));
    }

    let mut registered = 0;
    for handle in handles {
        let (status, body) = handle.await.unwrap();
        match status {
            StatusCode::OK => registered += 1,
            StatusCode::BAD_REQUEST => assert_eq!(body["message"], "this event is full"),
            other => panic!("unexpected status {other}: {body}"),
        }
    }
    assert_eq!(registered, 2, "capacity must never be exceeded");

    let (_, event) = ctx
        .call(Method::GET, &format!("/api/events/{}", event["id"].as_str().unwrap()), &manager, None)
        .await;
    assert_eq!(event["attendee_count"], 2);
}

#[tokio::test]
async fn test_event_registration_statuses() {
    let Some(ctx) = TestContext::new().await else { return };
    let club = ctx.club().await;
    let manager = ctx.user(Role::President, Some(club.id)).await;
    let first = ctx.user(Role::Student, None).await;
    let second = ctx.user(Role::Student, None).await;
    let event = create_event(&ctx, &manager, club.id, 1).await;
    let uri = format!("/api/events/{}/register", event["id"].as_str().unwrap());

    let (status, _) = ctx.call(Method::POST, &uri, &first, None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = ctx.call(Method::POST, &uri, &first, None).await;
    assert_eq!(status, StatusCode::CONFLICT, "double registration");
    let (status, _) = ctx.call(Method::POST, &uri, &second, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "event is full");

    let (status, _) = ctx.call(Method::DELETE, &uri, &second, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND, "never registered");
    let (status, _) = ctx.call(Method::DELETE, &uri, &first, None).await;
    assert_eq!(status, StatusCode::OK);

    // the freed seat can be taken
    let (status, body) = ctx.call(Method::POST, &uri, &second, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["attendee_count"], 1);
}

#[tokio::test]
async fn test_empty_event_edit_returns_the_event() {
    let Some(ctx) = TestContext::new().await else { return };
    let club = ctx.club().await;
    let manager = ctx.user(Role::Coordinator, Some(club.id)).await;
    let event = create_event(&ctx, &manager, club.id, 10).await;

    let (status, edited) = ctx
        .call(
            Method::PUT,
            &format!("/api/events/{}", event["id"].as_str().unwrap()),
            &manager,
            Some(json!({})),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{edited}");
    assert_eq!(edited["title"], event["title"]);
    assert_eq!(edited["max_attendees"], 10);
}

#[tokio::test]
async fn test_attempts_resume_submit_once_and_run_out() {
    let Some(ctx) = TestContext::new().await else { return };
    let club = ctx.club().await;
    let manager = ctx.user(Role::Coordinator, Some(club.id)).await;
    let student = ctx.user(Role::Student, Some(club.id)).await;

    let (status, assignment) = ctx
        .call(
            Method::POST,
            "/api/assignments",
            &manager,
            Some(json!({
                "club_id": club.id,
                "title": "Ohm's law",
                "description": "Warm-up quiz",
                "due_date": Utc::now() + Duration::days(7),
                "max_attempts": 1,
                "is_published": true,
                "questions": [
                    {"kind": "true_false", "prompt": "V = I * R", "correct_answer": true}
                ],
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{assignment}");
    let id = assignment["id"].as_str().unwrap();
    let question_id = assignment["questions"][0]["id"].as_str().unwrap();
    let start = format!("/api/assignments/{id}/start");
    let submit = format!("/api/assignments/{id}/submit");

    let (status, started) = ctx.call(Method::POST, &start, &student, None).await;
    assert_eq!(status, StatusCode::OK, "{started}");
    assert!(started["questions"][0].get("correct_answer").is_none());
    let attempt_id = started["attempt"]["id"].clone();

    let (_, resumed) = ctx.call(Method::POST, &start, &student, None).await;
    assert_eq!(resumed["attempt"]["id"], attempt_id, "an open attempt is resumed");

    let answers = json!({ "attempt_id": attempt_id, "answers": { question_id: true } });
    let (status, graded) = ctx
        .call(Method::POST, &submit, &student, Some(answers.clone()))
        .await;
    assert_eq!(status, StatusCode::OK, "{graded}");
    assert_eq!(graded["score"], 1);
    assert_eq!(graded["is_passing"], true);

    let (status, _) = ctx.call(Method::POST, &submit, &student, Some(answers)).await;
    assert_eq!(status, StatusCode::CONFLICT, "second submit");

    let (status, body) = ctx.call(Method::POST, &start, &student, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "you have used all of your attempts for this assignment");
}

#[tokio::test]
async fn test_membership_transitions() {
    let Some(ctx) = TestContext::new().await else { return };
    let first = ctx.club().await;
    let second = ctx.club().await;
    let student = ctx.user(Role::Student, None).await;

    let (status, _) = ctx.call(Method::DELETE, "/api/membership", &student, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "leaving without a club");

    let join = Some(json!({ "club_id": first.id }));
    let (status, club) = ctx.call(Method::POST, "/api/membership", &student, join.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(club["id"], json!(first.id));
    let (status, _) = ctx.call(Method::POST, "/api/membership", &student, join).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "joining twice");

    let (status, club) = ctx
        .call(Method::PUT, "/api/membership", &student, Some(json!({ "club_id": second.id })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(club["id"], json!(second.id));

    let (status, _) = ctx.call(Method::DELETE, "/api/membership", &student, None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = ctx.call(Method::DELETE, "/api/membership", &student, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_likes_toggle() {
    let Some(ctx) = TestContext::new().await else { return };
    let club = ctx.club().await;
    let author = ctx.user(Role::Student, Some(club.id)).await;
    let fan = ctx.user(Role::Student, None).await;

    let (status, post) = ctx
        .call(
            Method::POST,
            &format!("/api/clubs/{}/posts", club.id),
            &author,
            Some(json!({ "title": "Demo day", "content": "Friday at five" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{post}");
    let like = format!("/api/posts/{}/like", post["id"].as_str().unwrap());

    let (_, body) = ctx.call(Method::POST, &like, &fan, None).await;
    assert_eq!(body, json!({ "liked": true, "like_count": 1 }));
    let (_, body) = ctx.call(Method::POST, &like, &fan, None).await;
    assert_eq!(body, json!({ "liked": false, "like_count": 0 }));
}

#[tokio::test]
async fn test_failed_welcome_email_leaves_no_club_behind() {
    // nothing accepts SMTP on localhost, so every send fails
    let mailer = Mailer::new(
        Some("localhost"),
        Some("zenith@college.edu"),
        Some("secret"),
        common::FRONTEND,
    )
    .unwrap();
    let Some(ctx) = TestContext::with_mailer(mailer).await else { return };
    let admin = ctx.user(Role::Admin, None).await;
    let slug = unique_slug();
    let email = unique_email();
    let body = json!({
        "name": "Astronomy",
        "slug": slug,
        "coordinator_email": email,
        "coordinator_name": "Vera Rubin",
    });

    for _ in 0..2 {
        let (status, _) = ctx
            .call(Method::POST, "/api/admin/clubs", &admin, Some(body.clone()))
            .await;
        // a retry fails the same way rather than on a leftover slug
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    let conn = &mut ctx.db.write().await.unwrap();
    let clubs_left = clubs::table
        .filter(clubs::slug.eq(&slug))
        .count()
        .get_result::<i64>(conn)
        .await
        .unwrap();
    let users_left = users::table
        .filter(users::email.eq(&email))
        .count()
        .get_result::<i64>(conn)
        .await
        .unwrap();
    assert_eq!((clubs_left, users_left), (0, 0));
}
