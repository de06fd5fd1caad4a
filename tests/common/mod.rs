//! Shared setup for the tests that talk to PostgreSQL.
//!
//! These tests run against `TEST_DATABASE_URL` and are skipped when it is not
//! set. The schema is created on first use. Every test makes its own clubs and
//! users, so runs against the same database do not interfere.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use diesel::{prelude::*, sql_types::Bool};
use diesel_async::{RunQueryDsl, SimpleAsyncConnection};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tower::ServiceExt;
use uuid::Uuid;
use zenith::{
    auth::{generate_jwt, JwtKeys, Role, TOKEN_LIFETIME},
    crypto::ChatCipher,
    db::DbRouter,
    email::Mailer,
    models::{Club, User},
    rate_limit::Limiters,
    schema::{clubs, users},
    AppContext,
};

pub const FRONTEND: &str = "http://localhost:3000";
const SECRET: &[u8] = b"db-test-secret";
const SCHEMA_LOCK: i64 = 73_112_024;

/// A user row plus a token for it.
pub struct TestUser {
    pub id: Uuid,
    pub email: String,
    pub token: String,
}

pub struct TestContext {
    pub app: Router,
    pub db: DbRouter,
    keys: JwtKeys,
}

#[derive(QueryableByName)]
struct SchemaPresent {
    #[diesel(sql_type = Bool)]
    present: bool,
}

async fn ensure_schema(db: &DbRouter) -> anyhow::Result<()> {
    let conn = &mut db.write().await?;

    conn.batch_execute(&format!("SELECT pg_advisory_lock({SCHEMA_LOCK})"))
        .await?;
    let schema = diesel::sql_query("SELECT to_regclass('public.clubs') IS NOT NULL AS present")
        .get_result::<SchemaPresent>(conn)
        .await?;
    if !schema.present {
        conn.batch_execute(include_str!(
            "../../migrations/2024-01-01-000000_create_zenith/up.sql"
        ))
        .await?;
    }
    conn.batch_execute(&format!("SELECT pg_advisory_unlock({SCHEMA_LOCK})"))
        .await?;

    Ok(())
}

pub fn unique_email() -> String {
    format!("{}@college.edu", Uuid::new_v4().simple())
}

pub fn unique_slug() -> String {
    format!("club-{}", Uuid::new_v4().simple())
}

pub fn request(method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Runs one request and returns the status with the JSON body, or `Null`
/// when the body is empty.
pub async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

impl TestContext {
    pub async fn new() -> Option<Self> {
        Self::with_mailer(Mailer::disabled(FRONTEND).unwrap()).await
    }

    pub async fn with_mailer(mailer: Mailer) -> Option<Self> {
        let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
            eprintln!("TEST_DATABASE_URL is not set, skipping");
            return None;
        };

        let db = DbRouter::connect(&url, &[], 8).unwrap();
        ensure_schema(&db).await.unwrap();

        let app = zenith::app(AppContext {
            db: db.clone(),
            keys: Arc::new(JwtKeys::from_secret(SECRET)),
            mailer,
            cipher: ChatCipher::new("db-test-chat").with_iterations(10),
            limiters: Arc::new(Limiters::new(Duration::from_secs(60), 100_000)),
            assets_dir: std::env::temp_dir().join("zenith-db-test-assets"),
        });

        Some(Self {
            app,
            db,
            keys: JwtKeys::from_secret(SECRET),
        })
    }

    pub async fn club(&self) -> Club {
        let conn = &mut self.db.write().await.unwrap();
        diesel::insert_into(clubs::table)
            .values((clubs::slug.eq(unique_slug()), clubs::name.eq("Test Club")))
            .get_result::<Club>(conn)
            .await
            .unwrap()
    }

    pub async fn user(&self, role: Role, club_id: Option<Uuid>) -> TestUser {
        let conn = &mut self.db.write().await.unwrap();
        let user = diesel::insert_into(users::table)
            .values((
                users::email.eq(unique_email()),
                users::password_hash.eq("not-a-real-hash"),
                users::name.eq("Test User"),
                users::role.eq(role.as_str()),
                users::club_id.eq(club_id),
            ))
            .get_result::<User>(conn)
            .await
            .unwrap();

        TestUser {
            token: generate_jwt(&self.keys, user.id, &user.email, role, TOKEN_LIFETIME).unwrap(),
            id: user.id,
            email: user.email,
        }
    }

    pub async fn call(
        &self,
        method: Method,
        uri: &str,
        user: &TestUser,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        send(self.app.clone(), request(method, uri, Some(&user.token), body)).await
    }
}
