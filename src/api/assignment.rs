use super::{club::find_club, load_actor, require_manager};
use crate::{
    auth::AuthUser,
    db::DbRouter,
    error::{AppError, AppResult},
    grading::{self, GradableQuestion, GradeReport, QuestionKind},
    models::{Assignment, AssignmentAttempt, AssignmentQuestion},
    notify::{self, NotificationKind},
    policy::Actor,
    schema::*,
};
use axum::{
    extract::{Path, Query},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use diesel::{
    prelude::*,
    result::{DatabaseErrorKind, Error as DieselError},
    sql_types::{Jsonb, Uuid as SqlUuid},
};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

const IN_PROGRESS: &str = "in_progress";
const COMPLETED: &str = "completed";

#[derive(Deserialize)]
struct NewQuestion {
    kind: QuestionKind,
    prompt: String,
    #[serde(default = "empty_options")]
    options: Value,
    correct_answer: Option<Value>,
    #[serde(default = "default_points")]
    points: i32,
}

fn empty_options() -> Value {
    json!([])
}

fn default_points() -> i32 {
    1
}

#[derive(Deserialize)]
struct NewAssignmentRequest {
    club_id: Uuid,
    title: String,
    description: String,
    instructions: Option<String>,
    due_date: DateTime<Utc>,
    time_limit_minutes: Option<i32>,
    #[serde(default = "default_max_attempts")]
    max_attempts: i32,
    #[serde(default = "default_passing_score")]
    passing_score: i32,
    #[serde(default)]
    is_published: bool,
    questions: Vec<NewQuestion>,
}

fn default_max_attempts() -> i32 {
    1
}

fn default_passing_score() -> i32 {
    60
}

#[derive(Deserialize)]
struct AssignmentFilter {
    club_id: Option<Uuid>,
}

#[derive(Deserialize)]
struct SubmitRequest {
    attempt_id: Uuid,
    #[serde(default)]
    answers: HashMap<Uuid, Value>,
}

#[derive(Deserialize)]
struct ViolationRequest {
    kind: String,
    detail: Option<String>,
}

#[derive(Serialize)]
struct QuestionResponse {
    id: Uuid,
    position: i32,
    kind: String,
    prompt: String,
    options: Value,
    points: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    correct_answer: Option<Value>,
}

impl QuestionResponse {
    fn from(question: AssignmentQuestion, reveal_answer: bool) -> Self {
        Self {
            id: question.id,
            position: question.position,
            kind: question.kind,
            prompt: question.prompt,
            options: question.options,
            points: question.points,
            correct_answer: question.correct_answer.filter(|_| reveal_answer),
        }
    }
}

#[derive(Serialize)]
struct AssignmentResponse {
    #[serde(flatten)]
    assignment: Assignment,
    questions: Vec<QuestionResponse>,
}

#[derive(Serialize)]
struct StartResponse {
    attempt: AssignmentAttempt,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
    questions: Vec<QuestionResponse>,
}

#[derive(Serialize)]
struct SubmitResponse {
    attempt_id: Uuid,
    #[serde(flatten)]
    report: GradeReport,
}

#[derive(Serialize)]
struct ResultRow {
    #[serde(flatten)]
    attempt: AssignmentAttempt,
    user_name: String,
    user_email: String,
}

#[derive(Serialize)]
struct HistoryRow {
    #[serde(flatten)]
    attempt: AssignmentAttempt,
    assignment_title: String,
}

fn validate_assignment(req: &NewAssignmentRequest, now: DateTime<Utc>) -> AppResult<()> {
    let bad = |msg: &'static str| Err(AppError::from(StatusCode::BAD_REQUEST, msg));

    if req.title.trim().is_empty() || req.description.trim().is_empty() {
        return bad("title and description are required");
    }
    if req.due_date <= now {
        return bad("the due date must be in the future");
    }
    if req.max_attempts < 1 {
        return bad("max attempts must be at least 1");
    }
    if !(0..=100).contains(&req.passing_score) {
        return bad("passing score must be between 0 and 100");
    }
    if req.time_limit_minutes.map_or(false, |m| m <= 0) {
        return bad("time limit must be positive");
    }
    if req.questions.is_empty() {
        return bad("an assignment needs at least one question");
    }
    for question in &req.questions {
        if question.prompt.trim().is_empty() {
            return bad("every question needs a prompt");
        }
        if question.points < 0 {
            return bad("question points cannot be negative");
        }
        if !question.kind.needs_manual_review() && question.correct_answer.is_none() {
            return bad("objective questions need a correct answer");
        }
    }
    Ok(())
}

fn attempt_deadline(assignment: &Assignment, attempt: &AssignmentAttempt) -> Option<DateTime<Utc>> {
    assignment
        .time_limit_minutes
        .map(|minutes| attempt.started_at + Duration::minutes(i64::from(minutes)))
}

async fn find_assignment(conn: &mut AsyncPgConnection, assignment_id: Uuid) -> AppResult<Assignment> {
    assignments::table
        .find(assignment_id)
        .first::<Assignment>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::from(StatusCode::NOT_FOUND, "the assignment does not exist"))
}

/// Like `find_assignment`, but drafts are invisible to everyone except the
/// club's managers.
async fn find_visible(
    conn: &mut AsyncPgConnection,
    assignment_id: Uuid,
    actor: &Actor,
) -> AppResult<Assignment> {
    let assignment = find_assignment(conn, assignment_id).await?;
    if !assignment.is_published && !actor.manages_club(assignment.club_id) {
        return Err(AppError::from(
            StatusCode::NOT_FOUND,
            "the assignment does not exist",
        ));
    }
    Ok(assignment)
}

async fn load_questions(
    conn: &mut AsyncPgConnection,
    assignment_id: Uuid,
) -> AppResult<Vec<AssignmentQuestion>> {
    Ok(assignment_questions::table
        .filter(assignment_questions::assignment_id.eq(assignment_id))
        .order(assignment_questions::position.asc())
        .load::<AssignmentQuestion>(conn)
        .await?)
}

async fn create(
    Extension(db): Extension<DbRouter>,
    user: AuthUser,
    Json(req): Json<NewAssignmentRequest>,
) -> AppResult<Json<AssignmentResponse>> {
    #[derive(Insertable)]
    #[diesel(table_name = assignments)]
    struct NewAssignment {
        club_id: Uuid,
        created_by: Uuid,
        title: String,
        description: String,
        instructions: Option<String>,
        due_date: DateTime<Utc>,
        time_limit_minutes: Option<i32>,
        max_attempts: i32,
        passing_score: i32,
        is_published: bool,
    }

    #[derive(Insertable)]
    #[diesel(table_name = assignment_questions)]
    struct NewQuestionRow {
        assignment_id: Uuid,
        position: i32,
        kind: &'static str,
        prompt: String,
        options: Value,
        correct_answer: Option<Value>,
        points: i32,
    }

    validate_assignment(&req, Utc::now())?;

    let conn = &mut db.write().await?;

    let actor = load_actor(conn, &user).await?;
    require_manager(&actor, req.club_id)?;
    find_club(conn, req.club_id).await?;

    let assignment = diesel::insert_into(assignments::table)
        .values(NewAssignment {
            club_id: req.club_id,
            created_by: user.id,
            title: req.title.trim().to_string(),
            description: req.description,
            instructions: req.instructions,
            due_date: req.due_date,
            time_limit_minutes: req.time_limit_minutes,
            max_attempts: req.max_attempts,
            passing_score: req.passing_score,
            is_published: req.is_published,
        })
        .get_result::<Assignment>(conn)
        .await?;

    let rows: Vec<_> = req
        .questions
        .into_iter()
        .enumerate()
        .map(|(position, q)| NewQuestionRow {
            assignment_id: assignment.id,
            position: position as i32,
            kind: q.kind.as_str(),
            prompt: q.prompt,
            options: q.options,
            correct_answer: q.correct_answer,
            points: q.points,
        })
        .collect();

    if let Err(e) = diesel::insert_into(assignment_questions::table)
        .values(&rows)
        .execute(conn)
        .await
    {
        // don't leave an assignment without its questions behind
        diesel::delete(assignments::table.find(assignment.id))
            .execute(conn)
            .await?;
        return Err(e.into());
    }
    tracing::info!(assignment_id = %assignment.id, questions = rows.len(), "created assignment");

    if assignment.is_published {
        notify::notify_club(
            conn,
            assignment.club_id,
            user.id,
            NotificationKind::Assignment,
            "New assignment",
            &format!(
                "{} is due {}",
                assignment.title,
                assignment.due_date.format("%b %e, %H:%M UTC")
            ),
            Some(assignment.id),
        )
        .await;
    }

    let questions = load_questions(conn, assignment.id)
        .await?
        .into_iter()
        .map(|q| QuestionResponse::from(q, true))
        .collect();

    Ok(Json(AssignmentResponse {
        assignment,
        questions,
    }))
}

async fn list(
    Extension(db): Extension<DbRouter>,
    Query(filter): Query<AssignmentFilter>,
    user: AuthUser,
) -> AppResult<Json<Vec<Assignment>>> {
    let conn = &mut db.read().await?;
    let actor = load_actor(conn, &user).await?;

    let mut query = assignments::table.into_boxed();
    if let Some(club_id) = filter.club_id {
        query = query.filter(assignments::club_id.eq(club_id));
    }
    if !actor.role.is_admin() {
        query = match actor.club_id.filter(|_| actor.role.is_manager()) {
            Some(own) => query.filter(
                assignments::is_published
                    .eq(true)
                    .or(assignments::club_id.eq(own)),
            ),
            None => query.filter(assignments::is_published.eq(true)),
        };
    }

    Ok(Json(
        query
            .order(assignments::due_date.asc())
            .load::<Assignment>(conn)
            .await?,
    ))
}

async fn info(
    Extension(db): Extension<DbRouter>,
    Path(assignment_id): Path<Uuid>,
    user: AuthUser,
) -> AppResult<Json<AssignmentResponse>> {
    let conn = &mut db.read().await?;
    let actor = load_actor(conn, &user).await?;

    let assignment = find_visible(conn, assignment_id, &actor).await?;
    let reveal = actor.manages_club(assignment.club_id);
    let questions = load_questions(conn, assignment_id)
        .await?
        .into_iter()
        .map(|q| QuestionResponse::from(q, reveal))
        .collect();

    Ok(Json(AssignmentResponse {
        assignment,
        questions,
    }))
}

async fn in_progress_attempt(
    conn: &mut AsyncPgConnection,
    assignment_id: Uuid,
    user_id: Uuid,
) -> AppResult<Option<AssignmentAttempt>> {
    Ok(assignment_attempts::table
        .filter(assignment_attempts::assignment_id.eq(assignment_id))
        .filter(assignment_attempts::user_id.eq(user_id))
        .filter(assignment_attempts::status.eq(IN_PROGRESS))
        .first::<AssignmentAttempt>(conn)
        .await
        .optional()?)
}

async fn start(
    Extension(db): Extension<DbRouter>,
    Path(assignment_id): Path<Uuid>,
    user: AuthUser,
) -> AppResult<Json<StartResponse>> {
    #[derive(Insertable)]
    #[diesel(table_name = assignment_attempts)]
    struct NewAttempt {
        assignment_id: Uuid,
        user_id: Uuid,
        attempt_number: i32,
    }

    let conn = &mut db.write().await?;
    let actor = load_actor(conn, &user).await?;

    let assignment = find_visible(conn, assignment_id, &actor).await?;
    if !assignment.is_published {
        return Err(AppError::from(
            StatusCode::BAD_REQUEST,
            "this assignment has not been published yet",
        ));
    }
    if assignment.due_date <= Utc::now() {
        return Err(AppError::from(
            StatusCode::BAD_REQUEST,
            "this assignment is past its due date",
        ));
    }

    let questions: Vec<_> = load_questions(conn, assignment_id)
        .await?
        .into_iter()
        .map(|q| QuestionResponse::from(q, false))
        .collect();

    if let Some(attempt) = in_progress_attempt(conn, assignment_id, user.id).await? {
        return Ok(Json(StartResponse {
            expires_at: attempt_deadline(&assignment, &attempt),
            attempt,
            questions,
        }));
    }

    let attempts_so_far = assignment_attempts::table
        .filter(assignment_attempts::assignment_id.eq(assignment_id))
        .filter(assignment_attempts::user_id.eq(user.id))
        .count()
        .get_result::<i64>(conn)
        .await?;
    if attempts_so_far >= i64::from(assignment.max_attempts) {
        return Err(AppError::from(
            StatusCode::BAD_REQUEST,
            "you have used all of your attempts for this assignment",
        ));
    }

    let inserted = diesel::insert_into(assignment_attempts::table)
        .values(NewAttempt {
            assignment_id,
            user_id: user.id,
            attempt_number: attempts_so_far as i32 + 1,
        })
        .get_result::<AssignmentAttempt>(conn)
        .await;

    let attempt = match inserted {
        Ok(attempt) => attempt,
        // a concurrent start won the race, hand back its attempt
        Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            in_progress_attempt(conn, assignment_id, user.id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("in-progress attempt vanished after a conflict"))?
        }
        Err(e) => return Err(e.into()),
    };
    tracing::debug!(attempt_id = %attempt.id, %assignment_id, "started attempt");

    Ok(Json(StartResponse {
        expires_at: attempt_deadline(&assignment, &attempt),
        attempt,
        questions,
    }))
}

async fn submit(
    Extension(db): Extension<DbRouter>,
    Path(assignment_id): Path<Uuid>,
    user: AuthUser,
    Json(req): Json<SubmitRequest>,
) -> AppResult<Json<SubmitResponse>> {
    let conn = &mut db.write().await?;

    let assignment = find_assignment(conn, assignment_id).await?;
    let attempt = assignment_attempts::table
        .filter(assignment_attempts::id.eq(req.attempt_id))
        .filter(assignment_attempts::assignment_id.eq(assignment_id))
        .filter(assignment_attempts::user_id.eq(user.id))
        .first::<AssignmentAttempt>(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::from(StatusCode::NOT_FOUND, "the attempt does not exist"))?;
    if attempt.status != IN_PROGRESS {
        return Err(AppError::from(
            StatusCode::CONFLICT,
            "this attempt has already been submitted",
        ));
    }

    let now = Utc::now();
    if let Some(deadline) = attempt_deadline(&assignment, &attempt) {
        if now > deadline {
            tracing::warn!(attempt_id = %attempt.id, %deadline, "attempt submitted after its time limit");
        }
    }

    let questions = load_questions(conn, assignment_id)
        .await?
        .into_iter()
        .map(|q| -> anyhow::Result<GradableQuestion> {
            Ok(GradableQuestion {
                id: q.id,
                kind: q.kind.parse::<QuestionKind>()?,
                correct_answer: q.correct_answer,
                points: q.points,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let report = grading::grade(&questions, &req.answers, assignment.passing_score);

    // the status guard makes a second submit a no-op
    let updated = diesel::update(
        assignment_attempts::table
            .filter(assignment_attempts::id.eq(attempt.id))
            .filter(assignment_attempts::status.eq(IN_PROGRESS)),
    )
    .set((
        assignment_attempts::status.eq(COMPLETED),
        assignment_attempts::submitted_at.eq(now),
        assignment_attempts::answers.eq(serde_json::to_value(&req.answers)?),
        assignment_attempts::graded_answers.eq(serde_json::to_value(&report.graded_answers)?),
        assignment_attempts::score.eq(report.score),
        assignment_attempts::max_score.eq(report.max_score),
        assignment_attempts::percentage.eq(report.percentage),
        assignment_attempts::is_passing.eq(report.is_passing),
    ))
    .execute(conn)
    .await?;

    if updated == 0 {
        return Err(AppError::from(
            StatusCode::CONFLICT,
            "this attempt has already been submitted",
        ));
    }
    tracing::info!(
        attempt_id = %attempt.id,
        score = report.score,
        max_score = report.max_score,
        "graded attempt"
    );

    Ok(Json(SubmitResponse {
        attempt_id: attempt.id,
        report,
    }))
}

async fn record_violation(
    Extension(db): Extension<DbRouter>,
    Path(assignment_id): Path<Uuid>,
    user: AuthUser,
    Json(req): Json<ViolationRequest>,
) -> AppResult<()> {
    if req.kind.trim().is_empty() {
        return Err(AppError::from(
            StatusCode::BAD_REQUEST,
            "violation kind is required",
        ));
    }
    let entry = json!([{
        "kind": req.kind.trim(),
        "detail": req.detail,
        "at": Utc::now(),
    }]);

    let conn = &mut db.write().await?;

    let updated = diesel::sql_query(
        "UPDATE assignment_attempts SET violations = violations || $1 \
         WHERE assignment_id = $2 AND user_id = $3 AND status = 'in_progress'",
    )
    .bind::<Jsonb, _>(entry)
    .bind::<SqlUuid, _>(assignment_id)
    .bind::<SqlUuid, _>(user.id)
    .execute(conn)
    .await?;

    if updated == 0 {
        return Err(AppError::from(
            StatusCode::NOT_FOUND,
            "you have no attempt in progress for this assignment",
        ));
    }
    tracing::warn!(%assignment_id, user_id = %user.id, kind = req.kind.trim(), "proctoring violation");

    Ok(())
}

async fn results(
    Extension(db): Extension<DbRouter>,
    Path(assignment_id): Path<Uuid>,
    user: AuthUser,
) -> AppResult<Json<Vec<ResultRow>>> {
    let conn = &mut db.read().await?;

    let assignment = find_assignment(conn, assignment_id).await?;
    let actor = load_actor(conn, &user).await?;
    require_manager(&actor, assignment.club_id)?;

    let rows = assignment_attempts::table
        .inner_join(users::table)
        .filter(assignment_attempts::assignment_id.eq(assignment_id))
        .filter(assignment_attempts::status.eq(COMPLETED))
        .order(assignment_attempts::submitted_at.desc())
        .select((assignment_attempts::all_columns, users::name, users::email))
        .load::<(AssignmentAttempt, String, String)>(conn)
        .await?;

    Ok(Json(
        rows.into_iter()
            .map(|(attempt, user_name, user_email)| ResultRow {
                attempt,
                user_name,
                user_email,
            })
            .collect(),
    ))
}

async fn my_attempts(
    Extension(db): Extension<DbRouter>,
    user: AuthUser,
) -> AppResult<Json<Vec<HistoryRow>>> {
    let conn = &mut db.read().await?;

    let rows = assignment_attempts::table
        .inner_join(assignments::table)
        .filter(assignment_attempts::user_id.eq(user.id))
        .order(assignment_attempts::started_at.desc())
        .select((assignment_attempts::all_columns, assignments::title))
        .load::<(AssignmentAttempt, String)>(conn)
        .await?;

    Ok(Json(
        rows.into_iter()
            .map(|(attempt, assignment_title)| HistoryRow {
                attempt,
                assignment_title,
            })
            .collect(),
    ))
}

pub fn app() -> Router {
    Router::new()
        .route("/", get(list).post(create))
        .route("/:assignment_id", get(info))
        .route("/:assignment_id/start", post(start))
        .route("/:assignment_id/submit", post(submit))
        .route("/:assignment_id/violations", post(record_violation))
        .route("/:assignment_id/results", get(results))
}

pub fn attempts() -> Router {
    Router::new().route("/", get(my_attempts))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(questions: Vec<NewQuestion>) -> NewAssignmentRequest {
        NewAssignmentRequest {
            club_id: Uuid::new_v4(),
            title: "Ownership quiz".to_string(),
            description: "Borrowing basics".to_string(),
            instructions: None,
            due_date: Utc::now() + Duration::days(7),
            time_limit_minutes: Some(30),
            max_attempts: 2,
            passing_score: 60,
            is_published: true,
            questions,
        }
    }

    fn question(kind: QuestionKind, correct_answer: Option<Value>) -> NewQuestion {
        NewQuestion {
            kind,
            prompt: "What does `&mut` mean?".to_string(),
            options: empty_options(),
            correct_answer,
            points: 1,
        }
    }

    #[test]
    fn objective_questions_need_answers() {
        let now = Utc::now();
        assert!(validate_assignment(
            &request(vec![
                question(QuestionKind::TrueFalse, Some(json!(true))),
                question(QuestionKind::Essay, None),
            ]),
            now
        )
        .is_ok());
        assert!(validate_assignment(
            &request(vec![question(QuestionKind::MultipleChoice, None)]),
            now
        )
        .is_err());
        assert!(validate_assignment(&request(vec![]), now).is_err());
    }

    #[test]
    fn rejects_bad_settings() {
        let now = Utc::now();
        let mut req = request(vec![question(QuestionKind::Coding, None)]);
        req.passing_score = 120;
        assert!(validate_assignment(&req, now).is_err());

        let mut req = request(vec![question(QuestionKind::Coding, None)]);
        req.due_date = now - Duration::hours(1);
        assert!(validate_assignment(&req, now).is_err());
    }

    #[test]
    fn answers_are_hidden_unless_revealed() {
        let question = AssignmentQuestion {
            id: Uuid::new_v4(),
            assignment_id: Uuid::new_v4(),
            position: 0,
            kind: "multiple_choice".to_string(),
            prompt: "Pick one".to_string(),
            options: json!(["A", "B"]),
            correct_answer: Some(json!("B")),
            points: 2,
        };
        assert!(QuestionResponse::from(question.clone(), false)
            .correct_answer
            .is_none());
        assert_eq!(
            QuestionResponse::from(question, true).correct_answer,
            Some(json!("B"))
        );
    }
}
