use crate::rate_limit::RateLimitDecision;
use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::borrow::Cow;

pub enum AppError {
    InternalServerError(anyhow::Error),
    ResponseStatusError(StatusCode, Cow<'static, str>),
    RateLimited(RateLimitDecision, Cow<'static, str>),
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Serialize)]
struct AppErrorResponse {
    status: u16,
    message: Cow<'static, str>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::InternalServerError(err) => {
                tracing::error!(error = ?err, "request failed");
                AppError::from(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
                    .into_response()
            }
            AppError::ResponseStatusError(code, s) => (
                code,
                Json(AppErrorResponse {
                    status: code.as_u16(),
                    message: s,
                }),
            )
                .into_response(),
            AppError::RateLimited(decision, s) => {
                let code = StatusCode::TOO_MANY_REQUESTS;
                let mut response = (
                    code,
                    Json(AppErrorResponse {
                        status: code.as_u16(),
                        message: s,
                    }),
                )
                    .into_response();
                decision.apply_headers(response.headers_mut());
                response.headers_mut().insert(
                    RETRY_AFTER,
                    HeaderValue::from(decision.retry_after_secs().max(1)),
                );
                response
            }
        }
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(e: E) -> AppError {
        AppError::InternalServerError(e.into())
    }
}

impl AppError {
    pub fn from(code: StatusCode, s: impl Into<Cow<'static, str>>) -> AppError {
        AppError::ResponseStatusError(code, s.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ResponseStatusError(code, _) => *code,
            AppError::RateLimited(..) => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::InternalServerError(err) => write!(f, "InternalServerError({err:?})"),
            AppError::ResponseStatusError(code, s) => write!(f, "{code}: {s}"),
            AppError::RateLimited(_, s) => write!(f, "429 Too Many Requests: {s}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_errors_keep_their_code() {
        let err = AppError::from(StatusCode::NOT_FOUND, "the club does not exist");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn anything_else_is_a_500() {
        let err: AppError = anyhow::anyhow!("connection reset").into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            err.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
