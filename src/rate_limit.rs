//! Fixed-window request limiting.
//!
//! Each key gets a window that opens on its first request. Once `max_requests`
//! have been counted the key is refused until the window closes.

use crate::error::AppError;
use axum::{
    http::{HeaderMap, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

// purge closed windows once the table grows past this
const PURGE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Window {
    opened: Instant,
    requests: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_after: Duration,
}

impl RateLimitDecision {
    pub fn retry_after_secs(&self) -> u64 {
        if self.allowed {
            0
        } else {
            // round up so clients never retry a moment too early
            self.reset_after.as_secs() + u64::from(self.reset_after.subsec_nanos() > 0)
        }
    }

    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
        headers.insert(
            "x-ratelimit-reset",
            HeaderValue::from(self.reset_after.as_secs()),
        );
    }
}

pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    message: &'static str,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32, message: &'static str) -> Self {
        Self {
            window,
            max_requests,
            message,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn api(window: Duration, max_requests: u32) -> Self {
        Self::new(
            window,
            max_requests,
            "Too many API requests from this IP, please try again later.",
        )
    }

    pub fn auth() -> Self {
        Self::new(
            Duration::from_secs(15 * 60),
            5,
            "Too many authentication attempts, please try again later.",
        )
    }

    pub fn chat() -> Self {
        Self::new(
            Duration::from_secs(60),
            30,
            "You are sending messages too quickly, please slow down.",
        )
    }

    pub fn upload() -> Self {
        Self::new(
            Duration::from_secs(60 * 60),
            10,
            "Too many file uploads, please try again later.",
        )
    }

    pub fn check(&self, key: &str) -> RateLimitDecision {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> RateLimitDecision {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());

        if windows.len() > PURGE_THRESHOLD {
            let window = self.window;
            windows.retain(|_, w| now.duration_since(w.opened) < window);
        }

        let entry = windows.entry(key.to_string()).or_insert(Window {
            opened: now,
            requests: 0,
        });
        if now.duration_since(entry.opened) >= self.window {
            *entry = Window {
                opened: now,
                requests: 0,
            };
        }

        let reset_after = self.window - now.duration_since(entry.opened);
        if entry.requests >= self.max_requests {
            return RateLimitDecision {
                allowed: false,
                limit: self.max_requests,
                remaining: 0,
                reset_after,
            };
        }

        entry.requests += 1;
        RateLimitDecision {
            allowed: true,
            limit: self.max_requests,
            remaining: self.max_requests - entry.requests,
            reset_after,
        }
    }

    /// Counts a request against `key`, failing with a 429 once the budget is spent.
    pub fn enforce(&self, key: &str) -> Result<RateLimitDecision, AppError> {
        let decision = self.check(key);
        if decision.allowed {
            Ok(decision)
        } else {
            tracing::warn!(key, "rate limit exceeded");
            Err(AppError::RateLimited(decision, self.message.into()))
        }
    }
}

pub struct Limiters {
    pub api: RateLimiter,
    pub auth: RateLimiter,
    pub chat: RateLimiter,
    pub upload: RateLimiter,
}

impl Limiters {
    pub fn new(api_window: Duration, api_max_requests: u32) -> Self {
        Self {
            api: RateLimiter::api(api_window, api_max_requests),
            auth: RateLimiter::auth(),
            chat: RateLimiter::chat(),
            upload: RateLimiter::upload(),
        }
    }
}

pub fn client_ip(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next());
    let real_ip = headers.get("x-real-ip").and_then(|v| v.to_str().ok());

    forwarded
        .or(real_ip)
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

/// Middleware applying the general API budget per client IP and endpoint.
pub async fn limit_api<B>(limiters: Arc<Limiters>, req: Request<B>, next: Next<B>) -> Response {
    let key = format!(
        "{}:{}:{}",
        client_ip(req.headers()),
        req.method(),
        req.uri().path()
    );

    match limiters.api.enforce(&key) {
        Ok(decision) => {
            let mut response = next.run(req).await;
            decision.apply_headers(response.headers_mut());
            response
        }
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_after_budget_then_reopens() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 2, "slow down");
        let start = Instant::now();

        let first = limiter.check_at("1.2.3.4:POST:/api/auth/login", start);
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);
        assert!(limiter.check_at("1.2.3.4:POST:/api/auth/login", start).allowed);

        let refused = limiter.check_at(
            "1.2.3.4:POST:/api/auth/login",
            start + Duration::from_secs(10),
        );
        assert!(!refused.allowed);
        assert_eq!(refused.remaining, 0);
        assert_eq!(refused.retry_after_secs(), 50);

        let reopened = limiter.check_at(
            "1.2.3.4:POST:/api/auth/login",
            start + Duration::from_secs(60),
        );
        assert!(reopened.allowed);
        assert_eq!(reopened.remaining, 1);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1, "slow down");
        let now = Instant::now();
        assert!(limiter.check_at("a", now).allowed);
        assert!(!limiter.check_at("a", now).allowed);
        assert!(limiter.check_at("b", now).allowed);
    }

    #[test]
    fn enforce_maps_to_429() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1, "slow down");
        assert!(limiter.enforce("chat:user").is_ok());
        let err = limiter.enforce("chat:user").unwrap_err();
        let response = err.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));
    }

    #[test]
    fn client_ip_prefers_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers), "unknown");

        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.9"));
        assert_eq!(client_ip(&headers), "10.0.0.9");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers), "203.0.113.7");
    }
}
