//! Chat retention.
//!
//! Old messages keep their row so threads stay intact, but the body is
//! replaced with a placeholder and the row is marked expired.

use crate::db::DbRouter;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use diesel::sql_types::{Integer, Text, Timestamptz};
use diesel_async::RunQueryDsl;
use std::time::Duration;

pub const EXPIRED_PLACEHOLDER: &str = "[This message was automatically deleted due to age]";
pub const BATCH_SIZE: i32 = 1000;
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

const EXPIRE_BATCH: &str = "UPDATE chat_messages SET body = $1, is_expired = TRUE, updated_at = NOW() \
     WHERE id IN (SELECT id FROM chat_messages \
                  WHERE created_at < $2 AND is_expired = FALSE LIMIT $3)";

pub fn cutoff(now: DateTime<Utc>, retention_days: u32) -> DateTime<Utc> {
    now - ChronoDuration::days(i64::from(retention_days))
}

/// Expires every message older than the retention period, one batch at a time.
pub async fn expire_old_messages(db: &DbRouter, retention_days: u32) -> anyhow::Result<usize> {
    let before = cutoff(Utc::now(), retention_days);
    let conn = &mut db.for_sql(EXPIRE_BATCH).await?;

    let mut total = 0;
    loop {
        let updated = diesel::sql_query(EXPIRE_BATCH)
            .bind::<Text, _>(EXPIRED_PLACEHOLDER)
            .bind::<Timestamptz, _>(before)
            .bind::<Integer, _>(BATCH_SIZE)
            .execute(conn)
            .await?;

        total += updated;
        if updated < BATCH_SIZE as usize {
            break;
        }
        tracing::debug!(total, "expired a batch of chat messages");
    }

    Ok(total)
}

/// Runs the retention sweep every hour until the process exits.
pub async fn run(db: DbRouter, retention_days: u32) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        match expire_old_messages(&db, retention_days).await {
            Ok(0) => tracing::debug!("no chat messages to expire"),
            Ok(count) => tracing::info!(count, retention_days, "expired old chat messages"),
            Err(e) => tracing::error!(error = ?e, "chat retention sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{classify, QueryKind};
    use chrono::TimeZone;

    #[test]
    fn cutoff_is_retention_days_back() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            cutoff(now, 60),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
        );
        assert_eq!(cutoff(now, 0), now);
    }

    #[test]
    fn sweep_runs_on_the_primary() {
        assert_eq!(classify(EXPIRE_BATCH), QueryKind::Write);
    }
}
