//! Connection pools and read/write routing.
//!
//! Writes always go to the primary. Reads rotate over the read replicas and
//! fall back to the primary when there are none or a replica cannot hand out
//! a connection. Nothing here gives read-your-writes guarantees; handlers that
//! need them take a `write()` connection for the read as well.

use deadpool::managed::{Object, Pool};
use diesel_async::{pooled_connection::AsyncDieselConnectionManager, AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

pub type DbPool = Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;
pub type DbConn = Object<AsyncDieselConnectionManager<AsyncPgConnection>>;

pub fn connect(db_url: &str, max_size: usize) -> anyhow::Result<DbPool> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(db_url);
    Pool::builder(manager)
        .max_size(max_size)
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build database pool: {e}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    Read,
    Write,
}

pub fn classify(sql: &str) -> QueryKind {
    let sql = sql.trim_start().to_ascii_lowercase();
    if ["select", "with", "show", "explain"]
        .iter()
        .any(|kw| sql.starts_with(kw))
    {
        QueryKind::Read
    } else {
        QueryKind::Write
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub max_size: usize,
    pub size: usize,
    pub available: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub primary: PoolStats,
    pub replicas: Vec<PoolStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterHealth {
    pub primary: bool,
    pub replicas: Vec<bool>,
    pub healthy: bool,
}

impl RouterHealth {
    fn from_checks(primary: bool, replicas: Vec<bool>) -> Self {
        let healthy = primary && (replicas.is_empty() || replicas.iter().any(|up| *up));
        Self {
            primary,
            replicas,
            healthy,
        }
    }
}

#[derive(Clone)]
pub struct DbRouter {
    primary: DbPool,
    replicas: Arc<Vec<DbPool>>,
    next_replica: Arc<AtomicUsize>,
}

impl DbRouter {
    pub fn new(primary: DbPool, replicas: Vec<DbPool>) -> Self {
        tracing::info!(replicas = replicas.len(), "initialized database router");
        Self {
            primary,
            replicas: Arc::new(replicas),
            next_replica: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn connect(primary_url: &str, replica_urls: &[String], max_size: usize) -> anyhow::Result<Self> {
        let primary = connect(primary_url, max_size)?;
        let replicas = replica_urls
            .iter()
            .map(|url| connect(url, max_size))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self::new(primary, replicas))
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    fn next_replica_index(&self) -> Option<usize> {
        if self.replicas.is_empty() {
            None
        } else {
            Some(self.next_replica.fetch_add(1, Ordering::Relaxed) % self.replicas.len())
        }
    }

    /// The replica a query of `kind` should run on, `None` for the primary.
    fn target(&self, kind: QueryKind) -> Option<usize> {
        match kind {
            QueryKind::Read => self.next_replica_index(),
            QueryKind::Write => None,
        }
    }

    async fn checkout(&self, replica: Option<usize>) -> anyhow::Result<DbConn> {
        if let Some(index) = replica {
            match self.replicas[index].get().await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    tracing::warn!(replica = index, error = %e, "read replica unavailable, falling back to primary");
                }
            }
        }

        self.primary
            .get()
            .await
            .map_err(|e| anyhow::anyhow!("primary database unavailable: {e}"))
    }

    pub async fn write(&self) -> anyhow::Result<DbConn> {
        self.checkout(self.target(QueryKind::Write)).await
    }

    pub async fn read(&self) -> anyhow::Result<DbConn> {
        self.checkout(self.target(QueryKind::Read)).await
    }

    /// Picks the pool by looking at the statement itself.
    pub async fn for_sql(&self, sql: &str) -> anyhow::Result<DbConn> {
        self.checkout(self.target(classify(sql))).await
    }

    pub fn stats(&self) -> RouterStats {
        fn pool_stats(pool: &DbPool) -> PoolStats {
            let status = pool.status();
            PoolStats {
                max_size: status.max_size,
                size: status.size,
                available: status.available as i64,
            }
        }

        RouterStats {
            primary: pool_stats(&self.primary),
            replicas: self.replicas.iter().map(pool_stats).collect(),
        }
    }

    pub async fn health_check(&self) -> RouterHealth {
        async fn ping(pool: &DbPool) -> bool {
            let Ok(mut conn) = pool.get().await else {
                return false;
            };
            diesel::sql_query("SELECT 1").execute(&mut conn).await.is_ok()
        }

        let primary = ping(&self.primary).await;
        if !primary {
            tracing::error!("primary database health check failed");
        }

        let mut replicas = Vec::with_capacity(self.replicas.len());
        for (index, replica) in self.replicas.iter().enumerate() {
            let up = ping(replica).await;
            if !up {
                tracing::warn!(replica = index, "read replica health check failed");
            }
            replicas.push(up);
        }

        RouterHealth::from_checks(primary, replicas)
    }
}
