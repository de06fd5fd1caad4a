use envconfig::Envconfig;
use std::time::Duration;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "DATABASE_URL")]
    pub db_url: String,
    #[envconfig(from = "DB_READ_REPLICAS", default = "")]
    pub db_read_replicas: String,
    #[envconfig(from = "DB_POOL_MAX", default = "16")]
    pub db_pool_max: usize,
    #[envconfig(from = "PORT", default = "8080")]
    pub port: u16,
    #[envconfig(from = "JWT_SECRET")]
    pub jwt_secret: String,
    #[envconfig(from = "CHAT_SECRET")]
    pub chat_secret: String,
    #[envconfig(from = "FRONTEND_HOST", default = "http://localhost:3000")]
    pub frontend_host: String,
    #[envconfig(from = "SMTP_HOST")]
    pub smtp_host: Option<String>,
    #[envconfig(from = "SMTP_USERNAME")]
    pub smtp_username: Option<String>,
    #[envconfig(from = "SMTP_PASSWORD")]
    pub smtp_password: Option<String>,
    #[envconfig(from = "RATE_LIMIT_WINDOW_SECS", default = "900")]
    pub rate_limit_window_secs: u64,
    #[envconfig(from = "RATE_LIMIT_MAX_REQUESTS", default = "100")]
    pub rate_limit_max_requests: u32,
    #[envconfig(from = "CHAT_RETENTION_DAYS", default = "60")]
    pub chat_retention_days: u32,
    #[envconfig(from = "ASSETS_DIR", default = "assets")]
    pub assets_dir: String,
}

impl Config {
    pub fn replica_urls(&self) -> Vec<String> {
        split_list(&self.db_read_replicas)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn reads_defaults_from_a_map() {
        let env = HashMap::from([
            ("DATABASE_URL".to_string(), "postgres://localhost/zenith".to_string()),
            ("JWT_SECRET".to_string(), "c2VjcmV0".to_string()),
            ("CHAT_SECRET".to_string(), "chat".to_string()),
            (
                "DB_READ_REPLICAS".to_string(),
                "postgres://r1/zenith, ,postgres://r2/zenith".to_string(),
            ),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.rate_limit_window(), Duration::from_secs(900));
        assert_eq!(
            config.replica_urls(),
            vec!["postgres://r1/zenith", "postgres://r2/zenith"]
        );
        assert!(config.smtp_host.is_none());
    }
}
