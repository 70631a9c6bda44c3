use std::env;
use std::path::PathBuf;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3050)
    pub port: u16,
    /// Database file path (default: ./driftsync.db)
    pub database_path: PathBuf,
    /// Stream replay window in milliseconds (default: 300000, i.e. 5 min)
    pub backlog_ms: i64,
    /// Collections maintenance jobs run over (comma-separated)
    pub collections: Vec<String>,
    /// Hours between compaction runs (default: 24)
    pub compaction_interval_hours: u64,
    /// Compaction merges deltas older than this many days (default: 90)
    pub compaction_retention_days: i64,
    /// Days between pruning runs (default: 7)
    pub pruning_interval_days: u64,
    /// Pruning keeps this many days of snapshots (default: 180)
    pub pruning_retention_days: i64,
    /// CORS allowed origins (comma-separated)
    pub cors_origins: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3050".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_path = PathBuf::from(
            env::var("DATABASE_PATH").unwrap_or_else(|_| "./driftsync.db".to_string()),
        );

        let backlog_ms = env::var("BACKLOG_MS")
            .unwrap_or_else(|_| "300000".to_string())
            .parse()
            .unwrap_or(300_000);

        let collections = env::var("COLLECTIONS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let compaction_interval_hours = env::var("COMPACTION_INTERVAL_HOURS")
            .unwrap_or_else(|_| "24".to_string())
            .parse()
            .unwrap_or(24);

        let compaction_retention_days = env::var("COMPACTION_RETENTION_DAYS")
            .unwrap_or_else(|_| "90".to_string())
            .parse()
            .unwrap_or(90);

        let pruning_interval_days = env::var("PRUNING_INTERVAL_DAYS")
            .unwrap_or_else(|_| "7".to_string())
            .parse()
            .unwrap_or(7);

        let pruning_retention_days = env::var("PRUNING_RETENTION_DAYS")
            .unwrap_or_else(|_| "180".to_string())
            .parse()
            .unwrap_or(180);

        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Config {
            host,
            port,
            database_path,
            backlog_ms,
            collections,
            compaction_interval_hours,
            compaction_retention_days,
            pruning_interval_days,
            pruning_retention_days,
            cors_origins,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "Invalid PORT environment variable"),
        }
    }
}

impl std::error::Error for ConfigError {}
