use rollcall_core::DEFAULT_TOLERANCE;
use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root data directory; also holds the store lock.
    pub data_dir: PathBuf,
    /// Directory of per-person embedding files.
    pub faces_dir: PathBuf,
    /// Path to the SQLite attendance database.
    pub db_path: PathBuf,
    /// Euclidean distance below which a probe matches an enrolled face.
    pub tolerance: f64,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                var("XDG_DATA_HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| {
                        let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                        PathBuf::from(home).join(".local/share")
                    })
                    .join("rollcall")
            });

        let faces_dir = var("ROLLCALL_FACES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("faces"));

        let db_path = var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("attendance.db"));

        let tolerance = var("ROLLCALL_TOLERANCE")
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|t| t.is_finite() && *t > 0.0)
            .unwrap_or(DEFAULT_TOLERANCE);

        Self {
            data_dir,
            faces_dir,
            db_path,
            tolerance,
            system_bus: var("ROLLCALL_SYSTEM_BUS")
                .map(|v| v != "0")
                .unwrap_or(false),
        }
    }
}
