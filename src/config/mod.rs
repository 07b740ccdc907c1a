use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable carrying the downloader binary into worker processes
pub const FETCH_TOOL_ENV: &str = "FETCHPOOL_FETCH_TOOL";
/// Environment variable carrying the ffmpeg location into worker processes
pub const FFMPEG_LOCATION_ENV: &str = "FETCHPOOL_FFMPEG_LOCATION";

/// Configuration for the worker pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker processes kept alive
    pub size: usize,
    /// Program launched for every worker process
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Startup parameters handed to every worker process at spawn time
    pub env: Vec<(String, String)>,
    /// How long a worker may take to exit after its stdin is closed
    pub shutdown_grace: Duration,
    /// Delay before retrying a respawn that failed
    pub restart_backoff: Duration,
    pub event_capacity: usize,
}

impl PoolConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mut worker_env = Vec::new();
        for key in [FETCH_TOOL_ENV, FFMPEG_LOCATION_ENV] {
            if let Ok(value) = env::var(key) {
                worker_env.push((key.to_string(), value));
            }
        }

        Self {
            size: env::var("FETCHPOOL_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.size),
            shutdown_grace: env::var("FETCHPOOL_SHUTDOWN_GRACE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_grace),
            env: worker_env,
            ..defaults
        }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Launch workers with `program args...` instead of the current executable
    pub fn with_command<I, S>(mut self, program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.program = program.into();
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_restart_backoff(mut self, backoff: Duration) -> Self {
        self.restart_backoff = backoff;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        let size = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .clamp(1, 8);

        Self {
            size,
            program: env::current_exe().unwrap_or_else(|_| PathBuf::from("fetchpool")),
            args: vec![
                "worker".to_string(),
                "--handler".to_string(),
                "fetch".to_string(),
            ],
            env: Vec::new(),
            shutdown_grace: Duration::from_secs(3),
            restart_backoff: Duration::from_secs(1),
            event_capacity: 256,
        }
    }
}

/// Configuration for the downloader, read inside a worker process
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub tool: String,
    pub ffmpeg_location: Option<String>,
    pub max_attempts: u32,
    pub cookies_from_browser: Option<String>,
    pub cookies_file: Option<PathBuf>,
    /// Run the downloader under `nice -n 19`
    pub background: bool,
}

impl FetchConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self {
            tool: env::var(FETCH_TOOL_ENV).unwrap_or_else(|_| "yt-dlp".to_string()),
            ffmpeg_location: env::var(FFMPEG_LOCATION_ENV).ok(),
            max_attempts: env::var("FETCHPOOL_MAX_ATTEMPTS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .unwrap_or(3),
            cookies_from_browser: env::var("FETCHPOOL_COOKIES_FROM_BROWSER").ok(),
            cookies_file: env::var("FETCHPOOL_COOKIES_FILE").ok().map(PathBuf::from),
            background: env::var("FETCHPOOL_BACKGROUND")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    /// Whether a fallback attempt with cookies is possible
    pub fn has_cookies(&self) -> bool {
        self.cookies_from_browser.is_some() || self.cookies_file.is_some()
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            tool: "yt-dlp".to_string(),
            ffmpeg_location: None,
            max_attempts: 3,
            cookies_from_browser: None,
            cookies_file: None,
            background: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert!(config.size >= 1 && config.size <= 8);
        assert_eq!(config.args, vec!["worker", "--handler", "fetch"]);
        assert_eq!(config.shutdown_grace, Duration::from_secs(3));
    }

    #[test]
    fn test_pool_config_builders() {
        let config = PoolConfig::default()
            .with_size(2)
            .with_command("/bin/worker", ["serve"])
            .with_env("FETCHPOOL_FETCH_TOOL", "/opt/yt-dlp")
            .with_shutdown_grace(Duration::from_millis(200));

        assert_eq!(config.size, 2);
        assert_eq!(config.program, PathBuf::from("/bin/worker"));
        assert_eq!(config.args, vec!["serve"]);
        assert_eq!(
            config.env,
            vec![("FETCHPOOL_FETCH_TOOL".to_string(), "/opt/yt-dlp".to_string())]
        );
        assert_eq!(config.shutdown_grace, Duration::from_millis(200));
    }

    #[test]
    fn test_fetch_config_cookies() {
        let mut config = FetchConfig::default();
        assert!(!config.has_cookies());
        config.cookies_from_browser = Some("firefox".to_string());
        assert!(config.has_cookies());
    }
}
