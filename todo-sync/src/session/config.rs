// Environment configuration for the sync client
// Resolves server endpoints, the local state directory and request timeouts

use std::path::PathBuf;
use std::time::Duration;

/// Default REST endpoint of the to-do server
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:5000";

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for server endpoints and local paths
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the REST API (no trailing slash)
    pub api_url: String,
    /// WebSocket URL of the push channel
    pub channel_url: String,
    /// Directory for persistent client state (cached credentials)
    pub state_dir: PathBuf,
    /// Timeout applied to every API call
    pub request_timeout: Duration,
}

impl Config {
    /// Create configuration using default endpoints and paths
    pub fn default_paths() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            channel_url: channel_url_for(DEFAULT_API_URL),
            state_dir: Self::default_state_dir(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Create configuration from environment variables, falling back to defaults
    ///
    /// - `TODO_SYNC_API_URL` overrides the REST base URL
    /// - `TODO_SYNC_CHANNEL_URL` overrides the push channel URL (otherwise derived from the API URL)
    /// - `TODO_SYNC_DIR` overrides the state directory
    /// - `TODO_SYNC_TIMEOUT_SECS` overrides the request timeout
    pub fn from_env() -> Self {
        let mut config = Self::default_paths();

        if let Ok(api_url) = std::env::var("TODO_SYNC_API_URL") {
            let api_url = api_url.trim_end_matches('/').to_string();
            config.channel_url = channel_url_for(&api_url);
            config.api_url = api_url;
        }

        if let Ok(channel_url) = std::env::var("TODO_SYNC_CHANNEL_URL") {
            config.channel_url = channel_url;
        }

        if let Ok(dir) = std::env::var("TODO_SYNC_DIR") {
            config.state_dir = PathBuf::from(dir);
        }

        if let Some(secs) = std::env::var("TODO_SYNC_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
        {
            config.request_timeout = Duration::from_secs(secs);
        }

        config
    }

    /// Get the default state directory
    fn default_state_dir() -> PathBuf {
        // All platforms: ~/.todo-sync/ (or /tmp/todo-sync if home unavailable)
        dirs::home_dir()
            .map(|h| h.join(".todo-sync"))
            .unwrap_or_else(|| PathBuf::from("/tmp/todo-sync"))
    }

    /// Get the state directory
    pub fn state_dir(&self) -> &PathBuf {
        &self.state_dir
    }

    /// Get the cached credentials file path
    pub fn credentials_file(&self) -> PathBuf {
        self.state_dir.join("credentials.json")
    }

    /// Ensure the state directory exists, owner-only on Unix since it holds a token
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.state_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.state_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(())
    }
}

/// Derive the push channel URL from the REST base URL
///
/// `http://host:5000` -> `ws://host:5000/ws`, `https://...` -> `wss://.../ws`
pub fn channel_url_for(api_url: &str) -> String {
    let api_url = api_url.trim_end_matches('/');
    if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{}/ws", rest)
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{}/ws", rest)
    } else {
        format!("ws://{}/ws", api_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_from_env() {
        let temp_dir = TempDir::new().unwrap();
        std::env::set_var("TODO_SYNC_DIR", temp_dir.path());
        std::env::set_var("TODO_SYNC_API_URL", "https://todo.example.com/");
        std::env::set_var("TODO_SYNC_TIMEOUT_SECS", "3");

        let config = Config::from_env();
        assert_eq!(config.state_dir(), temp_dir.path());
        assert_eq!(config.api_url, "https://todo.example.com");
        assert_eq!(config.channel_url, "wss://todo.example.com/ws");
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert_eq!(
            config.credentials_file(),
            temp_dir.path().join("credentials.json")
        );

        std::env::remove_var("TODO_SYNC_DIR");
        std::env::remove_var("TODO_SYNC_API_URL");
        std::env::remove_var("TODO_SYNC_TIMEOUT_SECS");
    }

    #[test]
    fn test_channel_url_derivation() {
        assert_eq!(
            channel_url_for("http://127.0.0.1:5000"),
            "ws://127.0.0.1:5000/ws"
        );
        assert_eq!(channel_url_for("https://a.b/"), "wss://a.b/ws");
        assert_eq!(channel_url_for("localhost:5000"), "ws://localhost:5000/ws");
    }

    #[test]
    fn test_default_paths() {
        let config = Config::default_paths();
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert!(config.state_dir().ends_with(".todo-sync") || config.state_dir().ends_with("todo-sync"));
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_dirs_creates_state_dir_with_0700() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            state_dir: temp_dir.path().join("state"),
            ..Config::default_paths()
        };

        config.ensure_dirs().unwrap();

        let mode = std::fs::metadata(&config.state_dir)
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o700, "state_dir should have 0700 permissions");
    }
}
