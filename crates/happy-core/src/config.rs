//! Configuration surface for the session-sync client.
//!
//! Resolution order: built-in defaults, then environment variables.
//! Unlike a full application config, this client only exposes the handful
//! of knobs the protocol itself needs — everything else (CLI flags, output
//! rendering) lives in the calling application.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Default production server URL, used when `HAPPY_SERVER_URL` is unset.
const DEFAULT_SERVER_URL: &str = "https://api.happy.engineering";

/// Complete runtime configuration for the session-sync client.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the sync server (HTTP and WebSocket endpoints are
    /// derived from it). Trailing slashes are stripped.
    pub server_url: String,
    /// Directory holding the credentials file and other client state.
    pub home_dir: PathBuf,
    /// Whether tool-trace / diagnostic sinks are enabled. Off by default;
    /// the sinks themselves are an external collaborator this crate never
    /// writes to directly.
    pub diagnostics_enabled: bool,
}

impl Config {
    /// Resolve configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let server_url = std::env::var("HAPPY_SERVER_URL")
            .unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string());
        let server_url = server_url.trim_end_matches('/').to_string();

        let home_dir = match std::env::var_os("HAPPY_HOME_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_home_dir()?,
        };

        let diagnostics_enabled = std::env::var("HAPPY_DIAGNOSTICS")
            .map(|v| matches!(v.as_str(), "1" | "true" | "on"))
            .unwrap_or(false);

        Ok(Self {
            server_url,
            home_dir,
            diagnostics_enabled,
        })
    }

    /// Path to the credentials file (`agent.key`) inside `home_dir`.
    pub fn credentials_path(&self) -> PathBuf {
        self.home_dir.join("agent.key")
    }
}

/// `$HOME/.happy`, the default credentials home.
fn default_home_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|h| h.join(".happy"))
        .ok_or_else(|| Error::Config("could not determine home directory".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(unsafe_code)]
    fn server_url_strips_trailing_slash() {
        // SAFETY: test runs single-threaded per-process under the default harness.
        unsafe {
            std::env::set_var("HAPPY_SERVER_URL", "https://example.com/");
        }
        let config = Config::from_env().unwrap();
        assert_eq!(config.server_url, "https://example.com");
        unsafe {
            std::env::remove_var("HAPPY_SERVER_URL");
        }
    }

    #[test]
    fn credentials_path_is_agent_key_under_home() {
        let config = Config {
            server_url: DEFAULT_SERVER_URL.to_string(),
            home_dir: PathBuf::from("/tmp/happy-test-home"),
            diagnostics_enabled: false,
        };
        assert_eq!(
            config.credentials_path(),
            PathBuf::from("/tmp/happy-test-home/agent.key")
        );
    }
}
