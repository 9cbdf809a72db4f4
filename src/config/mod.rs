use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete client configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Generation backend
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_url")]
    pub url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_backend_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Supabase identity provider
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_identity_url")]
    pub url: String,
    /// Public anon key sent as `apikey`
    #[serde(default)]
    pub anon_key: String,
    /// Refresh the session when it expires within this window
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_seconds: i64,
    /// Loopback port for the OAuth redirect
    #[serde(default = "default_callback_port")]
    pub callback_port: u16,
    /// How long `login` waits for the browser to come back
    #[serde(default = "default_login_timeout")]
    pub login_timeout_seconds: u64,
    /// Per-request limit for GoTrue calls
    #[serde(default = "default_identity_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_identity_url() -> String {
    "http://localhost:54321".to_string()
}

fn default_refresh_margin() -> i64 {
    300
}

fn default_callback_port() -> u16 {
    54400
}

fn default_login_timeout() -> u64 {
    300
}

fn default_identity_request_timeout() -> u64 {
    10
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            url: default_identity_url(),
            anon_key: String::new(),
            refresh_margin_seconds: default_refresh_margin(),
            callback_port: default_callback_port(),
            login_timeout_seconds: default_login_timeout(),
            request_timeout_seconds: default_identity_request_timeout(),
        }
    }
}

impl IdentityConfig {
    pub fn refresh_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_margin_seconds)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Session bridge
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Fallback poll interval while authenticated
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
}

fn default_poll_interval() -> u64 {
    3
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
        }
    }
}

impl SessionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

/// Generation flow
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    /// 0 waits indefinitely
    #[serde(default = "default_generation_timeout")]
    pub timeout_seconds: u64,
}

fn default_generation_timeout() -> u64 {
    600
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_generation_timeout(),
        }
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_seconds > 0).then(|| Duration::from_secs(self.timeout_seconds))
    }
}

/// Local credential storage
#[derive(Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    /// Base64 AES-256 key; values are stored in plaintext without it
    #[serde(default)]
    pub encryption_key: Option<String>,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("manim-ai.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            encryption_key: None,
        }
    }
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("path", &self.path)
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl ClientConfig {
    /// Apply `MANIM_AI_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("MANIM_AI_BACKEND_URL") {
            self.backend.url = v;
        }
        if let Some(v) = lookup("MANIM_AI_SUPABASE_URL") {
            self.identity.url = v;
        }
        if let Some(v) = lookup("MANIM_AI_SUPABASE_KEY") {
            self.identity.anon_key = v;
        }
        if let Some(v) = lookup("MANIM_AI_CALLBACK_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.identity.callback_port = port;
            }
        }
        if let Some(v) = lookup("MANIM_AI_STORAGE_PATH") {
            self.storage.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("MANIM_AI_ENCRYPTION_KEY") {
            self.storage.encryption_key = Some(v).filter(|k| !k.is_empty());
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: impl AsRef<Path>) -> Result<ClientConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: ClientConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.backend.url, "http://localhost:3000");
        assert_eq!(config.backend.request_timeout_seconds, 120);
        assert_eq!(config.identity.refresh_margin_seconds, 300);
        assert_eq!(config.identity.callback_port, 54400);
        assert_eq!(config.identity.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.session.poll_interval_seconds, 3);
        assert_eq!(config.generation.timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.storage.path, PathBuf::from("manim-ai.db"));
        assert!(config.storage.encryption_key.is_none());
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [backend]
            url = "https://api.example.com"
            request_timeout_seconds = 30

            [identity]
            url = "https://project.supabase.co"
            anon_key = "anon"
            callback_port = 8123
            request_timeout_seconds = 4

            [session]
            poll_interval_seconds = 10

            [generation]
            timeout_seconds = 0

            [storage]
            path = "/tmp/creds.db"
            encryption_key = "AAAA"
        "#;

        let config: ClientConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.backend.url, "https://api.example.com");
        assert_eq!(config.backend.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.identity.anon_key, "anon");
        assert_eq!(config.identity.callback_port, 8123);
        assert_eq!(config.identity.request_timeout(), Duration::from_secs(4));
        assert_eq!(config.session.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.generation.timeout(), None);
        assert_eq!(config.storage.encryption_key.as_deref(), Some("AAAA"));
    }

    #[test]
    fn test_partial_config() {
        // Missing sections use defaults
        let toml = r#"
            [session]
            poll_interval_seconds = 5
        "#;

        let config: ClientConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.session.poll_interval_seconds, 5);
        assert_eq!(config.backend.url, "http://localhost:3000"); // Default
        assert_eq!(config.identity.login_timeout_seconds, 300); // Default
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MANIM_AI_BACKEND_URL", "https://api.example.com"),
            ("MANIM_AI_SUPABASE_KEY", "anon-from-env"),
            ("MANIM_AI_CALLBACK_PORT", "not-a-port"),
            ("MANIM_AI_ENCRYPTION_KEY", ""),
        ]);

        let mut config = ClientConfig::default();
        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.backend.url, "https://api.example.com");
        assert_eq!(config.identity.anon_key, "anon-from-env");
        // Unparseable values are ignored
        assert_eq!(config.identity.callback_port, 54400);
        assert!(config.storage.encryption_key.is_none());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[backend]\nurl = \"http://backend.test\"").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.backend.url, "http://backend.test");

        assert!(load_config("/nonexistent/manim-ai.toml").is_err());
    }

    #[test]
    fn test_encryption_key_not_in_debug() {
        let mut config = ClientConfig::default();
        config.storage.encryption_key = Some("secret-key".to_string());
        assert!(!format!("{:?}", config).contains("secret-key"));
    }
}
