use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

/// Server configuration.
#[derive(Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// HS256 signing secret. A random one is generated when unset.
    pub jwt_secret: Option<SecretString>,
    pub token_ttl: Duration,
    /// How long a submission waits for the per-session append lock.
    pub lock_timeout: Duration,
    pub max_send_queue: usize,
    pub cleanup_interval: Duration,
    pub preview_chars: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9191,
            db_path: chatdesk_telemetry::data_dir().join("chatdesk.db"),
            jwt_secret: None,
            token_ttl: Duration::from_secs(12 * 60 * 60),
            lock_timeout: Duration::from_secs(5),
            max_send_queue: 256,
            cleanup_interval: Duration::from_secs(60),
            preview_chars: chatdesk_store::sessions::DEFAULT_PREVIEW_CHARS,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `CHATDESK_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    fn overlay(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(host) = var("CHATDESK_HOST") {
            self.host = host;
        }
        if let Some(port) = parse_var(&var, "CHATDESK_PORT") {
            self.port = port;
        }
        if let Some(path) = var("CHATDESK_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(secret) = var("CHATDESK_JWT_SECRET").filter(|s| !s.is_empty()) {
            self.jwt_secret = Some(SecretString::from(secret));
        }
        if let Some(secs) = parse_var(&var, "CHATDESK_TOKEN_TTL_SECS") {
            self.token_ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var(&var, "CHATDESK_LOCK_TIMEOUT_MS") {
            self.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = parse_var::<usize>(&var, "CHATDESK_SEND_QUEUE") {
            self.max_send_queue = size.max(1);
        }
        self
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Configured secret, or a per-process random one.
    pub fn signing_secret(&self) -> SecretString {
        match &self.jwt_secret {
            Some(secret) => secret.clone(),
            None => {
                tracing::warn!(
                    "no JWT secret configured, generated a random one; presented tokens will resolve to guest"
                );
                crate::identity::generate_secret()
            }
        }
    }
}

fn parse_var<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable config value");
            None
        }
    }
}
