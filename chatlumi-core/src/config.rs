use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct ChatLumiConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub facebook: FacebookConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
    /// Externally reachable base URL, used for OAuth redirects.
    pub public_url: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            public_url: "http://localhost:3000".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub cookie_name: String,
    pub session_ttl_hours: i64,
    /// Adds the `Secure` attribute to the session cookie (HTTPS deployments).
    pub secure_cookies: bool,
    pub purge_interval_minutes: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            cookie_name: "chatlumi_session".to_string(),
            session_ttl_hours: 24 * 30,
            secure_cookies: false,
            purge_interval_minutes: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FacebookConfig {
    pub app_id: String,
    pub app_secret: String,
    pub webhook_verify_token: String,
    /// When false only the presence of `x-hub-signature-256` is checked.
    pub verify_signatures: bool,
    pub graph_base_url: String,
    pub dialog_base_url: String,
    pub api_version: String,
    pub request_timeout_seconds: u64,
}

impl Default for FacebookConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_secret: String::new(),
            webhook_verify_token: String::new(),
            verify_signatures: false,
            graph_base_url: "https://graph.facebook.com".to_string(),
            dialog_base_url: "https://www.facebook.com".to_string(),
            api_version: "v17.0".to_string(),
            request_timeout_seconds: 30,
        }
    }
}

impl ChatLumiConfig {
    /// Load from a TOML file, then apply `CHATLUMI__SECTION__KEY` overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("CHATLUMI").separator("__"))
            .build()?;
        s.try_deserialize()
    }

    /// Environment-only variant for deployments without a config file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("CHATLUMI").separator("__"))
            .build()?
            .try_deserialize()
    }
}
