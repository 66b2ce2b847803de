use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration build error: {0}")]
    Build(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Token and flow lifetimes, all in seconds.
#[derive(Clone, Debug, Deserialize)]
pub struct OAuth2Config {
    #[serde(default = "default_access_token_lifetime")]
    pub access_token_lifetime: i64,
    #[serde(default = "default_refresh_token_lifetime")]
    pub refresh_token_lifetime: i64,
    #[serde(default = "default_authorization_code_lifetime")]
    pub authorization_code_lifetime: i64,
    /// How long a single authorize request may stay open before it expires.
    #[serde(default = "default_flow_lifetime")]
    pub flow_lifetime: i64,
    /// Remember approvals so returning users are not asked again.
    #[serde(default = "default_true")]
    pub remember_consent: bool,
}

impl Default for OAuth2Config {
    fn default() -> Self {
        Self {
            access_token_lifetime: default_access_token_lifetime(),
            refresh_token_lifetime: default_refresh_token_lifetime(),
            authorization_code_lifetime: default_authorization_code_lifetime(),
            flow_lifetime: default_flow_lifetime(),
            remember_consent: true,
        }
    }
}

/// Settings for the external identity verification network.
#[derive(Clone, Debug, Deserialize)]
pub struct VerificationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_verification_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Overall bound on a single verification attempt.
    #[serde(default = "default_verification_timeout")]
    pub timeout_secs: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: default_verification_api_url(),
            client_id: String::new(),
            client_secret: String::new(),
            poll_interval_secs: default_poll_interval(),
            timeout_secs: default_verification_timeout(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Public base URL of this server
    pub issuer_url: String,
    /// HMAC key for session cookies
    pub session_secret: String,
    /// Session cookie lifetime in seconds
    #[serde(default = "default_session_lifetime")]
    pub session_lifetime: i64,
    #[serde(default)]
    pub oauth2: OAuth2Config,
    #[serde(default)]
    pub verification: VerificationConfig,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_session_lifetime() -> i64 {
    86400
}

fn default_access_token_lifetime() -> i64 {
    3600
}

fn default_refresh_token_lifetime() -> i64 {
    86400 * 7
}

fn default_authorization_code_lifetime() -> i64 {
    600
}

fn default_flow_lifetime() -> i64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_verification_api_url() -> String {
    "https://api.staging.v2.tnid.com".to_string()
}

fn default_poll_interval() -> u64 {
    5
}

fn default_verification_timeout() -> u64 {
    300
}

impl AppConfig {
    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_secret.len() < 32 {
            return Err(ConfigError::Validation(
                "session_secret must be at least 32 characters".into(),
            ));
        }
        if url::Url::parse(&self.issuer_url).is_err() {
            return Err(ConfigError::Validation(
                "issuer_url must be an absolute URL".into(),
            ));
        }
        if self.oauth2.authorization_code_lifetime <= 0
            || self.oauth2.authorization_code_lifetime > 600
        {
            return Err(ConfigError::Validation(
                "oauth2.authorization_code_lifetime must be between 1 and 600 seconds".into(),
            ));
        }
        if self.oauth2.access_token_lifetime <= 0 || self.oauth2.refresh_token_lifetime <= 0 {
            return Err(ConfigError::Validation(
                "oauth2 token lifetimes must be > 0".into(),
            ));
        }
        if self.oauth2.flow_lifetime <= 0 || self.session_lifetime <= 0 {
            return Err(ConfigError::Validation(
                "oauth2.flow_lifetime and session_lifetime must be > 0".into(),
            ));
        }
        if self.verification.enabled {
            if self.verification.client_id.is_empty() || self.verification.client_secret.is_empty()
            {
                return Err(ConfigError::Validation(
                    "verification.client_id and verification.client_secret are required when verification is enabled".into(),
                ));
            }
            if self.verification.poll_interval_secs == 0 {
                return Err(ConfigError::Validation(
                    "verification.poll_interval_secs must be > 0".into(),
                ));
            }
            if self.verification.timeout_secs < self.verification.poll_interval_secs {
                return Err(ConfigError::Validation(
                    "verification.timeout_secs must be >= poll_interval_secs".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Load application configuration from `config.yaml` + environment overrides.
///
/// Any environment variable matching the key path separated by double
/// underscores (e.g. `OAUTH2__ACCESS_TOKEN_LIFETIME`) overrides the file value.
/// A `.env` file in the working directory is loaded first if present.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    use config::{Config, Environment, File};

    let _ = dotenvy::dotenv();

    let cfg = Config::builder()
        .add_source(File::with_name("config.yaml").required(false))
        .add_source(Environment::default().separator("__"))
        .build()?;

    let app: AppConfig = cfg.try_deserialize()?;
    app.validate()?;
    Ok(app)
}

/// Convenience helper for binaries wanting panic-on-error behaviour.
pub fn load_config_or_panic() -> AppConfig {
    match load_config() {
        Ok(c) => c,
        Err(e) => panic!("Failed to load configuration: {e}"),
    }
}
