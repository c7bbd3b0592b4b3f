use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::billing::DEFAULT_HOME_COUNTRY;
use crate::billing::validation::normalize_country_code;
use crate::error::AppError;
use crate::utils::{get_env_with_prefix, parse_flag};

/// Deployment environment. Controls plan catalog hot reload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    #[default]
    Development,
    Test,
}

impl Environment {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Some(Self::Production),
            "development" | "dev" => Some(Self::Development),
            "test" => Some(Self::Test),
            _ => None,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Main configuration for the billing service
#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub billing: BillingSettings,
    pub stripe: StripeSettings,
    pub database: DatabaseSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

/// Catalog location, checkout redirects and cache settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BillingSettings {
    #[serde(default = "default_plans_path")]
    pub plans_path: PathBuf,
    #[serde(default = "default_home_country")]
    pub home_country: String,
    #[serde(default)]
    pub checkout_success_url: String,
    #[serde(default)]
    pub checkout_cancel_url: String,
    #[serde(default)]
    pub allowed_redirect_domains: Vec<String>,
    #[serde(default = "default_access_cache_ttl_secs")]
    pub access_cache_ttl_secs: u64,
}

/// Stripe credentials. Debug output never includes the secrets.
#[derive(Clone)]
pub struct StripeSettings {
    pub secret_key: Option<SecretString>,
    pub webhook_secret: Option<SecretString>,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

#[derive(Clone)]
pub struct DatabaseSettings {
    pub url: Option<SecretString>,
}

impl std::fmt::Debug for StripeSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeSettings")
            .field("secret_key", &self.secret_key.as_ref().map(|_| "[REDACTED]"))
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "[REDACTED]"))
            .field("max_retries", &self.max_retries)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl std::fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("url", &self.url.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            billing: BillingSettings::default(),
            stripe: StripeSettings::default(),
            database: DatabaseSettings { url: None },
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            plans_path: default_plans_path(),
            home_country: default_home_country(),
            checkout_success_url: String::new(),
            checkout_cancel_url: String::new(),
            allowed_redirect_domains: Vec::new(),
            access_cache_ttl_secs: default_access_cache_ttl_secs(),
        }
    }
}

impl Default for StripeSettings {
    fn default() -> Self {
        Self {
            secret_key: None,
            webhook_secret: None,
            max_retries: 3,
            timeout_secs: 30,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_plans_path() -> PathBuf {
    PathBuf::from("config/plans.json")
}

fn default_home_country() -> String {
    DEFAULT_HOME_COUNTRY.to_string()
}

fn default_access_cache_ttl_secs() -> u64 {
    60
}

impl ServerConfig {
    pub fn addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

impl BillingSettings {
    pub fn access_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.access_cache_ttl_secs)
    }
}

/// Builder for Config with environment variable support
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: Config,
    invalid_env: Option<String>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            invalid_env: None,
        }
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.config.environment = environment;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.server.port = port;
        self
    }

    pub fn with_plans_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.billing.plans_path = path.into();
        self
    }

    pub fn with_checkout_urls(
        mut self,
        success_url: impl Into<String>,
        cancel_url: impl Into<String>,
    ) -> Self {
        self.config.billing.checkout_success_url = success_url.into();
        self.config.billing.checkout_cancel_url = cancel_url.into();
        self
    }

    pub fn with_stripe_keys(
        mut self,
        secret_key: impl Into<SecretString>,
        webhook_secret: impl Into<SecretString>,
    ) -> Self {
        self.config.stripe.secret_key = Some(secret_key.into());
        self.config.stripe.webhook_secret = Some(webhook_secret.into());
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database.url = Some(SecretString::from(url.into()));
        self
    }

    /// Load configuration from environment variables with BILLING_ prefix
    ///
    /// Unparseable numbers keep their defaults. An unknown `APP_ENV` is
    /// reported by [`ConfigBuilder::build`].
    pub fn from_env(mut self) -> Self {
        if let Some(env) = get_env_with_prefix("APP_ENV") {
            match Environment::parse(&env) {
                Some(parsed) => self.config.environment = parsed,
                None => self.invalid_env = Some(env),
            }
        }
        if let Some(host) = get_env_with_prefix("HOST") {
            self.config.server.host = host;
        }
        if let Some(port) = get_env_with_prefix("PORT") {
            if let Ok(p) = port.parse() {
                self.config.server.port = p;
            }
        }
        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = get_env_with_prefix("LOG_JSON") {
            self.config.logging.json = parse_flag(&json);
        }

        if let Some(path) = get_env_with_prefix("PLANS_PATH") {
            self.config.billing.plans_path = PathBuf::from(path);
        }
        if let Some(country) = get_env_with_prefix("HOME_COUNTRY") {
            self.config.billing.home_country = country;
        }
        if let Some(url) = get_env_with_prefix("CHECKOUT_SUCCESS_URL") {
            self.config.billing.checkout_success_url = url;
        }
        if let Some(url) = get_env_with_prefix("CHECKOUT_CANCEL_URL") {
            self.config.billing.checkout_cancel_url = url;
        }
        if let Some(domains) = get_env_with_prefix("ALLOWED_REDIRECT_DOMAINS") {
            self.config.billing.allowed_redirect_domains = domains
                .split(',')
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .collect();
        }
        if let Some(ttl) = get_env_with_prefix("ACCESS_CACHE_TTL_SECS") {
            if let Ok(secs) = ttl.parse() {
                self.config.billing.access_cache_ttl_secs = secs;
            }
        }

        if let Some(key) = get_env_with_prefix("STRIPE_SECRET_KEY") {
            self.config.stripe.secret_key = Some(SecretString::from(key));
        }
        if let Some(secret) = get_env_with_prefix("STRIPE_WEBHOOK_SECRET") {
            self.config.stripe.webhook_secret = Some(SecretString::from(secret));
        }
        if let Some(retries) = get_env_with_prefix("STRIPE_MAX_RETRIES") {
            if let Ok(n) = retries.parse() {
                self.config.stripe.max_retries = n;
            }
        }
        if let Some(timeout) = get_env_with_prefix("STRIPE_TIMEOUT_SECS") {
            if let Ok(secs) = timeout.parse() {
                self.config.stripe.timeout_secs = secs;
            }
        }

        if let Some(url) = get_env_with_prefix("DATABASE_URL") {
            self.config.database.url = Some(SecretString::from(url));
        }

        self
    }

    /// Build the configuration, validating all settings
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid server address, log level, home
    /// country or cache TTL, and for a production environment without
    /// Stripe credentials or checkout redirect URLs.
    pub fn build(self) -> Result<Config, AppError> {
        if let Some(env) = self.invalid_env {
            return Err(AppError::bad_request(format!(
                "Invalid APP_ENV: {}. Must be one of: production, development, test",
                env
            )));
        }

        let mut config = self.config;

        config.server.addr().map_err(|e| {
            AppError::bad_request(format!(
                "Invalid server address {}:{} - {}",
                config.server.host, config.server.port, e
            ))
        })?;

        if config.server.port == 0 {
            return Err(AppError::bad_request("Server port must be greater than 0"));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.to_lowercase().as_str()) {
            return Err(AppError::bad_request(format!(
                "Invalid log level: {}. Must be one of: {}",
                config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        config.billing.home_country = normalize_country_code(Some(&config.billing.home_country))
            .ok_or_else(|| {
                AppError::bad_request(format!(
                    "Invalid home country: {}",
                    config.billing.home_country
                ))
            })?;

        if config.billing.access_cache_ttl_secs == 0 {
            return Err(AppError::bad_request(
                "Access cache TTL must be greater than 0",
            ));
        }

        if config.environment.is_production() {
            let missing = |secret: &Option<SecretString>| {
                secret
                    .as_ref()
                    .is_none_or(|s| s.expose_secret().trim().is_empty())
            };
            if missing(&config.stripe.secret_key) {
                return Err(AppError::bad_request(
                    "STRIPE_SECRET_KEY is required in production",
                ));
            }
            if missing(&config.stripe.webhook_secret) {
                return Err(AppError::bad_request(
                    "STRIPE_WEBHOOK_SECRET is required in production",
                ));
            }
            if config.billing.checkout_success_url.is_empty()
                || config.billing.checkout_cancel_url.is_empty()
            {
                return Err(AppError::bad_request(
                    "Checkout success and cancel URLs are required in production",
                ));
            }
        }

        Ok(config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
