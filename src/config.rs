//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)
//!
//! The resulting [`AppConfig`] is passed explicitly into every component
//! that needs to know this server's identity.

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub internal: InternalAuthConfig,
    pub keys: KeyConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }

    /// Canonical actor URL for a local handle
    pub fn actor_url(&self, username: &str) -> String {
        format!("{}/users/{}", self.base_url(), username)
    }

    /// Whether `domain` names this server (case-insensitive, trailing dot ignored)
    pub fn is_local_domain(&self, domain: &str) -> bool {
        normalized_server_host(domain) == normalized_server_host(&self.domain)
            && explicit_port(domain) == explicit_port(&self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Federation behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Scheme used for WebFinger discovery against remote domains
    pub remote_scheme: String,
    /// Timeout for discovery and actor document fetches (seconds)
    pub fetch_timeout_secs: u64,
    /// Timeout for outbound inbox deliveries (seconds)
    pub delivery_timeout_secs: u64,
    /// Items per outbox page
    pub outbox_page_size: u32,
    /// TTL of the in-memory remote actor cache (seconds)
    pub actor_cache_ttl_secs: u64,
    /// Permit outbound fetches to loopback/private hosts (tests, LAN setups)
    pub allow_private_addresses: bool,
    /// Upper bound on concurrent outbound deliveries
    pub max_concurrent_deliveries: usize,
    /// How long applied inbound activity ids are kept for replay detection (seconds)
    pub activity_retention_secs: u64,
}

/// Service-to-service authentication between gateway and content service
#[derive(Debug, Clone, Deserialize)]
pub struct InternalAuthConfig {
    /// HMAC secret shared by both services (32+ bytes)
    pub service_secret: String,
    /// Lifetime of issued tokens in seconds (default: 600)
    pub token_ttl_secs: u64,
}

/// Actor key material
#[derive(Debug, Clone, Deserialize)]
pub struct KeyConfig {
    /// Base64-encoded 32-byte key for the private key vault
    pub vault_key: String,
    /// RSA modulus size for newly provisioned actors
    pub rsa_bits: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDIGATE__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 4000)?
            .set_default("server.protocol", "http")?
            .set_default("federation.remote_scheme", "https")?
            .set_default("federation.fetch_timeout_secs", 10)?
            .set_default("federation.delivery_timeout_secs", 30)?
            .set_default("federation.outbox_page_size", 10)?
            .set_default("federation.actor_cache_ttl_secs", 3600)?
            .set_default("federation.allow_private_addresses", false)?
            .set_default("federation.max_concurrent_deliveries", 10)?
            .set_default("federation.activity_retention_secs", 172_800)?
            .set_default("internal.token_ttl_secs", 600)?
            .set_default("keys.rsa_bits", 2048)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FEDIGATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        const MIN_SERVICE_SECRET_BYTES: usize = 32;
        const MIN_RSA_BITS: usize = 1024;
        // Must outlive the window in which a signed request's Date is accepted.
        const MIN_ACTIVITY_RETENTION_SECS: u64 = 600;

        if self.internal.service_secret.len() < MIN_SERVICE_SECRET_BYTES {
            return Err(crate::error::AppError::Config(format!(
                "internal.service_secret must be at least {} bytes",
                MIN_SERVICE_SECRET_BYTES
            )));
        }

        if self.internal.token_ttl_secs == 0 {
            return Err(crate::error::AppError::Config(
                "internal.token_ttl_secs must be greater than 0".to_string(),
            ));
        }

        if self.federation.outbox_page_size == 0 {
            return Err(crate::error::AppError::Config(
                "federation.outbox_page_size must be greater than 0".to_string(),
            ));
        }

        if self.federation.activity_retention_secs < MIN_ACTIVITY_RETENTION_SECS {
            return Err(crate::error::AppError::Config(format!(
                "federation.activity_retention_secs must be at least {}",
                MIN_ACTIVITY_RETENTION_SECS
            )));
        }

        if !matches!(self.federation.remote_scheme.as_str(), "http" | "https") {
            return Err(crate::error::AppError::Config(
                "federation.remote_scheme must be http or https".to_string(),
            ));
        }

        if self.keys.rsa_bits < MIN_RSA_BITS {
            return Err(crate::error::AppError::Config(format!(
                "keys.rsa_bits must be at least {}",
                MIN_RSA_BITS
            )));
        }

        crate::federation::AesGcmKeyVault::from_config(&self.keys)?;

        if is_local_server_domain(&self.server.domain) {
            if !self.server.protocol.eq_ignore_ascii_case("https") {
                tracing::warn!(
                    domain = %self.server.domain,
                    "Serving plain http on a local domain"
                );
            }
        } else if !self.server.protocol.eq_ignore_ascii_case("https") {
            return Err(crate::error::AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn explicit_port(domain: &str) -> Option<u16> {
    url::Url::parse(&format!("http://{}", domain.trim()))
        .ok()
        .and_then(|url| url.port())
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};

    pub(crate) fn valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 4000,
                domain: "localhost".to_string(),
                protocol: "http".to_string(),
            },
            database: DatabaseConfig {
                path: PathBuf::from("/tmp/fedigate-test.db"),
            },
            federation: FederationConfig {
                remote_scheme: "http".to_string(),
                fetch_timeout_secs: 5,
                delivery_timeout_secs: 5,
                outbox_page_size: 10,
                actor_cache_ttl_secs: 3600,
                allow_private_addresses: true,
                max_concurrent_deliveries: 4,
                activity_retention_secs: 3600,
            },
            internal: InternalAuthConfig {
                service_secret: "s".repeat(32),
                token_ttl_secs: 600,
            },
            keys: KeyConfig {
                vault_key: BASE64_STANDARD.encode([9_u8; 32]),
                rsa_bits: 1024,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_accepts_http_on_localhost() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_activity_retention_inside_signature_window() {
        let mut config = valid_config();
        config.federation.activity_retention_secs = 60;

        let error = config
            .validate()
            .expect_err("retention shorter than the date window must fail");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("activity_retention_secs")
        ));
    }

    #[test]
    fn validate_rejects_short_service_secret() {
        let mut config = valid_config();
        config.internal.service_secret = "short".to_string();

        let error = config
            .validate()
            .expect_err("service secret shorter than 32 bytes must fail");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("internal.service_secret")
        ));
    }

    #[test]
    fn validate_rejects_http_for_non_local_domain() {
        let mut config = valid_config();
        config.server.domain = "social.example.com".to_string();

        let error = config
            .validate()
            .expect_err("public domains must require https");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("server.protocol must be https")
        ));
    }

    #[test]
    fn validate_rejects_bad_vault_key() {
        let mut config = valid_config();
        config.keys.vault_key = BASE64_STANDARD.encode([1_u8; 16]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn is_local_domain_compares_host_and_port() {
        let mut config = valid_config();
        config.server.domain = "Social.Example.com".to_string();
        assert!(config.server.is_local_domain("social.example.com"));
        assert!(config.server.is_local_domain("social.example.com."));
        assert!(!config.server.is_local_domain("social.example.com:8443"));
        assert!(!config.server.is_local_domain("other.example.com"));
    }
}
