use std::fmt;

use base64::Engine;
use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::presign::{AddressingStyle, SigningCredentials};

/// Command-line overrides. Only flags that were actually passed are merged
/// over the TOML file and the environment.
#[derive(Parser, Serialize, Debug, Default)]
#[command(name = "ghoststream-server", version, about = "GhostStream delivery server")]
pub struct Cli {
    /// Path to TOML config file
    #[arg(long, default_value = "./ghoststream.toml")]
    #[serde(skip)]
    pub config: String,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip)]
    pub generate_config: bool,

    /// Port to listen on
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Data directory for the SQLite database
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_logs: bool,
}

/// Effective server configuration after all layers are merged.
#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    pub data_dir: String,
    #[serde(default)]
    pub json_logs: bool,

    /// Shared secret of the chat platform bot that issues identity tokens
    #[serde(default)]
    pub bot_token: Option<String>,
    /// Base64 AES-256 key for title envelopes
    #[serde(default)]
    pub aes_key_b64: Option<String>,
    /// Base64 HMAC key for tag blind indexes
    #[serde(default)]
    pub tag_hmac_key_b64: Option<String>,

    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// Object store credentials (loaded from [object_store] section in TOML)
    #[serde(default)]
    pub object_store: Option<ObjectStoreConfig>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("bind_address", &self.bind_address)
            .field("data_dir", &self.data_dir)
            .field("json_logs", &self.json_logs)
            .field("bot_token", &redacted(&self.bot_token))
            .field("aes_key_b64", &redacted(&self.aes_key_b64))
            .field("tag_hmac_key_b64", &redacted(&self.tag_hmac_key_b64))
            .field("auth", &self.auth)
            .field("limits", &self.limits)
            .field("delivery", &self.delivery)
            .field("object_store", &self.object_store)
            .finish()
    }
}

fn redacted(value: &Option<String>) -> Option<&'static str> {
    value.as_ref().map(|_| "<redacted>")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Maximum accepted identity token age in seconds (default: 86400)
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age(),
        }
    }
}

fn default_max_age() -> u64 {
    86400
}

/// Sliding-window quotas per endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_per_window")]
    pub feed_per_window: u32,
    #[serde(default = "default_per_window")]
    pub play_per_window: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            feed_per_window: default_per_window(),
            play_per_window: default_per_window(),
            window_secs: default_window_secs(),
        }
    }
}

fn default_per_window() -> u32 {
    30
}

fn default_window_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Lifetime of every signed URL (default: 7200 = 2 hours)
    #[serde(default = "default_url_ttl")]
    pub url_ttl_secs: u64,
    /// How long before expiry clients should re-request URLs (default: 600)
    #[serde(default = "default_refresh_lead")]
    pub refresh_lead_secs: u64,
    /// Upper bound on each ledger or catalog call (default: 3000 ms)
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            url_ttl_secs: default_url_ttl(),
            refresh_lead_secs: default_refresh_lead(),
            store_timeout_ms: default_store_timeout(),
        }
    }
}

fn default_url_ttl() -> u64 {
    7200
}

fn default_refresh_lead() -> u64 {
    600
}

fn default_store_timeout() -> u64 {
    3000
}

/// S3-compatible object store (Cloudflare R2 in production).
#[derive(Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// e.g. https://<account>.r2.cloudflarestorage.com
    pub endpoint: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub addressing_style: AddressingStyle,
}

impl fmt::Debug for ObjectStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreConfig")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("addressing_style", &self.addressing_style)
            .finish()
    }
}

fn default_region() -> String {
    "auto".to_string()
}

impl ObjectStoreConfig {
    pub fn credentials(&self) -> SigningCredentials {
        SigningCredentials {
            endpoint: self.endpoint.clone(),
            region: self.region.clone(),
            access_key_id: self.access_key_id.clone(),
            secret_access_key: self.secret_access_key.clone(),
            addressing_style: self.addressing_style,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8787,
            bind_address: "0.0.0.0".to_string(),
            data_dir: "./data".to_string(),
            json_logs: false,
            bot_token: None,
            aes_key_b64: None,
            tag_hmac_key_b64: None,
            auth: AuthConfig::default(),
            limits: LimitsConfig::default(),
            delivery: DeliveryConfig::default(),
            object_store: None,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (GHOSTSTREAM_*) < CLI args
    pub fn load(cli: &Cli) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&cli.config))
            .merge(Env::prefixed("GHOSTSTREAM_").split("__"))
            .merge(Serialized::defaults(cli))
            .extract()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("{0} is not valid base64")]
    InvalidBase64(&'static str),
    #[error("{name} must be between {min} and {max}, got {actual}")]
    OutOfRange {
        name: &'static str,
        min: u64,
        max: u64,
        actual: u64,
    },
    #[error("{name} must decode to {expected} bytes, got {actual}")]
    InvalidKeyLength {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Secret material decoded once at startup. Read-only for the life of the
/// process and handed to each component constructor.
#[derive(Clone)]
pub struct Secrets {
    pub platform_secret: String,
    pub metadata_key: [u8; 32],
    pub tag_key: Vec<u8>,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secrets { .. }")
    }
}

impl Secrets {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let platform_secret = config
            .bot_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::Missing("bot_token"))?;

        let aes_key = decode_b64_setting("aes_key_b64", config.aes_key_b64.as_deref())?;
        let metadata_key: [u8; 32] =
            aes_key
                .as_slice()
                .try_into()
                .map_err(|_| ConfigError::InvalidKeyLength {
                    name: "aes_key_b64",
                    expected: 32,
                    actual: aes_key.len(),
                })?;

        let tag_key = decode_b64_setting("tag_hmac_key_b64", config.tag_hmac_key_b64.as_deref())?;
        if tag_key.is_empty() {
            return Err(ConfigError::Missing("tag_hmac_key_b64"));
        }

        Ok(Self {
            platform_secret,
            metadata_key,
            tag_key,
        })
    }
}

fn decode_b64_setting(name: &'static str, value: Option<&str>) -> Result<Vec<u8>, ConfigError> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(name))?;
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|_| ConfigError::InvalidBase64(name))
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# GhostStream Delivery Server Configuration
# Place this file at ./ghoststream.toml or specify with --config <path>
# Every setting can be overridden via environment variables
# (GHOSTSTREAM_PORT, GHOSTSTREAM_LIMITS__WINDOW_SECS, ...) or CLI flags.

# port = 8787
# bind_address = "0.0.0.0"
# data_dir = "./data"
# json_logs = false

# ---- Secrets (prefer env vars over this file) ----
# bot_token = ""          # GHOSTSTREAM_BOT_TOKEN
# aes_key_b64 = ""        # GHOSTSTREAM_AES_KEY_B64, 32 bytes
# tag_hmac_key_b64 = ""   # GHOSTSTREAM_TAG_HMAC_KEY_B64

# [auth]
# max_age_secs = 86400    # reject identity tokens older than this

# [limits]
# feed_per_window = 30
# play_per_window = 30
# window_secs = 60

# [delivery]
# url_ttl_secs = 7200
# refresh_lead_secs = 600
# store_timeout_ms = 3000

# [object_store]
# endpoint = "https://<account>.r2.cloudflarestorage.com"
# region = "auto"
# access_key_id = ""
# secret_access_key = ""
# addressing_style = "path"   # or "virtual-hosted"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_keys() -> Config {
        Config {
            bot_token: Some("123:abc".to_string()),
            aes_key_b64: Some(base64::engine::general_purpose::STANDARD.encode([7u8; 32])),
            tag_hmac_key_b64: Some(base64::engine::general_purpose::STANDARD.encode(b"tag-key")),
            ..Config::default()
        }
    }

    #[test]
    fn test_secrets_decode() {
        let secrets = Secrets::from_config(&config_with_keys()).unwrap();
        assert_eq!(secrets.metadata_key, [7u8; 32]);
        assert_eq!(secrets.tag_key, b"tag-key");
        assert_eq!(format!("{:?}", secrets), "Secrets { .. }");
    }

    #[test]
    fn test_missing_bot_token_rejected() {
        let mut config = config_with_keys();
        config.bot_token = None;
        assert!(matches!(
            Secrets::from_config(&config),
            Err(ConfigError::Missing("bot_token"))
        ));
    }

    #[test]
    fn test_short_aes_key_rejected() {
        let mut config = config_with_keys();
        config.aes_key_b64 = Some(base64::engine::general_purpose::STANDARD.encode([1u8; 16]));
        assert!(matches!(
            Secrets::from_config(&config),
            Err(ConfigError::InvalidKeyLength { actual: 16, .. })
        ));
    }

    #[test]
    fn test_config_debug_redacts_secrets() {
        let mut config = config_with_keys();
        config.object_store = Some(ObjectStoreConfig {
            endpoint: "https://acct.r2.cloudflarestorage.com".to_string(),
            region: "auto".to_string(),
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "very-secret-value".to_string(),
            addressing_style: AddressingStyle::Path,
        });
        let aes = config.aes_key_b64.clone().unwrap();
        let tag = config.tag_hmac_key_b64.clone().unwrap();

        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("123:abc"));
        assert!(!rendered.contains(&aes));
        assert!(!rendered.contains(&tag));
        assert!(!rendered.contains("very-secret-value"));
        assert!(rendered.contains("<redacted>"));
        assert!(rendered.contains("AKIDEXAMPLE"));

        // Unset secrets stay visibly unset
        assert!(format!("{:?}", Config::default()).contains("bot_token: None"));
    }

    #[test]
    fn test_template_mentions_every_section() {
        let template = generate_config_template();
        for section in ["[auth]", "[limits]", "[delivery]", "[object_store]"] {
            assert!(template.contains(section), "missing {}", section);
        }
    }
}
