use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Hard ceiling the platform enforces on a single text message (characters).
pub const LARK_MESSAGE_CEILING: usize = 4000;
/// Room reserved for the `[i/N] ` prefix added to chunked sends.
pub const CHUNK_PREFIX_HEADROOM: usize = 16;

const CONFIG_ENV_VAR: &str = "LARK_COURIER_CONFIG";

// ── Top-level config ──────────────────────────────────────────────

/// Top-level configuration, loaded from `config.toml`.
///
/// Resolution order: explicit path → `LARK_COURIER_CONFIG` env → `~/.lark-courier/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct Config {
    /// Path to config.toml - computed at load time, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,
    /// Lark/Feishu application credentials and endpoints.
    #[serde(default)]
    pub lark: LarkConfig,
    /// Outbound delivery tuning (thresholds, chunking, retry bound).
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// Document publishing (folder layout, permissions, naming).
    #[serde(default)]
    pub documents: DocumentConfig,
}

// ── Lark ──────────────────────────────────────────────────────────

fn default_use_feishu() -> bool {
    true
}

fn default_allowed_users() -> Vec<String> {
    vec!["*".into()]
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Lark/Feishu bot credentials.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LarkConfig {
    /// App ID from the Lark/Feishu developer console. Overridden by `LARK_APP_ID`.
    #[serde(default)]
    pub app_id: String,
    /// App Secret from the developer console. Overridden by `LARK_APP_SECRET`.
    #[serde(default)]
    pub app_secret: String,
    /// Use the Feishu (China) endpoints instead of Lark (international).
    #[serde(default = "default_use_feishu")]
    pub use_feishu: bool,
    /// Sender open_ids whose messages are accepted ("*" = everyone).
    #[serde(default = "default_allowed_users")]
    pub allowed_users: Vec<String>,
    /// Override for the open-apis base URL (e.g. a test server).
    #[serde(default)]
    pub api_base: Option<String>,
    /// Override for the web host used when building document links.
    #[serde(default)]
    pub web_base: Option<String>,
    /// Optional HTTP(S) proxy for all Lark API traffic.
    #[serde(default)]
    pub proxy_url: Option<String>,
    /// Per-request timeout for REST calls.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for LarkConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_secret: String::new(),
            use_feishu: default_use_feishu(),
            allowed_users: default_allowed_users(),
            api_base: None,
            web_base: None,
            proxy_url: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

// ── Delivery ──────────────────────────────────────────────────────

fn default_document_threshold() -> usize {
    2000
}

fn default_chunk_max_length() -> usize {
    3500
}

fn default_chunk_delay_ms() -> u64 {
    500
}

fn default_max_attempts() -> u32 {
    3
}

fn default_dead_letter_capacity() -> usize {
    100
}

/// Outbound delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeliveryConfig {
    /// Content longer than this many characters is published as a document.
    #[serde(default = "default_document_threshold")]
    pub document_threshold: usize,
    /// Maximum characters per chunk when falling back to chunked sending.
    #[serde(default = "default_chunk_max_length")]
    pub chunk_max_length: usize,
    /// Pause between consecutive chunk sends (rate limiting).
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
    /// Attempts per delivery before it is moved to the dead-letter list.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Dead letters kept in memory; the oldest is evicted past this bound.
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
}

impl DeliveryConfig {
    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            document_threshold: default_document_threshold(),
            chunk_max_length: default_chunk_max_length(),
            chunk_delay_ms: default_chunk_delay_ms(),
            max_attempts: default_max_attempts(),
            dead_letter_capacity: default_dead_letter_capacity(),
        }
    }
}

// ── Documents ─────────────────────────────────────────────────────

fn default_parent_folder_name() -> String {
    "Plans".into()
}

fn default_title_fallback_label() -> String {
    "Message".into()
}

/// Document publishing settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DocumentConfig {
    /// Shared container folder under which per-chat folders are created.
    #[serde(default = "default_parent_folder_name")]
    pub parent_folder_name: String,
    /// open_id granted access to created folders and files. Unset = no grants.
    /// Overridden by `LARK_ADMIN_OPEN_ID`.
    #[serde(default)]
    pub admin_open_id: Option<String>,
    /// Label used for the timestamp title when no usable line is found.
    #[serde(default = "default_title_fallback_label")]
    pub title_fallback_label: String,
    /// Merge short lines into paragraph blocks before uploading.
    #[serde(default)]
    pub compact_paragraphs: bool,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            parent_folder_name: default_parent_folder_name(),
            admin_open_id: None,
            title_fallback_label: default_title_fallback_label(),
            compact_paragraphs: false,
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────

fn default_config_path() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".lark-courier").join("config.toml"))
}

fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    default_config_path()
}

impl Config {
    /// Load the config file, creating it with defaults when missing.
    pub async fn load_or_init(explicit: Option<&Path>) -> Result<Self> {
        let config_path = resolve_config_path(explicit)?;

        let mut config = if config_path.exists() {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = fs::metadata(&config_path).await {
                    if meta.permissions().mode() & 0o004 != 0 {
                        tracing::warn!(
                            "Config file {:?} is world-readable (mode {:o}) and holds the app secret. \
                             Consider restricting with: chmod 600 {:?}",
                            config_path,
                            meta.permissions().mode() & 0o777,
                            config_path,
                        );
                    }
                }
            }

            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path.clone();
            config
        } else {
            let mut config = Config::default();
            config.config_path = config_path.clone();
            config.save().await?;

            #[cfg(unix)]
            {
                use std::{fs::Permissions, os::unix::fs::PermissionsExt};
                let _ = fs::set_permissions(&config_path, Permissions::from_mode(0o600)).await;
            }
            config
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(path = %config.config_path.display(), "Config loaded");
        Ok(config)
    }

    /// Environment variables win over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(app_id) = std::env::var("LARK_APP_ID") {
            if !app_id.is_empty() {
                self.lark.app_id = app_id;
            }
        }
        if let Ok(secret) = std::env::var("LARK_APP_SECRET") {
            if !secret.is_empty() {
                self.lark.app_secret = secret;
            }
        }
        if let Ok(admin) = std::env::var("LARK_ADMIN_OPEN_ID") {
            if !admin.trim().is_empty() {
                self.documents.admin_open_id = Some(admin.trim().to_string());
            }
        }
    }

    /// Validate values that would otherwise fail deep inside the pipeline.
    pub fn validate(&self) -> Result<()> {
        let delivery = &self.delivery;
        if delivery.document_threshold == 0 {
            anyhow::bail!("delivery.document_threshold must be greater than 0");
        }
        if delivery.document_threshold >= LARK_MESSAGE_CEILING {
            anyhow::bail!(
                "delivery.document_threshold ({}) must be below the platform message ceiling ({LARK_MESSAGE_CEILING})",
                delivery.document_threshold
            );
        }
        if delivery.chunk_max_length == 0 {
            anyhow::bail!("delivery.chunk_max_length must be greater than 0");
        }
        if delivery.chunk_max_length + CHUNK_PREFIX_HEADROOM >= LARK_MESSAGE_CEILING {
            anyhow::bail!(
                "delivery.chunk_max_length ({}) leaves no room for chunk prefixes under the {LARK_MESSAGE_CEILING} char ceiling",
                delivery.chunk_max_length
            );
        }
        if delivery.max_attempts == 0 {
            anyhow::bail!("delivery.max_attempts must be at least 1");
        }
        if self.documents.parent_folder_name.trim().is_empty() {
            anyhow::bail!("documents.parent_folder_name must not be empty");
        }
        if let Some(proxy) = &self.lark.proxy_url {
            reqwest::Url::parse(proxy)
                .with_context(|| format!("lark.proxy_url is not a valid URL: {proxy}"))?;
        }
        Ok(())
    }

    /// Write the config atomically (temp file + rename).
    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;

        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }
        Ok(())
    }
}

/// Build the shared HTTP client for Lark traffic, honoring proxy and timeout settings.
pub fn build_http_client(config: &LarkConfig) -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
        .connect_timeout(Duration::from_secs(10));

    if let Some(proxy_url) = config.proxy_url.as_deref() {
        match reqwest::Proxy::all(proxy_url) {
            Ok(proxy) => builder = builder.proxy(proxy),
            Err(error) => tracing::warn!(proxy_url, "Ignoring invalid Lark proxy: {error}"),
        }
    }

    builder.build().unwrap_or_else(|error| {
        tracing::warn!("Failed to build Lark HTTP client: {error}");
        reqwest::Client::new()
    })
}
