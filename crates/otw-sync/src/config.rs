use std::path::{Path, PathBuf};
use std::time::Duration;

use otw_adapters::{default_card_selectors, PortalSettings, ETIMAD_BASE_URL, ETIMAD_SEARCH_PATH};
use otw_core::{ColumnSet, ColumnSetError};
use otw_storage::{
    BackoffPolicy, GoogleSheetsConfig, HttpClientConfig, TokenBucketConfig, DEFAULT_USER_AGENT,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PER_KEYWORD_LIMIT: usize = 25;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("source '{source_id}': {message}")]
    InvalidSource { source_id: String, message: String },
    #[error("source '{source_id}' columns: {error}")]
    Columns {
        source_id: String,
        error: ColumnSetError,
    },
    #[error("OTW_SHEET_ID is not set")]
    MissingSheetId,
    #[error("no sheet credentials: set OTW_SHEETS_ACCESS_TOKEN or OTW_SHEETS_TOKEN_FILE")]
    MissingSheetCredentials,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    #[default]
    Live,
    /// Replay captured pages from `fixtures/<source_id>/`.
    Fixture,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let registry: Self = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        for source in &registry.sources {
            source.validate()?;
        }
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_yaml_str(&text, path)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

/// One searchable portal and the keywords run against it.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: SourceMode,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_search_path")]
    pub search_path: String,
    #[serde(default = "default_card_selectors")]
    pub card_selectors: Vec<String>,
    pub keywords: Vec<String>,
    #[serde(default = "default_per_keyword_limit")]
    pub per_keyword_limit: usize,
    #[serde(default = "default_true")]
    pub require_today: bool,
    /// Header row of the store; the built-in Arabic names when omitted.
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_base_url() -> String {
    ETIMAD_BASE_URL.to_string()
}

fn default_search_path() -> String {
    ETIMAD_SEARCH_PATH.to_string()
}

fn default_per_keyword_limit() -> usize {
    DEFAULT_PER_KEYWORD_LIMIT
}

impl SourceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidSource {
            source_id: self.source_id.clone(),
            message: message.to_string(),
        };
        if self.per_keyword_limit == 0 {
            return Err(invalid("per_keyword_limit must be positive"));
        }
        if self.keywords.iter().all(|k| k.trim().is_empty()) {
            return Err(invalid("at least one keyword is required"));
        }
        self.column_set()?;
        Ok(())
    }

    pub fn portal_settings(&self) -> PortalSettings {
        PortalSettings {
            base_url: self.base_url.clone(),
            search_path: self.search_path.clone(),
            card_selectors: self.card_selectors.clone(),
        }
    }

    pub fn column_set(&self) -> Result<ColumnSet, ConfigError> {
        match &self.columns {
            None => Ok(ColumnSet::default()),
            Some(names) => ColumnSet::new(names.clone()).map_err(|error| ConfigError::Columns {
                source_id: self.source_id.clone(),
                error,
            }),
        }
    }

    /// Trimmed, non-empty keywords with repeats removed, in configured order.
    pub fn search_keywords(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.keywords.len());
        for keyword in self.keywords.iter().map(|k| k.trim()) {
            if !keyword.is_empty() && !out.iter().any(|k| k == keyword) {
                out.push(keyword.to_string());
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetSettings {
    pub sheet_id: Option<String>,
    pub tab: String,
    pub access_token: Option<String>,
    pub token_file: Option<PathBuf>,
}

impl SheetSettings {
    pub fn google_config(&self) -> Result<GoogleSheetsConfig, ConfigError> {
        let sheet_id = self.sheet_id.clone().ok_or(ConfigError::MissingSheetId)?;
        let token = match (&self.access_token, &self.token_file) {
            (Some(token), _) => token.trim().to_string(),
            (None, Some(path)) => std::fs::read_to_string(path)
                .map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?
                .trim()
                .to_string(),
            (None, None) => return Err(ConfigError::MissingSheetCredentials),
        };
        if token.is_empty() {
            return Err(ConfigError::MissingSheetCredentials);
        }
        Ok(GoogleSheetsConfig::new(sheet_id, self.tab.clone(), token))
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub artifacts_dir: PathBuf,
    pub pending_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub keyword_concurrency: usize,
    /// Request pacing; off unless `OTW_HTTP_RATE_REFILL_MS` is set.
    pub http_rate_limit: Option<TokenBucketConfig>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub sheet: SheetSettings,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or blank keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let parse_or = |key: &str, default: u64| {
            get(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        let workspace_root = get("OTW_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let dir = |key: &str, name: &str| {
            get(key)
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join(name))
        };

        Self {
            artifacts_dir: dir("OTW_ARTIFACTS_DIR", "artifacts"),
            pending_dir: dir("OTW_PENDING_DIR", "pending"),
            reports_dir: dir("OTW_REPORTS_DIR", "reports"),
            user_agent: get("OTW_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: parse_or("OTW_HTTP_TIMEOUT_SECS", 30),
            http_max_retries: parse_or("OTW_HTTP_MAX_RETRIES", 2) as usize,
            keyword_concurrency: parse_or("OTW_KEYWORD_CONCURRENCY", 4).max(1) as usize,
            http_rate_limit: match parse_or("OTW_HTTP_RATE_REFILL_MS", 0) {
                0 => None,
                refill_ms => Some(TokenBucketConfig {
                    capacity: parse_or("OTW_HTTP_RATE_BURST", 4).clamp(1, u64::from(u32::MAX)) as u32,
                    refill_every: Duration::from_millis(refill_ms),
                }),
            },
            scheduler_enabled: get("OTW_SCHEDULER_ENABLED")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(false),
            sync_cron: get("OTW_SYNC_CRON").unwrap_or_else(|| "0 0 7 * * *".to_string()),
            sheet: SheetSettings {
                sheet_id: get("OTW_SHEET_ID"),
                tab: get("OTW_SHEET_TAB").unwrap_or_else(|| "Sheet1".to_string()),
                access_token: get("OTW_SHEETS_ACCESS_TOKEN"),
                token_file: get("OTW_SHEETS_TOKEN_FILE").map(PathBuf::from),
            },
            workspace_root,
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn relevance_rules_path(&self) -> PathBuf {
        self.workspace_root.join("rules").join("relevance.yaml")
    }

    pub fn fixtures_dir(&self) -> PathBuf {
        self.workspace_root.join("fixtures")
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            max_in_flight: self.keyword_concurrency,
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..BackoffPolicy::default()
            },
            token_bucket: self.http_rate_limit,
            ..HttpClientConfig::default()
        }
    }
}
