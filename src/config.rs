//! Validated crawl configuration loaded from a JSON file.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, #[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlConfig {
    pub target: TargetConfig,
    #[serde(default)]
    pub crawl: CrawlSection,
    #[serde(default)]
    pub heuristics: Heuristics,
    #[serde(default)]
    pub content: ContentSection,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub git: GitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub base_urls: Vec<String>,
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub disallowed_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSection {
    #[serde(default = "defaults::depth_max")]
    pub depth_max: u32,
    #[serde(default)]
    pub budgets: Budgets,
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "defaults::rate_limit_rps")]
    pub rate_limit_rps: f64,
    #[serde(default = "defaults::concurrency")]
    pub concurrency: usize,
    #[serde(default = "defaults::yes")]
    pub follow_redirects: bool,
    #[serde(default)]
    pub normalize_query: NormalizeQuery,
    #[serde(default)]
    pub time_max_secs: Option<u64>,
    #[serde(default = "defaults::error_rate_max")]
    pub error_rate_max: f64,
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Budgets {
    #[serde(default = "defaults::pages_max")]
    pub pages_max: u64,
    #[serde(default = "defaults::js_max")]
    pub js_max: u64,
    #[serde(default = "defaults::api_max")]
    pub api_max: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizeQuery {
    #[serde(default = "defaults::drop_params")]
    pub drop_params: Vec<String>,
    #[serde(default = "defaults::yes")]
    pub sort_params: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heuristics {
    #[serde(default = "defaults::family_max_samples")]
    pub family_max_samples: u64,
    #[serde(default = "defaults::family_threshold")]
    pub family_threshold: f64,
    #[serde(default = "defaults::simhash_shingle_size")]
    pub simhash_shingle_size: usize,
    #[serde(default = "defaults::html_similarity_drop")]
    pub html_similarity_drop: f64,
    #[serde(default = "defaults::pagination_diff_ratio")]
    pub pagination_diff_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentSection {
    #[serde(default = "defaults::include_types")]
    pub include_types: Vec<String>,
    #[serde(default = "defaults::exclude_extensions")]
    pub exclude_extensions: Vec<String>,
    #[serde(default = "defaults::max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    #[serde(default)]
    pub header_name: Option<String>,
    #[serde(default)]
    pub header_value: Option<String>,
    #[serde(default)]
    pub cookies: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    None,
    Cookies,
    Header,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "defaults::root_dir")]
    pub root_dir: String,
    #[serde(default = "defaults::pages_dir")]
    pub store_pages_under: String,
    #[serde(default = "defaults::js_dir")]
    pub store_js_under: String,
    #[serde(default = "defaults::api_dir")]
    pub store_api_under: String,
}

/// Parsed and validated but only handed off at the collaborator boundary;
/// no Git operations happen in-core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub commit_every_files: Option<u64>,
}

mod defaults {
    pub fn depth_max() -> u32 {
        4
    }
    pub fn timeout_ms() -> u64 {
        20_000
    }
    pub fn rate_limit_rps() -> f64 {
        4.0
    }
    pub fn concurrency() -> usize {
        4
    }
    pub fn yes() -> bool {
        true
    }
    pub fn error_rate_max() -> f64 {
        0.5
    }
    pub fn max_retries() -> u32 {
        3
    }
    pub fn pages_max() -> u64 {
        200
    }
    pub fn js_max() -> u64 {
        100
    }
    pub fn api_max() -> u64 {
        100
    }
    pub fn drop_params() -> Vec<String> {
        vec![
            "utm_*".to_string(),
            "gclid".to_string(),
            "fbclid".to_string(),
            "session*".to_string(),
        ]
    }
    pub fn family_max_samples() -> u64 {
        3
    }
    pub fn family_threshold() -> f64 {
        0.3
    }
    pub fn simhash_shingle_size() -> usize {
        8
    }
    pub fn html_similarity_drop() -> f64 {
        0.92
    }
    pub fn pagination_diff_ratio() -> f64 {
        0.15
    }
    pub fn include_types() -> Vec<String> {
        vec!["html".to_string(), "js".to_string(), "json".to_string()]
    }
    pub fn exclude_extensions() -> Vec<String> {
        [
            "pdf", "jpg", "jpeg", "png", "gif", "svg", "ico", "css", "woff", "woff2", "ttf",
            "zip", "mp4", "avi", "mov", "mp3", "wav", "doc", "docx", "xls", "xlsx", "ppt",
            "pptx", "tar", "gz", "tgz", "bz2", "7z", "rar", "exe", "msi", "dmg", "iso", "apk",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
    pub fn max_body_bytes() -> usize {
        10 * 1024 * 1024
    }
    pub fn root_dir() -> String {
        "./recon-output".to_string()
    }
    pub fn pages_dir() -> String {
        "pages".to_string()
    }
    pub fn js_dir() -> String {
        "js".to_string()
    }
    pub fn api_dir() -> String {
        "api".to_string()
    }
}

impl Default for CrawlSection {
    fn default() -> Self {
        serde_json::from_str("{}").expect("crawl section defaults")
    }
}

impl Default for Budgets {
    fn default() -> Self {
        serde_json::from_str("{}").expect("budget defaults")
    }
}

impl Default for NormalizeQuery {
    fn default() -> Self {
        serde_json::from_str("{}").expect("normalize_query defaults")
    }
}

impl Default for Heuristics {
    fn default() -> Self {
        serde_json::from_str("{}").expect("heuristics defaults")
    }
}

impl Default for ContentSection {
    fn default() -> Self {
        serde_json::from_str("{}").expect("content defaults")
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("output defaults")
    }
}

impl CrawlConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().display().to_string(), e))?;
        let config: CrawlConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.base_urls.is_empty() {
            return Err(ConfigError::Invalid("target.base_urls is empty".into()));
        }
        if self.target.allowed_domains.is_empty() {
            return Err(ConfigError::Invalid(
                "target.allowed_domains is empty".into(),
            ));
        }
        if self.crawl.rate_limit_rps <= 0.0 {
            return Err(ConfigError::Invalid(
                "crawl.rate_limit_rps must be positive".into(),
            ));
        }
        if self.crawl.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "crawl.concurrency must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.heuristics.html_similarity_drop) {
            return Err(ConfigError::Invalid(
                "heuristics.html_similarity_drop must be in [0, 1]".into(),
            ));
        }
        if self.heuristics.simhash_shingle_size == 0 {
            return Err(ConfigError::Invalid(
                "heuristics.simhash_shingle_size must be at least 1".into(),
            ));
        }
        if self.auth.mode == AuthMode::Header
            && (self.auth.header_name.is_none() || self.auth.header_value.is_none())
        {
            return Err(ConfigError::Invalid(
                "auth.mode=header requires header_name and header_value".into(),
            ));
        }
        Ok(())
    }

    /// Stable hash of the effective configuration, recorded in the manifest
    /// so downstream consumers can tell runs apart.
    pub fn config_hash(&self) -> String {
        let serialized = serde_json::to_string(self).unwrap_or_default();
        hex::encode(&Sha1::digest(serialized.as_bytes())[..8])
    }
}
