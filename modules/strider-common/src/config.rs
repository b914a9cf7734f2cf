use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// TOML-backed crawl configuration loaded from disk.
/// Auth secrets can be overridden via `STRIDER_AUTH_VALUE` so they stay
/// out of the file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub target: TargetConfig,
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub heuristics: HeuristicsConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub scoring: ScoringWeights,
    /// sha256 of the raw config file bytes; recorded in the manifest so a
    /// resumed run can detect drift. Not part of the file itself.
    #[serde(skip)]
    pub config_hash: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub base_urls: Vec<String>,
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub disallowed_paths: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CrawlConfig {
    #[serde(default = "default_depth_max")]
    pub depth_max: u32,
    pub budgets: BudgetConfig,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_rate_limit_rps")]
    pub rate_limit_rps: f64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_true")]
    pub follow_redirects: bool,
    #[serde(default)]
    pub normalize_query: NormalizeQueryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BudgetConfig {
    pub pages_max: u32,
    pub js_max: u32,
    pub api_max: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NormalizeQueryConfig {
    /// Wildcard patterns for query parameters dropped during
    /// canonicalization (`utm_*`, `gclid`, ...).
    pub drop_params: Vec<String>,
    pub sort_params: bool,
}

impl Default for NormalizeQueryConfig {
    fn default() -> Self {
        Self {
            drop_params: ["utm_*", "gclid", "fbclid", "session*", "mc_cid", "mc_eid"]
                .into_iter()
                .map(String::from)
                .collect(),
            sort_params: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HeuristicsConfig {
    pub family_max_samples: u32,
    /// Shannon bits per char above which a long path segment is treated as
    /// an identifier during family generalization.
    pub family_threshold: f64,
    pub simhash_shingle_size: usize,
    /// Similarity above which an HTML page is dropped as a near-duplicate.
    pub html_similarity_drop: f64,
    /// Minimum content diff ratio for saving another pagination sibling.
    pub pagination_diff_min: f64,
}

impl Default for HeuristicsConfig {
    fn default() -> Self {
        Self {
            family_max_samples: 3,
            family_threshold: 3.5,
            simhash_shingle_size: 8,
            html_similarity_drop: 0.92,
            pagination_diff_min: 0.15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ContentConfig {
    pub include_types: Vec<String>,
    pub exclude_extensions: Vec<String>,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            include_types: ["html", "js", "json"].into_iter().map(String::from).collect(),
            exclude_extensions: [
                "png", "jpg", "jpeg", "gif", "svg", "css", "woff", "woff2", "ttf", "ico",
                "pdf", "zip", "tar", "gz", "mp4", "webm", "mp3",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    None,
    Cookies,
    Header,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    /// Header name when `mode = "header"` (e.g. "Authorization").
    #[serde(default)]
    pub header_name: String,
    /// Cookie string or header value depending on mode.
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    pub root_dir: PathBuf,
    #[serde(default = "default_pages_under")]
    pub store_pages_under: String,
    #[serde(default = "default_js_under")]
    pub store_js_under: String,
    #[serde(default = "default_api_under")]
    pub store_api_under: String,
}

/// Git hand-off settings. The committer itself is an external collaborator;
/// these fields are carried so the hand-off event can describe the target.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct GitConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub commit_every_files: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FetcherMode {
    #[default]
    Http,
    Browserless,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FetcherConfig {
    #[serde(default)]
    pub mode: FetcherMode,
    #[serde(default)]
    pub browserless_url: String,
    #[serde(default)]
    pub browserless_token: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_body_html")]
    pub max_body_bytes_html: u64,
    #[serde(default = "default_body_js")]
    pub max_body_bytes_js: u64,
    #[serde(default = "default_body_api")]
    pub max_body_bytes_api: u64,
    /// Failed / attempted fetch ratio above which the run stops.
    #[serde(default = "default_error_rate_max")]
    pub error_rate_max: f64,
    /// Wall-clock bound for the whole run, in seconds.
    #[serde(default = "default_time_max_s")]
    pub time_max_s: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            mode: FetcherMode::Http,
            browserless_url: String::new(),
            browserless_token: String::new(),
            max_retries: default_max_retries(),
            max_body_bytes_html: default_body_html(),
            max_body_bytes_js: default_body_js(),
            max_body_bytes_api: default_body_api(),
            error_rate_max: default_error_rate_max(),
            time_max_s: default_time_max_s(),
        }
    }
}

/// Weights for work-item scoring. Defaults match the tuning the heuristics
/// were calibrated with; override under `[scoring]` when needed.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ScoringWeights {
    pub w_type: f64,
    pub w_depth: f64,
    pub w_novelty: f64,
    pub w_family: f64,
    pub w_noise: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            w_type: 0.35,
            w_depth: 0.35,
            w_novelty: 0.2,
            w_family: 0.3,
            w_noise: 0.15,
        }
    }
}

fn default_depth_max() -> u32 {
    3
}
fn default_timeout_ms() -> u64 {
    20_000
}
fn default_rate_limit_rps() -> f64 {
    2.0
}
fn default_concurrency() -> usize {
    4
}
fn default_true() -> bool {
    true
}
fn default_pages_under() -> String {
    "pages".to_string()
}
fn default_js_under() -> String {
    "js".to_string()
}
fn default_api_under() -> String {
    "api".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_body_html() -> u64 {
    3_000_000
}
fn default_body_js() -> u64 {
    5_000_000
}
fn default_body_api() -> u64 {
    2_000_000
}
fn default_error_rate_max() -> f64 {
    0.5
}
fn default_time_max_s() -> u64 {
    1800
}

/// Load, hash and validate a TOML config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config.config_hash = crate::sha256_hex(content.as_bytes());

    if let Ok(value) = std::env::var("STRIDER_AUTH_VALUE") {
        if !value.is_empty() {
            config.auth.value = value;
        }
    }

    config.validate()?;
    Ok(config)
}

impl Config {
    /// Structural validation beyond what serde can express.
    pub fn validate(&self) -> Result<()> {
        if self.target.base_urls.is_empty() {
            bail!("target.base_urls must not be empty");
        }
        for url in &self.target.base_urls {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                bail!("target.base_urls entry is not http(s): {url}");
            }
        }
        if self.target.allowed_domains.is_empty() {
            bail!("target.allowed_domains must not be empty");
        }
        let b = &self.crawl.budgets;
        if b.pages_max == 0 || b.js_max == 0 || b.api_max == 0 {
            bail!("crawl.budgets must all be greater than zero");
        }
        if self.crawl.rate_limit_rps <= 0.0 {
            bail!("crawl.rate_limit_rps must be positive");
        }
        if self.crawl.concurrency == 0 {
            bail!("crawl.concurrency must be at least 1");
        }
        if self.heuristics.simhash_shingle_size < 2 {
            bail!("heuristics.simhash_shingle_size must be at least 2");
        }
        if !(0.0..=1.0).contains(&self.heuristics.html_similarity_drop) {
            bail!("heuristics.html_similarity_drop must be within [0, 1]");
        }
        if self.auth.mode == AuthMode::Header && self.auth.header_name.is_empty() {
            bail!("auth.header_name is required when auth.mode = \"header\"");
        }
        if self.fetcher.mode == FetcherMode::Browserless && self.fetcher.browserless_url.is_empty()
        {
            bail!("fetcher.browserless_url is required when fetcher.mode = \"browserless\"");
        }
        Ok(())
    }

    /// The primary target, used for manifest metadata and log context.
    pub fn primary_target(&self) -> &str {
        self.target
            .base_urls
            .first()
            .map(String::as_str)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [target]
        base_urls = ["https://app.example.org"]
        allowed_domains = ["example.org"]

        [crawl]
        [crawl.budgets]
        pages_max = 10
        js_max = 5
        api_max = 5

        [output]
        root_dir = "/tmp/out"
    "#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.crawl.depth_max, 3);
        assert_eq!(config.heuristics.family_max_samples, 3);
        assert_eq!(config.output.store_pages_under, "pages");
        assert!(config.crawl.normalize_query.sort_params);
        assert!((config.scoring.w_type - 0.35).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_base_urls_rejected() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.target.base_urls.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_http_seed_rejected() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.target.base_urls = vec!["ftp://example.org".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_budget_rejected() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.crawl.budgets.pages_max = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn header_auth_requires_name() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.auth.mode = AuthMode::Header;
        assert!(config.validate().is_err());
        config.auth.header_name = "Authorization".into();
        config.validate().unwrap();
    }

    #[test]
    fn unknown_field_rejected() {
        let bad = format!("{MINIMAL}\n[surprise]\nx = 1\n");
        assert!(toml::from_str::<Config>(&bad).is_err());
    }
}
