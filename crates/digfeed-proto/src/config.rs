use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Best-effort cache of probe counts, seen ids and channel archives.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// How the sampler behaves when every hit on a drawn page was already seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum NoveltyPolicy {
    /// Return an already-seen hit instead of drawing again.
    #[default]
    ReuseSeen,
    /// Draw up to `attempts` other pages before reusing seen hits.
    Reprobe { attempts: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_api_base")]
    pub api_base: String,
    /// Personal access token; anonymous requests get a much lower rate budget.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    /// Pages beyond this are never requested, whatever the catalog reports.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_pool_depth")]
    pub pool_depth: usize,
    #[serde(default = "default_seen_capacity")]
    pub seen_capacity: usize,
    #[serde(default = "default_probe_ttl_hours")]
    pub probe_ttl_hours: i64,
    #[serde(default = "default_true")]
    pub fetch_details: bool,
    #[serde(default)]
    pub novelty: NoveltyPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSource {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default = "default_feed_base")]
    pub feed_base: String,
    #[serde(default = "default_video_api_base")]
    pub api_base: String,
    /// Required for the paginated listing and for media search.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub sources: Vec<ChannelSource>,
    #[serde(default = "default_free_feed_cap")]
    pub free_feed_cap: usize,
    #[serde(default = "default_archive_page_delay_ms")]
    pub archive_page_delay_ms: u64,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_seen_capacity")]
    pub seen_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_raw_target")]
    pub raw_target: usize,
    #[serde(default = "default_ready_target")]
    pub ready_target: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_look_behind")]
    pub look_behind: usize,
    #[serde(default = "default_look_ahead")]
    pub look_ahead: usize,
    /// Slots kept materialized ahead of the current position.
    #[serde(default = "default_lookahead_slots")]
    pub lookahead_slots: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_rate_limit_base_ms")]
    pub rate_limit_base_ms: u64,
    #[serde(default = "default_transient_base_ms")]
    pub transient_base_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            api_base: default_catalog_api_base(),
            token: None,
            user_agent: default_user_agent(),
            min_interval_ms: default_min_interval_ms(),
            per_page: default_per_page(),
            max_pages: default_max_pages(),
            pool_depth: default_pool_depth(),
            seen_capacity: default_seen_capacity(),
            probe_ttl_hours: default_probe_ttl_hours(),
            fetch_details: default_true(),
            novelty: NoveltyPolicy::default(),
        }
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            feed_base: default_feed_base(),
            api_base: default_video_api_base(),
            api_key: None,
            sources: Vec::new(),
            free_feed_cap: default_free_feed_cap(),
            archive_page_delay_ms: default_archive_page_delay_ms(),
            min_interval_ms: default_min_interval_ms(),
            seen_capacity: default_seen_capacity(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            raw_target: default_raw_target(),
            ready_target: default_ready_target(),
            poll_interval_ms: default_poll_interval_ms(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            look_behind: default_look_behind(),
            look_ahead: default_look_ahead(),
            lookahead_slots: default_lookahead_slots(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            rate_limit_base_ms: default_rate_limit_base_ms(),
            transient_base_ms: default_transient_base_ms(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

fn default_catalog_api_base() -> String {
    "https://api.discogs.com".to_string()
}

fn default_user_agent() -> String {
    concat!("digfeed/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_min_interval_ms() -> u64 {
    400
}

fn default_per_page() -> u32 {
    50
}

fn default_max_pages() -> u32 {
    100
}

fn default_pool_depth() -> usize {
    3
}

fn default_seen_capacity() -> usize {
    1000
}

fn default_probe_ttl_hours() -> i64 {
    24
}

fn default_feed_base() -> String {
    "https://www.youtube.com/feeds/videos.xml".to_string()
}

fn default_video_api_base() -> String {
    "https://www.googleapis.com/youtube/v3".to_string()
}

fn default_free_feed_cap() -> usize {
    15
}

fn default_archive_page_delay_ms() -> u64 {
    1500
}

fn default_raw_target() -> usize {
    15
}

fn default_ready_target() -> usize {
    5
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_look_behind() -> usize {
    1
}

fn default_look_ahead() -> usize {
    3
}

fn default_lookahead_slots() -> usize {
    8
}

fn default_max_attempts() -> u32 {
    5
}

fn default_rate_limit_base_ms() -> u64 {
    2000
}

fn default_transient_base_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    1.5
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load from `path`, writing the defaults there first if it does not exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8990);
        assert_eq!(config.catalog.min_interval_ms, 400);
        assert_eq!(config.catalog.novelty, NoveltyPolicy::ReuseSeen);
        assert_eq!(config.pipeline.raw_target, 15);
        assert_eq!(config.pipeline.ready_target, 5);
        assert_eq!(config.window.look_behind, 1);
        assert_eq!(config.window.look_ahead, 3);
        assert_eq!(config.window.lookahead_slots, 8);
        assert_eq!(config.retry.multiplier, 1.5);
        assert!(config.daemon.state_file.ends_with("digfeed/state.json"));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let toml = r#"
            [catalog]
            token = "abc"
            novelty = { policy = "reprobe", attempts = 2 }

            [[channels.sources]]
            id = "UC123"
            name = "Some Channel"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.catalog.token.as_deref(), Some("abc"));
        assert_eq!(config.catalog.per_page, 50);
        assert_eq!(config.catalog.novelty, NoveltyPolicy::Reprobe { attempts: 2 });
        assert_eq!(config.channels.sources.len(), 1);
        assert_eq!(config.channels.free_feed_cap, 15);
        assert_eq!(config.http.bind_address, "127.0.0.1");
    }

    #[test]
    fn test_load_from_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.http.port, 8990);

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.catalog.api_base, config.catalog.api_base);
    }
}
