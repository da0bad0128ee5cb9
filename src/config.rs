use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub drafts: DraftsConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub costs: CostConfig,
    #[serde(default)]
    pub render: RenderConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DraftsConfig {
    #[serde(default = "default_drafts_path")]
    pub path: PathBuf,
    /// Quiet period after the last edit before the working text is saved.
    #[serde(default = "default_idle_ms")]
    pub idle_ms: u64,
}

impl DraftsConfig {
    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }
}

impl Default for DraftsConfig {
    fn default() -> Self {
        Self {
            path: default_drafts_path(),
            idle_ms: default_idle_ms(),
        }
    }
}

fn default_drafts_path() -> PathBuf {
    PathBuf::from("./data/drafts.sqlite")
}
fn default_idle_ms() -> u64 {
    1500
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct LimitsConfig {
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
    #[serde(default = "default_max_blob_bytes")]
    pub max_blob_bytes: usize,
    #[serde(default = "default_single_call_budget")]
    pub single_call_budget: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_text_chars: default_max_text_chars(),
            max_blob_bytes: default_max_blob_bytes(),
            single_call_budget: default_single_call_budget(),
        }
    }
}

fn default_max_text_chars() -> usize {
    40_000
}
fn default_max_blob_bytes() -> usize {
    460_800
}
fn default_single_call_budget() -> usize {
    1_900_000
}

/// Unit costs charged for publishing, used for the pre-submit estimate.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct CostConfig {
    #[serde(default = "default_post_cost")]
    pub post: u64,
    #[serde(default = "default_tag_cost")]
    pub tag: u64,
    #[serde(default = "default_blob_cost")]
    pub blob: u64,
    #[serde(default = "default_poll_cost")]
    pub poll: u64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            post: default_post_cost(),
            tag: default_tag_cost(),
            blob: default_blob_cost(),
            poll: default_poll_cost(),
        }
    }
}

fn default_post_cost() -> u64 {
    2
}
fn default_tag_cost() -> u64 {
    3
}
fn default_blob_cost() -> u64 {
    10
}
fn default_poll_cost() -> u64 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct RenderConfig {
    #[serde(default = "default_max_transclusion_depth")]
    pub max_transclusion_depth: usize,
    #[serde(default = "default_max_resolve_passes")]
    pub max_resolve_passes: usize,
    #[serde(default = "default_feed_prefix")]
    pub feed_prefix: String,
    #[serde(default = "default_user_prefix")]
    pub user_prefix: String,
    /// Origin of the app itself, e.g. `https://app.example`. Absolute post
    /// links are only transcluded when they point here; relative ones
    /// (`/post/<id>`, `#/post/<id>`) always are.
    #[serde(default)]
    pub app_origin: Option<String>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            max_transclusion_depth: default_max_transclusion_depth(),
            max_resolve_passes: default_max_resolve_passes(),
            feed_prefix: default_feed_prefix(),
            user_prefix: default_user_prefix(),
            app_origin: None,
        }
    }
}

fn default_max_transclusion_depth() -> usize {
    4
}
fn default_max_resolve_passes() -> usize {
    6
}
fn default_feed_prefix() -> String {
    "#/feed/".to_string()
}
fn default_user_prefix() -> String {
    "#/user/".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Load the config file when it exists, otherwise fall back to defaults.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        Ok(Config::default())
    }
}

fn validate(config: &Config) -> Result<()> {
    // Validate limits
    if config.limits.max_text_chars == 0 {
        anyhow::bail!("limits.max_text_chars must be > 0");
    }
    if config.limits.max_blob_bytes == 0 {
        anyhow::bail!("limits.max_blob_bytes must be > 0");
    }
    if config.limits.single_call_budget < config.limits.max_blob_bytes {
        anyhow::bail!("limits.single_call_budget must be >= limits.max_blob_bytes");
    }

    // Validate drafts
    if config.drafts.idle_ms == 0 {
        anyhow::bail!("drafts.idle_ms must be > 0");
    }

    // Validate render
    if config.render.max_resolve_passes == 0 {
        anyhow::bail!("render.max_resolve_passes must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_sections_missing() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.limits.max_blob_bytes, 460_800);
        assert_eq!(config.render.max_transclusion_depth, 4);
        assert_eq!(config.drafts.idle_ms, 1500);
        validate(&config).unwrap();
    }

    #[test]
    fn test_partial_section() {
        let config: Config = toml::from_str(
            r#"
            [limits]
            single_call_budget = 1000000

            [render]
            max_transclusion_depth = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.limits.single_call_budget, 1_000_000);
        assert_eq!(config.limits.max_text_chars, 40_000);
        assert_eq!(config.render.max_transclusion_depth, 2);
        assert_eq!(config.render.feed_prefix, "#/feed/");
    }

    #[test]
    fn test_rejects_inconsistent_budget() {
        let config: Config = toml::from_str(
            r#"
            [limits]
            max_blob_bytes = 2000
            single_call_budget = 1000
            "#,
        )
        .unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("folio.toml");
        std::fs::write(&path, "[drafts]\nidle_ms = 250\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.drafts.idle_ms, 250);

        let missing = dir.path().join("missing.toml");
        assert!(load_config(&missing).is_err());
        assert_eq!(load_or_default(&missing).unwrap().drafts.idle_ms, 1500);
    }
}
