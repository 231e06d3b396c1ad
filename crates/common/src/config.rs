use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level cidrwatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub jail_file: Option<PathBuf>,
    #[serde(default)]
    pub ban_file: Option<PathBuf>,
    /// Global IP whitelist file (one IP or CIDR per line).
    #[serde(default)]
    pub whitelist: Option<PathBuf>,
    /// Global IP blacklist file (one IP or CIDR per line).
    #[serde(default)]
    pub blacklist: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Jail tiers, lowest first. Empty means the built-in defaults.
    #[serde(default)]
    pub jail_cells: Vec<CellConfig>,
    /// Named trie configurations, each bundling a filter stack and recipes.
    #[serde(default)]
    pub tries: Vec<TrieConfig>,
    #[serde(default)]
    pub live: LiveConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            jail_file: None,
            ban_file: None,
            whitelist: None,
            blacklist: None,
            log_format: default_log_format(),
            jail_cells: vec![],
            tries: vec![],
            live: LiveConfig::default(),
        }
    }
}

/// One jail tier: a description and how long its bans last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellConfig {
    pub description: String,
    pub duration_secs: u64,
}

/// A named bundle of one trie, one filter stack and one or more recipes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrieConfig {
    pub name: String,
    #[serde(default)]
    pub filters: FilterSpec,
    pub recipes: Vec<RecipeConfig>,
}

/// Parameters of a single detection pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeConfig {
    pub min_size: u32,
    #[serde(default)]
    pub min_depth: u8,
    #[serde(default = "default_max_depth")]
    pub max_depth: u8,
    #[serde(default)]
    pub threshold: f64,
    #[serde(default = "default_true")]
    pub use_for_jail: bool,
}

/// Declarative filter stack for one trie configuration.
///
/// Whitelists reject matching requests (trusted traffic is excluded from
/// analysis); blacklists, when non-empty, reject everything that does not
/// match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterSpec {
    /// Inline CIDR entries, merged with the global whitelist file.
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub useragent_whitelist: Vec<String>,
    #[serde(default)]
    pub useragent_blacklist: Vec<String>,
    #[serde(default)]
    pub useragent_regex: Option<String>,
    #[serde(default)]
    pub endpoint_regex: Option<String>,
    /// Restrict analysis to these ranges when non-empty.
    #[serde(default)]
    pub ranges_cidr: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_window_max_secs")]
    pub sliding_window_max_secs: u64,
    #[serde(default = "default_window_max_size")]
    pub sliding_window_max_size: usize,
    #[serde(default = "default_sleep_secs")]
    pub sleep_between_iterations_secs: u64,
    #[serde(default = "default_batch_queue_capacity")]
    pub batch_queue_capacity: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            sliding_window_max_secs: default_window_max_secs(),
            sliding_window_max_size: default_window_max_size(),
            sleep_between_iterations_secs: default_sleep_secs(),
            batch_queue_capacity: default_batch_queue_capacity(),
        }
    }
}

// Default value helpers
fn default_log_format() -> String {
    "$remote_addr - - [$time_local] \"$request\" $status $bytes \"$http_referer\" \"$http_user_agent\""
        .to_string()
}
fn default_max_depth() -> u8 {
    32
}
fn default_true() -> bool {
    true
}
fn default_port() -> u16 {
    5044
}
fn default_window_max_secs() -> u64 {
    3600
}
fn default_window_max_size() -> usize {
    1_000_000
}
fn default_sleep_secs() -> u64 {
    30
}
fn default_batch_queue_capacity() -> usize {
    1000
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> anyhow::Result<()> {
        for trie in &self.tries {
            if trie.recipes.is_empty() {
                anyhow::bail!("trie configuration '{}' has no recipes", trie.name);
            }
            let dup = self
                .tries
                .iter()
                .filter(|other| other.name == trie.name)
                .count();
            if dup > 1 {
                anyhow::bail!("duplicate trie configuration name '{}'", trie.name);
            }
            for recipe in &trie.recipes {
                recipe.validate(&trie.name)?;
            }
            if let (Some(start), Some(end)) = (trie.filters.start_time, trie.filters.end_time) {
                if start > end {
                    anyhow::bail!(
                        "trie configuration '{}': start_time is after end_time",
                        trie.name
                    );
                }
            }
        }

        for cell in &self.jail_cells {
            if cell.duration_secs == 0 {
                anyhow::bail!("jail cell '{}' has zero duration", cell.description);
            }
        }

        if self.live.sleep_between_iterations_secs == 0 {
            anyhow::bail!("live.sleep_between_iterations_secs must be positive");
        }
        if self.live.sliding_window_max_size == 0 {
            anyhow::bail!("live.sliding_window_max_size must be positive");
        }

        Ok(())
    }
}

impl RecipeConfig {
    pub fn validate(&self, trie_name: &str) -> anyhow::Result<()> {
        if self.min_depth > self.max_depth {
            anyhow::bail!(
                "trie configuration '{}': recipe min_depth {} exceeds max_depth {}",
                trie_name,
                self.min_depth,
                self.max_depth
            );
        }
        if self.max_depth > 32 {
            anyhow::bail!(
                "trie configuration '{}': recipe max_depth {} exceeds 32",
                trie_name,
                self.max_depth
            );
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            anyhow::bail!(
                "trie configuration '{}': recipe threshold {} outside 0..=1",
                trie_name,
                self.threshold
            );
        }
        Ok(())
    }
}
