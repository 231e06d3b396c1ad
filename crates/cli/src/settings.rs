//! Merging the YAML configuration with command-line flags into the runtime
//! settings the orchestrators consume. Flags override file values.

use std::path::PathBuf;

use anyhow::Context;
use cidrwatch_common::{AppConfig, CellConfig, FilterSpec, LiveConfig};
use cidrwatch_detect::Recipe;
use cidrwatch_filter::{load_list_file, FilterChain};
use cidrwatch_logparse::LogFormat;

use crate::args::{CommonArgs, LiveArgs};

const DEFAULT_JAIL_FILE: &str = "cidrwatch-jail.yaml";
const DEFAULT_BAN_FILE: &str = "cidrwatch-bans.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Plain,
    Compact,
    Tui,
}

/// One resolved trie configuration: compiled filters plus validated recipes.
pub struct TrieSettings {
    pub name: String,
    pub chain: FilterChain,
    pub recipes: Vec<Recipe>,
}

pub struct Settings {
    pub jail_file: PathBuf,
    pub ban_file: PathBuf,
    pub jail_cells: Vec<CellConfig>,
    pub log_format: LogFormat,
    pub tries: Vec<TrieSettings>,
    pub output: OutputMode,
    pub live: LiveConfig,
}

impl Settings {
    pub fn build(common: &CommonArgs, log_format_flag: Option<&str>) -> anyhow::Result<Self> {
        let config = match &common.config {
            Some(path) => AppConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => AppConfig::default(),
        };

        let jail_file = common
            .jail_file
            .clone()
            .or_else(|| config.jail_file.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_JAIL_FILE));
        let ban_file = common
            .ban_file
            .clone()
            .or_else(|| config.ban_file.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BAN_FILE));

        let whitelist_path = common.whitelist.clone().or_else(|| config.whitelist.clone());
        let file_whitelist = match &whitelist_path {
            Some(path) => load_list_file(path)
                .with_context(|| format!("loading whitelist {}", path.display()))?,
            None => vec![],
        };
        let blacklist_path = common.blacklist.clone().or_else(|| config.blacklist.clone());
        let file_blacklist = match &blacklist_path {
            Some(path) => load_list_file(path)
                .with_context(|| format!("loading blacklist {}", path.display()))?,
            None => vec![],
        };

        let template = log_format_flag.unwrap_or(&config.log_format);
        let log_format =
            LogFormat::from_template(template).context("compiling log format template")?;

        let mut tries = Vec::new();
        for trie_config in &config.tries {
            let chain =
                FilterChain::from_spec(&trie_config.filters, &file_whitelist, &file_blacklist)
                    .with_context(|| format!("trie configuration '{}'", trie_config.name))?;
            let mut recipes = Vec::with_capacity(trie_config.recipes.len());
            for recipe in &trie_config.recipes {
                recipes.push(
                    Recipe::new(
                        recipe.min_size,
                        recipe.min_depth,
                        recipe.max_depth,
                        recipe.threshold,
                    )
                    .with_context(|| format!("trie configuration '{}'", trie_config.name))?
                    .with_jail(recipe.use_for_jail),
                );
            }
            tries.push(TrieSettings {
                name: trie_config.name.clone(),
                chain,
                recipes,
            });
        }

        // Bare --clusterArgSets flags form one configuration of their own,
        // carrying the command-line filter flags.
        if !common.cluster_arg_sets.is_empty() {
            let spec = FilterSpec {
                start_time: common.start_time,
                end_time: common.end_time,
                useragent_regex: common.useragent_regex.clone(),
                endpoint_regex: common.endpoint_regex.clone(),
                ranges_cidr: common.ranges_cidr.clone(),
                ..FilterSpec::default()
            };
            let chain = FilterChain::from_spec(&spec, &file_whitelist, &file_blacklist)
                .context("command-line filter flags")?;
            let mut recipes = Vec::with_capacity(common.cluster_arg_sets.len());
            for arg_set in &common.cluster_arg_sets {
                recipes.push(arg_set.parse::<Recipe>()?);
            }
            let name = if tries.iter().any(|t| t.name == "default") {
                "cli".to_string()
            } else {
                "default".to_string()
            };
            tries.push(TrieSettings {
                name,
                chain,
                recipes,
            });
        }

        if tries.is_empty() {
            anyhow::bail!(
                "no detection recipes configured; pass --clusterArgSets or configure tries in the config file"
            );
        }

        let output = if common.tui {
            OutputMode::Tui
        } else if common.compact {
            OutputMode::Compact
        } else {
            OutputMode::Plain
        };

        Ok(Self {
            jail_file,
            ban_file,
            jail_cells: config.jail_cells.clone(),
            log_format,
            tries,
            output,
            live: config.live,
        })
    }

    /// Fold the live-mode flags over the configured values.
    pub fn apply_live_flags(&mut self, args: &LiveArgs) {
        if let Some(port) = args.port {
            self.live.port = port;
        }
        if let Some(max_secs) = args.sliding_window_max_time {
            self.live.sliding_window_max_secs = max_secs;
        }
        if let Some(max_size) = args.sliding_window_max_size {
            self.live.sliding_window_max_size = max_size;
        }
    }
}
