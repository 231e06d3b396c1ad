//! Process-wide memo caches for compiled filter machinery.
//!
//! Recipes across trie configurations frequently repeat the same regex or the
//! same CIDR list; both are compiled once and shared by pattern text.

use std::sync::Arc;

use cidrwatch_common::CidrwatchError;
use cidrwatch_net::{parse_list_entry, Cidr};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::cidr_set::CidrSet;

static REGEXES: Lazy<DashMap<String, Arc<Regex>>> = Lazy::new(DashMap::new);

static CIDR_SETS: Lazy<DashMap<String, Arc<CidrSet>>> = Lazy::new(DashMap::new);

/// Compile `pattern`, or reuse the shared compilation for it.
pub fn compiled_regex(pattern: &str) -> Result<Arc<Regex>, CidrwatchError> {
    if let Some(existing) = REGEXES.get(pattern) {
        return Ok(Arc::clone(&existing));
    }
    let compiled = Regex::new(pattern).map_err(|e| CidrwatchError::Regex {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })?;
    let compiled = Arc::new(compiled);
    debug!(pattern, "compiled filter regex");
    REGEXES
        .entry(pattern.to_string())
        .or_insert_with(|| Arc::clone(&compiled));
    Ok(compiled)
}

/// Build a membership set from textual entries, or reuse the shared one.
///
/// The cache key is the entry list itself, newline-joined, so configurations
/// naming the same ranges share one structure.
pub fn cidr_set(entries: &[String]) -> Result<Arc<CidrSet>, CidrwatchError> {
    let key = entries.join("\n");
    if let Some(existing) = CIDR_SETS.get(&key) {
        return Ok(Arc::clone(&existing));
    }

    let mut cidrs: Vec<Cidr> = Vec::with_capacity(entries.len());
    for entry in entries {
        cidrs.push(parse_list_entry(entry)?);
    }
    let set = Arc::new(CidrSet::from_cidrs(&cidrs));
    debug!(entries = entries.len(), ranges = set.len(), "built CIDR set");
    CIDR_SETS.entry(key).or_insert_with(|| Arc::clone(&set));
    Ok(set)
}
