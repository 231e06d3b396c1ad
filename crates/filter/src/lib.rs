//! The admission pipeline deciding which parsed requests reach a trie.
//!
//! Stages run in a fixed order so cheap, high-selectivity rejections come
//! first. Whitelists drop matching traffic (trusted sources are not
//! analyzed); blacklists, when present, drop everything else.

pub mod cache;
pub mod cidr_set;

use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cidrwatch_common::{CidrwatchError, FilterSpec, Request};
use cidrwatch_net::parse_list_entry;
use regex::Regex;
use tracing::warn;

pub use cidr_set::CidrSet;

/// The pipeline stage that rejected a request. `None` from
/// [`FilterChain::check`] means admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectStage {
    IpWhitelist,
    IpBlacklist,
    TimeWindow,
    UseragentWhitelist,
    UseragentBlacklist,
    UseragentRegex,
    EndpointRegex,
    FocusRanges,
}

impl RejectStage {
    pub const ALL: [RejectStage; 8] = [
        RejectStage::IpWhitelist,
        RejectStage::IpBlacklist,
        RejectStage::TimeWindow,
        RejectStage::UseragentWhitelist,
        RejectStage::UseragentBlacklist,
        RejectStage::UseragentRegex,
        RejectStage::EndpointRegex,
        RejectStage::FocusRanges,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RejectStage::IpWhitelist => "ip_whitelist",
            RejectStage::IpBlacklist => "ip_blacklist",
            RejectStage::TimeWindow => "time_window",
            RejectStage::UseragentWhitelist => "useragent_whitelist",
            RejectStage::UseragentBlacklist => "useragent_blacklist",
            RejectStage::UseragentRegex => "useragent_regex",
            RejectStage::EndpointRegex => "endpoint_regex",
            RejectStage::FocusRanges => "focus_ranges",
        }
    }

    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|stage| stage == self).unwrap()
    }
}

/// A compiled filter stack for one trie configuration.
///
/// Construction resolves every pattern through the process-wide caches, so
/// chains sharing a pattern share its compilation.
#[derive(Clone)]
pub struct FilterChain {
    ip_whitelist: Option<Arc<CidrSet>>,
    ip_blacklist: Option<Arc<CidrSet>>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    ua_whitelist: Vec<String>,
    ua_blacklist: Vec<String>,
    ua_regex: Option<Arc<Regex>>,
    endpoint_regex: Option<Arc<Regex>>,
    focus: Option<Arc<CidrSet>>,
}

impl FilterChain {
    /// Compile a chain from its declarative spec plus entries loaded from the
    /// global whitelist/blacklist files.
    pub fn from_spec(
        spec: &FilterSpec,
        file_whitelist: &[String],
        file_blacklist: &[String],
    ) -> Result<Self, CidrwatchError> {
        let whitelist = merged(&spec.whitelist, file_whitelist);
        let blacklist = merged(&spec.blacklist, file_blacklist);

        Ok(Self {
            ip_whitelist: non_empty_set(&whitelist)?,
            ip_blacklist: non_empty_set(&blacklist)?,
            start_time: spec.start_time,
            end_time: spec.end_time,
            ua_whitelist: spec.useragent_whitelist.clone(),
            ua_blacklist: spec.useragent_blacklist.clone(),
            ua_regex: spec
                .useragent_regex
                .as_deref()
                .map(cache::compiled_regex)
                .transpose()?,
            endpoint_regex: spec
                .endpoint_regex
                .as_deref()
                .map(cache::compiled_regex)
                .transpose()?,
            focus: non_empty_set(&spec.ranges_cidr)?,
        })
    }

    /// An empty chain that admits everything.
    pub fn pass_all() -> Self {
        Self {
            ip_whitelist: None,
            ip_blacklist: None,
            start_time: None,
            end_time: None,
            ua_whitelist: vec![],
            ua_blacklist: vec![],
            ua_regex: None,
            endpoint_regex: None,
            focus: None,
        }
    }

    /// Run the stages in order; the first rejection wins.
    pub fn check(&self, request: &Request) -> Option<RejectStage> {
        if let Some(set) = &self.ip_whitelist {
            if set.contains(request.addr) {
                return Some(RejectStage::IpWhitelist);
            }
        }
        if let Some(set) = &self.ip_blacklist {
            if !set.contains(request.addr) {
                return Some(RejectStage::IpBlacklist);
            }
        }
        if let Some(start) = self.start_time {
            if request.timestamp < start {
                return Some(RejectStage::TimeWindow);
            }
        }
        if let Some(end) = self.end_time {
            if request.timestamp > end {
                return Some(RejectStage::TimeWindow);
            }
        }
        if self
            .ua_whitelist
            .iter()
            .any(|needle| request.user_agent.contains(needle.as_str()))
        {
            return Some(RejectStage::UseragentWhitelist);
        }
        if !self.ua_blacklist.is_empty()
            && !self
                .ua_blacklist
                .iter()
                .any(|needle| request.user_agent.contains(needle.as_str()))
        {
            return Some(RejectStage::UseragentBlacklist);
        }
        if let Some(regex) = &self.ua_regex {
            if !regex.is_match(&request.user_agent) {
                return Some(RejectStage::UseragentRegex);
            }
        }
        if let Some(regex) = &self.endpoint_regex {
            if !regex.is_match(&request.uri) {
                return Some(RejectStage::EndpointRegex);
            }
        }
        if let Some(set) = &self.focus {
            if !set.contains(request.addr) {
                return Some(RejectStage::FocusRanges);
            }
        }
        None
    }

    /// Admission shorthand.
    pub fn admits(&self, request: &Request) -> bool {
        self.check(request).is_none()
    }
}

fn merged(inline: &[String], from_file: &[String]) -> Vec<String> {
    let mut entries = inline.to_vec();
    entries.extend(from_file.iter().cloned());
    entries
}

fn non_empty_set(entries: &[String]) -> Result<Option<Arc<CidrSet>>, CidrwatchError> {
    if entries.is_empty() {
        Ok(None)
    } else {
        cache::cidr_set(entries).map(Some)
    }
}

/// Read an IP list file: one IP or CIDR per line, `#` comments and blank
/// lines skipped, unparseable lines dropped with a warning.
pub fn load_list_file(path: &Path) -> Result<Vec<String>, CidrwatchError> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);

    let mut entries = Vec::new();
    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match parse_list_entry(trimmed) {
            Ok(_) => entries.push(trimmed.to_string()),
            Err(_) => warn!(
                path = %path.display(),
                line = line_num + 1,
                content = trimmed,
                "skipping unparseable list entry"
            ),
        }
    }
    Ok(entries)
}
