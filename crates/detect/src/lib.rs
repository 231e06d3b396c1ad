//! Cluster detection: search a counting trie for CIDR ranges holding a
//! disproportionate share of traffic.
//!
//! The walk is a depth-limited DFS with an ancestor-wins emission rule: a
//! node that qualifies is emitted and its subtree skipped, so one pass never
//! produces overlapping ranges.

pub mod parallel;

use std::str::FromStr;

use cidrwatch_common::CidrwatchError;
use cidrwatch_net::Cidr;
use cidrwatch_trie::{Trie, ROOT};

pub use parallel::detect_parallel;

/// Parameters of one detection pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Recipe {
    pub min_size: u32,
    pub min_depth: u8,
    pub max_depth: u8,
    pub threshold: f64,
    pub use_for_jail: bool,
}

impl Recipe {
    pub fn new(
        min_size: u32,
        min_depth: u8,
        max_depth: u8,
        threshold: f64,
    ) -> Result<Self, CidrwatchError> {
        if min_depth > max_depth {
            return Err(CidrwatchError::Recipe(format!(
                "min_depth {} exceeds max_depth {}",
                min_depth, max_depth
            )));
        }
        if max_depth > 32 {
            return Err(CidrwatchError::Recipe(format!(
                "max_depth {} exceeds 32",
                max_depth
            )));
        }
        if !(0.0..=1.0).contains(&threshold) {
            return Err(CidrwatchError::Recipe(format!(
                "threshold {} outside 0..=1",
                threshold
            )));
        }
        Ok(Self {
            min_size,
            min_depth,
            max_depth,
            threshold,
            use_for_jail: true,
        })
    }

    pub fn with_jail(mut self, use_for_jail: bool) -> Self {
        self.use_for_jail = use_for_jail;
        self
    }
}

impl FromStr for Recipe {
    type Err = CidrwatchError;

    /// Parse the `"min,minDepth,maxDepth,threshold"` flag form.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = text.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(CidrwatchError::Recipe(format!(
                "'{}': expected min,minDepth,maxDepth,threshold",
                text
            )));
        }
        let bad = |field: &str| CidrwatchError::Recipe(format!("'{}': bad {}", text, field));
        let min_size: u32 = parts[0].parse().map_err(|_| bad("min"))?;
        let min_depth: u8 = parts[1].parse().map_err(|_| bad("minDepth"))?;
        let max_depth: u8 = parts[2].parse().map_err(|_| bad("maxDepth"))?;
        let threshold: f64 = parts[3].parse().map_err(|_| bad("threshold"))?;
        Recipe::new(min_size, min_depth, max_depth, threshold)
    }
}

/// One detected range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CidrMatch {
    pub cidr: Cidr,
    pub count: u32,
    /// Share of the trie's total, in `0.0..=1.0`.
    pub percentage: f64,
}

/// Run one sequential detection pass over the whole trie.
pub fn detect(trie: &Trie, recipe: &Recipe) -> Vec<CidrMatch> {
    let total = trie.total();
    if total == 0 {
        return vec![];
    }
    let mut matches = Vec::new();
    walk(trie, ROOT, 0, 0, recipe, total, &mut matches);
    matches
}

/// DFS under `node`, emitting qualifying ranges and skipping their subtrees.
///
/// A qualifying node is narrowed before emission: while exactly one child
/// also qualifies, the walk follows it, so a chain of prefixes all holding
/// the same cluster resolves to its tightest CIDR. Where the mass splits
/// (both children qualify) the ancestor wins and the subtree is skipped.
pub(crate) fn walk(
    trie: &Trie,
    node: u32,
    prefix: u32,
    depth: u8,
    recipe: &Recipe,
    total: u32,
    out: &mut Vec<CidrMatch>,
) {
    if depth > recipe.max_depth {
        return;
    }
    if depth < recipe.min_depth {
        for bit in [0usize, 1] {
            if let Some(child) = trie.child(node, bit) {
                let child_prefix = prefix | ((bit as u32) << (31 - depth));
                walk(trie, child, child_prefix, depth + 1, recipe, total, out);
            }
        }
        return;
    }

    let count = trie.count_at(node);
    let percentage = f64::from(count) / f64::from(total);
    if count < recipe.min_size || percentage < recipe.threshold {
        // Counts only shrink with depth; nothing below can qualify either.
        return;
    }

    if depth < recipe.max_depth {
        if let Some((child, bit)) = sole_qualifying_child(trie, node, recipe, total) {
            let child_prefix = prefix | ((bit as u32) << (31 - depth));
            walk(trie, child, child_prefix, depth + 1, recipe, total, out);
            return;
        }
    }

    out.push(CidrMatch {
        cidr: Cidr::new(prefix, depth).expect("depth bounded by 32"),
        count,
        percentage,
    });
}

/// The single child of `node` meeting the recipe's size and share bounds, or
/// `None` when zero or both children meet them.
fn sole_qualifying_child(
    trie: &Trie,
    node: u32,
    recipe: &Recipe,
    total: u32,
) -> Option<(u32, usize)> {
    let mut found: Option<(u32, usize)> = None;
    for bit in [0usize, 1] {
        if let Some(child) = trie.child(node, bit) {
            let count = trie.count_at(child);
            let percentage = f64::from(count) / f64::from(total);
            if count >= recipe.min_size && percentage >= recipe.threshold {
                if found.is_some() {
                    return None;
                }
                found = Some((child, bit));
            }
        }
    }
    found
}
