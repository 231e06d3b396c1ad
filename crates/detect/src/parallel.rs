//! Parallel detection driver.
//!
//! The driver descends to a split depth, hands every surviving subtree to a
//! bounded work queue, and lets a pool of workers run the same DFS each on
//! its own subtree. Subtrees are independent, so the result set equals the
//! sequential walk's up to concatenation order.

use crossbeam_channel::{bounded, Sender};
use std::thread;
use tracing::trace;

use cidrwatch_trie::{Trie, ROOT};

use crate::{walk, CidrMatch, Recipe};

/// Estimated nodes per worker below which the split moves one level up.
const PER_WORKER_TARGET: usize = 5000;

/// One unit of parallel work: a subtree pinned at the split depth. Node
/// indices are arena-local and copy-trivial.
#[derive(Debug, Clone, Copy)]
struct Subtree {
    node: u32,
    prefix: u32,
    depth: u8,
}

/// Run one detection pass using the worker pool.
pub fn detect_parallel(trie: &Trie, recipe: &Recipe) -> Vec<CidrMatch> {
    let total = trie.total();
    if total == 0 {
        return vec![];
    }

    let workers = worker_count();
    let split = split_depth(workers, trie.node_count());
    let queue_bound = (4 * workers).max(16);
    trace!(workers, split, queue_bound, "starting parallel detection");

    let (job_tx, job_rx) = bounded::<Subtree>(queue_bound);
    let (result_tx, result_rx) = bounded::<Vec<CidrMatch>>(queue_bound);

    let mut matches = Vec::new();
    thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                for job in job_rx {
                    let mut local = Vec::new();
                    walk(
                        trie, job.node, job.prefix, job.depth, recipe, total, &mut local,
                    );
                    if !local.is_empty() {
                        let _ = result_tx.send(local);
                    }
                }
            });
        }

        // The seeder owns the job sender; the queue closes when it finishes.
        let seed_result_tx = result_tx.clone();
        scope.spawn(move || {
            let mut shallow = Vec::new();
            seed(trie, ROOT, 0, 0, recipe, total, split, &job_tx, &mut shallow);
            if !shallow.is_empty() {
                let _ = seed_result_tx.send(shallow);
            }
        });

        drop(result_tx);
        drop(job_rx);

        // Drain continuously so neither queue can wedge its producers.
        for partial in result_rx.iter() {
            matches.extend(partial);
        }
    });

    matches
}

/// Walk from the root down to the split depth, emitting or pruning exactly
/// like the sequential DFS, and enqueue each subtree that reaches the split
/// still unresolved.
#[allow(clippy::too_many_arguments)]
fn seed(
    trie: &Trie,
    node: u32,
    prefix: u32,
    depth: u8,
    recipe: &Recipe,
    total: u32,
    split: u8,
    jobs: &Sender<Subtree>,
    out: &mut Vec<CidrMatch>,
) {
    if depth > recipe.max_depth {
        return;
    }
    if depth == split {
        let _ = jobs.send(Subtree {
            node,
            prefix,
            depth,
        });
        return;
    }
    if depth < recipe.min_depth {
        for bit in [0usize, 1] {
            if let Some(child) = trie.child(node, bit) {
                let child_prefix = prefix | ((bit as u32) << (31 - depth));
                seed(
                    trie,
                    child,
                    child_prefix,
                    depth + 1,
                    recipe,
                    total,
                    split,
                    jobs,
                    out,
                );
            }
        }
        return;
    }

    let count = trie.count_at(node);
    let percentage = f64::from(count) / f64::from(total);
    if count < recipe.min_size || percentage < recipe.threshold {
        return;
    }

    if depth < recipe.max_depth {
        if let Some((child, bit)) = crate::sole_qualifying_child(trie, node, recipe, total) {
            let child_prefix = prefix | ((bit as u32) << (31 - depth));
            seed(
                trie,
                child,
                child_prefix,
                depth + 1,
                recipe,
                total,
                split,
                jobs,
                out,
            );
            return;
        }
    }

    out.push(CidrMatch {
        cidr: cidrwatch_net::Cidr::new(prefix, depth).expect("depth bounded by 32"),
        count,
        percentage,
    });
}

fn worker_count() -> usize {
    num_cpus::get().max(1)
}

/// Split depth: deep enough for `2^k >= 2 * workers` subtrees (capped at 16),
/// pulled one level up when the trie is too small to justify it.
fn split_depth(workers: usize, node_count: usize) -> u8 {
    let mut k: u8 = 0;
    while (1usize << k) < 2 * workers && k < 16 {
        k += 1;
    }
    if node_count / workers.max(1) < PER_WORKER_TARGET {
        k = k.saturating_sub(1);
    }
    k.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect;
    use cidrwatch_net::parse_addr;

    fn sorted(mut matches: Vec<CidrMatch>) -> Vec<(String, u32)> {
        matches.sort_by_key(|m| m.cidr);
        matches
            .into_iter()
            .map(|m| (m.cidr.to_string(), m.count))
            .collect()
    }

    fn pseudo_random_trie(inserts: usize) -> Trie {
        let mut trie = Trie::new();
        let mut state = 0xBEEF_CAFEu32;
        for _ in 0..inserts {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            // Bias into a handful of /24s so clusters actually form.
            let addr = match state % 4 {
                0 => parse_addr("10.11.12.0").unwrap() + (state % 256),
                1 => parse_addr("198.51.100.0").unwrap() + (state % 64),
                2 => parse_addr("203.0.113.0").unwrap() + (state % 8),
                _ => state,
            };
            trie.insert(addr);
        }
        trie
    }

    #[test]
    fn matches_sequential_walk() {
        let trie = pseudo_random_trie(20_000);
        for recipe in [
            Recipe::new(50, 0, 32, 0.001).unwrap(),
            Recipe::new(100, 8, 24, 0.01).unwrap(),
            Recipe::new(10, 32, 32, 0.0).unwrap(),
            Recipe::new(1, 0, 0, 0.0).unwrap(),
        ] {
            let sequential = sorted(detect(&trie, &recipe));
            let parallel = sorted(detect_parallel(&trie, &recipe));
            assert_eq!(sequential, parallel, "recipe {:?}", recipe);
        }
    }

    #[test]
    fn empty_trie_yields_nothing() {
        let trie = Trie::new();
        let recipe = Recipe::new(0, 0, 32, 0.0).unwrap();
        assert!(detect_parallel(&trie, &recipe).is_empty());
    }

    #[test]
    fn single_cluster_resolves_across_split() {
        // The narrowing chain crosses any plausible split depth.
        let mut trie = Trie::new();
        let addr = parse_addr("192.0.2.77").unwrap();
        for _ in 0..1000 {
            trie.insert(addr);
        }
        let recipe = Recipe::new(10, 0, 32, 0.0).unwrap();

        let matches = detect_parallel(&trie, &recipe);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].cidr.to_string(), "192.0.2.77/32");
        assert_eq!(matches[0].count, 1000);
    }

    #[test]
    fn split_depth_scales_with_workers() {
        assert_eq!(split_depth(1, 1_000_000), 1);
        assert_eq!(split_depth(4, 1_000_000), 3);
        assert_eq!(split_depth(8, 1_000_000), 4);
        // Tiny tries pull the split up one level.
        assert_eq!(split_depth(4, 100), 2);
        // The split never exceeds 16.
        assert_eq!(split_depth(1 << 20, usize::MAX), 16);
    }
}
