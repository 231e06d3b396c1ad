//! The one-shot orchestrator: file in, report and jail updates out.

use std::io::BufRead;
use std::path::Path;
use std::thread;

use anyhow::Context;
use chrono::Utc;
use cidrwatch_common::Request;
use cidrwatch_detect::detect_parallel;
use cidrwatch_filter::FilterChain;
use cidrwatch_jail::{persist, Jail};
use cidrwatch_logparse::LogFormat;
use cidrwatch_trie::Trie;
use tracing::{info, warn};

use crate::args::StaticArgs;
use crate::render::{self, RecipeReport, Report, TrieReport};
use crate::settings::{OutputMode, Settings};

/// Below this many requests, filtering is not worth fanning out.
const PARALLEL_FILTER_THRESHOLD: usize = 10_000;

pub fn run(args: &StaticArgs, settings: &Settings) -> anyhow::Result<()> {
    let (requests, malformed) = parse_logfile(&args.logfile, &settings.log_format)?;
    info!(
        parsed = requests.len(),
        malformed, "log file ingested"
    );

    let now = Utc::now();
    let mut jail = load_jail_or_empty(settings);
    jail.expire(now);
    let active_before = jail.active_cidrs();

    let mut report = Report {
        tries: Vec::with_capacity(settings.tries.len()),
        active_bans: vec![],
        parsed: requests.len() as u64,
        malformed,
    };

    for trie_settings in &settings.tries {
        let (addrs, drops) = filter_requests(&requests, &trie_settings.chain);
        let mut trie = Trie::with_capacity(addrs.len());
        for addr in &addrs {
            trie.insert(*addr);
        }

        let mut recipes = Vec::with_capacity(trie_settings.recipes.len());
        for recipe in &trie_settings.recipes {
            let mut matches = detect_parallel(&trie, recipe);
            matches.sort_by_key(|m| m.cidr);
            if recipe.use_for_jail {
                for m in &matches {
                    jail.submit(m.cidr, now);
                }
            }
            recipes.push(RecipeReport {
                recipe: *recipe,
                matches,
            });
        }

        report.tries.push(TrieReport {
            name: trie_settings.name.clone(),
            admitted: addrs.len() as u64,
            drops,
            recipes,
        });
    }

    let active = jail.active_cidrs();
    persist::save_jail(&jail, &settings.jail_file)
        .with_context(|| format!("writing jail file {}", settings.jail_file.display()))?;
    if active != active_before || !settings.ban_file.exists() {
        persist::write_ban_file(&settings.ban_file, &active)
            .with_context(|| format!("writing ban file {}", settings.ban_file.display()))?;
    }
    report.active_bans = active;

    match settings.output {
        OutputMode::Plain => print!("{}", render::render_plain(&report)),
        OutputMode::Compact => print!("{}", render::render_compact(&report)),
        OutputMode::Tui => {
            #[cfg(feature = "tui")]
            crate::tui::show_report(&report)?;
            #[cfg(not(feature = "tui"))]
            anyhow::bail!("this build has no TUI support; rebuild with --features tui");
        }
    }
    Ok(())
}

/// Parse the whole file. Malformed lines are counted and dropped.
fn parse_logfile(path: &Path, format: &LogFormat) -> anyhow::Result<(Vec<Request>, u64)> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening log file {}", path.display()))?;
    let reader = std::io::BufReader::new(file);

    let mut requests = Vec::new();
    let mut malformed = 0u64;
    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }
        match format.parse(&line) {
            Ok(request) => requests.push(request),
            Err(e) => {
                malformed += 1;
                if malformed <= 10 {
                    warn!(line = line_num + 1, error = %e, "dropping malformed line");
                }
            }
        }
    }
    Ok((requests, malformed))
}

fn load_jail_or_empty(settings: &Settings) -> Jail {
    match persist::load_jail(&settings.jail_file) {
        Ok(Some(jail)) => jail,
        Ok(None) => Jail::from_cell_configs(&settings.jail_cells),
        Err(e) => {
            // Malformed state needs an operator; keep running with a fresh
            // jail and leave the bad file in place until the next save.
            warn!(path = %settings.jail_file.display(), error = %e, "jail file unreadable, starting empty");
            Jail::from_cell_configs(&settings.jail_cells)
        }
    }
}

/// Run every request through the chain, collecting admitted addresses and
/// per-stage drop counts. Large inputs fan out over scoped threads.
pub(crate) fn filter_requests(requests: &[Request], chain: &FilterChain) -> (Vec<u32>, [u64; 8]) {
    if requests.len() < PARALLEL_FILTER_THRESHOLD {
        return filter_chunk(requests, chain);
    }

    let workers = num_cpus::get().max(1);
    let chunk_size = requests.len().div_ceil(workers);
    let partials: Vec<(Vec<u32>, [u64; 8])> = thread::scope(|scope| {
        let handles: Vec<_> = requests
            .chunks(chunk_size)
            .map(|chunk| scope.spawn(move || filter_chunk(chunk, chain)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("filter worker panicked"))
            .collect()
    });

    let mut addrs = Vec::with_capacity(requests.len());
    let mut drops = [0u64; 8];
    for (chunk_addrs, chunk_drops) in partials {
        addrs.extend(chunk_addrs);
        for (total, part) in drops.iter_mut().zip(chunk_drops.iter()) {
            *total += part;
        }
    }
    (addrs, drops)
}

fn filter_chunk(requests: &[Request], chain: &FilterChain) -> (Vec<u32>, [u64; 8]) {
    let mut addrs = Vec::with_capacity(requests.len());
    let mut drops = [0u64; 8];
    for request in requests {
        match chain.check(request) {
            None => addrs.push(request.addr),
            Some(stage) => drops[stage.index()] += 1,
        }
    }
    (addrs, drops)
}
