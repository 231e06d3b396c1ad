//! The live orchestrator: framed ingestion in, periodic detection cycles,
//! jail updates and ban-file rewrites out.
//!
//! One thread owns all windows and the jail. Reader threads deliver parsed
//! batches over a bounded channel; per-window timer threads deliver cycle
//! ticks over another. The orchestrator multiplexes both, so windows have a
//! single mutator by construction.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;

use anyhow::Context;
use arc_swap::ArcSwap;
use chrono::{DateTime, Duration, Utc};
use cidrwatch_detect::detect_parallel;
use cidrwatch_ingest::IngestServer;
use cidrwatch_jail::{persist, Jail};
use cidrwatch_net::Cidr;
use cidrwatch_window::SlidingWindow;
use crossbeam_channel::{bounded, select, Receiver};
use tracing::{debug, info, warn};

use crate::settings::{OutputMode, Settings};

/// How often the orchestrator re-checks the shutdown flag while idle.
const IDLE_TICK: StdDuration = StdDuration::from_millis(200);
/// Sleep granularity of the window timers.
const TIMER_STEP: StdDuration = StdDuration::from_millis(200);
/// Matches kept for the status display.
const RECENT_MATCH_CAP: usize = 50;

/// Point-in-time state published for the TUI and status output.
#[derive(Debug, Clone, Default)]
pub struct LiveSnapshot {
    pub updated: Option<DateTime<Utc>>,
    pub windows: Vec<WindowStatus>,
    pub active_bans: Vec<Cidr>,
    pub recent_matches: Vec<RecentMatch>,
    pub malformed_lines: u64,
}

#[derive(Debug, Clone)]
pub struct WindowStatus {
    pub name: String,
    pub resident: usize,
}

#[derive(Debug, Clone)]
pub struct RecentMatch {
    pub window: String,
    pub cidr: Cidr,
    pub count: u32,
    pub percentage: f64,
}

pub fn run(settings: &Settings) -> anyhow::Result<()> {
    #[cfg(not(feature = "tui"))]
    if settings.output == OutputMode::Tui {
        anyhow::bail!("this build has no TUI support; rebuild with --features tui");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::Relaxed);
        })
        .context("installing signal handler")?;
    }

    let (batch_tx, batch_rx) = bounded::<Vec<String>>(settings.live.batch_queue_capacity);
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.live.port));
    let server = IngestServer::bind(addr, batch_tx, Arc::clone(&shutdown))
        .with_context(|| format!("binding ingest port {}", settings.live.port))?;
    let acceptor = server.spawn();

    let (tick_tx, tick_rx) = bounded::<usize>(settings.tries.len().max(1));
    let interval = StdDuration::from_secs(settings.live.sleep_between_iterations_secs);
    let mut timers = Vec::with_capacity(settings.tries.len());
    for index in 0..settings.tries.len() {
        let tick_tx = tick_tx.clone();
        let shutdown = Arc::clone(&shutdown);
        timers.push(
            thread::Builder::new()
                .name(format!("window-timer-{}", index))
                .spawn(move || {
                    while !shutdown.load(Ordering::Relaxed) {
                        let mut waited = StdDuration::ZERO;
                        while waited < interval && !shutdown.load(Ordering::Relaxed) {
                            thread::sleep(TIMER_STEP);
                            waited += TIMER_STEP;
                        }
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        // A full queue means the previous cycle is still in
                        // flight; skip this beat rather than pile up.
                        let _ = tick_tx.try_send(index);
                    }
                })
                .expect("failed to spawn timer thread"),
        );
    }
    drop(tick_tx);

    let snapshot: Arc<ArcSwap<LiveSnapshot>> =
        Arc::new(ArcSwap::from_pointee(LiveSnapshot::default()));

    #[cfg(feature = "tui")]
    let tui_handle = if settings.output == OutputMode::Tui {
        let snapshot = Arc::clone(&snapshot);
        let shutdown = Arc::clone(&shutdown);
        Some(
            thread::Builder::new()
                .name("tui".into())
                .spawn(move || crate::tui::run_live(snapshot, shutdown))
                .expect("failed to spawn TUI thread"),
        )
    } else {
        None
    };

    let mut orchestrator = Orchestrator::new(settings, snapshot);
    orchestrator.event_loop(&batch_rx, &tick_rx, &shutdown);

    info!("shutting down");
    shutdown.store(true, Ordering::Relaxed);
    let _ = acceptor.join();
    for timer in timers {
        let _ = timer.join();
    }
    orchestrator.final_flush();

    #[cfg(feature = "tui")]
    if let Some(handle) = tui_handle {
        let _ = handle.join();
    }
    Ok(())
}

struct Orchestrator<'a> {
    settings: &'a Settings,
    windows: Vec<SlidingWindow>,
    jail: Jail,
    jail_file: PathBuf,
    ban_file: PathBuf,
    last_active: Vec<Cidr>,
    snapshot: Arc<ArcSwap<LiveSnapshot>>,
    recent_matches: Vec<RecentMatch>,
    malformed_lines: u64,
    /// Per-window, per-stage drop counters since the last cycle.
    drops: Vec<[u64; 8]>,
}

impl<'a> Orchestrator<'a> {
    fn new(settings: &'a Settings, snapshot: Arc<ArcSwap<LiveSnapshot>>) -> Self {
        let max_age = Duration::seconds(settings.live.sliding_window_max_secs as i64);
        let windows = settings
            .tries
            .iter()
            .map(|_| SlidingWindow::new(max_age, settings.live.sliding_window_max_size))
            .collect();

        let jail = match persist::load_jail(&settings.jail_file) {
            Ok(Some(jail)) => jail,
            Ok(None) => Jail::from_cell_configs(&settings.jail_cells),
            Err(e) => {
                warn!(path = %settings.jail_file.display(), error = %e, "jail file unreadable, starting empty");
                Jail::from_cell_configs(&settings.jail_cells)
            }
        };
        let last_active = jail.active_cidrs();

        Self {
            settings,
            windows,
            jail,
            jail_file: settings.jail_file.clone(),
            ban_file: settings.ban_file.clone(),
            last_active,
            snapshot,
            recent_matches: Vec::new(),
            malformed_lines: 0,
            drops: vec![[0; 8]; settings.tries.len()],
        }
    }

    fn event_loop(
        &mut self,
        batch_rx: &Receiver<Vec<String>>,
        tick_rx: &Receiver<usize>,
        shutdown: &AtomicBool,
    ) {
        loop {
            select! {
                recv(batch_rx) -> batch => match batch {
                    Ok(batch) => self.ingest_batch(batch),
                    Err(_) => break,
                },
                recv(tick_rx) -> tick => match tick {
                    Ok(index) => self.run_cycle(index),
                    Err(_) => break,
                },
                default(IDLE_TICK) => {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                }
            }
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
        }
    }

    /// Parse a shipped batch and fan each request into every window whose
    /// filter stack admits it.
    fn ingest_batch(&mut self, batch: Vec<String>) {
        for line in batch {
            let request = match self.settings.log_format.parse(&line) {
                Ok(request) => request,
                Err(_) => {
                    self.malformed_lines += 1;
                    continue;
                }
            };
            for (index, trie_settings) in self.settings.tries.iter().enumerate() {
                match trie_settings.chain.check(&request) {
                    None => self.windows[index].push(request.clone()),
                    Some(stage) => self.drops[index][stage.index()] += 1,
                }
            }
        }
    }

    /// One detection cycle for one window: evict, detect, submit, persist.
    fn run_cycle(&mut self, index: usize) {
        let now = Utc::now();
        let name = self.settings.tries[index].name.clone();
        let window = &mut self.windows[index];
        let evicted = window.evict(now);
        let resident = window.len();

        self.jail.expire(now);

        let mut cycle_matches = Vec::new();
        for recipe in &self.settings.tries[index].recipes {
            let mut matches = detect_parallel(self.windows[index].trie(), recipe);
            matches.sort_by_key(|m| m.cidr);
            if recipe.use_for_jail {
                for m in &matches {
                    self.jail.submit(m.cidr, now);
                }
            }
            cycle_matches.extend(matches);
        }
        self.windows[index].mark_detection(now);

        let dropped: u64 = self.drops[index].iter().sum();
        info!(
            window = %name,
            resident,
            expired = evicted.expired,
            overflow = evicted.overflow,
            dropped,
            matches = cycle_matches.len(),
            "detection cycle"
        );
        for (stage, count) in cidrwatch_filter::RejectStage::ALL
            .iter()
            .zip(self.drops[index].iter())
        {
            if *count > 0 {
                debug!(window = %name, stage = stage.as_str(), count, "cycle drops");
            }
        }
        self.drops[index] = [0; 8];

        match self.settings.output {
            OutputMode::Plain => {
                for m in &cycle_matches {
                    println!(
                        "[{}] {} {:<18} {:>10} {:>7.2}%",
                        now.format("%Y-%m-%dT%H:%M:%SZ"),
                        name,
                        m.cidr.to_string(),
                        m.count,
                        m.percentage * 100.0
                    );
                }
            }
            OutputMode::Compact => {
                for m in &cycle_matches {
                    println!("{}\t{}\t{}\t{:.4}", name, m.cidr, m.count, m.percentage);
                }
            }
            OutputMode::Tui => {}
        }

        for m in cycle_matches {
            self.recent_matches.push(RecentMatch {
                window: name.clone(),
                cidr: m.cidr,
                count: m.count,
                percentage: m.percentage,
            });
        }
        let overflow = self.recent_matches.len().saturating_sub(RECENT_MATCH_CAP);
        if overflow > 0 {
            self.recent_matches.drain(..overflow);
        }

        self.persist(now);
        self.publish_snapshot(now);
    }

    /// Transient persistence failures are logged and retried next cycle.
    fn persist(&mut self, _now: DateTime<Utc>) {
        if let Err(e) = persist::save_jail(&self.jail, &self.jail_file) {
            warn!(path = %self.jail_file.display(), error = %e, "jail write failed, retrying next cycle");
            return;
        }
        let active = self.jail.active_cidrs();
        if active != self.last_active {
            match persist::write_ban_file(&self.ban_file, &active) {
                Ok(()) => self.last_active = active,
                Err(e) => {
                    warn!(path = %self.ban_file.display(), error = %e, "ban write failed, retrying next cycle");
                }
            }
        }
    }

    fn publish_snapshot(&self, now: DateTime<Utc>) {
        let windows = self
            .settings
            .tries
            .iter()
            .zip(self.windows.iter())
            .map(|(trie_settings, window)| WindowStatus {
                name: trie_settings.name.clone(),
                resident: window.len(),
            })
            .collect();
        self.snapshot.store(Arc::new(LiveSnapshot {
            updated: Some(now),
            windows,
            active_bans: self.jail.active_cidrs(),
            recent_matches: self.recent_matches.clone(),
            malformed_lines: self.malformed_lines,
        }));
    }

    /// Last write on the way out; nothing to retry after this.
    fn final_flush(&mut self) {
        if let Err(e) = persist::save_jail(&self.jail, &self.jail_file) {
            warn!(error = %e, "final jail write failed");
        }
        let active = self.jail.active_cidrs();
        if active != self.last_active {
            if let Err(e) = persist::write_ban_file(&self.ban_file, &active) {
                warn!(error = %e, "final ban write failed");
            }
        }
        if self.malformed_lines > 0 {
            info!(malformed = self.malformed_lines, "malformed lines over this run");
        }
    }
}
