//! The jail: escalating bans for repeatedly detected ranges.
//!
//! Cells form ordered tiers with growing ban durations. A first detection
//! lands in cell 0; a re-offense after expiry escalates one tier; a
//! detection while still banned refreshes the ban. A newly detected range
//! swallows any active prisoners it properly contains.

pub mod persist;

use chrono::{DateTime, Duration, Utc};
use cidrwatch_common::config::CellConfig;
use cidrwatch_net::Cidr;
use tracing::{debug, info};

/// One ban tier.
#[derive(Debug, Clone)]
pub struct JailCell {
    pub description: String,
    pub duration: Duration,
    prisoners: Vec<Prisoner>,
}

impl JailCell {
    pub fn new(description: impl Into<String>, duration: Duration) -> Self {
        Self {
            description: description.into(),
            duration,
            prisoners: Vec::new(),
        }
    }

    pub fn prisoners(&self) -> &[Prisoner] {
        &self.prisoners
    }
}

/// A banned (or formerly banned) range inside one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prisoner {
    pub cidr: Cidr,
    pub banned_at: DateTime<Utc>,
    pub active: bool,
}

/// What [`Jail::submit`] did with a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// First offense, placed in cell 0.
    Admitted,
    /// Already actively banned; the ban restarted in the same cell.
    Refreshed { cell: usize },
    /// Re-offense after expiry; moved up a tier.
    Escalated { from: usize, to: usize },
    /// An active prisoner already contains this range; nothing changed.
    Covered { cell: usize },
}

#[derive(Debug, Clone)]
pub struct Jail {
    cells: Vec<JailCell>,
}

/// The default tiers: 10 minutes, 4 hours, 7 days, 30 days, 180 days.
pub fn default_cells() -> Vec<JailCell> {
    vec![
        JailCell::new("first offense", Duration::minutes(10)),
        JailCell::new("second offense", Duration::hours(4)),
        JailCell::new("third offense", Duration::days(7)),
        JailCell::new("fourth offense", Duration::days(30)),
        JailCell::new("persistent offender", Duration::days(180)),
    ]
}

impl Jail {
    pub fn new(cells: Vec<JailCell>) -> Self {
        assert!(!cells.is_empty(), "a jail needs at least one cell");
        Self { cells }
    }

    pub fn with_default_cells() -> Self {
        Self::new(default_cells())
    }

    /// Build from configuration; an empty list means the default tiers.
    pub fn from_cell_configs(configs: &[CellConfig]) -> Self {
        if configs.is_empty() {
            return Self::with_default_cells();
        }
        Self::new(
            configs
                .iter()
                .map(|c| {
                    JailCell::new(c.description.clone(), Duration::seconds(c.duration_secs as i64))
                })
                .collect(),
        )
    }

    pub fn cells(&self) -> &[JailCell] {
        &self.cells
    }

    pub fn prisoner_count(&self) -> usize {
        self.cells.iter().map(|c| c.prisoners.len()).sum()
    }

    /// Submit a newly detected range.
    pub fn submit(&mut self, cidr: Cidr, now: DateTime<Utc>) -> SubmitOutcome {
        // A wider active ban already covers this range; it stays the sole
        // representative regardless of submission order.
        if let Some(cell) = self.active_container(&cidr) {
            debug!(%cidr, cell, "already covered by an active ban");
            return SubmitOutcome::Covered { cell };
        }

        // Containment merge: active prisoners properly inside the new range
        // are marked now and removed after placement.
        let swallowed: Vec<Cidr> = self
            .cells
            .iter()
            .flat_map(|cell| cell.prisoners.iter())
            .filter(|p| p.active && cidr.contains_proper(&p.cidr))
            .map(|p| p.cidr)
            .collect();

        let outcome = match self.find(&cidr) {
            Some((cell, index)) => {
                let prisoner = &mut self.cells[cell].prisoners[index];
                if prisoner.active {
                    prisoner.banned_at = now;
                    debug!(%cidr, cell, "ban refreshed");
                    SubmitOutcome::Refreshed { cell }
                } else {
                    let target = (cell + 1).min(self.cells.len() - 1);
                    self.cells[cell].prisoners.remove(index);
                    self.cells[target].prisoners.push(Prisoner {
                        cidr,
                        banned_at: now,
                        active: true,
                    });
                    info!(%cidr, from = cell, to = target, "re-offense escalated");
                    SubmitOutcome::Escalated {
                        from: cell,
                        to: target,
                    }
                }
            }
            None => {
                self.cells[0].prisoners.push(Prisoner {
                    cidr,
                    banned_at: now,
                    active: true,
                });
                info!(%cidr, "new range jailed");
                SubmitOutcome::Admitted
            }
        };

        if !swallowed.is_empty() {
            debug!(%cidr, swallowed = swallowed.len(), "containment merge");
            for cell in &mut self.cells {
                cell.prisoners.retain(|p| !swallowed.contains(&p.cidr));
            }
        }

        outcome
    }

    /// Deactivate every prisoner whose ban has run out. Inactive prisoners
    /// are retained so a re-offense escalates instead of starting over.
    pub fn expire(&mut self, now: DateTime<Utc>) -> usize {
        let mut expired = 0;
        for cell in &mut self.cells {
            for prisoner in &mut cell.prisoners {
                if prisoner.active && prisoner.banned_at + cell.duration < now {
                    prisoner.active = false;
                    expired += 1;
                    debug!(cidr = %prisoner.cidr, "ban expired");
                }
            }
        }
        expired
    }

    /// The flat view of currently banned ranges, ordered for stable output.
    pub fn active_cidrs(&self) -> Vec<Cidr> {
        let mut active: Vec<Cidr> = self
            .cells
            .iter()
            .flat_map(|cell| cell.prisoners.iter())
            .filter(|p| p.active)
            .map(|p| p.cidr)
            .collect();
        active.sort_unstable();
        active
    }

    fn active_container(&self, cidr: &Cidr) -> Option<usize> {
        self.cells.iter().position(|cell| {
            cell.prisoners
                .iter()
                .any(|p| p.active && p.cidr.contains_proper(cidr))
        })
    }

    fn find(&self, cidr: &Cidr) -> Option<(usize, usize)> {
        for (cell_index, cell) in self.cells.iter().enumerate() {
            if let Some(index) = cell.prisoners.iter().position(|p| p.cidr == *cidr) {
                return Some((cell_index, index));
            }
        }
        None
    }

    /// Restore a prisoner into a specific cell; used when loading persisted
    /// state.
    pub(crate) fn place(&mut self, cell: usize, prisoner: Prisoner) {
        self.cells[cell].prisoners.push(prisoner);
    }
}
