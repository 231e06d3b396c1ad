//! Durable jail state and the ban file.
//!
//! The jail serializes to YAML at a fixed path and is rewritten after every
//! cycle that changes state. The ban file is the firewall-facing projection:
//! one CIDR per line, nothing else. Both writes go through a temp file in
//! the target directory followed by a rename, so a partial write is never
//! observable.

use std::io::Write as _;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use cidrwatch_common::CidrwatchError;
use cidrwatch_net::Cidr;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Jail, JailCell, Prisoner};

#[derive(Debug, Serialize, Deserialize)]
struct JailFile {
    cells: Vec<CellRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CellRecord {
    id: usize,
    description: String,
    duration_secs: u64,
    #[serde(default)]
    prisoners: Vec<PrisonerRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PrisonerRecord {
    cidr: Cidr,
    banned_at: DateTime<Utc>,
    active: bool,
}

/// Serialize the jail to `path`, atomically.
pub fn save_jail(jail: &Jail, path: &Path) -> Result<(), CidrwatchError> {
    let file = JailFile {
        cells: jail
            .cells()
            .iter()
            .enumerate()
            .map(|(id, cell)| CellRecord {
                id,
                description: cell.description.clone(),
                duration_secs: cell.duration.num_seconds().max(0) as u64,
                prisoners: cell
                    .prisoners()
                    .iter()
                    .map(|p| PrisonerRecord {
                        cidr: p.cidr,
                        banned_at: p.banned_at,
                        active: p.active,
                    })
                    .collect(),
            })
            .collect(),
    };
    let text = serde_yaml::to_string(&file)?;
    write_atomic(path, text.as_bytes())?;
    info!(path = %path.display(), prisoners = jail.prisoner_count(), "jail state written");
    Ok(())
}

/// Load jail state from `path`.
///
/// A missing file yields `Ok(None)` (start empty); a malformed file is an
/// error for the caller to report.
pub fn load_jail(path: &Path) -> Result<Option<Jail>, CidrwatchError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let file: JailFile = serde_yaml::from_str(&text)
        .map_err(|e| CidrwatchError::Jail(format!("{}: {}", path.display(), e)))?;
    if file.cells.is_empty() {
        return Err(CidrwatchError::Jail(format!(
            "{}: no cells in jail file",
            path.display()
        )));
    }

    let cells: Vec<JailCell> = file
        .cells
        .iter()
        .map(|record| {
            JailCell::new(
                record.description.clone(),
                Duration::seconds(record.duration_secs as i64),
            )
        })
        .collect();

    let mut jail = Jail::new(cells);
    for (cell_index, record) in file.cells.iter().enumerate() {
        for prisoner in &record.prisoners {
            jail.place(
                cell_index,
                Prisoner {
                    cidr: prisoner.cidr,
                    banned_at: prisoner.banned_at,
                    active: prisoner.active,
                },
            );
        }
    }
    info!(path = %path.display(), prisoners = jail.prisoner_count(), "jail state loaded");
    Ok(Some(jail))
}

/// Rewrite the ban file: the active ranges, one CIDR per line,
/// newline-terminated, atomically.
pub fn write_ban_file(path: &Path, active: &[Cidr]) -> Result<(), CidrwatchError> {
    let mut text = String::with_capacity(active.len() * 19);
    for cidr in active {
        text.push_str(&cidr.to_string());
        text.push('\n');
    }
    write_atomic(path, text.as_bytes())?;
    info!(path = %path.display(), ranges = active.len(), "ban file written");
    Ok(())
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), CidrwatchError> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut temp = match dir {
        Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
        None => tempfile::NamedTempFile::new_in(".")?,
    };
    temp.write_all(contents)?;
    temp.flush()?;
    temp.persist(path)
        .map_err(|e| CidrwatchError::Io(e.error))?;
    Ok(())
}
