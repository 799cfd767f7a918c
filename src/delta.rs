//! Delta planner: decides which departments need re-scraping between two
//! syncs by diffing department snapshots (presence + count).
//!
//! The planner is deliberately cheap: it never inspects items, only the
//! per-department counts the portal's listing page already exposes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One department with its approximate listing count at a point in time.
/// Used only for diffing, never as a record of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepartmentCount {
    pub name: String,
    pub count: u64,
}

/// How the delta sweep selects its targets.
///
/// `Quick` assumes an unchanged department count means no new items, which
/// is unsound when items are added and removed in equal number between
/// syncs. `Full` exists precisely to catch that case: it re-targets every
/// known department while still skipping individual known items. The two
/// modes are never reconciled automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaMode {
    Quick,
    Full,
}

impl DeltaMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Full => "full",
        }
    }
}

impl FromStr for DeltaMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quick" => Ok(Self::Quick),
            "full" => Ok(Self::Full),
            _ => Err(format!("Invalid delta mode: {} (expected quick|full)", s)),
        }
    }
}

/// Normalize a department name to its diff key: case-fold and collapse
/// internal whitespace.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeltaStats {
    pub added: usize,
    pub removed: usize,
    pub count_changed: usize,
}

/// The minimal work list for one delta sweep.
#[derive(Debug, Clone)]
pub struct DeltaPlan {
    /// Departments to re-scrape, resolved back to the latest snapshot's
    /// records (the sweep needs names as the portal spells them).
    pub targets: Vec<DepartmentCount>,
    /// Departments present in the baseline but gone from the latest
    /// snapshot. Reported for visibility, never re-processed.
    pub removed: Vec<String>,
    pub stats: DeltaStats,
}

/// Compute the re-scrape plan for the given mode.
///
/// Quick: targets are departments that appeared or whose count changed.
/// Full: targets are every department in the latest snapshot; the diff
/// stats are still computed for reporting.
pub fn plan(mode: DeltaMode, baseline: &[DepartmentCount], latest: &[DepartmentCount]) -> DeltaPlan {
    let base_counts: BTreeMap<String, u64> = baseline
        .iter()
        .map(|d| (normalize_name(&d.name), d.count))
        .collect();
    let latest_counts: BTreeMap<String, u64> = latest
        .iter()
        .map(|d| (normalize_name(&d.name), d.count))
        .collect();

    let base_keys: BTreeSet<&String> = base_counts.keys().collect();
    let latest_keys: BTreeSet<&String> = latest_counts.keys().collect();

    let added: BTreeSet<&String> = latest_keys.difference(&base_keys).copied().collect();
    let removed: Vec<String> = base_keys
        .difference(&latest_keys)
        .map(|k| (*k).clone())
        .collect();
    let changed: BTreeSet<&String> = latest_keys
        .intersection(&base_keys)
        .copied()
        .filter(|k| latest_counts[*k] != base_counts[*k])
        .collect();

    let stats = DeltaStats {
        added: added.len(),
        removed: removed.len(),
        count_changed: changed.len(),
    };

    let targets = match mode {
        DeltaMode::Quick => latest
            .iter()
            .filter(|d| {
                let key = normalize_name(&d.name);
                added.contains(&key) || changed.contains(&key)
            })
            .cloned()
            .collect(),
        DeltaMode::Full => latest.to_vec(),
    };

    DeltaPlan {
        targets,
        removed,
        stats,
    }
}

// ── Pass summaries ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassStatus {
    Completed,
    Error,
}

/// Aggregated result of one worker pass over a portal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassSummary {
    pub expected: u64,
    pub extracted: u64,
    pub skipped: u64,
    pub tender_ids: BTreeSet<String>,
    pub departments: BTreeSet<String>,
    pub status: PassStatus,
}

impl PassSummary {
    pub fn empty() -> Self {
        Self {
            expected: 0,
            extracted: 0,
            skipped: 0,
            tender_ids: BTreeSet::new(),
            departments: BTreeSet::new(),
            status: PassStatus::Completed,
        }
    }

    /// Merge the delta-sweep pass into the initial pass: counts sum, sets
    /// union, and the result is `Error` if either pass errored.
    pub fn merge(mut self, other: PassSummary) -> PassSummary {
        self.expected += other.expected;
        self.extracted += other.extracted;
        self.skipped += other.skipped;
        self.tender_ids.extend(other.tender_ids);
        self.departments.extend(other.departments);
        if other.status == PassStatus::Error {
            self.status = PassStatus::Error;
        }
        self
    }
}

// ── Snapshot persistence ─────────────────────────────────────────────

/// Path of the persisted baseline snapshot for a portal.
pub fn snapshot_path(snapshots_dir: &Path, portal: &str) -> PathBuf {
    snapshots_dir.join(format!("{}.json", sanitize_portal(portal)))
}

pub(crate) fn sanitize_portal(portal: &str) -> String {
    portal
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Load the baseline snapshot written after the previous sync. A missing or
/// unreadable baseline yields `None`, which forces a full plan upstream.
pub fn load_snapshot(path: &Path) -> Option<Vec<DepartmentCount>> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read department snapshot");
            return None;
        }
    };
    match serde_json::from_str(&data) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt department snapshot; ignoring");
            None
        }
    }
}

pub fn save_snapshot(path: &Path, snapshot: &[DepartmentCount]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create snapshot directory")?;
    }
    let data = serde_json::to_string_pretty(snapshot).context("Failed to encode snapshot")?;
    std::fs::write(path, data).context("Failed to write snapshot")?;
    Ok(())
}
