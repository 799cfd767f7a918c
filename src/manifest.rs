//! Known-item manifest: the per-portal record of tender ids already seen and
//! departments already fully processed.
//!
//! The manifest is a seed for incremental runs, not a source of truth; the
//! store's uniqueness constraint remains the authoritative backstop. Entries
//! grow append-only: keys are never evicted.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::delta::PassSummary;

/// State recorded for one portal after each run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortalManifest {
    #[serde(default)]
    pub tender_ids: BTreeSet<String>,
    #[serde(default)]
    pub processed_departments: BTreeSet<String>,
    #[serde(default)]
    pub last_run: Option<String>,
    #[serde(default)]
    pub last_expected: Option<u64>,
    #[serde(default)]
    pub last_extracted: Option<u64>,
}

/// The whole manifest file: one entry per portal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub portals: BTreeMap<String, PortalManifest>,
}

impl Manifest {
    /// Load the manifest, tolerating absence and corruption. A missing file
    /// is a normal first run; an unreadable one degrades to empty with a
    /// warning so the run can proceed (the store still rejects duplicates).
    pub fn load(path: &Path) -> Manifest {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Manifest::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read manifest; starting empty");
                return Manifest::default();
            }
        };
        match serde_json::from_str(&data) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt manifest; starting empty");
                Manifest::default()
            }
        }
    }

    /// Persist atomically: write a temp file next to the target, then rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).context("Failed to create manifest directory")?;
        let data = serde_json::to_string_pretty(self).context("Failed to encode manifest")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to rename {} into place", tmp.display()))?;
        Ok(())
    }

    pub fn portal(&self, portal: &str) -> Option<&PortalManifest> {
        self.portals.get(portal)
    }

    /// Known tender ids for a portal; empty for a portal never synced.
    pub fn known_ids(&self, portal: &str) -> BTreeSet<String> {
        self.portals
            .get(portal)
            .map(|p| p.tender_ids.clone())
            .unwrap_or_default()
    }

    /// Fold one finished run into the portal's entry. Sets union in, counters
    /// are replaced with the latest run's totals.
    pub fn record_run(&mut self, portal: &str, summary: &PassSummary) {
        let entry = self.portals.entry(portal.to_string()).or_default();
        entry.tender_ids.extend(summary.tender_ids.iter().cloned());
        entry
            .processed_departments
            .extend(summary.departments.iter().cloned());
        entry.last_run = Some(Utc::now().to_rfc3339());
        entry.last_expected = Some(summary.expected);
        entry.last_extracted = Some(summary.extracted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::PassStatus;

    fn summary(ids: &[&str], depts: &[&str], expected: u64, extracted: u64) -> PassSummary {
        PassSummary {
            expected,
            extracted,
            skipped: 0,
            tender_ids: ids.iter().map(|s| s.to_string()).collect(),
            departments: depts.iter().map(|s| s.to_string()).collect(),
            status: PassStatus::Completed,
        }
    }

    #[test]
    fn test_missing_manifest_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::load(&dir.path().join("manifest.json"));
        assert!(manifest.portals.is_empty());
    }

    #[test]
    fn test_corrupt_manifest_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, "{oops").unwrap();
        assert_eq!(Manifest::load(&path), Manifest::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");

        let mut manifest = Manifest::default();
        manifest.record_run("etenders", &summary(&["T-1", "T-2"], &["Health"], 10, 2));
        manifest.save(&path).unwrap();

        let reloaded = Manifest::load(&path);
        assert_eq!(reloaded, manifest);
        assert_eq!(reloaded.known_ids("etenders").len(), 2);
        // No stray temp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_record_run_grows_append_only() {
        let mut manifest = Manifest::default();
        manifest.record_run("etenders", &summary(&["T-1", "T-2"], &["Health"], 10, 2));
        manifest.record_run("etenders", &summary(&["T-3"], &["Works"], 4, 1));

        let entry = manifest.portal("etenders").unwrap();
        assert_eq!(entry.tender_ids.len(), 3);
        assert_eq!(entry.processed_departments.len(), 2);
        // Counters reflect the latest run, not a running total.
        assert_eq!(entry.last_expected, Some(4));
        assert_eq!(entry.last_extracted, Some(1));
        assert!(entry.last_run.is_some());
    }

    #[test]
    fn test_portals_are_independent() {
        let mut manifest = Manifest::default();
        manifest.record_run("etenders", &summary(&["T-1"], &[], 1, 1));
        manifest.record_run("gem", &summary(&["T-1", "G-9"], &[], 2, 2));

        assert_eq!(manifest.known_ids("etenders").len(), 1);
        assert_eq!(manifest.known_ids("gem").len(), 2);
        assert!(manifest.known_ids("unseen").is_empty());
    }

    #[test]
    fn test_partial_manifest_json_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(
            &path,
            r#"{"portals":{"etenders":{"tender_ids":["T-1"]}}}"#,
        )
        .unwrap();

        let manifest = Manifest::load(&path);
        let entry = manifest.portal("etenders").unwrap();
        assert_eq!(entry.tender_ids.len(), 1);
        assert!(entry.processed_departments.is_empty());
        assert!(entry.last_run.is_none());
    }
}
