use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Terminal and live states of a portal run as recorded in the run ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Error,
    TimeoutCleaned,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::TimeoutCleaned => "timeout_cleaned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "timeout_cleaned" => Ok(Self::TimeoutCleaned),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a run re-scrapes everything or only what the planner targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScopeMode {
    Full,
    Incremental,
}

impl ScopeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl FromStr for ScopeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            _ => Err(format!("Invalid scope mode: {}", s)),
        }
    }
}

impl std::fmt::Display for ScopeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One synchronization attempt for one portal.
///
/// Progress counters are mutated only by the owning worker and are
/// monotonically non-decreasing; status becomes immutable once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub portal_name: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub status: RunStatus,
    pub scope_mode: ScopeMode,
    pub expected_total: Option<i64>,
    pub extracted_total: Option<i64>,
    pub skipped_total: Option<i64>,
}

impl Run {
    /// A run shows progress if either counter has moved off zero.
    pub fn has_progress(&self) -> bool {
        self.extracted_total.unwrap_or(0) > 0 || self.skipped_total.unwrap_or(0) > 0
    }

    /// Age of the run relative to `now`. Unparseable timestamps age as zero,
    /// which keeps the oracle on its conservative "wait" path.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        match DateTime::parse_from_rfc3339(&self.started_at) {
            Ok(started) => now.signed_duration_since(started.with_timezone(&Utc)),
            Err(_) => Duration::zero(),
        }
    }
}

/// One discovered listing row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenderRecord {
    pub id: i64,
    pub run_id: i64,
    pub portal_name: String,
    pub department_name: String,
    pub tender_id: String,
    pub closing_date: String,
    pub title: String,
    pub description: String,
    pub source_url: Option<String>,
}

/// A tender about to be inserted; the store assigns the row id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTender {
    pub run_id: i64,
    pub portal_name: String,
    pub department_name: String,
    pub tender_id: String,
    pub closing_date: String,
    pub title: String,
    pub description: String,
    pub source_url: Option<String>,
}

/// Values that stand in for "we could not extract an identifier".
/// Rows carrying one of these are exempt from the identity constraint and
/// are retained, duplicated or not, for manual review.
pub const PLACEHOLDER_TENDER_IDS: &[&str] = &["", "n/a", "na", "none", "unknown", "-"];

/// True if the given natural key is empty or a known placeholder after
/// normalization (trim + case-fold). Must match the SQL predicate guarding
/// the identity index.
pub fn is_placeholder_id(tender_id: &str) -> bool {
    let normalized = tender_id.trim().to_lowercase();
    PLACEHOLDER_TENDER_IDS.contains(&normalized.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_roundtrip() {
        for s in &["running", "completed", "error", "timeout_cleaned"] {
            let parsed: RunStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_scope_mode_roundtrip() {
        for s in &["full", "incremental"] {
            let parsed: ScopeMode = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("quick".parse::<ScopeMode>().is_err());
    }

    #[test]
    fn test_serde_produces_snake_case_strings() {
        assert_eq!(
            serde_json::to_string(&RunStatus::TimeoutCleaned).unwrap(),
            "\"timeout_cleaned\""
        );
        assert_eq!(
            serde_json::from_str::<ScopeMode>("\"incremental\"").unwrap(),
            ScopeMode::Incremental
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Error.is_terminal());
        assert!(RunStatus::TimeoutCleaned.is_terminal());
    }

    #[test]
    fn test_has_progress() {
        let mut run = Run {
            id: 1,
            portal_name: "etenders".into(),
            started_at: Utc::now().to_rfc3339(),
            completed_at: None,
            status: RunStatus::Running,
            scope_mode: ScopeMode::Full,
            expected_total: Some(100),
            extracted_total: None,
            skipped_total: None,
        };
        assert!(!run.has_progress());
        run.skipped_total = Some(3);
        assert!(run.has_progress());
        run.skipped_total = Some(0);
        run.extracted_total = Some(1);
        assert!(run.has_progress());
    }

    #[test]
    fn test_run_age_unparseable_is_zero() {
        let run = Run {
            id: 1,
            portal_name: "p".into(),
            started_at: "not-a-timestamp".into(),
            completed_at: None,
            status: RunStatus::Running,
            scope_mode: ScopeMode::Full,
            expected_total: None,
            extracted_total: None,
            skipped_total: None,
        };
        assert_eq!(run.age(Utc::now()), Duration::zero());
    }

    #[test]
    fn test_placeholder_ids() {
        assert!(is_placeholder_id(""));
        assert!(is_placeholder_id("  "));
        assert!(is_placeholder_id("N/A"));
        assert!(is_placeholder_id(" Unknown "));
        assert!(is_placeholder_id("-"));
        assert!(!is_placeholder_id("TND-2024-001"));
    }
}
