use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// GET /v2/_catalog response
#[derive(Debug, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub repositories: Vec<String>,
}

/// GET /v2/<repo>/tags/list response
#[derive(Debug, Deserialize)]
pub struct TagList {
    pub tags: Option<Vec<String>>,
}

/// GET /v2/<repo>/manifests/<tag> (schema v2 / OCI)
#[derive(Debug, Deserialize)]
pub struct Manifest {
    pub config: Option<ManifestConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ManifestConfig {
    pub digest: String,
}

/// GET /v2/<repo>/blobs/<config-digest>: image config containing the created timestamp
#[derive(Debug, Deserialize)]
pub struct ImageConfig {
    pub created: Option<DateTime<Utc>>,
}

/// A Registry V2 connection record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Registry {
    pub id: i64,
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    pub created_at: DateTime<Utc>,
}

/// Per-registry cleanup rules
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub registry_id: i64,
    /// Keep the N newest tags per repository (0 disables the rule)
    #[serde(default)]
    pub keep_last_count: i64,
    /// Keep tags younger than N days (0 disables the rule)
    #[serde(default)]
    pub keep_days: i64,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub filter_repos: Option<String>,
    #[serde(default)]
    pub exclude_repos: Option<String>,
    #[serde(default)]
    pub exclude_tags: Option<String>,
}

impl RetentionPolicy {
    /// The policy used for a registry that has never been configured
    pub fn default_for(registry_id: i64) -> Self {
        Self {
            registry_id,
            keep_last_count: 5,
            keep_days: 0,
            dry_run: true,
            last_run_at: None,
            filter_repos: None,
            exclude_repos: None,
            exclude_tags: Some("^latest$|^main$|^master$".to_string()),
        }
    }
}

/// Per-tag view built during a retention run
#[derive(Debug, Clone)]
pub struct ImageCandidate {
    pub tag: String,
    pub digest: String,
    pub created: DateTime<Utc>,
    pub protected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionAction {
    Kept,
    WouldDelete,
    Deleted,
    ErrorDelete,
}

impl fmt::Display for RetentionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RetentionAction::Kept => "kept",
            RetentionAction::WouldDelete => "would_delete",
            RetentionAction::Deleted => "deleted",
            RetentionAction::ErrorDelete => "error_delete",
        };
        f.write_str(s)
    }
}

/// One line of a retention run's outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionLog {
    pub repository: String,
    pub tag: String,
    pub digest: String,
    pub created: DateTime<Utc>,
    pub action: RetentionAction,
    pub reason: String,
}

/// Per-registry scheduled scan configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPolicy {
    pub id: i64,
    pub registry_id: i64,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub interval_hours: i64,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub filter_repos: Option<String>,
    #[serde(default)]
    pub filter_tags: Option<String>,
}

impl ScanPolicy {
    pub fn default_for(registry_id: i64) -> Self {
        Self {
            id: 0,
            registry_id,
            enabled: false,
            interval_hours: 24,
            next_run_at: None,
            last_run_at: None,
            filter_repos: None,
            filter_tags: Some("latest".to_string()),
        }
    }

    /// A policy is due when it has never run or its next run time has passed
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.next_run_at {
            None => true,
            Some(next) => now > next,
        }
    }

    /// Interval between runs; non-positive values fall back to a day
    pub fn interval(&self) -> chrono::Duration {
        let hours = if self.interval_hours < 1 {
            24
        } else {
            self.interval_hours
        };
        chrono::Duration::hours(hours)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Scanning,
    Completed,
    Failed,
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScanStatus::Scanning => "scanning",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Persisted scan result, unique per (registry_id, repository, tag)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VulnerabilityScan {
    pub id: i64,
    pub registry_id: i64,
    pub repository: String,
    pub tag: String,
    #[serde(default)]
    pub digest: String,
    pub status: ScanStatus,
    /// JSON object of severity counts keyed by scanner name
    #[serde(default)]
    pub summary: String,
    /// JSON object of raw reports keyed by scanner name
    #[serde(default)]
    pub report: String,
    pub scanned_at: DateTime<Utc>,
}

impl VulnerabilityScan {
    pub fn start(registry_id: i64, repository: &str, tag: &str) -> Self {
        Self {
            id: 0,
            registry_id,
            repository: repository.to_string(),
            tag: tag.to_string(),
            digest: String::new(),
            status: ScanStatus::Scanning,
            summary: String::new(),
            report: String::new(),
            scanned_at: Utc::now(),
        }
    }

    pub fn same_image(&self, other: &VulnerabilityScan) -> bool {
        self.registry_id == other.registry_id
            && self.repository == other.repository
            && self.tag == other.tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_scan_policy_due_when_never_run() {
        let policy = ScanPolicy::default_for(1);
        assert!(policy.is_due(Utc::now()));
    }

    #[test]
    fn test_scan_policy_not_due_at_exact_next_run() {
        let next = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let policy = ScanPolicy {
            next_run_at: Some(next),
            ..ScanPolicy::default_for(1)
        };
        assert!(!policy.is_due(next));
        assert!(policy.is_due(next + chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_scan_policy_interval_fallback() {
        let mut policy = ScanPolicy::default_for(1);
        policy.interval_hours = 0;
        assert_eq!(policy.interval(), chrono::Duration::hours(24));
        policy.interval_hours = -3;
        assert_eq!(policy.interval(), chrono::Duration::hours(24));
        policy.interval_hours = 6;
        assert_eq!(policy.interval(), chrono::Duration::hours(6));
    }

    #[test]
    fn test_retention_action_serializes_snake_case() {
        let json = serde_json::to_string(&RetentionAction::WouldDelete).unwrap();
        assert_eq!(json, "\"would_delete\"");
        assert_eq!(RetentionAction::ErrorDelete.to_string(), "error_delete");
    }
}
