use crate::errors::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupKind {
    Domain,
    Custom,
}

impl GroupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TabSort {
    #[default]
    SavedAt,
    Title,
    Domain,
}

impl TabSort {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SavedAt => "savedAt",
            Self::Title => "title",
            Self::Domain => "domain",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "savedAt" => Some(Self::SavedAt),
            "title" => Some(Self::Title),
            "domain" => Some(Self::Domain),
            _ => None,
        }
    }

    pub(crate) fn order_by(self) -> &'static str {
        match self {
            Self::SavedAt => "saved_at DESC, rowid ASC",
            Self::Title => "COALESCE(display_name, title) COLLATE NOCASE ASC, saved_at DESC",
            Self::Domain => "domain COLLATE NOCASE ASC, saved_at DESC",
        }
    }
}

/// An archived tab in the active collection.
///
/// Membership is a single ordered set of custom group names. The legacy
/// single-group pair is derived from it: the first custom group when there is
/// one, otherwise the domain group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabRecord {
    pub id: String,
    pub url: String,
    pub title: String,
    pub display_name: Option<String>,
    pub sort_key: Option<String>,
    pub domain: String,
    pub custom_groups: Vec<String>,
    pub favicon_url: Option<String>,
    pub screenshot: Option<Vec<u8>>,
    pub last_accessed: Option<DateTime<Utc>>,
    pub saved_at: DateTime<Utc>,
}

impl TabRecord {
    pub fn group_kind(&self) -> GroupKind {
        if self.custom_groups.is_empty() {
            GroupKind::Domain
        } else {
            GroupKind::Custom
        }
    }

    pub fn group_label(&self) -> &str {
        self.custom_groups
            .first()
            .map(String::as_str)
            .unwrap_or(self.domain.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrashedTab {
    #[serde(flatten)]
    pub tab: TabRecord,
    pub trashed_at: DateTime<Utc>,
}

/// A tab as captured from the browser, before it is matched against the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabDraft {
    pub url: String,
    pub title: String,
    pub favicon_url: Option<String>,
    pub screenshot: Option<Vec<u8>>,
    pub last_accessed: Option<DateTime<Utc>>,
    pub saved_at: Option<DateTime<Utc>>,
}

impl TabDraft {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            ..Self::default()
        }
    }

    pub(crate) fn has_screenshot(&self) -> bool {
        self.screenshot.as_ref().is_some_and(|bytes| !bytes.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomGroupMeta {
    pub name: String,
    pub sort_order: i64,
    pub color: Option<String>,
    pub sort_override: Option<TabSort>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeleteOutcome {
    Trashed,
    PermanentlyDeleted,
    NotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

impl BatchOutcome {
    pub fn record(&mut self, id: &str, result: AppResult<()>) {
        match result {
            Ok(()) => self.succeeded.push(id.to_string()),
            Err(error) => self.failed.push(BatchFailure {
                id: id.to_string(),
                error: error.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizationRule {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub name: String,
    pub pattern: String,
    pub replacement: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleIssue {
    pub rule_id: String,
    pub rule_name: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedPattern {
    pub pattern: String,
    pub replacement: String,
    pub numeric_segment: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeDetail {
    pub kept_url: String,
    pub removed_urls: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizationReport {
    pub merged_count: usize,
    pub rewritten_count: usize,
    pub details: Vec<MergeDetail>,
    pub skipped_rules: Vec<RuleIssue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkCategory {
    Alive,
    Dead,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckState {
    #[default]
    Idle,
    Running,
    Paused,
    Cancelled,
    Completed,
}

impl CheckState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkTarget {
    pub tab_id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkCheckResult {
    pub tab_id: String,
    pub url: String,
    pub category: LinkCategory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckProgress {
    pub state: CheckState,
    pub epoch: u64,
    pub total_count: usize,
    pub checked_count: usize,
    pub alive: usize,
    pub dead: usize,
    pub warning: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub retention_days: u32,
    pub link_check_concurrency: usize,
    pub probe_timeout_ms: u64,
    pub sweep_interval_hours: u64,
    pub sweep_startup_delay_secs: u64,
    pub normalization_rules: Vec<NormalizationRule>,
    pub default_sort: TabSort,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            retention_days: 30,
            link_check_concurrency: 6,
            probe_timeout_ms: 8_000,
            sweep_interval_hours: 24,
            sweep_startup_delay_secs: 10,
            normalization_rules: Vec::new(),
            default_sort: TabSort::SavedAt,
        }
    }
}

impl AppSettings {
    pub const MAX_LINK_CHECK_CONCURRENCY: usize = 16;

    /// Reads settings from a YAML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> AppResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let settings: Self = serde_yaml::from_str(&raw)?;
        Ok(settings)
    }

    pub fn effective_concurrency(&self) -> usize {
        self.link_check_concurrency
            .clamp(1, Self::MAX_LINK_CHECK_CONCURRENCY)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.probe_timeout_ms == 0 {
            return Err(AppError::InvalidInput(
                "probeTimeoutMs must be greater than zero".to_string(),
            ));
        }
        if self.sweep_interval_hours == 0 {
            return Err(AppError::InvalidInput(
                "sweepIntervalHours must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
