use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boot reasons reported after a scheduled low-power wake (SMPL-style resets).
pub const SCHEDULED_BOOT_REASONS: &[&str] = &["RTC alarm"];

/// Boot reasons reported after an unexpected reset.
pub const UNEXPECTED_BOOT_REASONS: &[&str] = &["UNKNOWN", "keyboard power on"];

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("crash category filter for `{category}` needs an inclusion or exclusion reason set")]
    EmptyReasonSets { category: Category },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportKind {
    Heartbeat,
    CrashReport,
}

/// Classification target for a single device report. The three crash
/// categories are mutually exclusive and exhaustive: `Other` is "matches
/// neither inclusion set", so unrecognized boot reasons always land somewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Heartbeat,
    ScheduledReset,
    UnexpectedReset,
    Other,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Heartbeat => "heartbeat",
            Category::ScheduledReset => "scheduled-reset",
            Category::UnexpectedReset => "unexpected-reset",
            Category::Other => "other",
        }
    }

    pub fn all() -> [Category; 4] {
        [
            Category::Heartbeat,
            Category::ScheduledReset,
            Category::UnexpectedReset,
            Category::Other,
        ]
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pure classifier over a report's kind and boot reason.
pub fn classify(kind: ReportKind, boot_reason: Option<&str>) -> Category {
    if kind == ReportKind::Heartbeat {
        return Category::Heartbeat;
    }
    let reason = boot_reason.unwrap_or_default();
    if SCHEDULED_BOOT_REASONS.contains(&reason) {
        Category::ScheduledReset
    } else if UNEXPECTED_BOOT_REASONS.contains(&reason) {
        Category::UnexpectedReset
    } else {
        Category::Other
    }
}

/// Boot-reason predicate for one category pass of an aggregation run.
///
/// Crash filters carry an inclusion set, an exclusion set, or both; a filter
/// with neither would match everything, so construction rejects it up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryFilter {
    category: Category,
    include: Option<Vec<String>>,
    exclude: Option<Vec<String>>,
}

impl CategoryFilter {
    pub fn heartbeat() -> Self {
        Self {
            category: Category::Heartbeat,
            include: None,
            exclude: None,
        }
    }

    pub fn crash(
        category: Category,
        include: Option<Vec<String>>,
        exclude: Option<Vec<String>>,
    ) -> Result<Self, FilterError> {
        if include.as_ref().map_or(true, Vec::is_empty)
            && exclude.as_ref().map_or(true, Vec::is_empty)
        {
            return Err(FilterError::EmptyReasonSets { category });
        }
        Ok(Self {
            category,
            include,
            exclude,
        })
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn include(&self) -> Option<&[String]> {
        self.include.as_deref()
    }

    pub fn exclude(&self) -> Option<&[String]> {
        self.exclude.as_deref()
    }

    pub fn matches(&self, kind: ReportKind, boot_reason: Option<&str>) -> bool {
        if self.category == Category::Heartbeat {
            return kind == ReportKind::Heartbeat;
        }
        if kind != ReportKind::CrashReport {
            return false;
        }
        let reason = boot_reason.unwrap_or_default();
        if let Some(include) = &self.include {
            if !include.iter().any(|candidate| candidate == reason) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude {
            if exclude.iter().any(|candidate| candidate == reason) {
                return false;
            }
        }
        true
    }
}

fn owned(reasons: &[&str]) -> Vec<String> {
    reasons.iter().map(|reason| reason.to_string()).collect()
}

/// The four standard passes of one aggregation run: heartbeats plus the three
/// mutually exclusive crash categories.
pub fn default_filters() -> Result<Vec<CategoryFilter>, FilterError> {
    let mut known = owned(SCHEDULED_BOOT_REASONS);
    known.extend(owned(UNEXPECTED_BOOT_REASONS));
    Ok(vec![
        CategoryFilter::heartbeat(),
        CategoryFilter::crash(
            Category::ScheduledReset,
            Some(owned(SCHEDULED_BOOT_REASONS)),
            None,
        )?,
        CategoryFilter::crash(
            Category::UnexpectedReset,
            Some(owned(UNEXPECTED_BOOT_REASONS)),
            None,
        )?,
        CategoryFilter::crash(Category::Other, None, Some(known))?,
    ])
}

/// Aggregation axis: each raw event carries an OS build fingerprint and,
/// for non-legacy devices, a radio firmware version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionDimension {
    OsBuild,
    Radio,
}

impl VersionDimension {
    pub fn all() -> [VersionDimension; 2] {
        [VersionDimension::OsBuild, VersionDimension::Radio]
    }

    /// Entity name used in run reports and operator output.
    pub fn entity_name(self) -> &'static str {
        match self {
            VersionDimension::OsBuild => "Version",
            VersionDimension::Radio => "RadioVersion",
        }
    }

    pub fn daily_entity_name(self) -> &'static str {
        match self {
            VersionDimension::OsBuild => "VersionDaily",
            VersionDimension::Radio => "RadioVersionDaily",
        }
    }

    /// Legacy devices report no radio version; those rows are skipped when
    /// aggregating along the radio axis.
    pub fn requires_version(self) -> bool {
        matches!(self, VersionDimension::Radio)
    }
}

impl std::fmt::Display for VersionDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.entity_name())
    }
}

fn default_ingested_at() -> DateTime<Utc> {
    Utc::now()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub device_id: String,
    pub build_fingerprint: String,
    #[serde(default)]
    pub radio_version: Option<String>,
    pub reported_at: DateTime<Utc>,
    #[serde(default = "default_ingested_at")]
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashReport {
    pub device_id: String,
    pub build_fingerprint: String,
    #[serde(default)]
    pub radio_version: Option<String>,
    pub boot_reason: String,
    pub reported_at: DateTime<Utc>,
    #[serde(default = "default_ingested_at")]
    pub ingested_at: DateTime<Utc>,
}

/// Wire shape for the ingestion path (JSON lines, tagged by kind).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DeviceReport {
    Heartbeat(Heartbeat),
    CrashReport(CrashReport),
}
