use chrono::{DateTime, Utc};
use fp_core::{default_filters, Category, CategoryFilter, FilterError, VersionDimension};
use fp_storage::{ResetReport, StatsStore, StorageError};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("filter error: {0}")]
    Filter(#[from] FilterError),
}

/// Dimensions and category passes of one aggregation run. Built explicitly
/// and handed to the engine; there is no ambient global configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub dimensions: Vec<VersionDimension>,
    pub filters: Vec<CategoryFilter>,
}

impl RunConfig {
    pub fn standard() -> Result<Self, StatsError> {
        Ok(Self {
            dimensions: VersionDimension::all().to_vec(),
            filters: default_filters()?,
        })
    }
}

/// Created/updated tallies of one run, per entity and per counter category.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    created: BTreeMap<&'static str, u64>,
    updated: BTreeMap<(&'static str, Category), u64>,
}

impl RunReport {
    fn record(&mut self, entity: &'static str, category: Category, created: bool) {
        if created {
            *self.created.entry(entity).or_default() += 1;
        } else {
            *self.updated.entry((entity, category)).or_default() += 1;
        }
    }

    pub fn created(&self, entity: &str) -> u64 {
        self.created.get(entity).copied().unwrap_or_default()
    }

    pub fn updated(&self, entity: &'static str, category: Category) -> u64 {
        self.updated
            .get(&(entity, category))
            .copied()
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty()
    }

    /// Human-readable report lines in the operator output format.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (entity, count) in &self.created {
            lines.push(format!("{count} {entity} created"));
        }
        for ((entity, category), count) in &self.updated {
            lines.push(format!("{count} {entity} updated for counter {category}"));
        }
        lines
    }
}

pub fn reset_lines(report: &ResetReport) -> Vec<String> {
    vec![
        format!("{} Version deleted", report.versions),
        format!("{} VersionDaily deleted", report.version_dailies),
        format!("{} RadioVersion deleted", report.radio_versions),
        format!("{} RadioVersionDaily deleted", report.radio_version_dailies),
        format!("{} Checkpoint deleted", report.checkpoints),
    ]
}

/// Incremental aggregation engine: drives windowed scans over the raw event
/// store and merges each group into the general and daily aggregates.
pub struct StatsEngine {
    config: RunConfig,
}

impl StatsEngine {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    pub fn standard() -> Result<Self, StatsError> {
        Ok(Self::new(RunConfig::standard()?))
    }

    /// One incremental pass: scans everything ingested after the last
    /// committed checkpoint, up to and including `now`.
    pub fn update(&self, store: &StatsStore) -> Result<RunReport, StatsError> {
        let lower = store.latest_checkpoint()?;
        // Captured once and shared by every dimension/filter pass, so events
        // ingested mid-run are either seen by all passes or by none.
        let upper = Utc::now();
        self.update_window(store, lower, upper)
    }

    /// The `update` primitive with explicit window bounds
    /// (lower exclusive, upper inclusive]. Commits the checkpoint at `upper`
    /// after both dimensions succeed.
    pub fn update_window(
        &self,
        store: &StatsStore,
        lower: Option<DateTime<Utc>>,
        upper: DateTime<Utc>,
    ) -> Result<RunReport, StatsError> {
        let mut report = RunReport::default();

        for &dimension in &self.config.dimensions {
            let mut groups_merged = 0u64;
            // All four category passes for a dimension commit together or not
            // at all; a failure aborts this dimension without a checkpoint.
            store.with_transaction(|store| {
                for filter in &self.config.filters {
                    let category = filter.category();
                    store.for_each_group(dimension, filter, lower, upper, |group| {
                        let outcome = store.merge_group(dimension, category, group)?;
                        report.record(dimension.entity_name(), category, outcome.general_created);
                        report.record(
                            dimension.daily_entity_name(),
                            category,
                            outcome.daily_created,
                        );
                        groups_merged += 1;
                        Ok(())
                    })?;
                }
                Ok(())
            })?;
            tracing::debug!(
                dimension = %dimension,
                groups = groups_merged,
                "dimension sweep committed"
            );
        }

        store.commit_checkpoint(upper)?;
        tracing::info!(upper = %upper, "aggregation checkpoint committed");
        Ok(report)
    }

    /// Full rebuild: delete all aggregates and checkpoints, then aggregate
    /// from the beginning of time. Manual release-date overrides are lost
    /// with the deleted rows.
    pub fn reset(&self, store: &StatsStore) -> Result<(ResetReport, RunReport), StatsError> {
        let deleted = store.reset_all()?;
        tracing::info!(
            versions = deleted.versions,
            radio_versions = deleted.radio_versions,
            "aggregates reset"
        );
        let report = self.update(store)?;
        Ok((deleted, report))
    }
}
