use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use fp_core::{Category, CategoryFilter, CrashReport, Heartbeat, VersionDimension};
use rusqlite::{params, params_from_iter, types::Value, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;

pub const STATS_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// One (version identifier, calendar day) bucket produced by a windowed scan,
/// with the number of distinct (device, reported_at) events in the bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportGroup {
    pub version_identifier: String,
    pub day: NaiveDate,
    pub distinct_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    pub general_created: bool,
    pub daily_created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneralStats {
    pub version_identifier: String,
    pub first_seen_on: NaiveDate,
    pub released_on: NaiveDate,
    pub heartbeats: i64,
    pub scheduled_resets: i64,
    pub unexpected_resets: i64,
    pub other: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyStats {
    pub version_identifier: String,
    pub day: NaiveDate,
    pub heartbeats: i64,
    pub scheduled_resets: i64,
    pub unexpected_resets: i64,
    pub other: i64,
}

impl GeneralStats {
    pub fn counter(&self, category: Category) -> i64 {
        match category {
            Category::Heartbeat => self.heartbeats,
            Category::ScheduledReset => self.scheduled_resets,
            Category::UnexpectedReset => self.unexpected_resets,
            Category::Other => self.other,
        }
    }
}

impl DailyStats {
    pub fn counter(&self, category: Category) -> i64 {
        match category {
            Category::Heartbeat => self.heartbeats,
            Category::ScheduledReset => self.scheduled_resets,
            Category::UnexpectedReset => self.unexpected_resets,
            Category::Other => self.other,
        }
    }
}

/// Row counts removed by a full reset, per entity type.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResetReport {
    pub versions: u64,
    pub version_dailies: u64,
    pub radio_versions: u64,
    pub radio_version_dailies: u64,
    pub checkpoints: u64,
}

pub struct StatsStore {
    conn: Connection,
}

impl StatsStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    fn configure(&self) -> Result<(), StorageError> {
        // Daily rows are removed through the parent's ON DELETE CASCADE.
        self.conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > STATS_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: STATS_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_stats_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Runs `f` inside one transaction; rolls back if it returns an error.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&Self) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let value = f(self)?;
        tx.commit()?;
        Ok(value)
    }

    /// Returns false when a report with the same (device, reported_at) key
    /// already exists; duplicate submissions dedupe here, not in the engine.
    pub fn insert_heartbeat(&self, heartbeat: &Heartbeat) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "
            INSERT OR IGNORE INTO heartbeats (
                device_id,
                build_fingerprint,
                radio_version,
                reported_at,
                ingested_at
            ) VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                heartbeat.device_id,
                heartbeat.build_fingerprint,
                heartbeat.radio_version,
                fmt_ts(heartbeat.reported_at),
                fmt_ts(heartbeat.ingested_at),
            ],
        )?;
        Ok(changes > 0)
    }

    pub fn insert_crash_report(&self, crash: &CrashReport) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "
            INSERT OR IGNORE INTO crash_reports (
                device_id,
                build_fingerprint,
                radio_version,
                boot_reason,
                reported_at,
                ingested_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                crash.device_id,
                crash.build_fingerprint,
                crash.radio_version,
                crash.boot_reason,
                fmt_ts(crash.reported_at),
                fmt_ts(crash.ingested_at),
            ],
        )?;
        Ok(changes > 0)
    }

    /// Streams (version identifier, day, distinct count) groups for one
    /// dimension/filter pass over the `ingested_at` window
    /// (lower exclusive, upper inclusive]. Groups are visited in statement
    /// order and never collected, so catch-up scans stay bounded in memory.
    ///
    /// Distinctness is on (device_id, reported_at): two devices reporting the
    /// same timestamp both count, repeated submissions of one report do not.
    pub fn for_each_group(
        &self,
        dimension: VersionDimension,
        filter: &CategoryFilter,
        lower_exclusive: Option<DateTime<Utc>>,
        upper_inclusive: DateTime<Utc>,
        mut visit: impl FnMut(&ReportGroup) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        let table = if filter.category() == Category::Heartbeat {
            "heartbeats"
        } else {
            "crash_reports"
        };
        let version_column = raw_version_column(dimension);

        let mut sql = format!(
            "
            SELECT {version_column},
                   date(reported_at) AS day,
                   COUNT(DISTINCT device_id || '|' || reported_at) AS distinct_count
            FROM {table}
            WHERE ingested_at <= ?
            "
        );
        let mut bindings = vec![Value::Text(fmt_ts(upper_inclusive))];
        if let Some(lower) = lower_exclusive {
            sql.push_str(" AND ingested_at > ?");
            bindings.push(Value::Text(fmt_ts(lower)));
        }
        if dimension.requires_version() {
            sql.push_str(&format!(" AND {version_column} IS NOT NULL"));
        }
        if filter.category() != Category::Heartbeat {
            if let Some(include) = filter.include() {
                sql.push_str(&format!(
                    " AND boot_reason IN ({})",
                    placeholders(include.len())
                ));
                bindings.extend(include.iter().cloned().map(Value::Text));
            }
            if let Some(exclude) = filter.exclude() {
                sql.push_str(&format!(
                    " AND boot_reason NOT IN ({})",
                    placeholders(exclude.len())
                ));
                bindings.extend(exclude.iter().cloned().map(Value::Text));
            }
        }
        sql.push_str(&format!(
            " GROUP BY {version_column}, day ORDER BY {version_column}, day"
        ));

        let mut statement = self.conn.prepare(&sql)?;
        let mut rows = statement.query(params_from_iter(bindings))?;
        while let Some(row) = rows.next()? {
            let day: String = row.get(1)?;
            let group = ReportGroup {
                version_identifier: row.get(0)?,
                day: parse_day(&day)?,
                distinct_count: row.get(2)?,
            };
            visit(&group)?;
        }
        Ok(())
    }

    /// Upserts one group into the general and daily aggregates for a
    /// dimension. Counter increments are relative (`c = c + n`) at the SQL
    /// layer, so groups from different category passes that land on the same
    /// row within one run compose without lost updates.
    pub fn merge_group(
        &self,
        dimension: VersionDimension,
        category: Category,
        group: &ReportGroup,
    ) -> Result<MergeOutcome, StorageError> {
        let stats = stats_table(dimension);
        let daily = daily_table(dimension);
        let counter = counter_column(category);
        let day = group.day.to_string();

        let existing: Option<(String, String)> = self
            .conn
            .query_row(
                &format!(
                    "SELECT first_seen_on, released_on FROM {stats} WHERE version_identifier = ?1"
                ),
                [&group.version_identifier],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let general_created = match existing {
            None => {
                self.conn.execute(
                    &format!(
                        "
                        INSERT INTO {stats} (version_identifier, first_seen_on, released_on)
                        VALUES (?1, ?2, ?2)
                        "
                    ),
                    params![group.version_identifier, day],
                )?;
                true
            }
            Some((first_seen_raw, released_raw)) => {
                let first_seen = parse_day(&first_seen_raw)?;
                if group.day < first_seen {
                    // released_on tracks first_seen_on only until an operator
                    // diverges it; after that it is never touched again.
                    if released_raw == first_seen_raw {
                        self.conn.execute(
                            &format!(
                                "
                                UPDATE {stats} SET first_seen_on = ?1, released_on = ?1
                                WHERE version_identifier = ?2
                                "
                            ),
                            params![day, group.version_identifier],
                        )?;
                    } else {
                        self.conn.execute(
                            &format!(
                                "UPDATE {stats} SET first_seen_on = ?1 WHERE version_identifier = ?2"
                            ),
                            params![day, group.version_identifier],
                        )?;
                    }
                }
                false
            }
        };

        self.conn.execute(
            &format!(
                "UPDATE {stats} SET {counter} = {counter} + ?1 WHERE version_identifier = ?2"
            ),
            params![group.distinct_count, group.version_identifier],
        )?;

        let daily_created = self.conn.execute(
            &format!("INSERT OR IGNORE INTO {daily} (version_identifier, day) VALUES (?1, ?2)"),
            params![group.version_identifier, day],
        )? > 0;
        self.conn.execute(
            &format!(
                "
                UPDATE {daily} SET {counter} = {counter} + ?1
                WHERE version_identifier = ?2 AND day = ?3
                "
            ),
            params![group.distinct_count, group.version_identifier, day],
        )?;

        Ok(MergeOutcome {
            general_created,
            daily_created,
        })
    }

    /// Operator-facing override of the release date. Once set to a value
    /// different from `first_seen_on`, the merge engine stops tracking it.
    pub fn set_released_on(
        &self,
        dimension: VersionDimension,
        version_identifier: &str,
        released_on: NaiveDate,
    ) -> Result<bool, StorageError> {
        let stats = stats_table(dimension);
        let changes = self.conn.execute(
            &format!("UPDATE {stats} SET released_on = ?1 WHERE version_identifier = ?2"),
            params![released_on.to_string(), version_identifier],
        )?;
        Ok(changes > 0)
    }

    pub fn general_stats(
        &self,
        dimension: VersionDimension,
        version_identifier: &str,
    ) -> Result<Option<GeneralStats>, StorageError> {
        let stats = stats_table(dimension);
        let row = self
            .conn
            .query_row(
                &format!(
                    "
                    SELECT version_identifier, first_seen_on, released_on,
                           heartbeats, scheduled_resets, unexpected_resets, other
                    FROM {stats}
                    WHERE version_identifier = ?1
                    "
                ),
                [version_identifier],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(identifier, first_seen, released, heartbeats, scheduled, unexpected, other)| {
            Ok(GeneralStats {
                version_identifier: identifier,
                first_seen_on: parse_day(&first_seen)?,
                released_on: parse_day(&released)?,
                heartbeats,
                scheduled_resets: scheduled,
                unexpected_resets: unexpected,
                other,
            })
        })
        .transpose()
    }

    pub fn daily_stats(
        &self,
        dimension: VersionDimension,
        version_identifier: &str,
    ) -> Result<Vec<DailyStats>, StorageError> {
        let daily = daily_table(dimension);
        let mut statement = self.conn.prepare(&format!(
            "
            SELECT version_identifier, day,
                   heartbeats, scheduled_resets, unexpected_resets, other
            FROM {daily}
            WHERE version_identifier = ?1
            ORDER BY day ASC
            "
        ))?;

        let rows = statement.query_map([version_identifier], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (identifier, day, heartbeats, scheduled, unexpected, other) = row?;
            entries.push(DailyStats {
                version_identifier: identifier,
                day: parse_day(&day)?,
                heartbeats,
                scheduled_resets: scheduled,
                unexpected_resets: unexpected,
                other,
            });
        }
        Ok(entries)
    }

    pub fn general_stats_count(&self, dimension: VersionDimension) -> Result<u64, StorageError> {
        self.count_rows(stats_table(dimension))
    }

    /// Inclusive upper bound of the last completed run, if any run completed.
    pub fn latest_checkpoint(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT updated_at FROM stats_checkpoints ORDER BY updated_at DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|value| parse_ts(&value)).transpose()
    }

    /// Only called after every merge of the run has committed.
    pub fn commit_checkpoint(&self, upper_bound: DateTime<Utc>) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO stats_checkpoints (updated_at) VALUES (?1)",
            [fmt_ts(upper_bound)],
        )?;
        Ok(())
    }

    /// Deletes every aggregate row in both dimensions plus all checkpoints.
    /// The next update run scans from the beginning of time.
    pub fn reset_all(&self) -> Result<ResetReport, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let report = ResetReport {
            versions: self.count_rows("version_stats")?,
            version_dailies: self.count_rows("version_daily_stats")?,
            radio_versions: self.count_rows("radio_version_stats")?,
            radio_version_dailies: self.count_rows("radio_version_daily_stats")?,
            checkpoints: self.count_rows("stats_checkpoints")?,
        };
        self.conn.execute("DELETE FROM version_stats", [])?;
        self.conn.execute("DELETE FROM radio_version_stats", [])?;
        self.conn.execute("DELETE FROM stats_checkpoints", [])?;
        tx.commit()?;
        Ok(report)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    fn count_rows(&self, table: &str) -> Result<u64, StorageError> {
        let count: i64 =
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                })?;
        Ok(count as u64)
    }
}

fn stats_table(dimension: VersionDimension) -> &'static str {
    match dimension {
        VersionDimension::OsBuild => "version_stats",
        VersionDimension::Radio => "radio_version_stats",
    }
}

fn daily_table(dimension: VersionDimension) -> &'static str {
    match dimension {
        VersionDimension::OsBuild => "version_daily_stats",
        VersionDimension::Radio => "radio_version_daily_stats",
    }
}

fn raw_version_column(dimension: VersionDimension) -> &'static str {
    match dimension {
        VersionDimension::OsBuild => "build_fingerprint",
        VersionDimension::Radio => "radio_version",
    }
}

fn counter_column(category: Category) -> &'static str {
    match category {
        Category::Heartbeat => "heartbeats",
        Category::ScheduledReset => "scheduled_resets",
        Category::UnexpectedReset => "unexpected_resets",
        Category::Other => "other",
    }
}

fn placeholders(count: usize) -> String {
    let mut out = String::new();
    for index in 0..count {
        if index > 0 {
            out.push(',');
        }
        out.push('?');
    }
    out
}

fn fmt_ts(value: DateTime<Utc>) -> String {
    // Fixed precision keeps lexicographic TEXT comparison consistent with
    // chronological order.
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

fn parse_day(value: &str) -> Result<NaiveDate, StorageError> {
    value
        .parse::<NaiveDate>()
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}
