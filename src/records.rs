//! Group leaderboards served from the stats cache with rough-then-refine.
//!
//! The cached stats may be stale. A query first ranks by the cached values,
//! then recomputes the keys that could change the outcome (stale rows and
//! uncached keys whose raw counts reach the cut-off), and ranks again.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chart::{ChartType, ValidationError};
use crate::config::RecordsConfig;
use crate::db::stats::StatField;
use crate::db::{Database, DbError};
use crate::stats::recompute_stats;

#[derive(Error, Debug)]
pub enum RecordsError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Database error: {0}")]
    Db(#[from] DbError),
}

/// A supported leaderboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RecordType {
    WeeksAtNumberOne(ChartType),
    WeeksCharting(ChartType),
    TotalPlays(ChartType),
    /// Members by number of entries they are the major driver of
    EntriesDriven,
}

impl RecordType {
    pub fn all() -> Vec<RecordType> {
        let mut all = Vec::with_capacity(3 * ChartType::ALL.len() + 1);
        for ct in ChartType::ALL {
            all.push(RecordType::WeeksAtNumberOne(ct));
            all.push(RecordType::WeeksCharting(ct));
            all.push(RecordType::TotalPlays(ct));
        }
        all.push(RecordType::EntriesDriven);
        all
    }

    /// Parse a record name plus optional chart type, as given on the command line.
    pub fn parse(name: &str, chart_type: Option<&str>) -> Result<Self, ValidationError> {
        let chart_type = chart_type.map(str::parse::<ChartType>).transpose()?;
        let needs_type = |ct: Option<ChartType>| ct.ok_or_else(|| ValidationError::RecordType(format!("{name} needs a chart type")));
        match name.trim().to_lowercase().as_str() {
            "weeks_at_number_one" | "number_ones" => Ok(RecordType::WeeksAtNumberOne(needs_type(chart_type)?)),
            "weeks_charting" => Ok(RecordType::WeeksCharting(needs_type(chart_type)?)),
            "total_plays" => Ok(RecordType::TotalPlays(needs_type(chart_type)?)),
            "entries_driven" => Ok(RecordType::EntriesDriven),
            other => Err(ValidationError::RecordType(other.to_string())),
        }
    }

    pub fn key(&self) -> String {
        match self {
            RecordType::WeeksAtNumberOne(ct) => format!("weeks_at_number_one:{ct}"),
            RecordType::WeeksCharting(ct) => format!("weeks_charting:{ct}"),
            RecordType::TotalPlays(ct) => format!("total_plays:{ct}"),
            RecordType::EntriesDriven => "entries_driven".to_string(),
        }
    }

    fn entry_field(&self) -> Option<(ChartType, StatField)> {
        match *self {
            RecordType::WeeksAtNumberOne(ct) => Some((ct, StatField::WeeksAtNumberOne)),
            RecordType::WeeksCharting(ct) => Some((ct, StatField::WeeksCharting)),
            RecordType::TotalPlays(ct) => Some((ct, StatField::TotalPlays)),
            RecordType::EntriesDriven => None,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for RecordType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((name, ct)) => Self::parse(name, Some(ct)),
            None => Self::parse(s, None),
        }
    }
}

impl TryFrom<String> for RecordType {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RecordType> for String {
    fn from(r: RecordType) -> String {
        r.key()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordsStatus {
    Pending,
    Completed,
}

impl RecordsStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for RecordsStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown records status {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub rank: i64,
    pub entry_key: String,
    pub name: String,
    pub artist: Option<String>,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub rank: i64,
    pub user_id: i64,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "rows", rename_all = "snake_case")]
pub enum Leaderboard {
    Entries(Vec<EntryRecord>),
    Members(Vec<MemberRecord>),
}

impl Leaderboard {
    pub fn len(&self) -> usize {
        match self {
            Leaderboard::Entries(rows) => rows.len(),
            Leaderboard::Members(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stored record-type → leaderboard map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupRecords(pub BTreeMap<RecordType, Leaderboard>);

impl GroupRecords {
    pub fn get(&self, record: &RecordType) -> Option<&Leaderboard> {
        self.0.get(record)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Compute one leaderboard, refreshing whichever stats could change it.
pub fn query_record(
    db: &Database,
    group_id: i64,
    record: RecordType,
    params: &RecordsConfig,
    workers: usize,
) -> Result<Leaderboard, RecordsError> {
    let top_n = params.top_n.max(1);

    let Some((chart_type, field)) = record.entry_field() else {
        let mut candidates = db.stale_stats_keys(group_id, None)?;
        candidates.extend(db.keys_without_stats(group_id)?);
        candidates.truncate(params.refresh_batch_size);
        recompute_stats(db, group_id, &candidates, workers);

        let rows = db
            .driven_entry_counts(group_id, top_n)?
            .into_iter()
            .filter(|&(_, value)| value > 0)
            .enumerate()
            .map(|(i, (user_id, value))| MemberRecord { rank: i as i64 + 1, user_id, value })
            .collect();
        return Ok(Leaderboard::Members(rows));
    };

    // Rough pass over possibly stale cached values
    let rough = db.top_stats_by(group_id, chart_type, field, top_n)?;
    let threshold = rough.get(top_n - 1).map(|r| r.value).unwrap_or(1).max(1);

    let mut candidates: Vec<(ChartType, String)> = rough
        .iter()
        .filter(|r| r.stale)
        .map(|r| (chart_type, r.entry_key.clone()))
        .collect();
    for key in db.missing_stats_candidates(group_id, chart_type, field, threshold)? {
        candidates.push((chart_type, key));
    }
    for key in db.stale_stats_keys(group_id, Some(chart_type))? {
        if !candidates.contains(&key) {
            candidates.push(key);
        }
    }
    candidates.truncate(params.refresh_batch_size);

    if !candidates.is_empty() {
        let refreshed = recompute_stats(db, group_id, &candidates, workers);
        log::debug!(
            "Refreshed {} stats rows for {} ({} failed)",
            refreshed.updated + refreshed.removed,
            record,
            refreshed.failed
        );
    }

    let rows = db
        .top_stats_by(group_id, chart_type, field, top_n)?
        .into_iter()
        .filter(|r| r.value > 0)
        .enumerate()
        .map(|(i, r)| EntryRecord {
            rank: i as i64 + 1,
            entry_key: r.entry_key,
            name: r.name,
            artist: r.artist,
            value: r.value,
        })
        .collect();
    Ok(Leaderboard::Entries(rows))
}

/// Recompute every leaderboard of a group and store them.
///
/// The stored status is `pending` while this runs and `completed` after.
pub fn refresh_group_records(
    db: &Database,
    group_id: i64,
    params: &RecordsConfig,
    workers: usize,
) -> Result<GroupRecords, RecordsError> {
    db.get_group(group_id)?;
    db.set_records_status(group_id, RecordsStatus::Pending)?;

    let mut records = GroupRecords::default();
    for record in RecordType::all() {
        let board = query_record(db, group_id, record, params, workers)?;
        records.0.insert(record, board);
    }

    db.store_records(group_id, &records, RecordsStatus::Completed)?;
    log::info!("Stored {} leaderboards for group {}", records.0.len(), group_id);
    Ok(records)
}
