use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::chart::{ChartMode, ChartType, EntryType};

/// A user row read from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub name: String,
}

/// One ranked item of a member's weekly top list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotItem {
    pub name: String,
    #[serde(default)]
    pub artist: Option<String>,
    pub playcount: i64,
}

/// A member's weekly top lists as supplied by the listening-history provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemberSnapshot {
    pub user_id: i64,
    pub week_start: NaiveDate,
    pub artists: Vec<SnapshotItem>,
    pub tracks: Vec<SnapshotItem>,
    pub albums: Vec<SnapshotItem>,
}

impl MemberSnapshot {
    pub fn items(&self, chart_type: ChartType) -> &[SnapshotItem] {
        match chart_type {
            ChartType::Artists => &self.artists,
            ChartType::Tracks => &self.tracks,
            ChartType::Albums => &self.albums,
        }
    }

    pub fn items_mut(&mut self, chart_type: ChartType) -> &mut Vec<SnapshotItem> {
        match chart_type {
            ChartType::Artists => &mut self.artists,
            ChartType::Tracks => &mut self.tracks,
            ChartType::Albums => &mut self.albums,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.artists.is_empty() && self.tracks.is_empty() && self.albums.is_empty()
    }
}

/// Data for creating a group.
pub struct NewGroup {
    pub name: String,
    pub owner_id: i64,
    pub chart_mode: ChartMode,
    pub chart_size: i64,
    pub tracking_day: i64,
    pub is_private: bool,
    pub allow_free_join: bool,
}

/// Group configuration read from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub owner_id: i64,
    pub chart_mode: ChartMode,
    pub chart_size: i64,
    pub tracking_day: i64,
    pub is_private: bool,
    pub allow_free_join: bool,
}

/// One merged item of a group-week, including items below the chart cutoff.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupWeekItem {
    pub chart_type: ChartType,
    pub entry_key: String,
    pub name: String,
    pub artist: Option<String>,
    pub playcount: i64,
    pub contributors: i64,
}

/// A ranked chart row ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChartEntry {
    pub chart_type: ChartType,
    pub entry_key: String,
    pub position: i64,
    pub playcount: i64,
    pub vibe_score: Option<f64>,
    pub position_change: Option<i64>,
    pub entry_type: EntryType,
    pub name: String,
    pub artist: Option<String>,
    pub slug: String,
    pub major_driver_id: Option<i64>,
    /// (user_id, playcount) per contributing member
    pub contributions: Vec<(i64, i64)>,
}

/// Everything a single group-week materializes, written in one transaction.
#[derive(Debug, Clone)]
pub struct WeekMaterialization {
    pub group_id: i64,
    pub week_start: NaiveDate,
    pub total_plays: i64,
    pub member_count: i64,
    pub items: Vec<GroupWeekItem>,
    pub entries: Vec<NewChartEntry>,
}

/// A chart row read back for display, with the driver's name joined in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartEntry {
    pub week_start: NaiveDate,
    pub chart_type: ChartType,
    pub entry_key: String,
    pub position: i64,
    pub playcount: i64,
    pub vibe_score: Option<f64>,
    pub position_change: Option<i64>,
    pub entry_type: EntryType,
    pub name: String,
    pub artist: Option<String>,
    pub slug: String,
    pub major_driver_id: Option<i64>,
    pub major_driver_name: Option<String>,
}

/// One week of an entry's chart history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryRow {
    pub week_start: NaiveDate,
    pub position: i64,
    pub playcount: i64,
}

/// Group-week totals.
#[derive(Debug, Clone, PartialEq)]
pub struct WeeklyStats {
    pub group_id: i64,
    pub week_start: NaiveDate,
    pub total_plays: i64,
    pub member_count: i64,
}

/// Cached aggregate for one entry key.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryStats {
    pub group_id: i64,
    pub chart_type: ChartType,
    pub entry_key: String,
    pub peak_position: i64,
    pub weeks_at_peak: i64,
    pub weeks_at_number_one: i64,
    pub total_weeks_charting: i64,
    pub total_weeks_appeared: i64,
    pub total_playcount: i64,
    pub major_driver_id: Option<i64>,
    pub major_driver_plays: i64,
    pub stale: bool,
}

/// A queued regeneration left behind by an overlap cleanup.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedWeek {
    pub group_id: i64,
    pub week_start: NaiveDate,
    pub reason: String,
}

/// Stored compatibility between a user and a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityScore {
    pub user_id: i64,
    pub group_id: i64,
    pub score: f64,
    pub artist_overlap: f64,
    pub track_overlap: f64,
    pub genre_overlap: f64,
    pub pattern_score: f64,
    pub computed_at: DateTime<Utc>,
}

/// Database-wide counters.
#[derive(Debug)]
pub struct DatabaseStats {
    pub users: i64,
    pub groups: i64,
    pub snapshot_weeks: i64,
    pub chart_weeks: i64,
    pub chart_entries: i64,
    pub stale_stats: i64,
    pub queued_weeks: i64,
}
