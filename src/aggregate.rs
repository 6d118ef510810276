//! Merge member snapshots into canonical per-entry totals for one group-week.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;

use crate::chart::ChartType;
use crate::db::models::{GroupWeekItem, MemberSnapshot};
use crate::db::{Database, DbError};
use crate::identity::entry_key;

/// Source of per-user weekly top lists.
///
/// `Ok(None)` means the user recorded nothing that week, which is not an error.
pub trait SnapshotProvider {
    fn snapshot(&self, user_id: i64, week_start: NaiveDate) -> Result<Option<MemberSnapshot>, DbError>;
}

impl SnapshotProvider for Database {
    fn snapshot(&self, user_id: i64, week_start: NaiveDate) -> Result<Option<MemberSnapshot>, DbError> {
        self.get_snapshot(user_id, week_start)
    }
}

/// One merged item with every member's contribution.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedEntry {
    pub entry_key: String,
    pub name: String,
    pub artist: Option<String>,
    pub playcount: i64,
    /// user_id → plays
    pub contributions: BTreeMap<i64, i64>,
}

impl AggregatedEntry {
    pub fn contributor_count(&self) -> usize {
        self.contributions.values().filter(|&&p| p > 0).count()
    }

    pub fn to_week_item(&self, chart_type: ChartType) -> GroupWeekItem {
        GroupWeekItem {
            chart_type,
            entry_key: self.entry_key.clone(),
            name: self.name.clone(),
            artist: self.artist.clone(),
            playcount: self.playcount,
            contributors: self.contributor_count() as i64,
        }
    }
}

/// Result of merging a group-week.
#[derive(Debug, Clone, Default)]
pub struct WeekAggregate {
    pub lists: BTreeMap<ChartType, Vec<AggregatedEntry>>,
    /// Sum of all members' artist plays for the week
    pub total_plays: i64,
    /// Members that contributed a snapshot
    pub contributing_members: usize,
}

impl WeekAggregate {
    pub fn list(&self, chart_type: ChartType) -> &[AggregatedEntry] {
        self.lists.get(&chart_type).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Fetch and merge the snapshots of `members` for the week.
///
/// A member without a snapshot, or whose snapshot cannot be read, contributes
/// nothing; the rest of the group is still aggregated.
pub fn aggregate_week<P: SnapshotProvider + ?Sized>(
    provider: &P,
    members: &[i64],
    week_start: NaiveDate,
    chart_types: &[ChartType],
) -> WeekAggregate {
    let mut snapshots = Vec::with_capacity(members.len());
    for &user_id in members {
        match provider.snapshot(user_id, week_start) {
            Ok(Some(s)) => snapshots.push(s),
            Ok(None) => log::debug!("No snapshot for user {} in week {}", user_id, week_start),
            Err(e) => log::warn!(
                "Skipping user {} for week {}: snapshot unavailable: {}",
                user_id, week_start, e
            ),
        }
    }
    merge_snapshots(&snapshots, chart_types)
}

/// Merge already-fetched snapshots. Output lists are ordered by entry key.
pub fn merge_snapshots(snapshots: &[MemberSnapshot], chart_types: &[ChartType]) -> WeekAggregate {
    let mut aggregate = WeekAggregate {
        contributing_members: snapshots.iter().filter(|s| !s.is_empty()).count(),
        ..WeekAggregate::default()
    };

    aggregate.total_plays = snapshots
        .iter()
        .flat_map(|s| s.artists.iter())
        .map(|i| i.playcount.max(0))
        .sum();

    for &chart_type in chart_types {
        let mut merged: HashMap<String, AggregatedEntry> = HashMap::new();
        // Best display candidate per key: (plays, user_id)
        let mut display_rank: HashMap<String, (i64, i64)> = HashMap::new();

        for snapshot in snapshots {
            for item in snapshot.items(chart_type) {
                if item.playcount <= 0 || item.name.trim().is_empty() {
                    continue;
                }
                let key = entry_key(chart_type, &item.name, item.artist.as_deref());
                let entry = merged.entry(key.clone()).or_insert_with(|| AggregatedEntry {
                    entry_key: key.clone(),
                    name: item.name.trim().to_string(),
                    artist: item.artist.as_ref().map(|a| a.trim().to_string()),
                    playcount: 0,
                    contributions: BTreeMap::new(),
                });
                entry.playcount += item.playcount;
                *entry.contributions.entry(snapshot.user_id).or_insert(0) += item.playcount;

                let candidate = (item.playcount, snapshot.user_id);
                let best = display_rank.entry(key).or_insert(candidate);
                if candidate.0 > best.0 || (candidate.0 == best.0 && candidate.1 < best.1) {
                    *best = candidate;
                    entry.name = item.name.trim().to_string();
                    entry.artist = item.artist.as_ref().map(|a| a.trim().to_string());
                }
            }
        }

        let mut list: Vec<AggregatedEntry> = merged.into_values().collect();
        list.sort_by(|a, b| a.entry_key.cmp(&b.entry_key));
        aggregate.lists.insert(chart_type, list);
    }

    aggregate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::SnapshotItem;
    use std::cell::RefCell;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn artists(user_id: i64, items: &[(&str, i64)]) -> MemberSnapshot {
        MemberSnapshot {
            user_id,
            week_start: d("2024-01-01"),
            artists: items
                .iter()
                .map(|(n, p)| SnapshotItem { name: n.to_string(), artist: None, playcount: *p })
                .collect(),
            ..MemberSnapshot::default()
        }
    }

    struct MapProvider {
        snapshots: HashMap<i64, MemberSnapshot>,
        failing: Vec<i64>,
        calls: RefCell<Vec<i64>>,
    }

    impl SnapshotProvider for MapProvider {
        fn snapshot(&self, user_id: i64, _week: NaiveDate) -> Result<Option<MemberSnapshot>, DbError> {
            self.calls.borrow_mut().push(user_id);
            if self.failing.contains(&user_id) {
                return Err(DbError::NotFound(format!("snapshot for {user_id}")));
            }
            Ok(self.snapshots.get(&user_id).cloned())
        }
    }

    #[test]
    fn test_sums_playcounts_across_members() {
        let agg = merge_snapshots(
            &[artists(1, &[("Artist X", 10)]), artists(2, &[("artist x", 5), ("Y", 2)])],
            &[ChartType::Artists],
        );
        let list = agg.list(ChartType::Artists);
        assert_eq!(list.len(), 2);
        let x = &list[0];
        assert_eq!(x.entry_key, "artist x");
        assert_eq!(x.playcount, 15);
        assert_eq!(x.contributions.get(&1), Some(&10));
        assert_eq!(x.contributions.get(&2), Some(&5));
        assert_eq!(x.contributor_count(), 2);
        // Display name taken from the biggest contribution
        assert_eq!(x.name, "Artist X");
        assert_eq!(agg.total_plays, 17);
        assert_eq!(agg.contributing_members, 2);
    }

    #[test]
    fn test_display_tie_prefers_lowest_user() {
        let agg = merge_snapshots(
            &[artists(7, &[("LOW", 3)]), artists(3, &[("Low", 3)])],
            &[ChartType::Artists],
        );
        assert_eq!(agg.list(ChartType::Artists)[0].name, "Low");
    }

    #[test]
    fn test_tracks_keyed_by_artist() {
        let snap = MemberSnapshot {
            user_id: 1,
            week_start: d("2024-01-01"),
            tracks: vec![
                SnapshotItem { name: "Intro".into(), artist: Some("The xx".into()), playcount: 4 },
                SnapshotItem { name: "Intro".into(), artist: Some("M83".into()), playcount: 2 },
            ],
            ..MemberSnapshot::default()
        };
        let agg = merge_snapshots(&[snap], &[ChartType::Tracks]);
        let keys: Vec<&str> = agg.list(ChartType::Tracks).iter().map(|e| e.entry_key.as_str()).collect();
        assert_eq!(keys, vec!["intro|m83", "intro|the xx"]);
    }

    #[test]
    fn test_ignores_zero_and_blank_items() {
        let agg = merge_snapshots(&[artists(1, &[("", 5), ("Nobody", 0)])], &[ChartType::Artists]);
        assert!(agg.list(ChartType::Artists).is_empty());
    }

    #[test]
    fn test_missing_and_failing_members_do_not_fail_group() {
        let mut snapshots = HashMap::new();
        snapshots.insert(1, artists(1, &[("X", 10)]));
        let provider = MapProvider { snapshots, failing: vec![3], calls: RefCell::new(Vec::new()) };

        let agg = aggregate_week(&provider, &[1, 2, 3], d("2024-01-01"), &ChartType::ALL);
        assert_eq!(*provider.calls.borrow(), vec![1, 2, 3]);
        assert_eq!(agg.contributing_members, 1);
        assert_eq!(agg.list(ChartType::Artists)[0].playcount, 10);
        assert!(agg.list(ChartType::Albums).is_empty());
    }
}
