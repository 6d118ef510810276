//! Week-over-week trends derived from ranked chart history.
//!
//! Runs once per materialized group-week, after ranking. Everything here is
//! read from stored chart rows, so re-running for the same week yields the
//! same payload.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::chart::ChartType;
use crate::config::TrendsConfig;
use crate::db::models::{ChartEntry, HistoryRow};
use crate::db::{Database, Result};

/// Longest gap between two materialized weeks that still counts as contiguous.
const MAX_STREAK_GAP_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupTrends {
    pub group_id: i64,
    pub week_start: NaiveDate,
    pub total_plays: i64,
    /// `None` when there is no previous materialized week
    pub total_plays_change: Option<i64>,
    pub chart_turnover: i64,
    pub new_entries: Vec<TrendEntry>,
    pub biggest_climbers: Vec<Climber>,
    pub comebacks: Vec<Comeback>,
    pub streaks: Vec<Streak>,
    pub fun_facts: Vec<FunFact>,
    pub member_spotlight: Option<MemberSpotlight>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendEntry {
    pub chart_type: ChartType,
    pub entry_key: String,
    pub name: String,
    pub artist: Option<String>,
    pub position: i64,
}

impl TrendEntry {
    fn from_chart(e: &ChartEntry) -> Self {
        Self {
            chart_type: e.chart_type,
            entry_key: e.entry_key.clone(),
            name: e.name.clone(),
            artist: e.artist.clone(),
            position: e.position,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Climber {
    pub entry: TrendEntry,
    pub position_change: i64,
    /// Current position is the best the entry has ever held
    pub is_new_peak: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comeback {
    pub entry: TrendEntry,
    /// Materialized weeks between the last prior appearance and this week
    pub weeks_away: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Streak {
    pub entry: TrendEntry,
    pub weeks: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FunFact {
    NumberOne {
        chart_type: ChartType,
        name: String,
        artist: Option<String>,
        total_weeks_at_number_one: i64,
    },
    MostShared {
        chart_type: ChartType,
        name: String,
        artist: Option<String>,
        contributors: i64,
    },
    LongestStreak {
        chart_type: ChartType,
        name: String,
        artist: Option<String>,
        weeks: i64,
    },
}

/// Member with the largest combined contribution to this week's charts.
///
/// Carries the user id only; display names are joined when rendered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberSpotlight {
    pub user_id: i64,
    pub playcount: i64,
    pub entries_contributed: i64,
    pub highlight: String,
    pub top_items: Vec<SpotlightItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotlightItem {
    pub chart_type: ChartType,
    pub name: String,
    pub artist: Option<String>,
    pub playcount: i64,
}

/// Length of the streak ending at `weeks[idx]`.
///
/// `positions` maps week start → position for one entry. The walk stops at the
/// first week that is missing, below `threshold`, or more than a week apart
/// from its successor.
pub fn streak_length(
    weeks: &[NaiveDate],
    idx: usize,
    positions: &HashMap<NaiveDate, i64>,
    threshold: i64,
) -> i64 {
    let holds = |w: &NaiveDate| positions.get(w).is_some_and(|&p| p <= threshold);
    if idx >= weeks.len() || !holds(&weeks[idx]) {
        return 0;
    }
    let mut length = 1;
    let mut i = idx;
    while i > 0 {
        let (prev, cur) = (weeks[i - 1], weeks[i]);
        if (cur - prev).num_days() > MAX_STREAK_GAP_DAYS || !holds(&prev) {
            break;
        }
        length += 1;
        i -= 1;
    }
    length
}

/// Derive and store trends for one materialized group-week.
pub fn analyze_week(
    db: &Database,
    group_id: i64,
    week_start: NaiveDate,
    params: &TrendsConfig,
) -> Result<GroupTrends> {
    let weeks = db.materialized_weeks(group_id)?;
    let Some(idx) = weeks.iter().position(|w| *w == week_start) else {
        return Err(crate::db::DbError::NotFound(format!(
            "materialized week {week_start} for group {group_id}"
        )));
    };
    let week_index: HashMap<NaiveDate, usize> = weeks.iter().enumerate().map(|(i, w)| (*w, i)).collect();

    let stats = db
        .weekly_stats(group_id, week_start)?
        .ok_or_else(|| crate::db::DbError::NotFound(format!("weekly stats for {week_start}")))?;
    let total_plays_change = match idx.checked_sub(1) {
        Some(prev) => db
            .weekly_stats(group_id, weeks[prev])?
            .map(|p| stats.total_plays - p.total_plays),
        None => None,
    };

    let mut new_entries = Vec::new();
    let mut climbers = Vec::new();
    let mut comebacks = Vec::new();
    let mut streaks = Vec::new();
    let mut fun_facts = Vec::new();
    let mut charted: HashMap<(ChartType, String), ChartEntry> = HashMap::new();

    for chart_type in ChartType::ALL {
        let chart = db.get_chart(group_id, chart_type, week_start)?;
        for entry in &chart {
            let history = db.entry_history(group_id, chart_type, &entry.entry_key)?;
            let positions: HashMap<NaiveDate, i64> =
                history.iter().map(|h| (h.week_start, h.position)).collect();

            match entry.position_change {
                None => {
                    new_entries.push(TrendEntry::from_chart(entry));
                    if let Some(weeks_away) = weeks_away(&history, week_start, &week_index, idx) {
                        comebacks.push(Comeback { entry: TrendEntry::from_chart(entry), weeks_away });
                    }
                }
                Some(change) if change > 0 => {
                    let best = history.iter().map(|h| h.position).min().unwrap_or(entry.position);
                    climbers.push(Climber {
                        entry: TrendEntry::from_chart(entry),
                        position_change: change,
                        is_new_peak: entry.position <= best,
                    });
                }
                Some(_) => {}
            }

            let length = streak_length(&weeks, idx, &positions, params.streak_threshold);
            if length >= 2 {
                streaks.push(Streak { entry: TrendEntry::from_chart(entry), weeks: length });
            }

            if chart_type == ChartType::Artists && entry.position == 1 {
                fun_facts.push(FunFact::NumberOne {
                    chart_type,
                    name: entry.name.clone(),
                    artist: entry.artist.clone(),
                    total_weeks_at_number_one: history.iter().filter(|h| h.position == 1).count() as i64,
                });
            }
        }
        for entry in chart {
            charted.insert((chart_type, entry.entry_key.clone()), entry);
        }
    }

    climbers.sort_by(|a, b| {
        b.position_change
            .cmp(&a.position_change)
            .then(a.entry.position.cmp(&b.entry.position))
            .then(a.entry.chart_type.cmp(&b.entry.chart_type))
    });
    // Cap per chart type, keeping the combined order
    let mut kept: HashMap<ChartType, usize> = HashMap::new();
    climbers.retain(|c| {
        let n = kept.entry(c.entry.chart_type).or_insert(0);
        *n += 1;
        *n <= params.max_climbers
    });
    streaks.sort_by(|a, b| b.weeks.cmp(&a.weeks).then(a.entry.position.cmp(&b.entry.position)));

    let contributions = db.week_contributions(group_id, week_start)?;
    if let Some(fact) = most_shared(&contributions, &charted) {
        fun_facts.push(fact);
    }
    if let Some(longest) = streaks.first() {
        fun_facts.push(FunFact::LongestStreak {
            chart_type: longest.entry.chart_type,
            name: longest.entry.name.clone(),
            artist: longest.entry.artist.clone(),
            weeks: longest.weeks,
        });
    }

    let trends = GroupTrends {
        group_id,
        week_start,
        total_plays: stats.total_plays,
        total_plays_change,
        chart_turnover: new_entries.len() as i64,
        new_entries,
        biggest_climbers: climbers,
        comebacks,
        streaks,
        fun_facts,
        member_spotlight: member_spotlight(&contributions, &charted),
    };
    db.store_trends(&trends)?;
    log::debug!(
        "Trends for group {} week {}: {} new, {} comebacks, {} streaks",
        group_id, week_start, trends.new_entries.len(), trends.comebacks.len(), trends.streaks.len()
    );
    Ok(trends)
}

/// Materialized weeks since the entry last charted, if it charted before and
/// skipped the immediately preceding week.
fn weeks_away(
    history: &[HistoryRow],
    week_start: NaiveDate,
    week_index: &HashMap<NaiveDate, usize>,
    idx: usize,
) -> Option<i64> {
    let last_prior = history.iter().rev().find(|h| h.week_start < week_start)?;
    let prior_idx = *week_index.get(&last_prior.week_start)?;
    let away = idx.checked_sub(prior_idx)?;
    (away >= 2).then_some(away as i64)
}

fn most_shared(
    contributions: &[(ChartType, String, i64, i64)],
    charted: &HashMap<(ChartType, String), ChartEntry>,
) -> Option<FunFact> {
    let mut counts: BTreeMap<(ChartType, &str), i64> = BTreeMap::new();
    for (chart_type, key, _, plays) in contributions {
        if *plays > 0 {
            *counts.entry((*chart_type, key.as_str())).or_insert(0) += 1;
        }
    }
    // BTreeMap order makes the earliest (type, key) win ties
    let ((chart_type, key), contributors) = counts
        .into_iter()
        .fold(None, |best: Option<((ChartType, &str), i64)>, (k, n)| match best {
            Some((_, best_n)) if best_n >= n => best,
            _ => Some((k, n)),
        })?;
    if contributors < 2 {
        return None;
    }
    let entry = charted.get(&(chart_type, key.to_string()))?;
    Some(FunFact::MostShared {
        chart_type,
        name: entry.name.clone(),
        artist: entry.artist.clone(),
        contributors,
    })
}

fn member_spotlight(
    contributions: &[(ChartType, String, i64, i64)],
    charted: &HashMap<(ChartType, String), ChartEntry>,
) -> Option<MemberSpotlight> {
    let mut totals: BTreeMap<i64, (i64, i64)> = BTreeMap::new();
    for (_, _, user_id, plays) in contributions {
        let t = totals.entry(*user_id).or_insert((0, 0));
        t.0 += plays;
        t.1 += 1;
    }
    // Ascending user id, strict `>` keeps the lowest id on ties
    let mut best: Option<(i64, i64, i64)> = None;
    for (&user_id, &(plays, count)) in &totals {
        match best {
            Some((_, best_plays, _)) if plays <= best_plays => {}
            _ => best = Some((user_id, plays, count)),
        }
    }
    let (user_id, playcount, entries_contributed) = best?;
    if playcount <= 0 {
        return None;
    }

    let mut items: Vec<SpotlightItem> = contributions
        .iter()
        .filter(|(_, _, uid, _)| *uid == user_id)
        .filter_map(|(chart_type, key, _, plays)| {
            let e = charted.get(&(*chart_type, key.clone()))?;
            Some(SpotlightItem {
                chart_type: *chart_type,
                name: e.name.clone(),
                artist: e.artist.clone(),
                playcount: *plays,
            })
        })
        .collect();
    items.sort_by(|a, b| b.playcount.cmp(&a.playcount).then_with(|| a.name.cmp(&b.name)));
    items.truncate(3);

    let highlight = match items.first() {
        Some(top) => format!(
            "{playcount} plays across {entries_contributed} charted entries, led by {} ({} plays)",
            top.name, top.playcount
        ),
        None => format!("{playcount} plays across {entries_contributed} charted entries"),
    };

    Some(MemberSpotlight { user_id, playcount, entries_contributed, highlight, top_items: items })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::{ChartMode, EntryType};
    use crate::db::models::{GroupWeekItem, NewChartEntry, NewGroup, WeekMaterialization};

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    struct Charts {
        db: Database,
        group_id: i64,
        alice: i64,
        bob: i64,
    }

    fn setup() -> Charts {
        let db = Database::open_in_memory().unwrap();
        let alice = db.upsert_user("alice").unwrap();
        let bob = db.upsert_user("bob").unwrap();
        let group_id = db
            .create_group(&NewGroup {
                name: "crew".into(),
                owner_id: alice,
                chart_mode: ChartMode::PlaysOnly,
                chart_size: 10,
                tracking_day: 0,
                is_private: false,
                allow_free_join: true,
            })
            .unwrap();
        Charts { db, group_id, alice, bob }
    }

    /// Store a group-week. Each chart lists (key, alice plays, bob plays), best first.
    fn store_week(c: &Charts, week: &str, charts: &[(ChartType, &[(&str, i64, i64)])]) {
        let week_start = d(week);
        let previous = c.db.previous_materialized_week(c.group_id, week_start).unwrap();
        let mut items = Vec::new();
        let mut entries = Vec::new();
        for (chart_type, rows) in charts {
            let before = match previous {
                Some(p) => c.db.chart_positions(c.group_id, *chart_type, p).unwrap(),
                None => HashMap::new(),
            };
            let artist = (*chart_type != ChartType::Artists).then(|| "Low".to_string());
            for (i, (key, a, b)) in rows.iter().enumerate() {
                let position = i as i64 + 1;
                let position_change = before.get(*key).map(|p| p - position);
                let contributions: Vec<(i64, i64)> =
                    [(c.alice, *a), (c.bob, *b)].into_iter().filter(|(_, p)| *p > 0).collect();
                items.push(GroupWeekItem {
                    chart_type: *chart_type,
                    entry_key: key.to_string(),
                    name: key.to_uppercase(),
                    artist: artist.clone(),
                    playcount: a + b,
                    contributors: contributions.len() as i64,
                });
                entries.push(NewChartEntry {
                    chart_type: *chart_type,
                    entry_key: key.to_string(),
                    position,
                    playcount: a + b,
                    vibe_score: None,
                    position_change,
                    entry_type: EntryType::from_change(position_change),
                    name: key.to_uppercase(),
                    artist: artist.clone(),
                    slug: key.to_string(),
                    major_driver_id: contributions.first().map(|(u, _)| *u),
                    contributions,
                });
            }
        }
        c.db.replace_week(&WeekMaterialization {
            group_id: c.group_id,
            week_start,
            total_plays: items.iter().map(|i| i.playcount).sum(),
            member_count: 2,
            items,
            entries,
        })
        .unwrap();
    }

    /// Three artist weeks: `e` climbs to a new best, `a` climbs back without
    /// regaining its old #1, `b` holds #1 for the last two weeks.
    fn three_artist_weeks(c: &Charts) {
        let artists = |rows: &'static [(&'static str, i64, i64)]| [(ChartType::Artists, rows)];
        store_week(c, "2024-01-01", &artists(&[("a", 50, 0), ("b", 40, 0), ("c", 30, 0), ("d", 20, 0), ("e", 10, 0)]));
        store_week(c, "2024-01-08", &artists(&[("b", 50, 0), ("c", 40, 0), ("d", 30, 0), ("a", 20, 0), ("e", 10, 0)]));
        store_week(c, "2024-01-15", &artists(&[("b", 50, 0), ("e", 20, 20), ("a", 30, 0), ("c", 20, 0), ("d", 10, 0)]));
    }

    #[test]
    fn test_climbers_flag_new_peaks() {
        let c = setup();
        three_artist_weeks(&c);
        let trends = analyze_week(&c.db, c.group_id, d("2024-01-15"), &TrendsConfig::default()).unwrap();

        let climbers: Vec<(&str, i64, bool)> = trends
            .biggest_climbers
            .iter()
            .map(|cl| (cl.entry.entry_key.as_str(), cl.position_change, cl.is_new_peak))
            .collect();
        assert_eq!(climbers, vec![("e", 3, true), ("a", 1, false)]);
        assert_eq!(trends.chart_turnover, 0);
        assert_eq!(trends.total_plays_change, Some(0));
    }

    #[test]
    fn test_fun_facts_cover_every_kind() {
        let c = setup();
        three_artist_weeks(&c);
        let trends = analyze_week(&c.db, c.group_id, d("2024-01-15"), &TrendsConfig::default()).unwrap();

        assert_eq!(
            trends.fun_facts,
            vec![
                FunFact::NumberOne {
                    chart_type: ChartType::Artists,
                    name: "B".into(),
                    artist: None,
                    total_weeks_at_number_one: 2,
                },
                FunFact::MostShared {
                    chart_type: ChartType::Artists,
                    name: "E".into(),
                    artist: None,
                    contributors: 2,
                },
                FunFact::LongestStreak {
                    chart_type: ChartType::Artists,
                    name: "B".into(),
                    artist: None,
                    weeks: 3,
                },
            ]
        );
        assert_eq!(trends.streaks.len(), 5);
        assert_eq!(c.db.get_trends(c.group_id, d("2024-01-15")).unwrap(), Some(trends));
    }

    #[test]
    fn test_climber_cap_applies_per_chart_type() {
        let c = setup();
        let up: &[(&str, i64, i64)] = &[("k1", 60, 0), ("k2", 50, 0), ("k3", 40, 0), ("k4", 30, 0), ("k5", 20, 0), ("k6", 10, 0)];
        let down: &[(&str, i64, i64)] = &[("k6", 60, 0), ("k5", 50, 0), ("k4", 40, 0), ("k3", 30, 0), ("k2", 20, 0), ("k1", 10, 0)];
        store_week(&c, "2024-01-01", &[(ChartType::Artists, up), (ChartType::Tracks, up), (ChartType::Albums, up)]);
        store_week(&c, "2024-01-08", &[(ChartType::Artists, down), (ChartType::Tracks, down), (ChartType::Albums, down)]);

        let params = TrendsConfig { max_climbers: 2, ..TrendsConfig::default() };
        let trends = analyze_week(&c.db, c.group_id, d("2024-01-08"), &params).unwrap();

        let climbers: Vec<(ChartType, &str)> = trends
            .biggest_climbers
            .iter()
            .map(|cl| (cl.entry.chart_type, cl.entry.entry_key.as_str()))
            .collect();
        assert_eq!(
            climbers,
            vec![
                (ChartType::Artists, "k6"),
                (ChartType::Tracks, "k6"),
                (ChartType::Albums, "k6"),
                (ChartType::Artists, "k5"),
                (ChartType::Tracks, "k5"),
                (ChartType::Albums, "k5"),
            ]
        );
    }

    #[test]
    fn test_streak_counts_contiguous_weeks() {
        let weeks = vec![d("2024-01-01"), d("2024-01-08"), d("2024-01-15"), d("2024-01-22")];
        let positions = HashMap::from([
            (d("2024-01-01"), 3),
            (d("2024-01-08"), 12),
            (d("2024-01-15"), 4),
            (d("2024-01-22"), 1),
        ]);
        assert_eq!(streak_length(&weeks, 3, &positions, 10), 2);
        assert_eq!(streak_length(&weeks, 3, &positions, 20), 4);
        assert_eq!(streak_length(&weeks, 1, &positions, 10), 0);
    }

    #[test]
    fn test_streak_breaks_on_gap() {
        // Week of 2024-01-08 was never materialized
        let weeks = vec![d("2024-01-01"), d("2024-01-15"), d("2024-01-22")];
        let positions = HashMap::from([(d("2024-01-01"), 1), (d("2024-01-15"), 1), (d("2024-01-22"), 1)]);
        assert_eq!(streak_length(&weeks, 2, &positions, 10), 2);
    }

    #[test]
    fn test_streak_breaks_on_absence() {
        let weeks = vec![d("2024-01-01"), d("2024-01-08"), d("2024-01-15")];
        let positions = HashMap::from([(d("2024-01-01"), 1), (d("2024-01-15"), 1)]);
        assert_eq!(streak_length(&weeks, 2, &positions, 10), 1);
    }

    #[test]
    fn test_spotlight_tie_prefers_lowest_user() {
        let contributions = vec![
            (ChartType::Artists, "a".to_string(), 5, 10),
            (ChartType::Artists, "b".to_string(), 2, 10),
        ];
        let spot = member_spotlight(&contributions, &HashMap::new()).unwrap();
        assert_eq!(spot.user_id, 2);
        assert_eq!(spot.playcount, 10);
        assert!(spot.top_items.is_empty());
    }

    #[test]
    fn test_weeks_away_requires_a_skipped_week() {
        let history = vec![HistoryRow { week_start: d("2024-01-01"), position: 1, playcount: 15 }];
        let index = HashMap::from([(d("2024-01-01"), 0), (d("2024-01-08"), 1), (d("2024-01-15"), 2)]);
        assert_eq!(weeks_away(&history, d("2024-01-15"), &index, 2), Some(2));
        assert_eq!(weeks_away(&history, d("2024-01-08"), &index, 1), None);
        assert_eq!(weeks_away(&[], d("2024-01-15"), &index, 2), None);
    }
}
