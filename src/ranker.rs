//! Deterministic chart positions and week-over-week movement.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::chart::{ChartType, EntryType};
use crate::db::models::NewChartEntry;
use crate::identity::slugify;
use crate::scoring::ScoredEntry;

/// Sort scored entries into a chart of at most `chart_size` rows.
///
/// Ordering is value descending, then entry key ascending, so identical input
/// always yields identical positions. `previous` maps entry key → position in
/// the group's prior chart week for this chart type.
pub fn rank_entries(
    mut scored: Vec<ScoredEntry>,
    chart_type: ChartType,
    chart_size: usize,
    previous: &HashMap<String, i64>,
) -> Vec<NewChartEntry> {
    scored.sort_by(compare_scored);
    scored.truncate(chart_size);

    scored
        .into_iter()
        .enumerate()
        .map(|(i, s)| {
            let position = i as i64 + 1;
            let position_change = previous.get(&s.entry.entry_key).map(|old| old - position);
            NewChartEntry {
                chart_type,
                slug: slugify(&s.entry.entry_key),
                position,
                playcount: s.entry.playcount,
                vibe_score: s.vibe_score,
                position_change,
                entry_type: EntryType::from_change(position_change),
                major_driver_id: s.major_driver.map(|(user_id, _)| user_id),
                contributions: s
                    .entry
                    .contributions
                    .iter()
                    .filter(|&(_, &plays)| plays > 0)
                    .map(|(&user_id, &plays)| (user_id, plays))
                    .collect(),
                entry_key: s.entry.entry_key,
                name: s.entry.name,
                artist: s.entry.artist,
            }
        })
        .collect()
}

fn compare_scored(a: &ScoredEntry, b: &ScoredEntry) -> Ordering {
    b.value
        .total_cmp(&a.value)
        .then_with(|| a.entry.entry_key.cmp(&b.entry.entry_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregatedEntry;
    use std::collections::BTreeMap;

    fn scored(key: &str, value: f64) -> ScoredEntry {
        ScoredEntry {
            entry: AggregatedEntry {
                entry_key: key.into(),
                name: key.into(),
                artist: None,
                playcount: value as i64,
                contributions: BTreeMap::from([(1, value as i64)]),
            },
            value,
            vibe_score: None,
            major_driver: Some((1, value as i64)),
        }
    }

    #[test]
    fn test_positions_contiguous_and_truncated() {
        let input: Vec<ScoredEntry> = (0..15).map(|i| scored(&format!("k{i:02}"), i as f64)).collect();
        let chart = rank_entries(input, ChartType::Artists, 10, &HashMap::new());
        assert_eq!(chart.len(), 10);
        let positions: Vec<i64> = chart.iter().map(|e| e.position).collect();
        assert_eq!(positions, (1..=10).collect::<Vec<_>>());
        assert_eq!(chart[0].entry_key, "k14");
    }

    #[test]
    fn test_short_chart_has_entry_count_rows() {
        let chart = rank_entries(vec![scored("a", 1.0), scored("b", 2.0)], ChartType::Artists, 10, &HashMap::new());
        assert_eq!(chart.len(), 2);
        assert_eq!(chart[1].position, 2);
    }

    #[test]
    fn test_ties_break_on_entry_key() {
        let chart = rank_entries(
            vec![scored("zeta", 5.0), scored("alpha", 5.0), scored("mid", 5.0)],
            ChartType::Artists,
            10,
            &HashMap::new(),
        );
        let keys: Vec<&str> = chart.iter().map(|e| e.entry_key.as_str()).collect();
        assert_eq!(keys, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_position_change_against_previous_week() {
        let previous = HashMap::from([("a".to_string(), 3), ("b".to_string(), 1)]);
        let chart = rank_entries(
            vec![scored("a", 9.0), scored("b", 5.0), scored("c", 1.0)],
            ChartType::Artists,
            10,
            &previous,
        );
        assert_eq!(chart[0].position_change, Some(2));
        assert_eq!(chart[0].entry_type, EntryType::Up);
        assert_eq!(chart[1].position_change, Some(-1));
        assert_eq!(chart[1].entry_type, EntryType::Down);
        assert_eq!(chart[2].position_change, None);
        assert_eq!(chart[2].entry_type, EntryType::New);
    }

    #[test]
    fn test_ranking_is_deterministic() {
        let make = || vec![scored("b", 2.0), scored("a", 2.0), scored("c", 7.0)];
        let first = rank_entries(make(), ChartType::Tracks, 10, &HashMap::new());
        let second = rank_entries(make().into_iter().rev().collect(), ChartType::Tracks, 10, &HashMap::new());
        assert_eq!(first, second);
    }
}
