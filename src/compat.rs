//! User ↔ group compatibility and group recommendations.
//!
//! Three stages, each narrowing the next:
//! 1. pre-filter: groups the user could join that have any listening data
//! 2. candidate selection: at least one of the user's top artists in the
//!    group's recent artist catalogue
//! 3. scoring: artist, track, genre and pattern components, weighted
//!
//! Results are cached per user for `cache_ttl_hours`.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Days, Duration, NaiveDate, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chart::ChartType;
use crate::config::{CompatibilityConfig, CompatibilityWeights};
use crate::db::models::{CompatibilityScore, Group};
use crate::db::{Database, DbError};
use crate::identity::entry_key;

#[derive(Error, Debug)]
pub enum CompatError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("unknown user {0}")]
    UnknownUser(i64),
    #[error("degenerate score for group {group_id}: {detail}")]
    Degenerate { group_id: i64, detail: String },
}

/// One ranked recommendation as cached and returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub rank: i64,
    pub compatibility: CompatibilityScore,
}

/// Listening summary of a user or a group over the trailing window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListeningProfile {
    /// artist key → plays
    pub artists: BTreeMap<String, f64>,
    /// track key → plays
    pub tracks: BTreeMap<String, f64>,
    /// tag → weight, accumulated from artist shares
    pub tags: BTreeMap<String, f64>,
    /// Average plays per week (per member for groups)
    pub weekly_volume: f64,
    /// Average distinct artists per play
    pub diversity: f64,
}

/// Component scores, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Components {
    pub artist: f64,
    pub track: f64,
    /// `None` when neither side has any tags
    pub genre: Option<f64>,
    pub pattern: f64,
}

/// Σ min(share_a, share_b) over common keys, where shares are normalized plays.
pub fn share_overlap(a: &BTreeMap<String, f64>, b: &BTreeMap<String, f64>) -> f64 {
    let total_a: f64 = a.values().filter(|v| **v > 0.0).sum();
    let total_b: f64 = b.values().filter(|v| **v > 0.0).sum();
    if total_a <= 0.0 || total_b <= 0.0 {
        return 0.0;
    }
    a.iter()
        .filter_map(|(k, va)| b.get(k).map(|vb| (va / total_a).min(vb / total_b)))
        .filter(|v| *v > 0.0)
        .sum()
}

/// Weighted Jaccard: Σ min / Σ max over the union of normalized tag weights.
/// `None` when both sides are empty.
pub fn weighted_jaccard(a: &BTreeMap<String, f64>, b: &BTreeMap<String, f64>) -> Option<f64> {
    if a.is_empty() && b.is_empty() {
        return None;
    }
    let norm = |m: &BTreeMap<String, f64>| -> BTreeMap<String, f64> {
        let total: f64 = m.values().filter(|v| **v > 0.0).sum();
        if total <= 0.0 {
            return BTreeMap::new();
        }
        m.iter().filter(|(_, v)| **v > 0.0).map(|(k, v)| (k.clone(), v / total)).collect()
    };
    let (a, b) = (norm(a), norm(b));
    let keys: std::collections::BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    let (mut min_sum, mut max_sum) = (0.0, 0.0);
    for k in keys {
        let (x, y) = (a.get(k).copied().unwrap_or(0.0), b.get(k).copied().unwrap_or(0.0));
        min_sum += x.min(y);
        max_sum += x.max(y);
    }
    Some(if max_sum > 0.0 { min_sum / max_sum } else { 0.0 })
}

fn ratio_similarity(a: f64, b: f64) -> f64 {
    let hi = a.max(b);
    if hi <= 0.0 { 0.0 } else { a.min(b).max(0.0) / hi }
}

/// Similarity of weekly volume and artist diversity, averaged.
pub fn pattern_score(user: &ListeningProfile, group: &ListeningProfile) -> f64 {
    0.5 * ratio_similarity(user.weekly_volume, group.weekly_volume)
        + 0.5 * ratio_similarity(user.diversity, group.diversity)
}

pub fn components(user: &ListeningProfile, group: &ListeningProfile) -> Components {
    Components {
        artist: share_overlap(&user.artists, &group.artists),
        track: share_overlap(&user.tracks, &group.tracks),
        genre: weighted_jaccard(&user.tags, &group.tags),
        pattern: pattern_score(user, group),
    }
}

/// Overall score in `[0, 100]`. Without genre data the genre weight is
/// spread over the other components in proportion to their weights.
pub fn overall_score(c: &Components, w: &CompatibilityWeights) -> f64 {
    let mut weighted = w.artist * c.artist + w.track * c.track + w.pattern * c.pattern;
    let mut total_weight = w.artist + w.track + w.pattern;
    if let Some(genre) = c.genre {
        weighted += w.genre * genre;
        total_weight += w.genre;
    }
    if total_weight <= 0.0 {
        return 0.0;
    }
    100.0 * weighted / total_weight
}

/// Trailing window `[from, through]` ending the day before `today`.
pub fn listening_window(today: NaiveDate, weeks: u32) -> (NaiveDate, NaiveDate) {
    let through = today.checked_sub_days(Days::new(1)).unwrap_or(today);
    let span = u64::from(weeks.max(1)) * 7 - 1;
    let from = through.checked_sub_days(Days::new(span)).unwrap_or(through);
    (from, through)
}

fn tag_profile(
    db: &Database,
    artists: &BTreeMap<String, f64>,
    limit: usize,
) -> Result<BTreeMap<String, f64>, DbError> {
    let total: f64 = artists.values().sum();
    let mut by_plays: Vec<(&String, &f64)> = artists.iter().collect();
    by_plays.sort_by(|a, b| b.1.total_cmp(a.1).then_with(|| a.0.cmp(b.0)));

    let mut tags = BTreeMap::new();
    if total <= 0.0 {
        return Ok(tags);
    }
    for (key, plays) in by_plays.into_iter().take(limit) {
        for (tag, weight) in db.artist_tags(key)? {
            *tags.entry(tag).or_insert(0.0) += weight * plays / total;
        }
    }
    Ok(tags)
}

/// A user's listening summary over `[from, through]`.
pub fn user_profile(
    db: &Database,
    user_id: i64,
    from: NaiveDate,
    through: NaiveDate,
    params: &CompatibilityConfig,
) -> Result<ListeningProfile, DbError> {
    let keyed = |chart_type: ChartType| -> Result<BTreeMap<String, f64>, DbError> {
        let mut map = BTreeMap::new();
        for item in db.user_top_items(user_id, chart_type, from, through)? {
            let key = entry_key(chart_type, &item.name, item.artist.as_deref());
            *map.entry(key).or_insert(0.0) += item.playcount.max(0) as f64;
        }
        Ok(map)
    };
    let artists = keyed(ChartType::Artists)?;
    let tracks = keyed(ChartType::Tracks)?;
    let tags = tag_profile(db, &artists, params.top_artists)?;

    let weeks = db.user_weekly_volume(user_id, from, through)?;
    let (weekly_volume, diversity) = if weeks.is_empty() {
        (0.0, 0.0)
    } else {
        let n = weeks.len() as f64;
        let volume = weeks.iter().map(|(plays, _)| *plays as f64).sum::<f64>() / n;
        let diversity = weeks
            .iter()
            .map(|&(plays, distinct)| if plays > 0 { distinct as f64 / plays as f64 } else { 0.0 })
            .sum::<f64>()
            / n;
        (volume, diversity)
    };

    Ok(ListeningProfile { artists, tracks, tags, weekly_volume, diversity })
}

/// A group's listening summary over `[from, through]`.
pub fn group_profile(
    db: &Database,
    group_id: i64,
    from: NaiveDate,
    through: NaiveDate,
    params: &CompatibilityConfig,
) -> Result<ListeningProfile, DbError> {
    let catalogue = |chart_type: ChartType| -> Result<BTreeMap<String, f64>, DbError> {
        Ok(db
            .group_catalogue(group_id, chart_type, from, through)?
            .into_iter()
            .map(|(k, plays)| (k, plays.max(0) as f64))
            .collect())
    };
    let artists = catalogue(ChartType::Artists)?;
    let tracks = catalogue(ChartType::Tracks)?;
    let tags = tag_profile(db, &artists, params.top_artists)?;

    let weeks = db.group_weekly_volume(group_id, from, through)?;
    let (weekly_volume, diversity) = if weeks.is_empty() {
        (0.0, 0.0)
    } else {
        let n = weeks.len() as f64;
        let volume = weeks
            .iter()
            .map(|w| if w.member_count > 0 { w.total_plays as f64 / w.member_count as f64 } else { 0.0 })
            .sum::<f64>()
            / n;
        let diversity = weeks
            .iter()
            .map(|w| if w.total_plays > 0 { w.distinct_artists as f64 / w.total_plays as f64 } else { 0.0 })
            .sum::<f64>()
            / n;
        (volume, diversity)
    };

    Ok(ListeningProfile { artists, tracks, tags, weekly_volume, diversity })
}

/// Stage 1: groups the user could join that have listening data.
pub fn prefilter_groups(db: &Database, user_id: i64) -> Result<Vec<Group>, DbError> {
    let joined: HashSet<i64> = db.current_group_ids(user_id)?.into_iter().collect();
    let mut groups = Vec::new();
    for g in db.get_all_groups()? {
        if joined.contains(&g.id) || (g.is_private && !g.allow_free_join) {
            continue;
        }
        if db.has_catalogue(g.id)? {
            groups.push(g);
        }
    }
    Ok(groups)
}

/// The user's `limit` most played artist keys, ties by key.
pub fn top_artist_keys(profile: &ListeningProfile, limit: usize) -> HashSet<String> {
    let mut artists: Vec<(&String, &f64)> = profile.artists.iter().collect();
    artists.sort_by(|a, b| b.1.total_cmp(a.1).then_with(|| a.0.cmp(b.0)));
    artists.into_iter().take(limit).map(|(k, _)| k.clone()).collect()
}

fn score_candidate(
    user_id: i64,
    user: &ListeningProfile,
    group_id: i64,
    group: &ListeningProfile,
    weights: &CompatibilityWeights,
    now: DateTime<Utc>,
) -> Result<CompatibilityScore, CompatError> {
    let c = components(user, group);
    let score = overall_score(&c, weights);
    if !score.is_finite() {
        return Err(CompatError::Degenerate { group_id, detail: format!("{c:?}") });
    }
    Ok(CompatibilityScore {
        user_id,
        group_id,
        score,
        artist_overlap: c.artist,
        track_overlap: c.track,
        genre_overlap: c.genre.unwrap_or(0.0),
        pattern_score: c.pattern,
        computed_at: now,
    })
}

/// Stage 3: score candidates in parallel batches, best first (ties by group id).
///
/// A candidate that cannot be scored is logged and dropped.
pub fn rank_candidates(
    user_id: i64,
    user: &ListeningProfile,
    candidates: &[(i64, ListeningProfile)],
    params: &CompatibilityConfig,
    workers: usize,
    now: DateTime<Utc>,
) -> Vec<CompatibilityScore> {
    let pool = rayon::ThreadPoolBuilder::new().num_threads(workers.max(1)).build();
    if let Err(e) = &pool {
        log::warn!("Falling back to the global rayon pool: {}", e);
    }

    let mut scores = Vec::with_capacity(candidates.len());
    for chunk in candidates.chunks(params.batch_size.max(1)) {
        let score_chunk = || -> Vec<Result<CompatibilityScore, CompatError>> {
            chunk
                .par_iter()
                .map(|(group_id, profile)| {
                    score_candidate(user_id, user, *group_id, profile, &params.weights, now)
                })
                .collect()
        };
        let results = match &pool {
            Ok(pool) => pool.install(score_chunk),
            Err(_) => score_chunk(),
        };
        for result in results {
            match result {
                Ok(s) => scores.push(s),
                Err(e) => log::warn!("Dropping candidate: {}", e),
            }
        }
    }

    scores.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.group_id.cmp(&b.group_id)));
    scores
}

/// Recommend groups for a user, from cache when it is younger than the TTL.
///
/// `force` skips the cache. A candidate whose data cannot be loaded or
/// scored is logged and dropped.
pub fn recommend_groups(
    db: &Database,
    user_id: i64,
    now: DateTime<Utc>,
    params: &CompatibilityConfig,
    workers: usize,
    force: bool,
) -> Result<Vec<Recommendation>, CompatError> {
    if db.user_name(user_id)?.is_none() {
        return Err(CompatError::UnknownUser(user_id));
    }
    if !force {
        if let Some((calculated, cached)) = db.cached_recommendations(user_id)? {
            if now - calculated < Duration::hours(params.cache_ttl_hours) {
                log::debug!("Using cached recommendations for user {} from {}", user_id, calculated);
                return Ok(cached);
            }
        }
    }

    let (from, through) = listening_window(now.date_naive(), params.window_weeks);
    let user = user_profile(db, user_id, from, through, params)?;
    let top_artists = top_artist_keys(&user, params.top_artists);

    let eligible = prefilter_groups(db, user_id)?;
    let mut candidates: Vec<(i64, ListeningProfile)> = Vec::new();
    for group in &eligible {
        let catalogue = match db.group_catalogue(group.id, ChartType::Artists, from, through) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("Skipping group {}: catalogue unavailable: {}", group.id, e);
                continue;
            }
        };
        if !catalogue.iter().any(|(k, _)| top_artists.contains(k)) {
            continue;
        }
        match group_profile(db, group.id, from, through, params) {
            Ok(profile) => candidates.push((group.id, profile)),
            Err(e) => log::warn!("Skipping group {}: profile unavailable: {}", group.id, e),
        }
    }
    log::info!(
        "User {}: {} eligible groups, {} candidates",
        user_id,
        eligible.len(),
        candidates.len()
    );

    let scores = rank_candidates(user_id, &user, &candidates, params, workers, now);
    let recommendations: Vec<Recommendation> = scores
        .iter()
        .enumerate()
        .map(|(i, s)| Recommendation { rank: i as i64 + 1, compatibility: s.clone() })
        .collect();
    db.store_recommendations(user_id, &scores, &recommendations, now)?;
    Ok(recommendations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::{ChartMode, EntryType};
    use crate::db::models::{GroupWeekItem, MemberSnapshot, NewChartEntry, NewGroup, SnapshotItem, WeekMaterialization};

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn map(items: &[(&str, f64)]) -> BTreeMap<String, f64> {
        items.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_share_overlap_bounds() {
        let a = map(&[("x", 10.0), ("y", 10.0)]);
        assert!((share_overlap(&a, &a) - 1.0).abs() < 1e-9);
        assert_eq!(share_overlap(&a, &map(&[("z", 3.0)])), 0.0);
        let half = share_overlap(&a, &map(&[("x", 1.0)]));
        assert!((half - 0.5).abs() < 1e-9);
        assert_eq!(share_overlap(&a, &BTreeMap::new()), 0.0);
    }

    #[test]
    fn test_weighted_jaccard() {
        assert_eq!(weighted_jaccard(&BTreeMap::new(), &BTreeMap::new()), None);
        assert_eq!(weighted_jaccard(&map(&[("rock", 1.0)]), &BTreeMap::new()), Some(0.0));
        let j = weighted_jaccard(&map(&[("rock", 1.0), ("jazz", 1.0)]), &map(&[("rock", 1.0)])).unwrap();
        // {0.5, 0.5} vs {1.0}: min sum 0.5, max sum 1.5
        assert!((j - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_genre_weight_redistributed_without_tags() {
        let w = CompatibilityWeights::default();
        let c = Components { artist: 1.0, track: 1.0, genre: None, pattern: 1.0 };
        assert!((overall_score(&c, &w) - 100.0).abs() < 1e-9);
        let with_genre = Components { genre: Some(0.0), ..c };
        assert!((overall_score(&with_genre, &w) - 85.0).abs() < 1e-9);
    }

    #[test]
    fn test_pattern_score() {
        let user = ListeningProfile { weekly_volume: 50.0, diversity: 0.2, ..Default::default() };
        let group = ListeningProfile { weekly_volume: 100.0, diversity: 0.2, ..Default::default() };
        assert!((pattern_score(&user, &group) - 0.75).abs() < 1e-9);
        assert_eq!(pattern_score(&ListeningProfile::default(), &group), 0.0);
    }

    #[test]
    fn test_degenerate_candidate_dropped_others_ranked() {
        let user = ListeningProfile {
            artists: map(&[("low", 10.0)]),
            weekly_volume: f64::INFINITY,
            diversity: 0.1,
            ..Default::default()
        };
        let close = ListeningProfile {
            artists: map(&[("low", 10.0)]),
            weekly_volume: 40.0,
            diversity: 0.1,
            ..Default::default()
        };
        let broken = ListeningProfile { weekly_volume: f64::INFINITY, ..close.clone() };
        let far = ListeningProfile { artists: map(&[("low", 1.0), ("slint", 9.0)]), ..close.clone() };
        let params = CompatibilityConfig { batch_size: 2, ..CompatibilityConfig::default() };

        let err = score_candidate(1, &user, 2, &broken, &params.weights, now()).unwrap_err();
        assert!(matches!(err, CompatError::Degenerate { group_id: 2, .. }));

        let ranked = rank_candidates(1, &user, &[(1, far), (2, broken), (3, close)], &params, 2, now());
        let ids: Vec<i64> = ranked.iter().map(|s| s.group_id).collect();
        assert_eq!(ids, vec![3, 1]);
        assert!(ranked.iter().all(|s| s.score.is_finite()));
    }

    #[test]
    fn test_listening_window() {
        let (from, through) = listening_window(d("2024-04-01"), 2);
        assert_eq!(through, d("2024-03-31"));
        assert_eq!(from, d("2024-03-18"));
    }

    struct World {
        db: Database,
        user: i64,
        shared: i64,
        private: i64,
        unrelated: i64,
    }

    fn group(db: &Database, owner: i64, name: &str, is_private: bool) -> i64 {
        db.create_group(&NewGroup {
            name: name.into(),
            owner_id: owner,
            chart_mode: ChartMode::PlaysOnly,
            chart_size: 10,
            tracking_day: 0,
            is_private,
            allow_free_join: !is_private,
        })
        .unwrap()
    }

    fn artist_week(db: &Database, group_id: i64, week: &str, artists: &[(&str, i64)]) {
        let items: Vec<GroupWeekItem> = artists
            .iter()
            .map(|(k, plays)| GroupWeekItem {
                chart_type: ChartType::Artists,
                entry_key: k.to_string(),
                name: k.to_string(),
                artist: None,
                playcount: *plays,
                contributors: 1,
            })
            .collect();
        let entries: Vec<NewChartEntry> = items
            .iter()
            .enumerate()
            .map(|(i, it)| NewChartEntry {
                chart_type: ChartType::Artists,
                entry_key: it.entry_key.clone(),
                position: i as i64 + 1,
                playcount: it.playcount,
                vibe_score: None,
                position_change: None,
                entry_type: EntryType::New,
                name: it.name.clone(),
                artist: None,
                slug: it.entry_key.clone(),
                major_driver_id: None,
                contributions: vec![],
            })
            .collect();
        db.replace_week(&WeekMaterialization {
            group_id,
            week_start: d(week),
            total_plays: artists.iter().map(|(_, p)| p).sum(),
            member_count: 2,
            items,
            entries,
        })
        .unwrap();
    }

    fn world() -> World {
        let db = Database::open_in_memory().unwrap();
        let user = db.upsert_user("newcomer").unwrap();
        let owner = db.upsert_user("owner").unwrap();
        let shared = group(&db, owner, "shared", false);
        let private = group(&db, owner, "private", true);
        let unrelated = group(&db, owner, "unrelated", false);
        let mine = group(&db, user, "mine", false);
        db.add_member(mine, user, d("2024-01-01")).unwrap();

        db.store_snapshot(&MemberSnapshot {
            user_id: user,
            week_start: d("2024-03-04"),
            artists: vec![
                SnapshotItem { name: "Boards of Canada".into(), artist: None, playcount: 30 },
                SnapshotItem { name: "Aphex Twin".into(), artist: None, playcount: 10 },
            ],
            ..MemberSnapshot::default()
        })
        .unwrap();

        artist_week(&db, shared, "2024-03-04", &[("boards of canada", 40), ("autechre", 40)]);
        artist_week(&db, private, "2024-03-04", &[("boards of canada", 90)]);
        artist_week(&db, unrelated, "2024-03-04", &[("metallica", 60)]);
        artist_week(&db, mine, "2024-03-04", &[("aphex twin", 20)]);
        db.set_artist_tags("boards of canada", &[("idm".into(), 1.0)]).unwrap();

        World { db, user, shared, private, unrelated }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-20T09:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_funnel_keeps_only_overlapping_joinable_groups() {
        let w = world();
        let cfg = CompatibilityConfig::default();
        let recs = recommend_groups(&w.db, w.user, now(), &cfg, 2, false).unwrap();
        let ids: Vec<i64> = recs.iter().map(|r| r.compatibility.group_id).collect();
        assert_eq!(ids, vec![w.shared]);
        assert!(!ids.contains(&w.private));
        assert!(!ids.contains(&w.unrelated));

        let top = &recs[0].compatibility;
        assert_eq!(recs[0].rank, 1);
        // user shares: 0.75 boc; group shares: 0.5 boc
        assert!((top.artist_overlap - 0.5).abs() < 1e-9);
        assert!(top.score > 0.0 && top.score <= 100.0);
        assert_eq!(w.db.get_compatibility(w.user, w.shared).unwrap().unwrap().score, top.score);
    }

    #[test]
    fn test_scores_are_deterministic() {
        let w = world();
        let cfg = CompatibilityConfig::default();
        let first = recommend_groups(&w.db, w.user, now(), &cfg, 1, true).unwrap();
        let second = recommend_groups(&w.db, w.user, now(), &cfg, 4, true).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_cache_respects_ttl() {
        let w = world();
        let cfg = CompatibilityConfig::default();
        let first = recommend_groups(&w.db, w.user, now(), &cfg, 2, false).unwrap();

        // New data inside the TTL is not seen
        artist_week(&w.db, w.unrelated, "2024-03-11", &[("boards of canada", 10)]);
        let cached = recommend_groups(&w.db, w.user, now() + Duration::hours(2), &cfg, 2, false).unwrap();
        assert_eq!(cached.len(), first.len());
        assert_eq!(cached[0].compatibility.group_id, first[0].compatibility.group_id);
        assert!((cached[0].compatibility.score - first[0].compatibility.score).abs() < 1e-9);

        let fresh = recommend_groups(&w.db, w.user, now() + Duration::hours(25), &cfg, 2, false).unwrap();
        assert_eq!(fresh.len(), 2);
    }

    #[test]
    fn test_unknown_user() {
        let w = world();
        let err = recommend_groups(&w.db, 999, now(), &CompatibilityConfig::default(), 1, false).unwrap_err();
        assert!(matches!(err, CompatError::UnknownUser(999)));
    }
}
