//! Chart-mode scoring and major-driver attribution.
//!
//! `vs` rewards shared listening: `playcount × contributors^exponent`.
//! `vs_weighted` blends raw playcount back in:
//! `blend × playcount + (1 − blend) × vs`.

use crate::aggregate::AggregatedEntry;
use crate::chart::ChartMode;
use crate::config::ScoringConfig;

/// An aggregated entry with its mode-specific ranking value.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEntry {
    pub entry: AggregatedEntry,
    /// Value the ranker sorts on
    pub value: f64,
    /// Stored vibe score; `None` under `plays_only`
    pub vibe_score: Option<f64>,
    /// (user_id, plays) of the largest contributor
    pub major_driver: Option<(i64, i64)>,
}

/// Shared-listening multiplier `f(n)`; non-decreasing in `n`.
pub fn contributor_factor(contributors: usize, exponent: f64) -> f64 {
    (contributors.max(1) as f64).powf(exponent.max(0.0))
}

pub fn vibe_score(playcount: i64, contributors: usize, params: &ScoringConfig) -> f64 {
    playcount as f64 * contributor_factor(contributors, params.contributor_exponent)
}

pub fn weighted_vibe_score(playcount: i64, contributors: usize, params: &ScoringConfig) -> f64 {
    let blend = params.blend_weight.clamp(0.0, 1.0);
    blend * playcount as f64 + (1.0 - blend) * vibe_score(playcount, contributors, params)
}

/// Member with the largest contribution; ties go to the lowest user id.
pub fn major_driver(entry: &AggregatedEntry) -> Option<(i64, i64)> {
    // BTreeMap iterates in ascending user id, so strict `>` keeps the lowest id on ties
    let mut best: Option<(i64, i64)> = None;
    for (&user_id, &plays) in &entry.contributions {
        if plays <= 0 {
            continue;
        }
        match best {
            Some((_, best_plays)) if plays <= best_plays => {}
            _ => best = Some((user_id, plays)),
        }
    }
    best
}

pub fn score_entry(entry: AggregatedEntry, mode: ChartMode, params: &ScoringConfig) -> ScoredEntry {
    let contributors = entry.contributor_count();
    let (value, vibe) = match mode {
        ChartMode::PlaysOnly => (entry.playcount as f64, None),
        ChartMode::Vs => {
            let vs = vibe_score(entry.playcount, contributors, params);
            (vs, Some(vs))
        }
        ChartMode::VsWeighted => {
            let v = weighted_vibe_score(entry.playcount, contributors, params);
            (v, Some(v))
        }
    };
    let major_driver = major_driver(&entry);
    ScoredEntry { entry, value, vibe_score: vibe, major_driver }
}

pub fn score_entries(
    entries: Vec<AggregatedEntry>,
    mode: ChartMode,
    params: &ScoringConfig,
) -> Vec<ScoredEntry> {
    entries.into_iter().map(|e| score_entry(e, mode, params)).collect()
}
