//! Lazily maintained per-entry stats.
//!
//! Writes only flag rows stale; the numbers are rebuilt here from chart rows,
//! so a recompute can run any number of times with the same result.

use rayon::prelude::*;

use crate::chart::ChartType;
use crate::db::models::{EntryStats, HistoryRow};
use crate::db::{Database, Result};

/// Everything needed to rebuild one key's stats.
#[derive(Debug, Clone)]
pub struct StatsInput {
    pub group_id: i64,
    pub chart_type: ChartType,
    pub entry_key: String,
    pub history: Vec<HistoryRow>,
    pub weeks_appeared: i64,
    /// (user_id, cumulative plays), ascending user id
    pub contributions: Vec<(i64, i64)>,
}

#[derive(Debug, Default, PartialEq)]
pub struct RecomputeResult {
    pub updated: u64,
    pub removed: u64,
    pub failed: u64,
}

/// Rebuild stats from chart rows. `None` when the key has no chart rows left.
pub fn compute_stats(input: &StatsInput) -> Option<EntryStats> {
    let peak_position = input.history.iter().map(|h| h.position).min()?;

    let mut driver: Option<(i64, i64)> = None;
    for &(user_id, plays) in &input.contributions {
        if plays <= 0 {
            continue;
        }
        match driver {
            Some((_, best)) if plays <= best => {}
            _ => driver = Some((user_id, plays)),
        }
    }

    Some(EntryStats {
        group_id: input.group_id,
        chart_type: input.chart_type,
        entry_key: input.entry_key.clone(),
        peak_position,
        weeks_at_peak: input.history.iter().filter(|h| h.position == peak_position).count() as i64,
        weeks_at_number_one: input.history.iter().filter(|h| h.position == 1).count() as i64,
        total_weeks_charting: input.history.len() as i64,
        // A charted week always has a week item; never report fewer appearances than chart weeks
        total_weeks_appeared: input.weeks_appeared.max(input.history.len() as i64),
        total_playcount: input.history.iter().map(|h| h.playcount).sum(),
        major_driver_id: driver.map(|(id, _)| id),
        major_driver_plays: driver.map(|(_, plays)| plays).unwrap_or(0),
        stale: false,
    })
}

fn load_input(db: &Database, group_id: i64, chart_type: ChartType, entry_key: &str) -> Result<StatsInput> {
    Ok(StatsInput {
        group_id,
        chart_type,
        entry_key: entry_key.to_string(),
        history: db.entry_history(group_id, chart_type, entry_key)?,
        weeks_appeared: db.weeks_appeared(group_id, chart_type, entry_key)?,
        contributions: db.cumulative_contributions(group_id, chart_type, entry_key)?,
    })
}

/// Recompute stats for `keys` of one group.
///
/// Inputs are read sequentially, computed in parallel chunks, and written
/// back sequentially. A key that fails to load or store is logged and
/// counted; the rest continue.
pub fn recompute_stats(
    db: &Database,
    group_id: i64,
    keys: &[(ChartType, String)],
    workers: usize,
) -> RecomputeResult {
    let mut result = RecomputeResult::default();
    if keys.is_empty() {
        return result;
    }

    let pool = rayon::ThreadPoolBuilder::new().num_threads(workers.max(1)).build();
    if let Err(e) = &pool {
        log::warn!("Falling back to the global rayon pool: {}", e);
    }

    let chunk_size = workers.max(1) * 16;
    for chunk in keys.chunks(chunk_size) {
        let mut inputs = Vec::with_capacity(chunk.len());
        for (chart_type, key) in chunk {
            match load_input(db, group_id, *chart_type, key) {
                Ok(input) => inputs.push(input),
                Err(e) => {
                    log::warn!("Stats input for {}/{} unavailable: {}", chart_type, key, e);
                    result.failed += 1;
                }
            }
        }

        let compute = || -> Vec<(StatsInput, Option<EntryStats>)> {
            inputs
                .into_par_iter()
                .map(|input| {
                    let stats = compute_stats(&input);
                    (input, stats)
                })
                .collect()
        };
        let computed = match &pool {
            Ok(pool) => pool.install(compute),
            Err(_) => compute(),
        };

        for (input, stats) in computed {
            let written = match &stats {
                Some(s) => db.upsert_entry_stats(s),
                None => db.delete_entry_stats(group_id, input.chart_type, &input.entry_key),
            };
            match (written, stats) {
                (Ok(()), Some(_)) => result.updated += 1,
                (Ok(()), None) => result.removed += 1,
                (Err(e), _) => {
                    log::error!("DB error storing stats for {}/{}: {}", input.chart_type, input.entry_key, e);
                    result.failed += 1;
                }
            }
        }
    }

    log::debug!(
        "Stats for group {}: {} updated, {} removed, {} failed",
        group_id, result.updated, result.removed, result.failed
    );
    result
}

/// Recompute every stale key and every charted key that has no stats row.
pub fn refresh_group_stats(db: &Database, group_id: i64, workers: usize) -> Result<RecomputeResult> {
    let mut keys = db.stale_stats_keys(group_id, None)?;
    keys.extend(db.keys_without_stats(group_id)?);
    keys.sort();
    keys.dedup();
    Ok(recompute_stats(db, group_id, &keys, workers))
}
