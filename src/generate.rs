//! Per group-week chart generation: aggregate, score, rank, store, analyze.

use std::collections::HashMap;

use chrono::{Datelike, Days, NaiveDate};
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;

use crate::aggregate::{aggregate_week, SnapshotProvider};
use crate::chart::{validate_chart_size, ChartType, ValidationError};
use crate::config::AppConfig;
use crate::db::models::{Group, WeekMaterialization};
use crate::db::{Database, DbError};
use crate::ranker::rank_entries;
use crate::scoring::score_entries;
use crate::trends::analyze_week;
use crate::week;

#[derive(Error, Debug)]
pub enum ChartError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{week_start} is not a {expected} week start for group {group_id}")]
    MisalignedWeek {
        group_id: i64,
        week_start: NaiveDate,
        expected: chrono::Weekday,
    },
    #[error("week {week_start} has not closed yet (ends {ends})")]
    WeekOpen { week_start: NaiveDate, ends: NaiveDate },
    #[error("user {user_id} does not own group {group_id}")]
    NotOwner { user_id: i64, group_id: i64 },
    #[error("changing the tracking day of group {0} deletes chart data and must be confirmed")]
    NotConfirmed(i64),
}

/// What happened to one requested week.
#[derive(Debug, Clone, PartialEq)]
pub enum WeekOutcome {
    Generated { week_start: NaiveDate, entries: usize },
    /// Already materialized and not forced
    Skipped { week_start: NaiveDate },
}

#[derive(Debug, Default)]
pub struct GenerateResult {
    pub generated: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Outcome of a tracking-day change.
#[derive(Debug, Clone, PartialEq)]
pub struct ReanchorOutcome {
    pub deleted_weeks: Vec<NaiveDate>,
    pub queued_week: Option<NaiveDate>,
}

/// Materialize one closed group-week.
///
/// Snapshots come from `provider`; everything else is read from and written
/// to `db`. The week's rows are replaced atomically, so regenerating from the
/// same snapshots reproduces the same charts. A materialized week is skipped
/// unless `force` is set or the week is queued for regeneration.
pub fn generate_week<P: SnapshotProvider + ?Sized>(
    db: &Database,
    provider: &P,
    group: &Group,
    week_start: NaiveDate,
    today: NaiveDate,
    config: &AppConfig,
    force: bool,
) -> Result<WeekOutcome, ChartError> {
    let anchor = week::tracking_weekday(group.tracking_day)?;
    if week_start.weekday() != anchor {
        return Err(ChartError::MisalignedWeek { group_id: group.id, week_start, expected: anchor });
    }
    let ends = week::week_end(week_start);
    if ends >= today {
        return Err(ChartError::WeekOpen { week_start, ends });
    }
    let chart_size = validate_chart_size(group.chart_size)?;

    let queued = db.is_week_queued(group.id, week_start)?;
    if !force && !queued && db.is_week_materialized(group.id, week_start)? {
        log::debug!("Group {} week {} already materialized", group.id, week_start);
        return Ok(WeekOutcome::Skipped { week_start });
    }

    let members = db.members_during_week(group.id, week_start)?;
    let aggregate = aggregate_week(provider, &members, week_start, &ChartType::ALL);
    let previous = db.previous_materialized_week(group.id, week_start)?;

    let mut items = Vec::new();
    let mut entries = Vec::new();
    for chart_type in ChartType::ALL {
        let list = aggregate.list(chart_type);
        items.extend(list.iter().map(|e| e.to_week_item(chart_type)));

        let prior_positions = match previous {
            Some(prev) => db.chart_positions(group.id, chart_type, prev)?,
            None => HashMap::new(),
        };
        let scored = score_entries(list.to_vec(), group.chart_mode, &config.scoring);
        entries.extend(rank_entries(scored, chart_type, chart_size, &prior_positions));
    }

    let materialization = WeekMaterialization {
        group_id: group.id,
        week_start,
        total_plays: aggregate.total_plays,
        member_count: members.len() as i64,
        items,
        entries,
    };
    db.replace_week(&materialization)?;
    // Charts are already committed; a week left without trends is queued again
    if let Err(e) = analyze_week(db, group.id, week_start, &config.trends) {
        log::warn!(
            "Trends failed for group {} week {}, queued for regeneration: {}",
            group.name, week_start, e
        );
        db.queue_week(group.id, week_start, "trend analysis failed")?;
        return Err(e.into());
    }

    log::info!(
        "Generated group {} week {}: {} chart rows from {}/{} members",
        group.name,
        week_start,
        materialization.entries.len(),
        aggregate.contributing_members,
        members.len()
    );
    Ok(WeekOutcome::Generated { week_start, entries: materialization.entries.len() })
}

/// Weeks a group still needs: queued regenerations first, then every closed
/// week after the latest materialized one (or since the members' first snapshot).
pub fn pending_weeks(db: &Database, group: &Group, today: NaiveDate) -> Result<Vec<NaiveDate>, ChartError> {
    let anchor = week::tracking_weekday(group.tracking_day)?;
    let queued: Vec<NaiveDate> = db.queued_weeks(group.id)?.into_iter().map(|q| q.week_start).collect();
    let materialized = db.materialized_weeks(group.id)?;

    let start = match (queued.first(), materialized.last()) {
        (Some(&first_queued), _) => Some(first_queued),
        (None, Some(&last)) => Some(week::upcoming_week_start(last, anchor)),
        (None, None) => {
            let members = db.all_member_ids(group.id)?;
            db.earliest_snapshot_week(&members)?
                .map(|first| week::week_start_for(first, anchor))
        }
    };

    // Queued weeks wait until their window has closed
    let mut weeks: Vec<NaiveDate> = queued.into_iter().filter(|w| week::week_end(*w) < today).collect();
    if let (Some(start), Some(through)) = (start, today.checked_sub_days(Days::new(1))) {
        weeks.extend(
            week::completed_weeks(start, through, anchor)
                .into_iter()
                .filter(|w| !materialized.iter().any(|m| week::windows_overlap(*m, *w))),
        );
    }
    weeks.sort();
    weeks.dedup();
    Ok(weeks)
}

/// Generate every pending week for a group, oldest first.
///
/// A failing week is logged and counted; later weeks still run.
pub fn generate_pending(
    db: &Database,
    group: &Group,
    today: NaiveDate,
    config: &AppConfig,
) -> Result<GenerateResult, ChartError> {
    let weeks = pending_weeks(db, group, today)?;
    let mut result = GenerateResult::default();
    if weeks.is_empty() {
        log::info!("Group {} is up to date", group.name);
        return Ok(result);
    }

    let pb = ProgressBar::new(weeks.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    for week_start in weeks {
        pb.set_message(week_start.to_string());
        match generate_week(db, db, group, week_start, today, config, false) {
            Ok(WeekOutcome::Generated { .. }) => result.generated += 1,
            Ok(WeekOutcome::Skipped { .. }) => result.skipped += 1,
            Err(e) => {
                log::warn!("Failed to generate group {} week {}: {}", group.name, week_start, e);
                result.failed += 1;
            }
        }
        pb.inc(1);
    }
    pb.finish_with_message(format!(
        "{} generated, {} skipped, {} failed",
        result.generated, result.skipped, result.failed
    ));
    Ok(result)
}

/// Move a group to a new tracking day.
///
/// Owner-only and explicit: when the first week on the new anchor overlaps the
/// latest materialized week, that week is deleted and the new week is queued,
/// all in one transaction.
pub fn change_tracking_day(
    db: &Database,
    group_id: i64,
    acting_user: i64,
    new_day: i64,
    confirm: bool,
) -> Result<ReanchorOutcome, ChartError> {
    let anchor = week::tracking_weekday(new_day)?;
    let group = db.get_group(group_id)?;
    if group.owner_id != acting_user {
        return Err(ChartError::NotOwner { user_id: acting_user, group_id });
    }
    if !confirm {
        return Err(ChartError::NotConfirmed(group_id));
    }

    let Some(last) = db.latest_materialized_week(group_id)? else {
        db.set_tracking_day(group_id, new_day)?;
        log::info!("Group {} re-anchored to day {} with no charts to clean up", group.name, new_day);
        return Ok(ReanchorOutcome { deleted_weeks: Vec::new(), queued_week: None });
    };

    let upcoming = week::upcoming_week_start(last, anchor);
    let overlapping: Vec<NaiveDate> = db
        .materialized_weeks(group_id)?
        .into_iter()
        .filter(|w| week::windows_overlap(*w, upcoming))
        .collect();
    let queued_week = (!overlapping.is_empty()).then_some(upcoming);

    db.reanchor_group(
        group_id,
        new_day,
        &overlapping,
        queued_week,
        &format!("tracking day changed from {} to {}", group.tracking_day, new_day),
    )?;

    if overlapping.is_empty() {
        log::info!("Group {} re-anchored to day {}", group.name, new_day);
    } else {
        log::warn!(
            "Group {} re-anchored to day {}: deleted {} overlapping week(s), queued {}",
            group.name, new_day, overlapping.len(), upcoming
        );
    }
    Ok(ReanchorOutcome { deleted_weeks: overlapping, queued_week })
}
