use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};

use super::models::{ChartEntry, HistoryRow, QueuedWeek, WeekMaterialization, WeeklyStats};
use super::{Database, DbError, Result};
use crate::chart::ChartType;
use crate::trends::GroupTrends;

impl Database {
    pub fn is_week_materialized(&self, group_id: i64, week_start: NaiveDate) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM group_weekly_stats WHERE group_id = ?1 AND week_start = ?2",
                params![group_id, week_start],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// All materialized week starts for a group, oldest first.
    pub fn materialized_weeks(&self, group_id: i64) -> Result<Vec<NaiveDate>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT week_start FROM group_weekly_stats WHERE group_id = ?1 ORDER BY week_start",
        )?;
        let weeks = stmt
            .query_map(params![group_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<NaiveDate>, _>>()?;
        Ok(weeks)
    }

    pub fn latest_materialized_week(&self, group_id: i64) -> Result<Option<NaiveDate>> {
        let week = self.conn.query_row(
            "SELECT MAX(week_start) FROM group_weekly_stats WHERE group_id = ?1",
            params![group_id],
            |row| row.get(0),
        )?;
        Ok(week)
    }

    /// Most recent materialized week strictly before `week_start`.
    pub fn previous_materialized_week(&self, group_id: i64, week_start: NaiveDate) -> Result<Option<NaiveDate>> {
        let week = self.conn.query_row(
            "SELECT MAX(week_start) FROM group_weekly_stats WHERE group_id = ?1 AND week_start < ?2",
            params![group_id, week_start],
            |row| row.get(0),
        )?;
        Ok(week)
    }

    /// entry_key → position for one chart week.
    pub fn chart_positions(
        &self,
        group_id: i64,
        chart_type: ChartType,
        week_start: NaiveDate,
    ) -> Result<HashMap<String, i64>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT entry_key, position FROM chart_entries
             WHERE group_id = ?1 AND chart_type = ?2 AND week_start = ?3",
        )?;
        let positions = stmt
            .query_map(params![group_id, chart_type, week_start], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<HashMap<String, i64>, _>>()?;
        Ok(positions)
    }

    /// Replace everything materialized for a group-week in a single transaction.
    ///
    /// Stats rows of every key touched (old or new) are marked stale, and any
    /// pending regeneration request for the week is cleared.
    pub fn replace_week(&self, m: &WeekMaterialization) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        let mut touched = delete_week_rows(&tx, m.group_id, m.week_start)?;

        tx.execute(
            "INSERT INTO group_weekly_stats (group_id, week_start, total_plays, member_count, generated_at)
             VALUES (?1, ?2, ?3, ?4, datetime('now'))",
            params![m.group_id, m.week_start, m.total_plays, m.member_count],
        )?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO group_week_items
                    (group_id, week_start, chart_type, entry_key, name, artist, playcount, contributors)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for i in &m.items {
                stmt.execute(params![
                    m.group_id, m.week_start, i.chart_type, i.entry_key,
                    i.name, i.artist, i.playcount, i.contributors,
                ])?;
                touched.insert((i.chart_type, i.entry_key.clone()));
            }
        }

        {
            let mut entry_stmt = tx.prepare_cached(
                "INSERT INTO chart_entries (
                    group_id, chart_type, entry_key, week_start, position, playcount, vibe_score,
                    position_change, entry_type, name, artist, slug, major_driver_id
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )?;
            let mut contrib_stmt = tx.prepare_cached(
                "INSERT INTO chart_entry_contributions
                    (group_id, chart_type, week_start, entry_key, user_id, playcount)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for e in &m.entries {
                entry_stmt.execute(params![
                    m.group_id, e.chart_type, e.entry_key, m.week_start, e.position, e.playcount,
                    e.vibe_score, e.position_change, e.entry_type, e.name, e.artist, e.slug,
                    e.major_driver_id,
                ])?;
                for (user_id, plays) in &e.contributions {
                    contrib_stmt.execute(params![
                        m.group_id, e.chart_type, m.week_start, e.entry_key, user_id, plays,
                    ])?;
                }
                touched.insert((e.chart_type, e.entry_key.clone()));
            }
        }

        mark_stale(&tx, m.group_id, &touched)?;
        tx.execute(
            "DELETE FROM regeneration_queue WHERE group_id = ?1 AND week_start = ?2",
            params![m.group_id, m.week_start],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Re-anchor a group on a new tracking day, deleting overlapping weeks and
    /// queueing `queued_week` for regeneration. All or nothing.
    pub fn reanchor_group(
        &self,
        group_id: i64,
        tracking_day: i64,
        overlapping: &[NaiveDate],
        queued_week: Option<NaiveDate>,
        reason: &str,
    ) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let changed = tx.execute(
            "UPDATE groups SET tracking_day = ?1 WHERE id = ?2",
            params![tracking_day, group_id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound(format!("group {group_id}")));
        }

        let mut touched = BTreeSet::new();
        for &week in overlapping {
            touched.extend(delete_week_rows(&tx, group_id, week)?);
            tx.execute(
                "DELETE FROM regeneration_queue WHERE group_id = ?1 AND week_start = ?2",
                params![group_id, week],
            )?;
        }
        mark_stale(&tx, group_id, &touched)?;

        if let Some(week) = queued_week {
            enqueue_week(&tx, group_id, week, reason)?;
        }

        tx.commit()?;
        Ok(overlapping.len())
    }

    /// Ask for a group-week to be regenerated on the next pending run.
    pub fn queue_week(&self, group_id: i64, week_start: NaiveDate, reason: &str) -> Result<()> {
        enqueue_week(&self.conn, group_id, week_start, reason)
    }

    pub fn is_week_queued(&self, group_id: i64, week_start: NaiveDate) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM regeneration_queue WHERE group_id = ?1 AND week_start = ?2",
                params![group_id, week_start],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn queued_weeks(&self, group_id: i64) -> Result<Vec<QueuedWeek>> {
        let mut stmt = self.conn.prepare(
            "SELECT group_id, week_start, reason FROM regeneration_queue
             WHERE group_id = ?1 ORDER BY week_start",
        )?;
        let weeks = stmt
            .query_map(params![group_id], |row| {
                Ok(QueuedWeek {
                    group_id: row.get(0)?,
                    week_start: row.get(1)?,
                    reason: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(weeks)
    }

    /// A chart week with driver display names resolved at read time.
    pub fn get_chart(
        &self,
        group_id: i64,
        chart_type: ChartType,
        week_start: NaiveDate,
    ) -> Result<Vec<ChartEntry>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT e.week_start, e.chart_type, e.entry_key, e.position, e.playcount, e.vibe_score,
                    e.position_change, e.entry_type, e.name, e.artist, e.slug,
                    e.major_driver_id, u.name
             FROM chart_entries e
             LEFT JOIN users u ON u.id = e.major_driver_id
             WHERE e.group_id = ?1 AND e.chart_type = ?2 AND e.week_start = ?3
             ORDER BY e.position",
        )?;
        let entries = stmt
            .query_map(params![group_id, chart_type, week_start], |row| {
                Ok(ChartEntry {
                    week_start: row.get(0)?,
                    chart_type: row.get(1)?,
                    entry_key: row.get(2)?,
                    position: row.get(3)?,
                    playcount: row.get(4)?,
                    vibe_score: row.get(5)?,
                    position_change: row.get(6)?,
                    entry_type: row.get(7)?,
                    name: row.get(8)?,
                    artist: row.get(9)?,
                    slug: row.get(10)?,
                    major_driver_id: row.get(11)?,
                    major_driver_name: row.get(12)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Every charted week of one entry, oldest first.
    pub fn entry_history(
        &self,
        group_id: i64,
        chart_type: ChartType,
        entry_key: &str,
    ) -> Result<Vec<HistoryRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT week_start, position, playcount FROM chart_entries
             WHERE group_id = ?1 AND chart_type = ?2 AND entry_key = ?3
             ORDER BY week_start",
        )?;
        let rows = stmt
            .query_map(params![group_id, chart_type, entry_key], |row| {
                Ok(HistoryRow {
                    week_start: row.get(0)?,
                    position: row.get(1)?,
                    playcount: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn weekly_stats(&self, group_id: i64, week_start: NaiveDate) -> Result<Option<WeeklyStats>> {
        let stats = self
            .conn
            .query_row(
                "SELECT group_id, week_start, total_plays, member_count FROM group_weekly_stats
                 WHERE group_id = ?1 AND week_start = ?2",
                params![group_id, week_start],
                |row| {
                    Ok(WeeklyStats {
                        group_id: row.get(0)?,
                        week_start: row.get(1)?,
                        total_plays: row.get(2)?,
                        member_count: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(stats)
    }

    /// (chart_type, entry_key, user_id, plays) for every charted entry of a week.
    pub fn week_contributions(
        &self,
        group_id: i64,
        week_start: NaiveDate,
    ) -> Result<Vec<(ChartType, String, i64, i64)>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT chart_type, entry_key, user_id, playcount FROM chart_entry_contributions
             WHERE group_id = ?1 AND week_start = ?2
             ORDER BY chart_type, entry_key, user_id",
        )?;
        let rows = stmt
            .query_map(params![group_id, week_start], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn user_name(&self, user_id: i64) -> Result<Option<String>> {
        let name = self
            .conn
            .query_row("SELECT name FROM users WHERE id = ?1", params![user_id], |row| row.get(0))
            .optional()?;
        Ok(name)
    }

    pub fn store_trends(&self, trends: &GroupTrends) -> Result<()> {
        let payload = serde_json::to_string(trends)
            .map_err(|source| DbError::Payload { table: "group_trends", source })?;
        self.conn.execute(
            "INSERT INTO group_trends (group_id, week_start, total_plays, total_plays_change, chart_turnover, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(group_id, week_start) DO UPDATE SET
                total_plays = excluded.total_plays,
                total_plays_change = excluded.total_plays_change,
                chart_turnover = excluded.chart_turnover,
                payload = excluded.payload",
            params![
                trends.group_id, trends.week_start, trends.total_plays,
                trends.total_plays_change, trends.chart_turnover, payload,
            ],
        )?;
        Ok(())
    }

    /// Stored trends for a group-week, validated against the typed schema.
    pub fn get_trends(&self, group_id: i64, week_start: NaiveDate) -> Result<Option<GroupTrends>> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM group_trends WHERE group_id = ?1 AND week_start = ?2",
                params![group_id, week_start],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|p| {
                serde_json::from_str(&p).map_err(|source| DbError::Payload { table: "group_trends", source })
            })
            .transpose()
    }
}

/// Delete one group-week's materialized rows; returns the chart keys it held.
fn delete_week_rows(
    conn: &Connection,
    group_id: i64,
    week_start: NaiveDate,
) -> Result<BTreeSet<(ChartType, String)>> {
    let mut touched = BTreeSet::new();
    {
        let mut stmt = conn.prepare_cached(
            "SELECT chart_type, entry_key FROM chart_entries WHERE group_id = ?1 AND week_start = ?2
             UNION
             SELECT chart_type, entry_key FROM group_week_items WHERE group_id = ?1 AND week_start = ?2",
        )?;
        let rows = stmt.query_map(params![group_id, week_start], |row| Ok((row.get(0)?, row.get(1)?)))?;
        for row in rows {
            touched.insert(row?);
        }
    }

    conn.execute(
        "DELETE FROM chart_entries WHERE group_id = ?1 AND week_start = ?2",
        params![group_id, week_start],
    )?;
    conn.execute(
        "DELETE FROM group_week_items WHERE group_id = ?1 AND week_start = ?2",
        params![group_id, week_start],
    )?;
    conn.execute(
        "DELETE FROM group_weekly_stats WHERE group_id = ?1 AND week_start = ?2",
        params![group_id, week_start],
    )?;
    conn.execute(
        "DELETE FROM group_trends WHERE group_id = ?1 AND week_start = ?2",
        params![group_id, week_start],
    )?;
    Ok(touched)
}

fn enqueue_week(conn: &Connection, group_id: i64, week_start: NaiveDate, reason: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO regeneration_queue (group_id, week_start, reason) VALUES (?1, ?2, ?3)
         ON CONFLICT(group_id, week_start) DO UPDATE SET reason = excluded.reason",
        params![group_id, week_start, reason],
    )?;
    Ok(())
}

fn mark_stale(conn: &Connection, group_id: i64, keys: &BTreeSet<(ChartType, String)>) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "UPDATE chart_entry_stats SET stale = 1
         WHERE group_id = ?1 AND chart_type = ?2 AND entry_key = ?3",
    )?;
    for (chart_type, key) in keys {
        stmt.execute(params![group_id, chart_type, key])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::{ChartMode, EntryType};
    use crate::db::models::{GroupWeekItem, NewChartEntry, NewGroup};

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn setup() -> (Database, i64, i64) {
        let db = Database::open_in_memory().unwrap();
        let user = db.upsert_user("alice").unwrap();
        let group = db
            .create_group(&NewGroup {
                name: "g".into(),
                owner_id: user,
                chart_mode: ChartMode::PlaysOnly,
                chart_size: 10,
                tracking_day: 0,
                is_private: false,
                allow_free_join: true,
            })
            .unwrap();
        (db, group, user)
    }

    fn week(group_id: i64, user: i64, week_start: &str, keys: &[&str]) -> WeekMaterialization {
        let entries: Vec<NewChartEntry> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| NewChartEntry {
                chart_type: ChartType::Artists,
                entry_key: k.to_string(),
                position: i as i64 + 1,
                playcount: 10 - i as i64,
                vibe_score: None,
                position_change: None,
                entry_type: EntryType::New,
                name: k.to_string(),
                artist: None,
                slug: k.to_string(),
                major_driver_id: Some(user),
                contributions: vec![(user, 10 - i as i64)],
            })
            .collect();
        WeekMaterialization {
            group_id,
            week_start: d(week_start),
            total_plays: 100,
            member_count: 1,
            items: entries
                .iter()
                .map(|e| GroupWeekItem {
                    chart_type: e.chart_type,
                    entry_key: e.entry_key.clone(),
                    name: e.name.clone(),
                    artist: None,
                    playcount: e.playcount,
                    contributors: 1,
                })
                .collect(),
            entries,
        }
    }

    #[test]
    fn test_replace_week_roundtrip() {
        let (db, g, u) = setup();
        db.replace_week(&week(g, u, "2024-01-01", &["a", "b"])).unwrap();
        assert!(db.is_week_materialized(g, d("2024-01-01")).unwrap());
        let chart = db.get_chart(g, ChartType::Artists, d("2024-01-01")).unwrap();
        assert_eq!(chart.len(), 2);
        assert_eq!(chart[0].major_driver_name.as_deref(), Some("alice"));

        // Replacing drops rows that are no longer present
        db.replace_week(&week(g, u, "2024-01-01", &["c"])).unwrap();
        let chart = db.get_chart(g, ChartType::Artists, d("2024-01-01")).unwrap();
        assert_eq!(chart.len(), 1);
        assert_eq!(chart[0].entry_key, "c");
        assert_eq!(db.week_contributions(g, d("2024-01-01")).unwrap().len(), 1);
    }

    #[test]
    fn test_driver_name_follows_rename() {
        let (db, g, u) = setup();
        db.replace_week(&week(g, u, "2024-01-01", &["a"])).unwrap();
        db.rename_user(u, "alicia").unwrap();
        let chart = db.get_chart(g, ChartType::Artists, d("2024-01-01")).unwrap();
        assert_eq!(chart[0].major_driver_name.as_deref(), Some("alicia"));
    }

    #[test]
    fn test_previous_materialized_week() {
        let (db, g, u) = setup();
        db.replace_week(&week(g, u, "2024-01-01", &["a"])).unwrap();
        db.replace_week(&week(g, u, "2024-01-15", &["a"])).unwrap();
        assert_eq!(db.previous_materialized_week(g, d("2024-01-15")).unwrap(), Some(d("2024-01-01")));
        assert_eq!(db.previous_materialized_week(g, d("2024-01-01")).unwrap(), None);
        assert_eq!(db.latest_materialized_week(g).unwrap(), Some(d("2024-01-15")));
        assert_eq!(db.materialized_weeks(g).unwrap(), vec![d("2024-01-01"), d("2024-01-15")]);
    }

    #[test]
    fn test_reanchor_deletes_and_queues() {
        let (db, g, u) = setup();
        db.replace_week(&week(g, u, "2024-01-01", &["a"])).unwrap();
        let deleted = db
            .reanchor_group(g, 2, &[d("2024-01-01")], Some(d("2024-01-03")), "tracking day changed")
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(!db.is_week_materialized(g, d("2024-01-01")).unwrap());
        assert!(db.get_chart(g, ChartType::Artists, d("2024-01-01")).unwrap().is_empty());
        assert_eq!(db.get_group(g).unwrap().tracking_day, 2);
        let queued = db.queued_weeks(g).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].week_start, d("2024-01-03"));

        // Generating the queued week clears it
        db.replace_week(&week(g, u, "2024-01-03", &["a"])).unwrap();
        assert!(db.queued_weeks(g).unwrap().is_empty());
    }

    #[test]
    fn test_queue_week_updates_reason() {
        let (db, g, u) = setup();
        db.replace_week(&week(g, u, "2024-01-01", &["a"])).unwrap();
        db.queue_week(g, d("2024-01-01"), "first").unwrap();
        db.queue_week(g, d("2024-01-01"), "second").unwrap();
        assert!(db.is_week_queued(g, d("2024-01-01")).unwrap());
        assert!(!db.is_week_queued(g, d("2024-01-08")).unwrap());
        let queued = db.queued_weeks(g).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].reason, "second");
    }

    #[test]
    fn test_entry_history_ordered() {
        let (db, g, u) = setup();
        db.replace_week(&week(g, u, "2024-01-08", &["b", "a"])).unwrap();
        db.replace_week(&week(g, u, "2024-01-01", &["a"])).unwrap();
        let history = db.entry_history(g, ChartType::Artists, "a").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].week_start, d("2024-01-01"));
        assert_eq!(history[0].position, 1);
        assert_eq!(history[1].position, 2);
    }
}
