use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::models::EntryStats;
use super::{Database, DbError, Result};
use crate::chart::ChartType;
use crate::records::{GroupRecords, RecordsStatus};

/// Cached stats column a leaderboard can be ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatField {
    WeeksAtNumberOne,
    WeeksCharting,
    TotalPlays,
}

impl StatField {
    fn column(self) -> &'static str {
        match self {
            StatField::WeeksAtNumberOne => "weeks_at_number_one",
            StatField::WeeksCharting => "total_weeks_charting",
            StatField::TotalPlays => "total_playcount",
        }
    }

    /// Aggregate over raw chart rows that approximates the column without a stats row.
    fn cheap_aggregate(self) -> &'static str {
        match self {
            StatField::WeeksAtNumberOne => "SUM(CASE WHEN position = 1 THEN 1 ELSE 0 END)",
            StatField::WeeksCharting => "COUNT(*)",
            StatField::TotalPlays => "SUM(playcount)",
        }
    }
}

impl Database {
    pub fn get_entry_stats(
        &self,
        group_id: i64,
        chart_type: ChartType,
        entry_key: &str,
    ) -> Result<Option<EntryStats>> {
        let stats = self
            .conn
            .query_row(
                "SELECT group_id, chart_type, entry_key, peak_position, weeks_at_peak,
                        weeks_at_number_one, total_weeks_charting, total_weeks_appeared,
                        total_playcount, major_driver_id, major_driver_plays, stale
                 FROM chart_entry_stats
                 WHERE group_id = ?1 AND chart_type = ?2 AND entry_key = ?3",
                params![group_id, chart_type, entry_key],
                |row| {
                    Ok(EntryStats {
                        group_id: row.get(0)?,
                        chart_type: row.get(1)?,
                        entry_key: row.get(2)?,
                        peak_position: row.get(3)?,
                        weeks_at_peak: row.get(4)?,
                        weeks_at_number_one: row.get(5)?,
                        total_weeks_charting: row.get(6)?,
                        total_weeks_appeared: row.get(7)?,
                        total_playcount: row.get(8)?,
                        major_driver_id: row.get(9)?,
                        major_driver_plays: row.get(10)?,
                        stale: row.get(11)?,
                    })
                },
            )
            .optional()?;
        Ok(stats)
    }

    /// Write freshly computed stats, clearing the stale flag.
    pub fn upsert_entry_stats(&self, s: &EntryStats) -> Result<()> {
        self.conn.execute(
            "INSERT INTO chart_entry_stats (
                group_id, chart_type, entry_key, peak_position, weeks_at_peak, weeks_at_number_one,
                total_weeks_charting, total_weeks_appeared, total_playcount, major_driver_id,
                major_driver_plays, stale, computed_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12)
             ON CONFLICT(group_id, chart_type, entry_key) DO UPDATE SET
                peak_position = excluded.peak_position,
                weeks_at_peak = excluded.weeks_at_peak,
                weeks_at_number_one = excluded.weeks_at_number_one,
                total_weeks_charting = excluded.total_weeks_charting,
                total_weeks_appeared = excluded.total_weeks_appeared,
                total_playcount = excluded.total_playcount,
                major_driver_id = excluded.major_driver_id,
                major_driver_plays = excluded.major_driver_plays,
                stale = 0,
                computed_at = excluded.computed_at",
            params![
                s.group_id, s.chart_type, s.entry_key, s.peak_position, s.weeks_at_peak,
                s.weeks_at_number_one, s.total_weeks_charting, s.total_weeks_appeared,
                s.total_playcount, s.major_driver_id, s.major_driver_plays,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn delete_entry_stats(&self, group_id: i64, chart_type: ChartType, entry_key: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM chart_entry_stats WHERE group_id = ?1 AND chart_type = ?2 AND entry_key = ?3",
            params![group_id, chart_type, entry_key],
        )?;
        Ok(())
    }

    /// Keys whose stats row is flagged stale.
    pub fn stale_stats_keys(&self, group_id: i64, chart_type: Option<ChartType>) -> Result<Vec<(ChartType, String)>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT chart_type, entry_key FROM chart_entry_stats
             WHERE group_id = ?1 AND stale = 1 AND (?2 IS NULL OR chart_type = ?2)
             ORDER BY chart_type, entry_key",
        )?;
        let keys = stmt
            .query_map(params![group_id, chart_type], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Charted keys that have no stats row yet.
    pub fn keys_without_stats(&self, group_id: i64) -> Result<Vec<(ChartType, String)>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT DISTINCT e.chart_type, e.entry_key FROM chart_entries e
             WHERE e.group_id = ?1 AND NOT EXISTS (
                SELECT 1 FROM chart_entry_stats s
                WHERE s.group_id = e.group_id AND s.chart_type = e.chart_type AND s.entry_key = e.entry_key
             )
             ORDER BY e.chart_type, e.entry_key",
        )?;
        let keys = stmt
            .query_map(params![group_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Keys without a stats row whose raw-row approximation of `field` reaches `threshold`.
    pub fn missing_stats_candidates(
        &self,
        group_id: i64,
        chart_type: ChartType,
        field: StatField,
        threshold: i64,
    ) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT e.entry_key, {agg} AS value FROM chart_entries e
             WHERE e.group_id = ?1 AND e.chart_type = ?2 AND NOT EXISTS (
                SELECT 1 FROM chart_entry_stats s
                WHERE s.group_id = e.group_id AND s.chart_type = e.chart_type AND s.entry_key = e.entry_key
             )
             GROUP BY e.entry_key
             HAVING value >= ?3
             ORDER BY value DESC, e.entry_key",
            agg = field.cheap_aggregate(),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let keys = stmt
            .query_map(params![group_id, chart_type, threshold], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    /// Top cached values of `field`, highest first, ties by entry key.
    pub fn top_stats_by(
        &self,
        group_id: i64,
        chart_type: ChartType,
        field: StatField,
        limit: usize,
    ) -> Result<Vec<EntryStatValue>> {
        let sql = format!(
            "SELECT s.entry_key, {col}, s.stale,
                    (SELECT e.name FROM chart_entries e
                     WHERE e.group_id = s.group_id AND e.chart_type = s.chart_type AND e.entry_key = s.entry_key
                     ORDER BY e.week_start DESC LIMIT 1),
                    (SELECT e.artist FROM chart_entries e
                     WHERE e.group_id = s.group_id AND e.chart_type = s.chart_type AND e.entry_key = s.entry_key
                     ORDER BY e.week_start DESC LIMIT 1)
             FROM chart_entry_stats s
             WHERE s.group_id = ?1 AND s.chart_type = ?2
             ORDER BY {col} DESC, s.entry_key
             LIMIT ?3",
            col = field.column(),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![group_id, chart_type, limit as i64], |row| {
                Ok(EntryStatValue {
                    entry_key: row.get(0)?,
                    value: row.get(1)?,
                    stale: row.get(2)?,
                    name: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    artist: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Number of merged week items recorded for a key, charted or not.
    pub fn weeks_appeared(&self, group_id: i64, chart_type: ChartType, entry_key: &str) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM group_week_items
             WHERE group_id = ?1 AND chart_type = ?2 AND entry_key = ?3",
            params![group_id, chart_type, entry_key],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// (user_id, plays) summed over every charted week of a key, by user id.
    pub fn cumulative_contributions(
        &self,
        group_id: i64,
        chart_type: ChartType,
        entry_key: &str,
    ) -> Result<Vec<(i64, i64)>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT user_id, SUM(playcount) FROM chart_entry_contributions
             WHERE group_id = ?1 AND chart_type = ?2 AND entry_key = ?3
             GROUP BY user_id ORDER BY user_id",
        )?;
        let rows = stmt
            .query_map(params![group_id, chart_type, entry_key], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Members ranked by how many entries they are the cumulative major driver of.
    pub fn driven_entry_counts(&self, group_id: i64, limit: usize) -> Result<Vec<(i64, i64)>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT major_driver_id, COUNT(*) AS driven
             FROM chart_entry_stats
             WHERE group_id = ?1 AND major_driver_id IS NOT NULL
             GROUP BY major_driver_id
             ORDER BY driven DESC, major_driver_id
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![group_id, limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_records_status(&self, group_id: i64, status: RecordsStatus) -> Result<()> {
        self.conn.execute(
            "INSERT INTO group_records (group_id, status, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(group_id) DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at",
            params![group_id, status.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn store_records(&self, group_id: i64, records: &GroupRecords, status: RecordsStatus) -> Result<()> {
        let payload = serde_json::to_string(records)
            .map_err(|source| DbError::Payload { table: "group_records", source })?;
        self.conn.execute(
            "INSERT INTO group_records (group_id, status, records, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(group_id) DO UPDATE SET
                status = excluded.status, records = excluded.records, updated_at = excluded.updated_at",
            params![group_id, status.as_str(), payload, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Stored records for a group, validated against the typed schema.
    pub fn get_records(&self, group_id: i64) -> Result<Option<(RecordsStatus, GroupRecords)>> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT status, records FROM group_records WHERE group_id = ?1",
                params![group_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((status, payload)) = row else {
            return Ok(None);
        };
        let status = status
            .parse::<RecordsStatus>()
            .map_err(|e| DbError::Invalid(format!("group_records.status: {e}")))?;
        let records = serde_json::from_str(&payload)
            .map_err(|source| DbError::Payload { table: "group_records", source })?;
        Ok(Some((status, records)))
    }
}

/// A leaderboard candidate read from the stats cache.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryStatValue {
    pub entry_key: String,
    pub name: String,
    pub artist: Option<String>,
    pub value: i64,
    pub stale: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::ChartMode;
    use crate::db::models::NewGroup;

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

    fn stats(group_id: i64, key: &str, number_ones: i64) -> EntryStats {
        EntryStats {
            group_id,
            chart_type: ChartType::Artists,
            entry_key: key.into(),
            peak_position: 1,
            weeks_at_peak: number_ones,
            weeks_at_number_one: number_ones,
            total_weeks_charting: 3,
            total_weeks_appeared: 3,
            total_playcount: 30,
            major_driver_id: None,
            major_driver_plays: 0,
            stale: false,
        }
    }

    #[test]
    fn test_upsert_and_read_back() {
        let (db, g, u) = setup();
        let mut s = stats(g, "x", 2);
        s.major_driver_id = Some(u);
        s.major_driver_plays = 12;
        db.upsert_entry_stats(&s).unwrap();
        assert_eq!(db.get_entry_stats(g, ChartType::Artists, "x").unwrap(), Some(s.clone()));

        db.delete_entry_stats(g, ChartType::Artists, "x").unwrap();
        assert_eq!(db.get_entry_stats(g, ChartType::Artists, "x").unwrap(), None);
    }

    #[test]
    fn test_top_stats_orders_by_field_then_key() {
        let (db, g, _) = setup();
        db.upsert_entry_stats(&stats(g, "b", 2)).unwrap();
        db.upsert_entry_stats(&stats(g, "a", 2)).unwrap();
        db.upsert_entry_stats(&stats(g, "c", 5)).unwrap();
        let top = db.top_stats_by(g, ChartType::Artists, StatField::WeeksAtNumberOne, 10).unwrap();
        let keys: Vec<&str> = top.iter().map(|v| v.entry_key.as_str()).collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
        assert_eq!(top[0].value, 5);
    }

    #[test]
    fn test_records_status_roundtrip() {
        let (db, g, _) = setup();
        assert!(db.get_records(g).unwrap().is_none());
        db.set_records_status(g, RecordsStatus::Pending).unwrap();
        let (status, records) = db.get_records(g).unwrap().unwrap();
        assert_eq!(status, RecordsStatus::Pending);
        assert!(records.is_empty());
    }

    #[test]
    fn test_corrupt_records_payload_is_rejected() {
        let (db, g, _) = setup();
        db.conn
            .execute(
                "INSERT INTO group_records (group_id, status, records, updated_at)
                 VALUES (?1, 'completed', '{\"weeks_at_number_one:artists\": 5}', 'now')",
                params![g],
            )
            .unwrap();
        assert!(matches!(db.get_records(g), Err(DbError::Payload { .. })));
    }
}
