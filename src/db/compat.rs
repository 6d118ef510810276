use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::models::CompatibilityScore;
use super::{Database, DbError, Result};
use crate::chart::ChartType;
use crate::compat::Recommendation;

/// One materialized group-week as seen by the pattern component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupWeekVolume {
    pub total_plays: i64,
    pub member_count: i64,
    pub distinct_artists: i64,
}

impl Database {
    /// Summed playcount per entry key over group-weeks starting in `[from, through]`.
    pub fn group_catalogue(
        &self,
        group_id: i64,
        chart_type: ChartType,
        from: NaiveDate,
        through: NaiveDate,
    ) -> Result<Vec<(String, i64)>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT entry_key, SUM(playcount) AS plays FROM group_week_items
             WHERE group_id = ?1 AND chart_type = ?2 AND week_start BETWEEN ?3 AND ?4
             GROUP BY entry_key
             ORDER BY plays DESC, entry_key",
        )?;
        let rows = stmt
            .query_map(params![group_id, chart_type, from, through], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Whether the group has any merged items at all.
    pub fn has_catalogue(&self, group_id: i64) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM group_week_items WHERE group_id = ?1 LIMIT 1",
                params![group_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn group_weekly_volume(
        &self,
        group_id: i64,
        from: NaiveDate,
        through: NaiveDate,
    ) -> Result<Vec<GroupWeekVolume>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT s.total_plays, s.member_count,
                    (SELECT COUNT(*) FROM group_week_items i
                     WHERE i.group_id = s.group_id AND i.week_start = s.week_start
                       AND i.chart_type = 'artists')
             FROM group_weekly_stats s
             WHERE s.group_id = ?1 AND s.week_start BETWEEN ?2 AND ?3
             ORDER BY s.week_start",
        )?;
        let rows = stmt
            .query_map(params![group_id, from, through], |row| {
                Ok(GroupWeekVolume {
                    total_plays: row.get(0)?,
                    member_count: row.get(1)?,
                    distinct_artists: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn store_compatibility(&self, s: &CompatibilityScore) -> Result<()> {
        upsert_score(&self.conn, s)
    }

    pub fn get_compatibility(&self, user_id: i64, group_id: i64) -> Result<Option<CompatibilityScore>> {
        let score = self
            .conn
            .query_row(
                "SELECT user_id, group_id, score, artist_overlap, track_overlap, genre_overlap,
                        pattern_score, computed_at
                 FROM compatibility_scores WHERE user_id = ?1 AND group_id = ?2",
                params![user_id, group_id],
                |row| {
                    Ok(CompatibilityScore {
                        user_id: row.get(0)?,
                        group_id: row.get(1)?,
                        score: row.get(2)?,
                        artist_overlap: row.get(3)?,
                        track_overlap: row.get(4)?,
                        genre_overlap: row.get(5)?,
                        pattern_score: row.get(6)?,
                        computed_at: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(score)
    }

    /// Cached recommendations for a user with the time they were computed.
    pub fn cached_recommendations(
        &self,
        user_id: i64,
    ) -> Result<Option<(DateTime<Utc>, Vec<Recommendation>)>> {
        let row: Option<(String, DateTime<Utc>)> = self
            .conn
            .query_row(
                "SELECT payload, last_calculated FROM recommendation_cache WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((payload, last_calculated)) = row else {
            return Ok(None);
        };
        let recommendations = serde_json::from_str(&payload)
            .map_err(|source| DbError::Payload { table: "recommendation_cache", source })?;
        Ok(Some((last_calculated, recommendations)))
    }

    /// Store scores and the user's recommendation list together.
    pub fn store_recommendations(
        &self,
        user_id: i64,
        scores: &[CompatibilityScore],
        recommendations: &[Recommendation],
        calculated_at: DateTime<Utc>,
    ) -> Result<()> {
        let payload = serde_json::to_string(recommendations)
            .map_err(|source| DbError::Payload { table: "recommendation_cache", source })?;
        let tx = self.conn.unchecked_transaction()?;
        for s in scores {
            upsert_score(&tx, s)?;
        }
        tx.execute(
            "INSERT INTO recommendation_cache (user_id, payload, last_calculated) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                payload = excluded.payload, last_calculated = excluded.last_calculated",
            params![user_id, payload, calculated_at],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Drop a user's cached recommendations so the next request recomputes.
    pub fn invalidate_recommendations(&self, user_id: i64) -> Result<()> {
        self.conn.execute(
            "DELETE FROM recommendation_cache WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(())
    }
}

fn upsert_score(conn: &Connection, s: &CompatibilityScore) -> Result<()> {
    conn.execute(
        "INSERT INTO compatibility_scores (
            user_id, group_id, score, artist_overlap, track_overlap, genre_overlap,
            pattern_score, computed_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(user_id, group_id) DO UPDATE SET
            score = excluded.score,
            artist_overlap = excluded.artist_overlap,
            track_overlap = excluded.track_overlap,
            genre_overlap = excluded.genre_overlap,
            pattern_score = excluded.pattern_score,
            computed_at = excluded.computed_at",
        params![
            s.user_id, s.group_id, s.score, s.artist_overlap, s.track_overlap,
            s.genre_overlap, s.pattern_score, s.computed_at,
        ],
    )?;
    Ok(())
}
