use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};

use super::models::{DatabaseStats, Group, MemberSnapshot, NewGroup, SnapshotItem, User};
use super::{Database, DbError, Result};
use crate::chart::ChartType;
use crate::week;

impl Database {
    /// Insert a user if missing. Returns the user id.
    pub fn upsert_user(&self, name: &str) -> Result<i64> {
        upsert_user(&self.conn, name)
    }

    pub fn find_user(&self, name: &str) -> Result<Option<User>> {
        let user = self
            .conn
            .query_row(
                "SELECT id, name FROM users WHERE name = ?1",
                params![name],
                |row| Ok(User { id: row.get(0)?, name: row.get(1)? }),
            )
            .optional()?;
        Ok(user)
    }

    pub fn rename_user(&self, id: i64, new_name: &str) -> Result<()> {
        let changed = self
            .conn
            .execute("UPDATE users SET name = ?1 WHERE id = ?2", params![new_name, id])?;
        if changed == 0 {
            return Err(DbError::NotFound(format!("user {id}")));
        }
        Ok(())
    }

    pub fn create_group(&self, g: &NewGroup) -> Result<i64> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO groups (name, owner_id, chart_mode, chart_size, tracking_day, is_private, allow_free_join)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                g.name, g.owner_id, g.chart_mode, g.chart_size, g.tracking_day,
                g.is_private, g.allow_free_join,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub fn get_group(&self, group_id: i64) -> Result<Group> {
        self.conn
            .query_row(
                "SELECT id, name, owner_id, chart_mode, chart_size, tracking_day, is_private, allow_free_join
                 FROM groups WHERE id = ?1",
                params![group_id],
                group_from_row,
            )
            .optional()?
            .ok_or_else(|| DbError::NotFound(format!("group {group_id}")))
    }

    pub fn find_group(&self, name: &str) -> Result<Option<Group>> {
        let group = self
            .conn
            .query_row(
                "SELECT id, name, owner_id, chart_mode, chart_size, tracking_day, is_private, allow_free_join
                 FROM groups WHERE name = ?1",
                params![name],
                group_from_row,
            )
            .optional()?;
        Ok(group)
    }

    pub fn get_all_groups(&self) -> Result<Vec<Group>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, owner_id, chart_mode, chart_size, tracking_day, is_private, allow_free_join
             FROM groups ORDER BY id",
        )?;
        let groups = stmt
            .query_map([], group_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(groups)
    }

    pub fn set_tracking_day(&self, group_id: i64, tracking_day: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE groups SET tracking_day = ?1 WHERE id = ?2",
            params![tracking_day, group_id],
        )?;
        Ok(())
    }

    /// Add a member; re-joining clears a previous leave date.
    pub fn add_member(&self, group_id: i64, user_id: i64, joined_on: NaiveDate) -> Result<()> {
        self.conn.execute(
            "INSERT INTO group_members (group_id, user_id, joined_on) VALUES (?1, ?2, ?3)
             ON CONFLICT(group_id, user_id) DO UPDATE SET left_on = NULL",
            params![group_id, user_id, joined_on],
        )?;
        Ok(())
    }

    pub fn remove_member(&self, group_id: i64, user_id: i64, left_on: NaiveDate) -> Result<()> {
        self.conn.execute(
            "UPDATE group_members SET left_on = ?3 WHERE group_id = ?1 AND user_id = ?2",
            params![group_id, user_id, left_on],
        )?;
        Ok(())
    }

    /// Users who were members at any point of the week window starting at `week_start`.
    pub fn members_during_week(&self, group_id: i64, week_start: NaiveDate) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT user_id FROM group_members
             WHERE group_id = ?1 AND joined_on <= ?3 AND (left_on IS NULL OR left_on >= ?2)
             ORDER BY user_id",
        )?;
        let ids = stmt
            .query_map(params![group_id, week_start, week::week_end(week_start)], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// Everyone who was ever a member of the group.
    pub fn all_member_ids(&self, group_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT user_id FROM group_members WHERE group_id = ?1 ORDER BY user_id")?;
        let ids = stmt
            .query_map(params![group_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// Groups the user currently belongs to.
    pub fn current_group_ids(&self, user_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT group_id FROM group_members WHERE user_id = ?1 AND left_on IS NULL",
        )?;
        let ids = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// Store a member's weekly snapshot. A week already recorded for the user is rejected.
    pub fn store_snapshot(&self, snapshot: &MemberSnapshot) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        insert_snapshot(&tx, snapshot)?;
        tx.commit()?;
        Ok(())
    }

    /// Fetch the snapshot a user recorded for the week window starting at `week_start`.
    ///
    /// Snapshot weeks are anchored on the provider's own week boundary, so the
    /// earliest snapshot starting inside the group's window is used.
    pub fn get_snapshot(&self, user_id: i64, week_start: NaiveDate) -> Result<Option<MemberSnapshot>> {
        let found: Option<NaiveDate> = self
            .conn
            .query_row(
                "SELECT MIN(week_start) FROM member_snapshots
                 WHERE user_id = ?1 AND week_start BETWEEN ?2 AND ?3",
                params![user_id, week_start, week::week_end(week_start)],
                |row| row.get(0),
            )?;
        let Some(snapshot_week) = found else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare_cached(
            "SELECT chart_type, name, artist, playcount FROM member_snapshots
             WHERE user_id = ?1 AND week_start = ?2
             ORDER BY chart_type, rank",
        )?;
        let mut snapshot = MemberSnapshot {
            user_id,
            week_start: snapshot_week,
            ..MemberSnapshot::default()
        };
        let rows = stmt.query_map(params![user_id, snapshot_week], |row| {
            Ok((
                row.get::<_, ChartType>(0)?,
                SnapshotItem {
                    name: row.get(1)?,
                    artist: row.get(2)?,
                    playcount: row.get(3)?,
                },
            ))
        })?;
        for row in rows {
            let (chart_type, item) = row?;
            snapshot.items_mut(chart_type).push(item);
        }
        Ok(Some(snapshot))
    }

    /// Earliest snapshot week stored for any of the given users.
    pub fn earliest_snapshot_week(&self, user_ids: &[i64]) -> Result<Option<NaiveDate>> {
        let mut earliest: Option<NaiveDate> = None;
        let mut stmt = self
            .conn
            .prepare_cached("SELECT MIN(week_start) FROM member_snapshots WHERE user_id = ?1")?;
        for id in user_ids {
            let week: Option<NaiveDate> = stmt.query_row(params![id], |row| row.get(0))?;
            earliest = match (earliest, week) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        Ok(earliest)
    }

    /// Summed playcounts of a user's items of one type over snapshots starting in `[from, through]`.
    pub fn user_top_items(
        &self,
        user_id: i64,
        chart_type: ChartType,
        from: NaiveDate,
        through: NaiveDate,
    ) -> Result<Vec<SnapshotItem>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT name, artist, SUM(playcount) AS plays FROM member_snapshots
             WHERE user_id = ?1 AND chart_type = ?2 AND week_start BETWEEN ?3 AND ?4
             GROUP BY lower(name), lower(COALESCE(artist, ''))
             ORDER BY plays DESC, lower(name)",
        )?;
        let items = stmt
            .query_map(params![user_id, chart_type, from, through], |row| {
                Ok(SnapshotItem {
                    name: row.get(0)?,
                    artist: row.get(1)?,
                    playcount: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Per-week artist play totals and distinct artist counts for a user.
    pub fn user_weekly_volume(
        &self,
        user_id: i64,
        from: NaiveDate,
        through: NaiveDate,
    ) -> Result<Vec<(i64, i64)>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT SUM(playcount), COUNT(*) FROM member_snapshots
             WHERE user_id = ?1 AND chart_type = 'artists' AND week_start BETWEEN ?2 AND ?3
             GROUP BY week_start ORDER BY week_start",
        )?;
        let rows = stmt
            .query_map(params![user_id, from, through], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_artist_tags(&self, artist_key: &str, tags: &[(String, f64)]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM artist_tags WHERE artist_key = ?1", params![artist_key])?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO artist_tags (artist_key, tag, weight) VALUES (?1, ?2, ?3)",
            )?;
            for (tag, weight) in tags {
                stmt.execute(params![artist_key, tag.to_lowercase(), weight])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn artist_tags(&self, artist_key: &str) -> Result<Vec<(String, f64)>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT tag, weight FROM artist_tags WHERE artist_key = ?1 ORDER BY tag")?;
        let tags = stmt
            .query_map(params![artist_key], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tags)
    }

    /// Get database statistics.
    pub fn stats(&self) -> Result<DatabaseStats> {
        let count = |sql: &str| -> Result<i64> { Ok(self.conn.query_row(sql, [], |row| row.get(0))?) };
        Ok(DatabaseStats {
            users: count("SELECT COUNT(*) FROM users")?,
            groups: count("SELECT COUNT(*) FROM groups")?,
            snapshot_weeks: count(
                "SELECT COUNT(*) FROM (SELECT DISTINCT user_id, week_start FROM member_snapshots)",
            )?,
            chart_weeks: count("SELECT COUNT(*) FROM group_weekly_stats")?,
            chart_entries: count("SELECT COUNT(*) FROM chart_entries")?,
            stale_stats: count("SELECT COUNT(*) FROM chart_entry_stats WHERE stale = 1")?,
            queued_weeks: count("SELECT COUNT(*) FROM regeneration_queue")?,
        })
    }
}

/// Insert a user if missing (used within a transaction).
pub(crate) fn upsert_user(conn: &rusqlite::Connection, name: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO users (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
        params![name],
    )?;
    let id: i64 = conn.query_row("SELECT id FROM users WHERE name = ?1", params![name], |row| row.get(0))?;
    Ok(id)
}

/// Insert a snapshot's rows (used within a transaction).
///
/// Snapshots are immutable: a (user, week) that already has rows is rejected
/// with [`DbError::Duplicate`] before anything is written.
pub(crate) fn insert_snapshot(conn: &rusqlite::Connection, s: &MemberSnapshot) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM member_snapshots WHERE user_id = ?1 AND week_start = ?2)",
        params![s.user_id, s.week_start],
        |row| row.get(0),
    )?;
    if exists {
        return Err(DbError::Duplicate(format!(
            "snapshot for user {} week {}",
            s.user_id, s.week_start
        )));
    }
    let mut stmt = conn.prepare_cached(
        "INSERT INTO member_snapshots (user_id, week_start, chart_type, rank, name, artist, playcount)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for chart_type in ChartType::ALL {
        for (i, item) in s.items(chart_type).iter().enumerate() {
            stmt.execute(params![
                s.user_id, s.week_start, chart_type, i as i64 + 1,
                item.name, item.artist, item.playcount,
            ])?;
        }
    }
    Ok(())
}

fn group_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        name: row.get(1)?,
        owner_id: row.get(2)?,
        chart_mode: row.get(3)?,
        chart_size: row.get(4)?,
        tracking_day: row.get(5)?,
        is_private: row.get(6)?,
        allow_free_join: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::ChartMode;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn item(name: &str, artist: Option<&str>, playcount: i64) -> SnapshotItem {
        SnapshotItem { name: name.into(), artist: artist.map(Into::into), playcount }
    }

    fn new_group(owner_id: i64) -> NewGroup {
        NewGroup {
            name: "Night Owls".into(),
            owner_id,
            chart_mode: ChartMode::PlaysOnly,
            chart_size: 10,
            tracking_day: 0,
            is_private: false,
            allow_free_join: true,
        }
    }

    #[test]
    fn test_upsert_user_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let a = db.upsert_user("alice").unwrap();
        let b = db.upsert_user("alice").unwrap();
        assert_eq!(a, b);
        assert_eq!(db.find_user("alice").unwrap().unwrap().id, a);
        assert!(db.find_user("bob").unwrap().is_none());
    }

    #[test]
    fn test_group_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let owner = db.upsert_user("alice").unwrap();
        let id = db.create_group(&new_group(owner)).unwrap();
        let g = db.get_group(id).unwrap();
        assert_eq!(g.name, "Night Owls");
        assert_eq!(g.chart_mode, ChartMode::PlaysOnly);
        assert!(g.allow_free_join);
        assert!(matches!(db.get_group(999), Err(DbError::NotFound(_))));
    }

    #[test]
    fn test_members_during_week() {
        let db = Database::open_in_memory().unwrap();
        let a = db.upsert_user("alice").unwrap();
        let b = db.upsert_user("bob").unwrap();
        let c = db.upsert_user("carol").unwrap();
        let g = db.create_group(&new_group(a)).unwrap();
        db.add_member(g, a, d("2024-01-01")).unwrap();
        db.add_member(g, b, d("2024-01-10")).unwrap();
        db.add_member(g, c, d("2023-12-01")).unwrap();
        db.remove_member(g, c, d("2023-12-31")).unwrap();

        assert_eq!(db.members_during_week(g, d("2024-01-01")).unwrap(), vec![a]);
        assert_eq!(db.members_during_week(g, d("2024-01-08")).unwrap(), vec![a, b]);
        assert_eq!(db.members_during_week(g, d("2023-12-25")).unwrap(), vec![c]);
    }

    #[test]
    fn test_snapshot_roundtrip_within_window() {
        let db = Database::open_in_memory().unwrap();
        let a = db.upsert_user("alice").unwrap();
        let snapshot = MemberSnapshot {
            user_id: a,
            week_start: d("2024-01-02"),
            artists: vec![item("Low", None, 12), item("Slint", None, 4)],
            tracks: vec![item("Words", Some("Low"), 7)],
            albums: vec![],
        };
        db.store_snapshot(&snapshot).unwrap();

        let found = db.get_snapshot(a, d("2024-01-01")).unwrap().unwrap();
        assert_eq!(found, snapshot);
        assert!(db.get_snapshot(a, d("2024-01-08")).unwrap().is_none());
        assert_eq!(db.earliest_snapshot_week(&[a]).unwrap(), Some(d("2024-01-02")));
    }

    #[test]
    fn test_snapshot_is_never_overwritten() {
        let db = Database::open_in_memory().unwrap();
        let a = db.upsert_user("alice").unwrap();
        let first = MemberSnapshot {
            user_id: a,
            week_start: d("2024-01-01"),
            artists: vec![item("Low", None, 12), item("Slint", None, 4)],
            ..MemberSnapshot::default()
        };
        db.store_snapshot(&first).unwrap();

        let second = MemberSnapshot {
            artists: vec![item("Codeine", None, 30)],
            ..first.clone()
        };
        assert!(matches!(db.store_snapshot(&second), Err(DbError::Duplicate(_))));
        assert_eq!(db.get_snapshot(a, d("2024-01-01")).unwrap().unwrap(), first);
    }

    #[test]
    fn test_user_top_items_sums_weeks() {
        let db = Database::open_in_memory().unwrap();
        let a = db.upsert_user("alice").unwrap();
        for (week, plays) in [("2024-01-01", 5), ("2024-01-08", 7)] {
            db.store_snapshot(&MemberSnapshot {
                user_id: a,
                week_start: d(week),
                artists: vec![item("Low", None, plays), item("Slint", None, 3)],
                ..MemberSnapshot::default()
            })
            .unwrap();
        }
        let top = db
            .user_top_items(a, ChartType::Artists, d("2024-01-01"), d("2024-01-31"))
            .unwrap();
        assert_eq!(top[0].name, "Low");
        assert_eq!(top[0].playcount, 12);
        assert_eq!(top[1].playcount, 6);
        assert_eq!(
            db.user_weekly_volume(a, d("2024-01-01"), d("2024-01-31")).unwrap(),
            vec![(8, 2), (10, 2)]
        );
    }
}
