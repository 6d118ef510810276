pub mod charts;
pub mod compat;
pub mod models;
pub mod queries;
pub mod stats;

use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
    #[error("Corrupt payload in {table}: {source}")]
    Payload {
        table: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid stored value: {0}")]
    Invalid(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Already recorded: {0}")]
    Duplicate(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        // WAL mode for better concurrent read performance
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.migrate()?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version > SCHEMA_VERSION {
            return Err(DbError::Migration(format!(
                "database schema v{version} is newer than this build (v{SCHEMA_VERSION})"
            )));
        }
        if version < 1 {
            self.migrate_v1()?;
        }
        if version < 2 {
            self.migrate_v2()?;
        }

        self.conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    /// V1: users, groups, snapshots and the materialized chart tables
    fn migrate_v1(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                name            TEXT NOT NULL UNIQUE,
                created_at      TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- Per-user weekly top lists, one row per ranked item
            CREATE TABLE IF NOT EXISTS member_snapshots (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id         INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                week_start      TEXT NOT NULL,
                chart_type      TEXT NOT NULL,
                rank            INTEGER NOT NULL,
                name            TEXT NOT NULL,
                artist          TEXT,
                playcount       INTEGER NOT NULL,
                UNIQUE(user_id, week_start, chart_type, rank)
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_user_week ON member_snapshots(user_id, week_start);

            CREATE TABLE IF NOT EXISTS groups (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                name            TEXT NOT NULL UNIQUE,
                owner_id        INTEGER NOT NULL REFERENCES users(id),
                chart_mode      TEXT NOT NULL DEFAULT 'plays_only',
                chart_size      INTEGER NOT NULL DEFAULT 10,
                tracking_day    INTEGER NOT NULL DEFAULT 0,
                is_private      INTEGER NOT NULL DEFAULT 0,
                allow_free_join INTEGER NOT NULL DEFAULT 1,
                created_at      TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS group_members (
                group_id        INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                user_id         INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                joined_on       TEXT NOT NULL,
                left_on         TEXT,
                PRIMARY KEY (group_id, user_id)
            );
            CREATE INDEX IF NOT EXISTS idx_members_user ON group_members(user_id);

            CREATE TABLE IF NOT EXISTS group_weekly_stats (
                group_id        INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                week_start      TEXT NOT NULL,
                total_plays     INTEGER NOT NULL,
                member_count    INTEGER NOT NULL,
                generated_at    TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (group_id, week_start)
            );

            -- Merged top lists of a group-week, including items below the chart cutoff
            CREATE TABLE IF NOT EXISTS group_week_items (
                group_id        INTEGER NOT NULL,
                week_start      TEXT NOT NULL,
                chart_type      TEXT NOT NULL,
                entry_key       TEXT NOT NULL,
                name            TEXT NOT NULL,
                artist          TEXT,
                playcount       INTEGER NOT NULL,
                contributors    INTEGER NOT NULL,
                PRIMARY KEY (group_id, week_start, chart_type, entry_key),
                FOREIGN KEY (group_id, week_start)
                    REFERENCES group_weekly_stats(group_id, week_start) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_week_items_key ON group_week_items(group_id, chart_type, entry_key);

            CREATE TABLE IF NOT EXISTS chart_entries (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id        INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                chart_type      TEXT NOT NULL,
                entry_key       TEXT NOT NULL,
                week_start      TEXT NOT NULL,
                position        INTEGER NOT NULL,
                playcount       INTEGER NOT NULL,
                vibe_score      REAL,
                position_change INTEGER,
                entry_type      TEXT NOT NULL,
                name            TEXT NOT NULL,
                artist          TEXT,
                slug            TEXT NOT NULL,
                major_driver_id INTEGER REFERENCES users(id) ON DELETE SET NULL,
                UNIQUE(group_id, chart_type, week_start, entry_key),
                UNIQUE(group_id, chart_type, week_start, position)
            );
            CREATE INDEX IF NOT EXISTS idx_entries_key ON chart_entries(group_id, chart_type, entry_key);
            CREATE INDEX IF NOT EXISTS idx_entries_week ON chart_entries(group_id, week_start);

            CREATE TABLE IF NOT EXISTS chart_entry_contributions (
                group_id        INTEGER NOT NULL,
                chart_type      TEXT NOT NULL,
                week_start      TEXT NOT NULL,
                entry_key       TEXT NOT NULL,
                user_id         INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                playcount       INTEGER NOT NULL,
                PRIMARY KEY (group_id, chart_type, week_start, entry_key, user_id),
                FOREIGN KEY (group_id, chart_type, week_start, entry_key)
                    REFERENCES chart_entries(group_id, chart_type, week_start, entry_key)
                    ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_contrib_key ON chart_entry_contributions(group_id, chart_type, entry_key);

            CREATE TABLE IF NOT EXISTS chart_entry_stats (
                group_id             INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                chart_type           TEXT NOT NULL,
                entry_key            TEXT NOT NULL,
                peak_position        INTEGER NOT NULL,
                weeks_at_peak        INTEGER NOT NULL,
                weeks_at_number_one  INTEGER NOT NULL,
                total_weeks_charting INTEGER NOT NULL,
                total_weeks_appeared INTEGER NOT NULL,
                total_playcount      INTEGER NOT NULL,
                major_driver_id      INTEGER REFERENCES users(id) ON DELETE SET NULL,
                major_driver_plays   INTEGER NOT NULL DEFAULT 0,
                stale                INTEGER NOT NULL DEFAULT 0,
                computed_at          TEXT NOT NULL,
                PRIMARY KEY (group_id, chart_type, entry_key)
            );
            CREATE INDEX IF NOT EXISTS idx_stats_stale ON chart_entry_stats(group_id, stale);

            CREATE TABLE IF NOT EXISTS group_records (
                group_id        INTEGER PRIMARY KEY REFERENCES groups(id) ON DELETE CASCADE,
                status          TEXT NOT NULL,
                records         TEXT NOT NULL DEFAULT '{}',
                updated_at      TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS group_trends (
                group_id           INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                week_start         TEXT NOT NULL,
                total_plays        INTEGER NOT NULL,
                total_plays_change INTEGER,
                chart_turnover     INTEGER NOT NULL,
                payload            TEXT NOT NULL,
                PRIMARY KEY (group_id, week_start)
            );

            CREATE TABLE IF NOT EXISTS regeneration_queue (
                group_id        INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                week_start      TEXT NOT NULL,
                reason          TEXT NOT NULL,
                queued_at       TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (group_id, week_start)
            );
            ",
        )?;
        Ok(())
    }

    /// V2: genre tags, compatibility scores and the recommendation cache
    fn migrate_v2(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS artist_tags (
                artist_key      TEXT NOT NULL,
                tag             TEXT NOT NULL,
                weight          REAL NOT NULL DEFAULT 1.0,
                PRIMARY KEY (artist_key, tag)
            );

            CREATE TABLE IF NOT EXISTS compatibility_scores (
                user_id         INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                group_id        INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                score           REAL NOT NULL,
                artist_overlap  REAL NOT NULL,
                track_overlap   REAL NOT NULL,
                genre_overlap   REAL NOT NULL,
                pattern_score   REAL NOT NULL,
                computed_at     TEXT NOT NULL,
                PRIMARY KEY (user_id, group_id)
            );

            CREATE TABLE IF NOT EXISTS recommendation_cache (
                user_id         INTEGER PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                payload         TEXT NOT NULL,
                last_calculated TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }
}

const SCHEMA_VERSION: i32 = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_set_user_version() {
        let db = Database::open_in_memory().unwrap();
        let version: i32 = db
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bandwagon.db");
        drop(Database::open(&path).unwrap());
        let db = Database::open(&path).unwrap();
        let tables: i64 = db
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'chart_entries'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tables, 1);
    }
}
