//! Load member weekly snapshots from JSON files.

use std::path::Path;

use chrono::NaiveDate;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use thiserror::Error;
use walkdir::WalkDir;

use crate::db::models::{MemberSnapshot, SnapshotItem};
use crate::db::queries::{insert_snapshot, upsert_user};
use crate::db::{Database, DbError};

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid snapshot file {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Database error: {0}")]
    Db(#[from] DbError),
}

/// One user's week as written by the listening-history exporter.
#[derive(Debug, Deserialize)]
pub struct SnapshotRecord {
    pub user: String,
    pub week_start: NaiveDate,
    #[serde(default)]
    pub artists: Vec<SnapshotItem>,
    #[serde(default)]
    pub tracks: Vec<SnapshotItem>,
    #[serde(default)]
    pub albums: Vec<SnapshotItem>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SnapshotFile {
    One(SnapshotRecord),
    Many(Vec<SnapshotRecord>),
}

#[derive(Debug, Default, PartialEq)]
pub struct ImportResult {
    pub files: u64,
    pub snapshots: u64,
    pub duplicates: u64,
    pub errors: u64,
}

/// Import every `.json` file under `paths` in a single transaction.
///
/// Files that cannot be read or parsed are logged and counted. A snapshot for a
/// (user, week) already stored is skipped and counted as a duplicate; the
/// stored one is kept.
pub fn import_snapshots(db: &Database, paths: &[String]) -> Result<ImportResult, ImportError> {
    let mut files = Vec::new();
    for path in paths {
        for entry in WalkDir::new(path).follow_links(true).into_iter().filter_map(|e| e.ok()) {
            let is_json = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("json"));
            if entry.file_type().is_file() && is_json {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_message("Importing...");

    let mut result = ImportResult::default();
    let tx = db.conn.unchecked_transaction().map_err(DbError::from)?;

    for path in &files {
        result.files += 1;
        match import_file(&tx, path) {
            Ok(counts) => {
                result.snapshots += counts.stored;
                result.duplicates += counts.duplicates;
            }
            Err(e) => {
                log::warn!("Skipping {}: {}", path.display(), e);
                result.errors += 1;
            }
        }
        pb.inc(1);
    }

    tx.commit().map_err(DbError::from)?;
    pb.finish_with_message(format!(
        "Done: {} snapshots from {} files, {} duplicates, {} errors",
        result.snapshots, result.files, result.duplicates, result.errors
    ));
    Ok(result)
}

#[derive(Debug, Default)]
struct FileCounts {
    stored: u64,
    duplicates: u64,
}

fn import_file(conn: &rusqlite::Connection, path: &Path) -> Result<FileCounts, ImportError> {
    let contents = std::fs::read_to_string(path)?;
    let parsed: SnapshotFile = serde_json::from_str(&contents).map_err(|source| ImportError::Json {
        path: path.display().to_string(),
        source,
    })?;
    let records = match parsed {
        SnapshotFile::One(r) => vec![r],
        SnapshotFile::Many(rs) => rs,
    };

    let mut counts = FileCounts::default();
    for record in records {
        let name = record.user.trim();
        if name.is_empty() {
            log::warn!("{}: snapshot for {} has no user", path.display(), record.week_start);
            continue;
        }
        let user_id = upsert_user(conn, name)?;
        let snapshot = MemberSnapshot {
            user_id,
            week_start: record.week_start,
            artists: record.artists,
            tracks: record.tracks,
            albums: record.albums,
        };
        match insert_snapshot(conn, &snapshot) {
            Ok(()) => counts.stored += 1,
            Err(DbError::Duplicate(what)) => {
                log::info!("{}: keeping existing {}", path.display(), what);
                counts.duplicates += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(counts)
}
