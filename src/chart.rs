//! Chart vocabulary shared by every stage: chart types, chart modes and
//! week-over-week entry classification.

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejections raised before any computation starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("unsupported chart type: {0}")]
    ChartType(String),
    #[error("unsupported chart mode: {0}")]
    ChartMode(String),
    #[error("unsupported record type: {0}")]
    RecordType(String),
    #[error("invalid tracking day {0} (expected 0 = Monday .. 6 = Sunday)")]
    TrackingDay(i64),
    #[error("chart size must be between 1 and {max}, got {got}")]
    ChartSize { got: i64, max: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartType {
    Artists,
    Tracks,
    Albums,
}

impl ChartType {
    pub const ALL: [ChartType; 3] = [ChartType::Artists, ChartType::Tracks, ChartType::Albums];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Artists => "artists",
            Self::Tracks => "tracks",
            Self::Albums => "albums",
        }
    }

    /// Tracks and albums are scoped to an artist in their entry key.
    pub fn is_artist_scoped(&self) -> bool {
        !matches!(self, Self::Artists)
    }
}

impl fmt::Display for ChartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChartType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "artists" | "artist" => Ok(Self::Artists),
            "tracks" | "track" => Ok(Self::Tracks),
            "albums" | "album" => Ok(Self::Albums),
            other => Err(ValidationError::ChartType(other.to_string())),
        }
    }
}

/// Ranking strategy configured per group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartMode {
    PlaysOnly,
    Vs,
    VsWeighted,
}

impl ChartMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlaysOnly => "plays_only",
            Self::Vs => "vs",
            Self::VsWeighted => "vs_weighted",
        }
    }
}

impl fmt::Display for ChartMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChartMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "plays_only" | "plays" => Ok(Self::PlaysOnly),
            "vs" => Ok(Self::Vs),
            "vs_weighted" => Ok(Self::VsWeighted),
            other => Err(ValidationError::ChartMode(other.to_string())),
        }
    }
}

/// How an entry moved relative to the group's previous chart week.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    New,
    Up,
    Down,
    Same,
}

impl EntryType {
    pub fn from_change(position_change: Option<i64>) -> Self {
        match position_change {
            None => Self::New,
            Some(c) if c > 0 => Self::Up,
            Some(c) if c < 0 => Self::Down,
            Some(_) => Self::Same,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Up => "up",
            Self::Down => "down",
            Self::Same => "same",
        }
    }
}

impl FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            "same" => Ok(Self::Same),
            other => Err(format!("unknown entry type {other}")),
        }
    }
}

macro_rules! sql_text_enum {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e| FromSqlError::Other(format!("{e}").into()))
            }
        }
    };
}

sql_text_enum!(ChartType);
sql_text_enum!(ChartMode);
sql_text_enum!(EntryType);

pub const MAX_CHART_SIZE: i64 = 100;

pub fn validate_chart_size(size: i64) -> Result<usize, ValidationError> {
    if (1..=MAX_CHART_SIZE).contains(&size) {
        Ok(size as usize)
    } else {
        Err(ValidationError::ChartSize { got: size, max: MAX_CHART_SIZE })
    }
}
