use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;

/// Application configuration loaded from TOML config file.
/// All fields have sensible defaults — the config file is optional.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct AppConfig {
    /// Custom database path (overrides XDG default).
    pub db_path: Option<PathBuf>,
    /// Number of parallel workers. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    pub scoring: ScoringConfig,
    pub trends: TrendsConfig,
    pub records: RecordsConfig,
    pub compatibility: CompatibilityConfig,
}

/// Vibe-score parameters.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ScoringConfig {
    /// Exponent of the contributor multiplier `n^exponent` used by `vs`.
    pub contributor_exponent: f64,
    /// Share of raw playcount in `vs_weighted` (0.0 = pure vs, 1.0 = plays only).
    pub blend_weight: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            contributor_exponent: 1.5,
            blend_weight: 0.5,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TrendsConfig {
    /// Worst position that still counts toward a streak.
    pub streak_threshold: i64,
    /// Number of climbers reported per chart type.
    pub max_climbers: usize,
}

impl Default for TrendsConfig {
    fn default() -> Self {
        Self {
            streak_threshold: 10,
            max_climbers: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RecordsConfig {
    /// Leaderboard length.
    pub top_n: usize,
    /// Maximum stats rows recomputed by one records query.
    pub refresh_batch_size: usize,
}

impl Default for RecordsConfig {
    fn default() -> Self {
        Self {
            top_n: 10,
            refresh_batch_size: 200,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CompatibilityConfig {
    /// Trailing window of weeks used for listening summaries.
    pub window_weeks: u32,
    /// User top artists compared during candidate selection.
    pub top_artists: usize,
    /// Candidates scored concurrently per batch.
    pub batch_size: usize,
    /// Recommendation cache lifetime in hours.
    pub cache_ttl_hours: i64,
    pub weights: CompatibilityWeights,
}

impl Default for CompatibilityConfig {
    fn default() -> Self {
        Self {
            window_weeks: 12,
            top_artists: 30,
            batch_size: 5,
            cache_ttl_hours: 24,
            weights: CompatibilityWeights::default(),
        }
    }
}

/// Relative weights of the four compatibility components.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CompatibilityWeights {
    pub artist: f64,
    pub track: f64,
    pub genre: f64,
    pub pattern: f64,
}

impl Default for CompatibilityWeights {
    fn default() -> Self {
        Self {
            artist: 0.4,
            track: 0.25,
            genre: 0.15,
            pattern: 0.2,
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/bandwagon/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        let config_path = Self::config_path();
        match config_path {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match Self::parse(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str::<AppConfig>(contents)
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Resolve the default database path using XDG data directory.
pub fn default_db_path() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir).ok();
        data_dir.join("bandwagon.db")
    } else {
        // Fallback: current directory
        PathBuf::from("bandwagon.db")
    }
}
