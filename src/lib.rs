pub mod aggregate;
pub mod chart;
pub mod compat;
pub mod config;
pub mod db;
pub mod generate;
pub mod identity;
pub mod import;
pub mod ranker;
pub mod records;
pub mod scoring;
pub mod stats;
pub mod trends;
pub mod week;

/// Application name for XDG paths
pub const APP_NAME: &str = "bandwagon";
