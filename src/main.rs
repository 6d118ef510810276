use anyhow::{Context, Result};
use bandwagon::chart::{ChartMode, ChartType};
use bandwagon::db::models::{ChartEntry, Group, NewGroup, User};
use bandwagon::db::Database;
use bandwagon::records::{Leaderboard, RecordType};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bandwagon", version, about = "Weekly group music charts from member listening history")]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import weekly listening snapshots from JSON files or directories
    Import {
        /// Files or directories to import
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Manage users
    User {
        #[command(subcommand)]
        action: UserCommand,
    },

    /// Manage groups and memberships
    Group {
        #[command(subcommand)]
        action: GroupCommand,
    },

    /// Generate charts for a group (all pending weeks unless --week is given)
    Generate {
        /// Group name
        group: String,

        /// Week start (YYYY-MM-DD) to generate
        #[arg(long)]
        week: Option<NaiveDate>,

        /// Regenerate even if the week is already materialized
        #[arg(long)]
        force: bool,
    },

    /// Show a group's chart for one week
    Chart {
        /// Group name
        group: String,

        /// Chart type (artists, tracks, albums)
        #[arg(short = 't', long = "type", default_value = "artists")]
        chart_type: ChartType,

        /// Week start (YYYY-MM-DD); defaults to the latest materialized week
        #[arg(long)]
        week: Option<NaiveDate>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show trends for one materialized week
    Trends {
        /// Group name
        group: String,

        /// Week start (YYYY-MM-DD); defaults to the latest materialized week
        #[arg(long)]
        week: Option<NaiveDate>,

        /// Re-derive trends instead of using the stored ones
        #[arg(long)]
        refresh: bool,
    },

    /// Recompute stale and missing per-entry stats
    RecomputeStats {
        /// Group name
        group: String,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,
    },

    /// Show group records (leaderboards)
    Records {
        /// Group name
        group: String,

        /// One record, e.g. weeks_at_number_one:artists or entries_driven
        #[arg(short, long)]
        record: Option<RecordType>,

        /// Recompute all leaderboards and store them
        #[arg(long)]
        refresh: bool,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,
    },

    /// Recommend groups that match a user's listening
    Recommend {
        /// User name
        user: String,

        /// Ignore cached recommendations
        #[arg(long)]
        force: bool,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,
    },

    /// Set genre tags for an artist (tag or tag=weight)
    Tag {
        /// Artist name
        artist: String,

        /// Tags, e.g. shoegaze=0.8 dream-pop
        #[arg(required = true)]
        tags: Vec<String>,
    },

    /// Show database statistics
    Stats,
}

#[derive(Subcommand)]
enum UserCommand {
    /// Add a user (no-op if it exists)
    Add { name: String },
    /// Rename a user; charts show the new name immediately
    Rename { name: String, new_name: String },
}

#[derive(Subcommand)]
enum GroupCommand {
    /// Create a group owned by an existing user
    Create {
        name: String,

        /// Owner's user name
        #[arg(long)]
        owner: String,

        /// Chart mode (plays_only, vs, vs_weighted)
        #[arg(long, default_value = "plays_only")]
        mode: ChartMode,

        /// Entries per chart
        #[arg(long, default_value = "10")]
        size: i64,

        /// Tracking day (0 = Monday .. 6 = Sunday)
        #[arg(long, default_value = "0")]
        tracking_day: i64,

        /// Mark the group private (private invite-only groups are never recommended)
        #[arg(long)]
        private: bool,

        /// Require the owner to add members
        #[arg(long)]
        invite_only: bool,
    },
    /// Join a group
    Join {
        group: String,
        user: String,
        /// Add the member even if the group is invite-only
        #[arg(long)]
        invited: bool,
    },
    /// Leave a group
    Leave { group: String, user: String },
    /// Change a group's tracking day (owner only; may delete overlapping charts)
    SetTrackingDay {
        group: String,
        /// Acting user (must own the group)
        #[arg(long)]
        user: String,
        /// New tracking day (0 = Monday .. 6 = Sunday)
        day: i64,
        /// Confirm deletion of overlapping chart weeks
        #[arg(long)]
        confirm: bool,
    },
    /// List all groups
    List,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    let config = bandwagon::config::AppConfig::load();

    // Resolve database path: CLI > config > XDG default
    let db_path = cli.db_path
        .or(config.db_path.clone())
        .unwrap_or_else(bandwagon::config::default_db_path);
    log::info!("Database: {}", db_path.display());

    let db = Database::open(&db_path)
        .context("Failed to open database")?;

    let workers = |jobs: usize| if jobs > 0 { jobs } else { config.resolve_workers() };
    let today = Utc::now().date_naive();

    match cli.command {
        Commands::Import { paths } => {
            let result = bandwagon::import::import_snapshots(&db, &paths)
                .context("Import failed")?;
            println!(
                "Import complete: {} snapshots from {} files, {} already recorded, {} errors",
                result.snapshots, result.files, result.duplicates, result.errors
            );
        }

        Commands::User { action } => match action {
            UserCommand::Add { name } => {
                let id = db.upsert_user(name.trim()).context("Failed to add user")?;
                println!("User {} has id {}", name.trim(), id);
            }
            UserCommand::Rename { name, new_name } => {
                let user = require_user(&db, &name)?;
                db.rename_user(user.id, new_name.trim())
                    .context("Rename failed")?;
                println!("Renamed {} to {}", name, new_name.trim());
            }
        },

        Commands::Group { action } => run_group_command(&db, action, today)?,

        Commands::Generate { group, week, force } => {
            let group = require_group(&db, &group)?;
            match week {
                Some(week_start) => {
                    let outcome = bandwagon::generate::generate_week(
                        &db, &db, &group, week_start, today, &config, force,
                    ).context("Generation failed")?;
                    match outcome {
                        bandwagon::generate::WeekOutcome::Generated { week_start, entries } => {
                            println!("Generated week {}: {} chart entries", week_start, entries);
                        }
                        bandwagon::generate::WeekOutcome::Skipped { week_start } => {
                            println!("Week {} already generated (use --force to regenerate)", week_start);
                        }
                    }
                }
                None => {
                    let result = bandwagon::generate::generate_pending(&db, &group, today, &config)
                        .context("Generation failed")?;
                    println!(
                        "Generation complete: {} generated, {} skipped, {} failed",
                        result.generated, result.skipped, result.failed
                    );
                }
            }
        }

        Commands::Chart { group, chart_type, week, json } => {
            let group = require_group(&db, &group)?;
            let Some(week_start) = resolve_week(&db, &group, week)? else {
                println!("No charts yet. Run `bandwagon generate {}` first.", group.name);
                return Ok(());
            };
            let entries = db.get_chart(group.id, chart_type, week_start)
                .context("Query failed")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }
            if entries.is_empty() {
                println!("No {} chart for {} week {}.", chart_type, group.name, week_start);
                return Ok(());
            }
            println!("{} {} chart, week of {} ({}):", group.name, chart_type, week_start, group.chart_mode);
            println!();
            print_chart_table(&entries);
        }

        Commands::Trends { group, week, refresh } => {
            let group = require_group(&db, &group)?;
            let Some(week_start) = resolve_week(&db, &group, week)? else {
                println!("No charts yet. Run `bandwagon generate {}` first.", group.name);
                return Ok(());
            };
            let stored = if refresh { None } else { db.get_trends(group.id, week_start)? };
            let trends = match stored {
                Some(t) => t,
                None => bandwagon::trends::analyze_week(&db, group.id, week_start, &config.trends)
                    .context("Trend analysis failed")?,
            };
            println!("{}", serde_json::to_string_pretty(&trends)?);
        }

        Commands::RecomputeStats { group, jobs } => {
            let group = require_group(&db, &group)?;
            let result = bandwagon::stats::refresh_group_stats(&db, group.id, workers(jobs))
                .context("Stats recompute failed")?;
            println!(
                "Stats recompute complete: {} updated, {} removed, {} failed",
                result.updated, result.removed, result.failed
            );
        }

        Commands::Records { group, record, refresh, jobs } => {
            let group = require_group(&db, &group)?;
            let workers = workers(jobs);
            if let Some(record) = record {
                let board = bandwagon::records::query_record(&db, group.id, record, &config.records, workers)
                    .context("Records query failed")?;
                println!("{} {}:", group.name, record);
                println!();
                print_leaderboard(&db, &board)?;
                return Ok(());
            }

            let records = match db.get_records(group.id)? {
                Some((status, records)) if !refresh => {
                    log::info!("Stored records are {}", status.as_str());
                    records
                }
                _ => bandwagon::records::refresh_group_records(&db, group.id, &config.records, workers)
                    .context("Records refresh failed")?,
            };
            if records.is_empty() {
                println!("No records for {}.", group.name);
                return Ok(());
            }
            for (record, board) in &records.0 {
                println!("{}:", record);
                print_leaderboard(&db, board)?;
                println!();
            }
        }

        Commands::Recommend { user, force, jobs } => {
            let user = require_user(&db, &user)?;
            let recs = bandwagon::compat::recommend_groups(
                &db, user.id, Utc::now(), &config.compatibility, workers(jobs), force,
            ).context("Recommendation failed")?;

            if recs.is_empty() {
                println!("No matching groups for {}.", user.name);
                return Ok(());
            }
            println!("Groups for {}:", user.name);
            println!();
            println!(
                "{:>3} {:<30} {:>6} {:>7} {:>7} {:>7} {:>7}",
                "#", "Group", "Score", "Artist", "Track", "Genre", "Pattern"
            );
            println!("{}", "-".repeat(75));
            for rec in &recs {
                let c = &rec.compatibility;
                let name = db.get_group(c.group_id).map(|g| g.name).unwrap_or_else(|_| c.group_id.to_string());
                println!(
                    "{:>3} {:<30} {:>6.1} {:>7.2} {:>7.2} {:>7.2} {:>7.2}",
                    rec.rank, truncate(&name, 30), c.score,
                    c.artist_overlap, c.track_overlap, c.genre_overlap, c.pattern_score
                );
            }
        }

        Commands::Tag { artist, tags } => {
            let key = bandwagon::identity::entry_key(ChartType::Artists, &artist, None);
            let parsed = tags.iter()
                .map(|t| parse_tag(t))
                .collect::<Result<Vec<_>>>()?;
            db.set_artist_tags(&key, &parsed).context("Failed to store tags")?;
            println!("Tagged {} with {} tags", artist, parsed.len());
        }

        Commands::Stats => {
            let stats = db.stats().context("Failed to get stats")?;
            println!("Database: {}", db_path.display());
            println!();
            println!("Users:           {}", stats.users);
            println!("Groups:          {}", stats.groups);
            println!("Snapshot weeks:  {}", stats.snapshot_weeks);
            println!("Chart weeks:     {}", stats.chart_weeks);
            println!("Chart entries:   {}", stats.chart_entries);
            println!("Stale stats:     {}", stats.stale_stats);
            println!("Queued weeks:    {}", stats.queued_weeks);
        }
    }

    Ok(())
}

fn run_group_command(db: &Database, action: GroupCommand, today: NaiveDate) -> Result<()> {
    match action {
        GroupCommand::Create { name, owner, mode, size, tracking_day, private, invite_only } => {
            bandwagon::chart::validate_chart_size(size)?;
            bandwagon::week::tracking_weekday(tracking_day)?;
            let owner = require_user(db, &owner)?;
            let id = db.create_group(&NewGroup {
                name: name.trim().to_string(),
                owner_id: owner.id,
                chart_mode: mode,
                chart_size: size,
                tracking_day,
                is_private: private,
                allow_free_join: !invite_only,
            }).context("Failed to create group")?;
            db.add_member(id, owner.id, today)?;
            db.invalidate_recommendations(owner.id)?;
            println!("Created group {} (id {}), owned by {}", name.trim(), id, owner.name);
        }
        GroupCommand::Join { group, user, invited } => {
            let group = require_group(db, &group)?;
            let user = require_user(db, &user)?;
            if !group.allow_free_join && !invited {
                anyhow::bail!("Group {} is invite-only (pass --invited to add the member)", group.name);
            }
            db.add_member(group.id, user.id, today)?;
            db.invalidate_recommendations(user.id)?;
            println!("{} joined {}", user.name, group.name);
        }
        GroupCommand::Leave { group, user } => {
            let group = require_group(db, &group)?;
            let user = require_user(db, &user)?;
            db.remove_member(group.id, user.id, today)?;
            db.invalidate_recommendations(user.id)?;
            println!("{} left {}", user.name, group.name);
        }
        GroupCommand::SetTrackingDay { group, user, day, confirm } => {
            let group = require_group(db, &group)?;
            let user = require_user(db, &user)?;
            let outcome = bandwagon::generate::change_tracking_day(db, group.id, user.id, day, confirm)
                .context("Tracking day change failed")?;
            println!("{} now tracks weeks from day {}", group.name, day);
            if !outcome.deleted_weeks.is_empty() {
                let weeks: Vec<String> = outcome.deleted_weeks.iter().map(|w| w.to_string()).collect();
                println!("Deleted overlapping weeks: {}", weeks.join(", "));
            }
            if let Some(queued) = outcome.queued_week {
                println!("Queued week {} for regeneration", queued);
            }
        }
        GroupCommand::List => {
            let groups = db.get_all_groups()?;
            if groups.is_empty() {
                println!("No groups.");
                return Ok(());
            }
            println!("{:>4} {:<30} {:<12} {:>4} {:>3} {:<8}", "Id", "Name", "Mode", "Size", "Day", "Access");
            println!("{}", "-".repeat(66));
            for g in &groups {
                let access = match (g.is_private, g.allow_free_join) {
                    (true, _) => "private",
                    (false, true) => "open",
                    (false, false) => "invite",
                };
                println!(
                    "{:>4} {:<30} {:<12} {:>4} {:>3} {:<8}",
                    g.id, truncate(&g.name, 30), g.chart_mode.as_str(), g.chart_size, g.tracking_day, access
                );
            }
        }
    }
    Ok(())
}

fn require_user(db: &Database, name: &str) -> Result<User> {
    db.find_user(name.trim())?
        .with_context(|| format!("No user named \"{}\"", name.trim()))
}

fn require_group(db: &Database, name: &str) -> Result<Group> {
    db.find_group(name.trim())?
        .with_context(|| format!("No group named \"{}\"", name.trim()))
}

fn resolve_week(db: &Database, group: &Group, week: Option<NaiveDate>) -> Result<Option<NaiveDate>> {
    match week {
        Some(w) => Ok(Some(w)),
        None => Ok(db.latest_materialized_week(group.id)?),
    }
}

fn parse_tag(raw: &str) -> Result<(String, f64)> {
    match raw.split_once('=') {
        Some((tag, weight)) => {
            let weight: f64 = weight.trim().parse()
                .with_context(|| format!("Invalid tag weight in \"{}\"", raw))?;
            if !weight.is_finite() || weight < 0.0 {
                anyhow::bail!("Tag weight must be a non-negative number: \"{}\"", raw);
            }
            Ok((tag.trim().to_lowercase(), weight))
        }
        None => Ok((raw.trim().to_lowercase(), 1.0)),
    }
}

fn print_chart_table(entries: &[ChartEntry]) {
    println!(
        "{:>3} {:>5} {:<35} {:<25} {:>6} {:>7}  {}",
        "Pos", "Move", "Name", "Artist", "Plays", "VS", "Driver"
    );
    println!("{}", "-".repeat(100));
    for e in entries {
        let movement = match e.position_change {
            Some(0) => "=".to_string(),
            Some(c) if c > 0 => format!("+{}", c),
            Some(c) => c.to_string(),
            None => e.entry_type.as_str().to_uppercase(),
        };
        let vs = e.vibe_score.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "—".to_string());
        println!(
            "{:>3} {:>5} {:<35} {:<25} {:>6} {:>7}  {}",
            e.position,
            movement,
            truncate(&e.name, 35),
            truncate(e.artist.as_deref().unwrap_or(""), 25),
            e.playcount,
            vs,
            e.major_driver_name.as_deref().unwrap_or("—"),
        );
    }
}

fn print_leaderboard(db: &Database, board: &Leaderboard) -> Result<()> {
    match board {
        Leaderboard::Entries(rows) => {
            for r in rows {
                let label = match &r.artist {
                    Some(a) => format!("{} - {}", r.name, a),
                    None => r.name.clone(),
                };
                println!("{:>3}. {:<50} {:>6}", r.rank, truncate(&label, 50), r.value);
            }
        }
        Leaderboard::Members(rows) => {
            for r in rows {
                let name = db.user_name(r.user_id)?.unwrap_or_else(|| format!("user {}", r.user_id));
                println!("{:>3}. {:<50} {:>6}", r.rank, truncate(&name, 50), r.value);
            }
        }
    }
    if board.is_empty() {
        println!("  (none)");
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max - 1).collect();
        format!("{}…", truncated)
    }
}
