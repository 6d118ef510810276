//! Stable identities for chartable items: entry keys and URL slugs.

use std::sync::LazyLock;

use regex::Regex;

use crate::chart::ChartType;

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static NON_SLUG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

fn normalize(part: &str) -> String {
    WHITESPACE_RE
        .replace_all(part.trim(), " ")
        .to_lowercase()
}

/// Entry key for an item: `name` for artists, `name|artist` for tracks and albums.
///
/// Case and runs of whitespace are folded so "The  Cure" and "the cure" merge.
pub fn entry_key(chart_type: ChartType, name: &str, artist: Option<&str>) -> String {
    let name = normalize(name);
    if chart_type.is_artist_scoped() {
        let artist = artist.map(normalize).unwrap_or_default();
        format!("{name}|{artist}")
    } else {
        name
    }
}

/// Split an entry key back into (name, artist) parts.
pub fn split_key(key: &str) -> (&str, Option<&str>) {
    match key.split_once('|') {
        Some((name, artist)) => (name, Some(artist)),
        None => (key, None),
    }
}

/// URL-safe slug for an entry key: "dark star|grateful dead" → "dark-star--grateful-dead".
pub fn slugify(key: &str) -> String {
    let (name, artist) = split_key(key);
    let slug_part = |s: &str| {
        NON_SLUG_RE
            .replace_all(&s.to_lowercase(), "-")
            .trim_matches('-')
            .to_string()
    };
    let name_slug = slug_part(name);
    let slug = match artist.map(slug_part) {
        Some(a) if !a.is_empty() => format!("{name_slug}--{a}"),
        _ => name_slug,
    };
    if slug.is_empty() { "untitled".to_string() } else { slug }
}
