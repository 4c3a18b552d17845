//! Duration strings for config files and API responses.
//!
//! Config values like `default_ttl = "24h"` parse through [`parse_duration`];
//! the serde module is referenced from config structs via
//! `#[serde(with = "arbok_core::humantime")]`.

use serde::{self, Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_duration(*duration))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Parse a duration string: plain seconds, or a number with an
/// `ms`/`s`/`m`/`h`/`d` suffix.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    // `ms` must be tried before `s` or "500ms" parses as "500m" + trailing junk
    if let Some(num) = s.strip_suffix("ms") {
        return parse_num(num).map(Duration::from_millis);
    }
    if let Some(num) = s.strip_suffix('s') {
        return parse_num(num).map(Duration::from_secs);
    }
    if let Some(num) = s.strip_suffix('m') {
        return parse_num(num).map(|n| Duration::from_secs(n * 60));
    }
    if let Some(num) = s.strip_suffix('h') {
        return parse_num(num).map(|n| Duration::from_secs(n * 3600));
    }
    if let Some(num) = s.strip_suffix('d') {
        return parse_num(num).map(|n| Duration::from_secs(n * 86400));
    }

    Err(format!("invalid duration: {s:?}"))
}

fn parse_num(s: &str) -> Result<u64, String> {
    s.trim()
        .parse()
        .map_err(|_| format!("invalid duration number: {s:?}"))
}

/// Render a duration the way `wg`-adjacent tooling prints TTLs: `24h`,
/// `1h30m`, `45s`. Sub-second remainders are dropped unless the whole
/// duration is below one second.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    if total == 0 {
        return format!("{}ms", d.subsec_millis());
    }

    let (hours, rem) = (total / 3600, total % 3600);
    let (mins, secs) = (rem / 60, rem % 60);

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if mins > 0 {
        out.push_str(&format!("{mins}m"));
    }
    if secs > 0 || out.is_empty() {
        out.push_str(&format!("{secs}s"));
    }
    out
}
