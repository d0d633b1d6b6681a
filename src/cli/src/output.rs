//! Table and unit helpers for CLI output.

use chrono::{DateTime, Utc};
use comfy_table::{ContentArrangement, Table};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

/// Borderless table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Human-readable byte count, e.g. "1.5 MB".
pub fn format_bytes(bytes: u64) -> String {
    for (unit, size) in [("GB", GIB), ("MB", MIB), ("KB", KIB)] {
        if bytes >= size {
            return format!("{:.1} {}", bytes as f64 / size as f64, unit);
        }
    }
    format!("{} B", bytes)
}

/// Relative age such as "3 hours ago".
pub fn format_ago(dt: &DateTime<Utc>) -> String {
    let age = Utc::now().signed_duration_since(*dt);
    let secs = age.num_seconds();
    if secs < 0 {
        return "just now".to_string();
    }

    let days = age.num_days();
    let (value, unit) = if secs < 60 {
        (secs, "seconds")
    } else if age.num_minutes() < 60 {
        (age.num_minutes(), "minutes")
    } else if age.num_hours() < 24 {
        (age.num_hours(), "hours")
    } else if days < 30 {
        (days, "days")
    } else if days < 365 {
        (days / 30, "months")
    } else {
        (days / 365, "years")
    };
    format!("{value} {unit} ago")
}

/// Parse sizes like "500m", "10g" or "1tb" into bytes. No suffix means bytes.
pub fn parse_size_bytes(s: &str) -> Result<u64, String> {
    let s = s.trim().to_lowercase();
    if s.is_empty() {
        return Err("empty size value".to_string());
    }

    let digits_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (number, suffix) = s.split_at(digits_end);
    let multiplier = match suffix {
        "" | "b" => 1,
        "k" | "kb" => KIB,
        "m" | "mb" => MIB,
        "g" | "gb" => GIB,
        "t" | "tb" => TIB,
        _ => return Err(format!("invalid size value: {s}")),
    };

    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid size value: {s}"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size value too large: {s}"))
}
