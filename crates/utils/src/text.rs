use chrono::{DateTime, Utc};
use uuid::Uuid;

pub fn short_uuid(u: &Uuid) -> String {
    // simple() gives a 32-char hex string with no hyphens
    let full = u.simple().to_string();
    full.chars().take(8).collect()
}

/// Truncate to at most `max_chars` characters, appending an ellipsis when cut.
pub fn truncate_with_ellipsis(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let cut: String = input.chars().take(max_chars).collect();
    format!("{cut}…")
}

/// Human-readable relative time for listings, e.g. "3 hours ago".
pub fn time_ago(then: DateTime<Utc>) -> String {
    let delta = Utc::now().signed_duration_since(then);
    let seconds = delta.num_seconds().max(0);
    if seconds < 60 {
        return "just now".to_string();
    }
    let (count, unit) = if seconds < 3600 {
        (seconds / 60, "minute")
    } else if seconds < 86_400 {
        (seconds / 3600, "hour")
    } else if seconds < 7 * 86_400 {
        (seconds / 86_400, "day")
    } else {
        (seconds / (7 * 86_400), "week")
    };
    if count == 1 {
        format!("1 {unit} ago")
    } else {
        format!("{count} {unit}s ago")
    }
}
