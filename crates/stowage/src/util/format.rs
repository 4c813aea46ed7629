use chrono::{DateTime, Local, Utc};

const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

pub fn format_bytes(bytes: i64) -> String {
    let mut value = bytes as f64;
    let mut unit = None;
    for candidate in UNITS {
        if value.abs() < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = Some(candidate);
    }

    match unit {
        Some(unit) => format!("{:.2} {}", value, unit),
        None => format!("{} B", bytes),
    }
}

pub fn format_elapsed(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let secs = (end - start).num_seconds().max(0);
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Parse sizes such as `512`, `10KB` or `1.5 GB` (binary multiples).
pub fn parse_size(s: &str) -> Result<i64, String> {
    let upper = s.trim().to_uppercase();
    let digits_end = upper
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(upper.len());
    let (number, suffix) = upper.split_at(digits_end);

    let multiplier = match suffix.trim() {
        "" | "B" => 1,
        "KB" => 1024_i64,
        "MB" => 1024_i64.pow(2),
        "GB" => 1024_i64.pow(3),
        "TB" => 1024_i64.pow(4),
        other => return Err(format!("Unknown size unit '{}' in '{}'", other, s)),
    };

    let value: f64 = number
        .parse()
        .map_err(|_| format!("Invalid size value: {}", s))?;
    Ok((value * multiplier as f64) as i64)
}
