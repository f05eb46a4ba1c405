//! Table formatting helpers for CLI output.

use comfy_table::{ContentArrangement, Table};

/// Create a styled table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a chrono timestamp as a relative "ago" string.
pub fn format_ago(dt: &chrono::DateTime<chrono::Utc>) -> String {
    let now = chrono::Utc::now();
    let duration = now.signed_duration_since(*dt);

    let secs = duration.num_seconds();
    if secs < 0 {
        return "just now".to_string();
    }

    if secs < 60 {
        return format!("{secs} seconds ago");
    }

    let mins = duration.num_minutes();
    if mins < 60 {
        return format!("{mins} minutes ago");
    }

    let hours = duration.num_hours();
    if hours < 24 {
        return format!("{hours} hours ago");
    }

    let days = duration.num_days();
    if days < 30 {
        return format!("{days} days ago");
    }

    let months = days / 30;
    if months < 12 {
        return format!("{months} months ago");
    }

    let years = days / 365;
    format!("{years} years ago")
}

/// Parse a size string like "500m", "10g", "1t" into bytes.
///
/// Supported suffixes (case-insensitive): `b`, `k`/`kb`, `m`/`mb`, `g`/`gb`, `t`/`tb`.
/// No suffix assumes bytes.
pub fn parse_size_bytes(s: &str) -> Result<u64, String> {
    let s = s.trim().to_lowercase();
    if s.is_empty() {
        return Err("empty size value".to_string());
    }

    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    const TB: u64 = 1024 * GB;

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix("tb") {
        (n, TB)
    } else if let Some(n) = s.strip_suffix('t') {
        (n, TB)
    } else if let Some(n) = s.strip_suffix("gb") {
        (n, GB)
    } else if let Some(n) = s.strip_suffix('g') {
        (n, GB)
    } else if let Some(n) = s.strip_suffix("mb") {
        (n, MB)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, MB)
    } else if let Some(n) = s.strip_suffix("kb") {
        (n, KB)
    } else if let Some(n) = s.strip_suffix('k') {
        (n, KB)
    } else if let Some(n) = s.strip_suffix('b') {
        (n, 1u64)
    } else {
        // Assume bytes if no suffix
        (s.as_str(), 1u64)
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| format!("invalid size value: {s}"))?;

    Ok(num * multiplier)
}

/// Shorten a `sha256:<hex>` digest to 12 hex characters.
pub fn short_digest(digest: &str) -> String {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    hex.chars().take(12).collect()
}

/// Render permission bits like `ls -l`, with a leading type character.
pub fn format_mode(type_char: char, mode: u32) -> String {
    let mut out = String::with_capacity(10);
    out.push(type_char);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- format_bytes tests ---

    #[test]
    fn test_format_bytes_zero() {
        assert_eq!(format_bytes(0), "0 B");
    }

    #[test]
    fn test_format_bytes_small() {
        assert_eq!(format_bytes(1), "1 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1023), "1023 B");
    }

    #[test]
    fn test_format_bytes_kilobytes() {
        assert_eq!(format_bytes(1024), "1.0 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(10240), "10.0 KB");
    }

    #[test]
    fn test_format_bytes_megabytes() {
        assert_eq!(format_bytes(1048576), "1.0 MB");
        assert_eq!(format_bytes(1048576 + 524288), "1.5 MB");
        assert_eq!(format_bytes(100 * 1048576), "100.0 MB");
    }

    #[test]
    fn test_format_bytes_gigabytes() {
        assert_eq!(format_bytes(1073741824), "1.0 GB");
        assert_eq!(format_bytes(10 * 1073741824), "10.0 GB");
    }

    // --- short_digest / format_mode tests ---

    #[test]
    fn test_short_digest() {
        assert_eq!(
            short_digest("sha256:0123456789abcdef0123456789abcdef"),
            "0123456789ab"
        );
        assert_eq!(short_digest("abc"), "abc");
    }

    #[test]
    fn test_format_mode() {
        assert_eq!(format_mode('-', 0o644), "-rw-r--r--");
        assert_eq!(format_mode('d', 0o755), "drwxr-xr-x");
        assert_eq!(format_mode('l', 0o777), "lrwxrwxrwx");
        assert_eq!(format_mode('-', 0o100600), "-rw-------");
    }

    // --- parse_size_bytes tests ---

    #[test]
    fn test_parse_size_bytes_bytes() {
        assert_eq!(parse_size_bytes("0").unwrap(), 0);
        assert_eq!(parse_size_bytes("1024").unwrap(), 1024);
        assert_eq!(parse_size_bytes("100b").unwrap(), 100);
        assert_eq!(parse_size_bytes("100B").unwrap(), 100);
    }

    #[test]
    fn test_parse_size_bytes_kilobytes() {
        assert_eq!(parse_size_bytes("1k").unwrap(), 1024);
        assert_eq!(parse_size_bytes("1K").unwrap(), 1024);
        assert_eq!(parse_size_bytes("1kb").unwrap(), 1024);
        assert_eq!(parse_size_bytes("1KB").unwrap(), 1024);
        assert_eq!(parse_size_bytes("512k").unwrap(), 512 * 1024);
    }

    #[test]
    fn test_parse_size_bytes_megabytes() {
        assert_eq!(parse_size_bytes("1m").unwrap(), 1024 * 1024);
        assert_eq!(parse_size_bytes("1M").unwrap(), 1024 * 1024);
        assert_eq!(parse_size_bytes("500mb").unwrap(), 500 * 1024 * 1024);
        assert_eq!(parse_size_bytes("500MB").unwrap(), 500 * 1024 * 1024);
    }

    #[test]
    fn test_parse_size_bytes_gigabytes() {
        assert_eq!(parse_size_bytes("1g").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size_bytes("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size_bytes("10gb").unwrap(), 10 * 1024 * 1024 * 1024);
        assert_eq!(parse_size_bytes("10GB").unwrap(), 10 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_size_bytes_terabytes() {
        assert_eq!(parse_size_bytes("1t").unwrap(), 1024 * 1024 * 1024 * 1024);
        assert_eq!(parse_size_bytes("1TB").unwrap(), 1024 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_size_bytes_whitespace() {
        assert_eq!(
            parse_size_bytes("  10g  ").unwrap(),
            10 * 1024 * 1024 * 1024
        );
    }

    #[test]
    fn test_parse_size_bytes_invalid_empty() {
        assert!(parse_size_bytes("").is_err());
    }

    #[test]
    fn test_parse_size_bytes_invalid_letters() {
        assert!(parse_size_bytes("abc").is_err());
    }

    #[test]
    fn test_parse_size_bytes_invalid_float() {
        assert!(parse_size_bytes("1.5g").is_err());
    }

    #[test]
    fn test_parse_size_bytes_invalid_negative() {
        assert!(parse_size_bytes("-10g").is_err());
    }

    // --- new_table tests ---

    #[test]
    fn test_new_table() {
        let table = new_table(&["ID", "NAME", "STATUS"]);
        let output = table.to_string();
        assert!(output.contains("ID"));
        assert!(output.contains("NAME"));
        assert!(output.contains("STATUS"));
    }

    #[test]
    fn test_new_table_with_rows() {
        let mut table = new_table(&["COL1", "COL2"]);
        table.add_row(["hello", "world"]);
        table.add_row(["foo", "bar"]);
        let output = table.to_string();
        assert!(output.contains("hello"));
        assert!(output.contains("world"));
        assert!(output.contains("foo"));
        assert!(output.contains("bar"));
    }

    #[test]
    fn test_new_table_single_header() {
        let table = new_table(&["SINGLE"]);
        let output = table.to_string();
        assert!(output.contains("SINGLE"));
    }

    // --- format_ago tests ---

    #[test]
    fn test_format_ago_seconds() {
        let now = chrono::Utc::now();
        assert_eq!(format_ago(&now), "0 seconds ago");

        let thirty_sec = now - chrono::Duration::seconds(30);
        assert_eq!(format_ago(&thirty_sec), "30 seconds ago");
    }

    #[test]
    fn test_format_ago_minutes() {
        let now = chrono::Utc::now();
        let one_min = now - chrono::Duration::minutes(1);
        assert_eq!(format_ago(&one_min), "1 minutes ago");

        let five_min = now - chrono::Duration::minutes(5);
        assert_eq!(format_ago(&five_min), "5 minutes ago");

        let fifty_nine_min = now - chrono::Duration::minutes(59);
        assert_eq!(format_ago(&fifty_nine_min), "59 minutes ago");
    }

    #[test]
    fn test_format_ago_hours() {
        let now = chrono::Utc::now();
        let one_hour = now - chrono::Duration::hours(1);
        assert_eq!(format_ago(&one_hour), "1 hours ago");

        let two_hours = now - chrono::Duration::hours(2);
        assert_eq!(format_ago(&two_hours), "2 hours ago");

        let twenty_three_hours = now - chrono::Duration::hours(23);
        assert_eq!(format_ago(&twenty_three_hours), "23 hours ago");
    }

    #[test]
    fn test_format_ago_days() {
        let now = chrono::Utc::now();
        let one_day = now - chrono::Duration::days(1);
        assert_eq!(format_ago(&one_day), "1 days ago");

        let three_days = now - chrono::Duration::days(3);
        assert_eq!(format_ago(&three_days), "3 days ago");

        let twenty_nine_days = now - chrono::Duration::days(29);
        assert_eq!(format_ago(&twenty_nine_days), "29 days ago");
    }

    #[test]
    fn test_format_ago_months() {
        let now = chrono::Utc::now();
        let two_months = now - chrono::Duration::days(60);
        assert_eq!(format_ago(&two_months), "2 months ago");
    }

    #[test]
    fn test_format_ago_years() {
        let now = chrono::Utc::now();
        let two_years = now - chrono::Duration::days(730);
        assert_eq!(format_ago(&two_years), "2 years ago");
    }

    #[test]
    fn test_format_ago_future() {
        let now = chrono::Utc::now();
        let future = now + chrono::Duration::hours(1);
        assert_eq!(format_ago(&future), "just now");
    }
}
