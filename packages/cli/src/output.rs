// ABOUTME: Terminal rendering helpers shared by the liteboxd subcommands
// ABOUTME: Tables use comfy-table, detail views print pretty JSON

use anyhow::Result;
use chrono::{DateTime, Utc};
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

pub fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn format_time(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn format_opt_time(dt: Option<&DateTime<Utc>>) -> String {
    dt.map(format_time).unwrap_or_else(|| "-".to_string())
}

/// Shorten to `max` characters, marking the cut with an ellipsis
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}

/// Colour a lifecycle, run, outcome or prepull status for tables
pub fn status_cell(status: &str) -> String {
    match status {
        "running" | "completed" | "fixed" | "created" | "updated" => status.green().to_string(),
        "pending" | "terminating" | "skipped" => status.yellow().to_string(),
        "error" | "failed" => status.red().to_string(),
        _ => status.dimmed().to_string(),
    }
}

/// clap parser for repeated `--env KEY=VALUE` flags
pub fn parse_env_pair(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("exactly-10", 10), "exactly-10");
        assert_eq!(truncate("a-much-longer-value", 10), "a-much-...");
    }

    #[test]
    fn test_parse_env_pair() {
        assert_eq!(
            parse_env_pair("APP_ENV=prod").unwrap(),
            ("APP_ENV".to_string(), "prod".to_string())
        );
        assert_eq!(
            parse_env_pair("URL=a=b").unwrap(),
            ("URL".to_string(), "a=b".to_string())
        );
        assert_eq!(
            parse_env_pair("EMPTY=").unwrap(),
            ("EMPTY".to_string(), String::new())
        );
        assert!(parse_env_pair("novalue").is_err());
        assert!(parse_env_pair("=x").is_err());
    }

    #[test]
    fn test_format_time() {
        let dt = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        assert_eq!(format_time(&dt), "2025-03-14 09:26:53");
        assert_eq!(format_opt_time(None), "-");
    }
}
