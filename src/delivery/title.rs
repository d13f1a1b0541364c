//! Document titles derived from free-form message content.

use crate::util::{char_len, truncate_with_ellipsis};
use chrono::{DateTime, Local, TimeZone};
use regex::Regex;
use std::sync::OnceLock;

/// Titles are capped at this many characters, ellipsis included.
pub const MAX_TITLE_CHARS: usize = 80;
/// A plain line must have at least this many characters to become a title.
const MIN_LINE_TITLE_CHARS: usize = 5;

/// Openers that carry no meaning as a title ("OK, ...", "Here is ...").
const LEAD_IN_PHRASES: &[&str] = &[
    "ok", "okay", "sure", "here is", "here's", "let me", "done", "好的", "这是", "以下是", "让我",
    "完成",
];

/// Derive a title for `content` using the current local time for the fallback.
pub fn extract_title(content: &str, fallback_label: &str) -> String {
    extract_title_at(content, fallback_label, &Local::now())
}

/// First match wins: a markdown heading, then the first substantive line,
/// then `"{fallback_label} - {timestamp}"`.
pub fn extract_title_at<Tz: TimeZone>(
    content: &str,
    fallback_label: &str,
    now: &DateTime<Tz>,
) -> String
where
    Tz::Offset: std::fmt::Display,
{
    if let Some(heading) = first_heading(content) {
        return truncate_with_ellipsis(heading, MAX_TITLE_CHARS);
    }

    if let Some(line) = content.lines().map(str::trim).find(|l| is_title_line(l)) {
        return truncate_with_ellipsis(line, MAX_TITLE_CHARS);
    }

    format!("{fallback_label} - {}", now.format("%Y/%-m/%-d %H:%M:%S"))
}

fn first_heading(content: &str) -> Option<&str> {
    static HEADING_RE: OnceLock<Regex> = OnceLock::new();
    let regex = HEADING_RE.get_or_init(|| {
        Regex::new(r"^\s{0,3}#{1,6}\s+(.+)$").expect("heading regex must compile")
    });

    content.lines().find_map(|line| {
        regex
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim())
            .filter(|text| !text.is_empty())
    })
}

fn is_title_line(line: &str) -> bool {
    !line.is_empty()
        && !is_horizontal_rule(line)
        && !is_lead_in(line)
        && char_len(line) >= MIN_LINE_TITLE_CHARS
}

fn is_horizontal_rule(line: &str) -> bool {
    let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    compact.len() >= 3
        && ['-', '*', '_']
            .iter()
            .any(|marker| compact.chars().all(|c| c == *marker))
}

fn is_lead_in(line: &str) -> bool {
    let lower = line.to_lowercase();
    LEAD_IN_PHRASES.iter().any(|phrase| {
        let Some(rest) = lower.strip_prefix(phrase) else {
            return false;
        };
        // a lead-in ends at punctuation, whitespace or end of line, so "ok"
        // keeps "okinawa" and "完成" keeps "完成度分析报告"
        rest.chars().next().map_or(true, |c| !c.is_alphanumeric())
    })
}
