//! Utility functions shared by the delivery pipeline.
//!
//! Everything here counts characters, not bytes: chat limits and document
//! titles are measured in characters, and slicing on byte offsets would
//! panic on multi-byte UTF-8 (CJK group names are the common case).

/// Characters that Lark Drive refuses (or mangles) in file and folder names.
const UNSAFE_NAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Number of characters in `s`.
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Truncate `s` to at most `max_chars` characters, ellipsis included.
///
/// When truncation happens the result is the first `max_chars - 3`
/// characters followed by `"..."`, so the output never exceeds `max_chars`.
///
/// # Examples
/// ```ignore
/// use lark_courier::util::truncate_with_ellipsis;
///
/// assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
/// assert_eq!(truncate_with_ellipsis("hello world", 8), "hello...");
/// assert_eq!(truncate_with_ellipsis("😀😀😀😀😀", 4), "😀...");
/// ```
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    if char_len(s) <= max_chars {
        return s.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let end = s.char_indices().nth(keep).map_or(s.len(), |(idx, _)| idx);
    format!("{}...", &s[..end])
}

/// Keep at most the first `max_chars` characters of `s`.
pub fn take_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Last `n` characters of `s` (all of `s` when it is shorter).
pub fn last_chars(s: &str, n: usize) -> &str {
    let total = char_len(s);
    if total <= n {
        return s;
    }
    let start = s
        .char_indices()
        .nth(total - n)
        .map_or(s.len(), |(idx, _)| idx);
    &s[start..]
}

/// Replace every character Drive rejects in names with `_`.
///
/// Each occurrence is replaced on its own; runs are not collapsed.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if UNSAFE_NAME_CHARS.contains(&c) { '_' } else { c })
        .collect()
}
