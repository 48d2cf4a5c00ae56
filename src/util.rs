//! Small helpers shared across the codebase.

/// Truncate a string to at most `max_chars` characters, appending "..." if
/// truncated. Safe on multi-byte UTF-8 because it cuts at character
/// boundaries, never byte indices.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

/// First line of an error message, capped at `max_chars`. Used to compare
/// failure signatures where full messages carry volatile suffixes.
pub fn error_prefix(s: &str, max_chars: usize) -> String {
    let first_line = s.lines().next().unwrap_or("");
    match first_line.char_indices().nth(max_chars) {
        Some((idx, _)) => first_line[..idx].to_string(),
        None => first_line.to_string(),
    }
}
