/// Truncate a string to at most `max_bytes` bytes without splitting a multi-byte
/// character. Returns the original string if it already fits.
pub fn safe_truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Shorten upstream error text for a user-visible status line.
///
/// Whitespace runs collapse to a single space and an ellipsis marks a cut.
pub fn summarize_details(s: &str, max_bytes: usize) -> String {
    let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.len() <= max_bytes {
        return collapsed;
    }
    format!("{}…", safe_truncate(&collapsed, max_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_within_limit() {
        assert_eq!(safe_truncate("hello", 10), "hello");
    }

    #[test]
    fn ascii_truncated() {
        assert_eq!(safe_truncate("hello world", 5), "hello");
    }

    #[test]
    fn cyrillic_no_split() {
        // "привет" = 6 chars × 2 bytes
        assert_eq!(safe_truncate("привет", 5), "пр");
    }

    #[test]
    fn zero_max() {
        assert_eq!(safe_truncate("hello", 0), "");
    }

    #[test]
    fn summarize_collapses_whitespace() {
        assert_eq!(summarize_details("quota\n  exceeded\t", 300), "quota exceeded");
    }

    #[test]
    fn summarize_marks_cut() {
        let long = "x".repeat(400);
        let out = summarize_details(&long, 300);
        assert!(out.ends_with('…'));
        assert_eq!(out.chars().count(), 301);
    }
}
