//! Configuration value parsing helpers

use std::time::Duration;

/// Parse a duration string like "200ms", "30s", "5m", "1h30m"
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let mut total_ms: u64 = 0;
    let mut current_num = String::new();
    let mut chars = s.trim().chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            current_num.push(c);
            continue;
        }

        let num: u64 = current_num
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", s))?;
        current_num.clear();

        total_ms += match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                num
            }
            's' => num * 1_000,
            'm' => num * 60_000,
            'h' => num * 3_600_000,
            'd' => num * 86_400_000,
            _ => return Err(format!("Unknown duration unit: {}", c)),
        };
    }

    if !current_num.is_empty() {
        return Err(format!("Missing unit in duration: {}", s));
    }

    if total_ms == 0 {
        return Err(format!("Invalid duration: {}", s));
    }

    Ok(Duration::from_millis(total_ms))
}

/// Check that a configured endpoint is an absolute http(s) URL.
pub fn validate_base_url(field: &str, value: &str) -> Result<(), String> {
    let parsed = url::Url::parse(value).map_err(|e| format!("{field}: invalid URL {value:?}: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!("{field}: unsupported scheme {other:?}")),
    }
}
