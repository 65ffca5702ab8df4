//! Shared utility helpers.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Default data directory: `<toolsmith_home>/data`.
pub fn default_data_dir() -> PathBuf {
    crate::toolsmith_home().join("data")
}

/// Truncate a string to `max` bytes (on a char boundary), appending `…` if trimmed.
pub fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

/// Truncate an owned string in place to at most `max_bytes`.
pub fn truncate_utf8_owned(mut s: String, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    s
}

/// Reject identifiers that could escape a directory when used as a path segment.
pub fn validate_segment(s: &str) -> anyhow::Result<()> {
    if s.is_empty()
        || s.contains('/')
        || s.contains('\\')
        || s.contains('\0')
        || s.contains("..")
    {
        anyhow::bail!("invalid identifier: {s:?}");
    }
    Ok(())
}
