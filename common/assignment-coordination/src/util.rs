use crate::error::{Error, Result};

/// Validate that an identifier is safe for use in key paths.
///
/// Identifiers (worker names) are interpolated into key paths. Without
/// validation, a name like `../../shadows/w-1` could write to arbitrary keys.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(Error::InvalidState(
            "identifier must be 1-128 characters".to_string(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::InvalidState(
            "identifier contains invalid characters (only alphanumeric, dash, underscore allowed)"
                .to_string(),
        ));
    }
    Ok(())
}

pub fn now_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Last path segment of a key. `"/items/42"` -> `"42"`.
pub fn basename(key: &str) -> &str {
    let key = key.trim_end_matches('/');
    match key.rfind('/') {
        Some(idx) => &key[idx + 1..],
        None => key,
    }
}

/// Join a root and a segment with exactly one `/` between them.
pub fn join_key(root: &str, segment: &str) -> String {
    format!(
        "{}/{}",
        root.trim_end_matches('/'),
        segment.trim_start_matches('/')
    )
}
