//! Input validation for outbound text and on-disk names.

use thiserror::Error;

/// Firmware limit for a text payload (`DATA_PAYLOAD_LEN` minus headroom).
pub const MAX_TEXT_BYTES: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TextError {
    #[error("message text is empty")]
    Empty,

    #[error("message is {len} bytes (max {max} bytes)")]
    TooLong { len: usize, max: usize },
}

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("file size exceeds limit ({limit} bytes)")]
    FileSizeExceeded { limit: usize },

    #[error("invalid JSON: {0}")]
    InvalidFormat(#[from] serde_json::Error),
}

/// Sanitize a direct message before it is encoded: control characters other
/// than newline and tab are removed, surrounding whitespace trimmed, and the
/// UTF-8 byte length checked against `max_bytes`.
pub fn validate_dm_text(text: &str, max_bytes: usize) -> Result<String, TextError> {
    let sanitized: String = text
        .chars()
        .filter(|&c| !c.is_control() || c == '\n' || c == '\t')
        .collect();
    let trimmed = sanitized.trim();
    if trimmed.is_empty() {
        return Err(TextError::Empty);
    }
    if trimmed.len() > max_bytes {
        return Err(TextError::TooLong {
            len: trimmed.len(),
            max: max_bytes,
        });
    }
    Ok(trimmed.to_string())
}

/// Filesystem-safe name for a session key (device address) using URL encoding.
pub fn safe_filename(name: &str) -> String {
    use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
    utf8_percent_encode(name, NON_ALPHANUMERIC).to_string()
}

/// Parse JSON with a size ceiling so a corrupt or hostile file cannot exhaust memory.
pub fn secure_json_parse<T>(content: &str, max_bytes: usize) -> Result<T, SecurityError>
where
    T: serde::de::DeserializeOwned,
{
    if content.len() > max_bytes {
        return Err(SecurityError::FileSizeExceeded { limit: max_bytes });
    }
    // Valid JSON never starts with NUL; interrupted writes on some filesystems leave them.
    let normalized = content.trim_start_matches('\0');
    Ok(serde_json::from_str(normalized)?)
}
