//! Validation of user-supplied entry names and mode strings.

use crate::error::{FileError, FileResult};

/// Characters that may not appear in a created name.
const FORBIDDEN_CHARS: &[char] = &['/', '\\', '\0', ':', '*', '?', '"', '<', '>', '|'];

/// Device names that some clients of a share cannot open.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Longest accepted name, in bytes.
const MAX_NAME_LEN: usize = 255;

/// Validate a single path component a client wants to create.
pub fn validate_file_name(name: &str) -> FileResult<()> {
    if name.is_empty() {
        return Err(FileError::BadRequest("name must not be empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FileError::BadRequest(format!(
            "name exceeds {MAX_NAME_LEN} bytes"
        )));
    }
    if let Some(c) = name.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(FileError::BadRequest(format!(
            "name contains invalid character {c:?}"
        )));
    }

    let stem = name.split('.').next().unwrap_or(name);
    if RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(stem)) {
        return Err(FileError::BadRequest(format!("{name} is a reserved name")));
    }

    if name.starts_with('.') || name.ends_with('.') {
        return Err(FileError::BadRequest(
            "name must not start or end with a dot".to_string(),
        ));
    }
    if name.starts_with(' ') || name.ends_with(' ') {
        return Err(FileError::BadRequest(
            "name must not start or end with a space".to_string(),
        ));
    }

    Ok(())
}

/// Parse an octal permission string such as `"0755"` or `"644"`.
pub fn parse_mode(mode: &str) -> FileResult<u32> {
    let digits = mode.trim();
    let digits = digits.strip_prefix("0o").unwrap_or(digits);
    if digits.is_empty() || digits.len() > 4 || !digits.chars().all(|c| ('0'..='7').contains(&c)) {
        return Err(FileError::BadRequest(format!("invalid mode: {mode}")));
    }
    u32::from_str_radix(digits, 8).map_err(|_| FileError::BadRequest(format!("invalid mode: {mode}")))
}
