//! Person labels. A label doubles as the on-disk name of its embedding file.

use thiserror::Error;

pub const MAX_LABEL_CHARS: usize = 50;

/// Characters that cannot appear in a label on any supported filesystem.
const FORBIDDEN_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LabelError {
    #[error("label cannot be empty")]
    Empty,
    #[error("label cannot contain '{0}'")]
    ForbiddenChar(char),
    #[error("label too long ({0} chars, max {MAX_LABEL_CHARS})")]
    TooLong(usize),
}

/// Validate a label and return its trimmed form.
pub fn validate_label(raw: &str) -> Result<&str, LabelError> {
    let label = raw.trim();
    if label.is_empty() {
        return Err(LabelError::Empty);
    }
    if let Some(c) = label.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(LabelError::ForbiddenChar(c));
    }
    let chars = label.chars().count();
    if chars > MAX_LABEL_CHARS {
        return Err(LabelError::TooLong(chars));
    }
    Ok(label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trims_whitespace() {
        assert_eq!(validate_label("  alice \n"), Ok("alice"));
    }

    #[test]
    fn test_rejects_empty() {
        assert_eq!(validate_label(""), Err(LabelError::Empty));
        assert_eq!(validate_label("   "), Err(LabelError::Empty));
    }

    #[test]
    fn test_rejects_path_characters() {
        assert_eq!(validate_label("../etc"), Err(LabelError::ForbiddenChar('/')));
        assert_eq!(validate_label("a\\b"), Err(LabelError::ForbiddenChar('\\')));
        assert_eq!(validate_label("who?"), Err(LabelError::ForbiddenChar('?')));
    }

    #[test]
    fn test_length_limit_counts_chars() {
        assert!(validate_label(&"é".repeat(MAX_LABEL_CHARS)).is_ok());
        assert_eq!(
            validate_label(&"x".repeat(MAX_LABEL_CHARS + 1)),
            Err(LabelError::TooLong(MAX_LABEL_CHARS + 1))
        );
    }
}
