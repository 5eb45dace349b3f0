//! Aggregation of stage errors and warnings.
//!
//! Nomad transports multiple warnings as a single string and multiple
//! validation errors as a flattened message plus a list of constituents.
//! [`MultiError`] keeps the constituents addressable until the wire boundary,
//! and [`merge_multierror_warnings`] reproduces the display format Nomad's
//! own clients expect.

use std::fmt;

/// An ordered collection of error messages that flattens to a single
/// newline-joined string at the wire boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiError {
    errors: Vec<String>,
}

impl MultiError {
    pub fn new(errors: Vec<String>) -> Self {
        Self { errors }
    }

    /// The individual error messages, in insertion order.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.errors.join("\n"))
    }
}

impl std::error::Error for MultiError {}

impl From<Vec<String>> for MultiError {
    fn from(errors: Vec<String>) -> Self {
        Self::new(errors)
    }
}

/// Serialize a warning list into Nomad's multi-warning display format.
///
/// A single warning is passed through as-is so that a lone local warning
/// reads naturally in client output. Two or more warnings are rendered as
/// the bullet list Nomad's CLI prints:
///
/// ```text
/// 2 warning(s):
///
/// * first warning
/// * second warning
/// ```
pub fn merge_multierror_warnings(warnings: &[String]) -> String {
    match warnings {
        [] => String::new(),
        [single] => single.clone(),
        many => {
            let mut out = format!("{} warning(s):\n", many.len());
            for warning in many {
                out.push_str("\n* ");
                out.push_str(warning);
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_error_display_joins_with_newlines() {
        let err = MultiError::new(vec!["first".to_string(), "second".to_string()]);
        assert_eq!(err.to_string(), "first\nsecond");
        assert_eq!(err.errors(), &["first", "second"]);
    }

    #[test]
    fn test_merge_empty() {
        assert_eq!(merge_multierror_warnings(&[]), "");
    }

    #[test]
    fn test_merge_single_warning_passes_through() {
        let merged = merge_multierror_warnings(&["w1".to_string()]);
        assert_eq!(merged, "w1");
    }

    #[test]
    fn test_merge_multiple_warnings_uses_bullet_list() {
        let merged = merge_multierror_warnings(&["existing".to_string(), "cpu low".to_string()]);
        assert_eq!(merged, "2 warning(s):\n\n* existing\n* cpu low");

        // Order is stable
        let existing = merged.find("existing").unwrap();
        let cpu = merged.find("cpu low").unwrap();
        assert!(existing < cpu);
    }
}
