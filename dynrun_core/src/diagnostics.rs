//! Structured compiler diagnostics.
//!
//! Every compile attempt yields an ordered list of [`Diagnostic`]s, whether it
//! succeeds or not. A compile is successful iff none of them has
//! [`Severity::Error`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Diagnostic codes emitted by the bundled frontend and the builder.
pub mod codes {
    pub const EMPTY_SOURCE: &str = "DR0001";
    pub const INVALID_CHARACTER: &str = "DR0002";
    pub const UNEXPECTED_TOKEN: &str = "DR0003";
    pub const INVALID_ENCODING: &str = "DR0004";
    pub const INTEGER_OVERFLOW: &str = "DR0005";
    pub const FEATURE_UNAVAILABLE: &str = "DR0006";
    pub const NESTING_TOO_DEEP: &str = "DR0007";

    pub const UNKNOWN_TYPE: &str = "DR0101";
    pub const UNKNOWN_MEMBER: &str = "DR0102";
    pub const UNKNOWN_NAME: &str = "DR0103";
    pub const TYPE_MISMATCH: &str = "DR0104";
    pub const ARGUMENT_COUNT: &str = "DR0105";
    pub const DUPLICATE_DEFINITION: &str = "DR0106";
    pub const MISSING_RETURN: &str = "DR0107";
    pub const AMBIGUOUS_TYPE: &str = "DR0108";
    pub const INVALID_ASSIGNMENT: &str = "DR0109";
    pub const ENTRY_POINT: &str = "DR0110";
    pub const STATIC_MISMATCH: &str = "DR0111";
    pub const INACCESSIBLE: &str = "DR0112";
    pub const INVALID_STATEMENT: &str = "DR0114";
    pub const STATIC_CONTEXT: &str = "DR0115";
    pub const UNINITIALIZED_FIELD: &str = "DR0116";

    pub const UNREACHABLE_CODE: &str = "DR0162";
    pub const UNUSED_VARIABLE: &str = "DR0168";

    pub const REFERENCE_NOT_FOUND: &str = "DR0201";
    pub const INVALID_REFERENCE: &str = "DR0202";
    pub const DUPLICATE_REFERENCE: &str = "DR0203";

    pub const ASSEMBLY_FAILED: &str = "DR0301";
}

/// How serious a diagnostic is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One-based position in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A structured compiler message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl Diagnostic {
    pub fn new(code: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity,
            message: message.into(),
            location: None,
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Error, message)
    }

    pub fn warning(code: &str, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Warning, message)
    }

    pub fn info(code: &str, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Info, message)
    }

    /// Attach a source location
    pub fn at(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location {
            Some(location) => write!(
                f,
                "{}[{}] {}: {}",
                self.severity, self.code, location, self.message
            ),
            None => write!(f, "{}[{}]: {}", self.severity, self.code, self.message),
        }
    }
}

/// Whether any diagnostic in the list is an error
pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_error)
}

/// Number of error diagnostics in the list
pub fn error_count(diagnostics: &[Diagnostic]) -> usize {
    diagnostics.iter().filter(|d| d.is_error()).count()
}

/// Number of warning diagnostics in the list, infos excluded
pub fn warning_count(diagnostics: &[Diagnostic]) -> usize {
    diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Warning)
        .count()
}

/// Promote every warning to an error (warnings-as-errors).
pub fn escalate_warnings(diagnostics: &mut [Diagnostic]) {
    for diagnostic in diagnostics
        .iter_mut()
        .filter(|d| d.severity == Severity::Warning)
    {
        diagnostic.severity = Severity::Error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_location() {
        let diagnostic =
            Diagnostic::error(codes::UNKNOWN_TYPE, "unknown type `Foo`").at(Location::new(3, 7));
        assert_eq!(
            diagnostic.to_string(),
            "error[DR0101] 3:7: unknown type `Foo`"
        );
    }

    #[test]
    fn test_escalate_warnings() {
        let mut diagnostics = vec![
            Diagnostic::warning(codes::UNUSED_VARIABLE, "unused"),
            Diagnostic::info(codes::DUPLICATE_REFERENCE, "note"),
        ];
        assert!(!has_errors(&diagnostics));
        assert_eq!(warning_count(&diagnostics), 1);

        escalate_warnings(&mut diagnostics);
        assert_eq!(warning_count(&diagnostics), 0);
        assert_eq!(error_count(&diagnostics), 1);
        assert_eq!(diagnostics[1].severity, Severity::Info);
    }

    #[test]
    fn test_severity_serialization() {
        let diagnostic = Diagnostic::warning(codes::UNREACHABLE_CODE, "unreachable code");
        let json = serde_json::to_string(&diagnostic).unwrap();
        assert!(json.contains("\"severity\":\"warning\""));
        assert!(!json.contains("location"));
    }
}
