//! Structured diagnostics: the core commits only to this shape. Formatting
//! them for a terminal is a driver concern (spec: "terminal loggers and
//! diagnostic formatting" are out of scope).

use std::ops::Range;

use serde::Serialize;

use crate::path::AbsFilePath;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// A single structured diagnostic: a file, an optional byte range within it,
/// a severity, and a message. `logged` tracks whether a terminal driver has
/// already shown this diagnostic, so control-flow outcomes downstream of a
/// reported failure aren't shown twice (spec §7).
#[derive(Clone, Debug, Serialize)]
pub struct Diagnostic {
    pub file: Option<AbsFilePath>,
    pub range: Option<Range<usize>>,
    pub severity: Severity,
    pub message: String,
    #[serde(skip)]
    logged: bool,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            file: None,
            range: None,
            severity: Severity::Error,
            message: message.into(),
            logged: false,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            file: None,
            range: None,
            severity: Severity::Warning,
            message: message.into(),
            logged: false,
        }
    }

    pub fn with_file(mut self, file: AbsFilePath) -> Self {
        self.file = Some(file);
        self
    }

    pub fn with_range(mut self, range: Range<usize>) -> Self {
        self.range = Some(range);
        self
    }

    /// Mark this diagnostic as logged, returning whether it already was.
    pub fn mark_logged(&mut self) -> bool {
        std::mem::replace(&mut self.logged, true)
    }

    pub fn is_logged(&self) -> bool {
        self.logged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_logged_is_idempotent_and_reports_prior_state() {
        let mut d = Diagnostic::error("boom");
        assert!(!d.mark_logged());
        assert!(d.mark_logged());
        assert!(d.is_logged());
    }
}
