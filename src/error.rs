//! The shared error taxonomy that crosses module boundaries (spec §7).
//!
//! Component-specific errors (`AnalysisError`, `FingerprintError`,
//! `CacheError`, `RunnerError`) live next to the component that raises them;
//! this module holds the outcomes the Executor itself needs to reason about
//! once a script finishes: runtime execution failures, control-flow outcomes
//! that are deliberately suppressed from user-facing logs, and a catch-all
//! internal error for conditions that should never happen.

use thiserror::Error;

/// A runtime failure from actually trying to run a script (as opposed to a
/// configuration problem caught at analysis time).
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ExecutionFailure {
    #[error("process exited with status {0}")]
    ExitNonZero(i32),
    #[error("process terminated by signal {0}")]
    ExitSignal(i32),
    #[error("failed to spawn process: {0}")]
    SpawnError(String),
    #[error("process was killed")]
    Killed,
    #[error("service exited unexpectedly")]
    ServiceExitedUnexpectedly,
    #[error("input file(s) deleted unexpectedly: {0:?}")]
    InputFileDeletedUnexpectedly(Vec<String>),
    #[error("output file(s) deleted unexpectedly: {0:?}")]
    OutputFileDeletedUnexpectedly(Vec<String>),
}

/// An outcome that is downstream of some other reported failure. These are
/// never logged on their own (spec §7): the failure that caused them already
/// was, or will be.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Error)]
pub enum ControlFlowOutcome {
    #[error("start cancelled")]
    StartCancelled,
    #[error("aborted")]
    Aborted,
    #[error("a dependency service exited unexpectedly")]
    DependencyServiceExitedUnexpectedly,
}

/// Everything that can end a script's execution other than success.
#[derive(Debug, Error)]
pub enum ScriptFailure {
    #[error(transparent)]
    Execution(#[from] ExecutionFailure),
    #[error(transparent)]
    ControlFlow(#[from] ControlFlowOutcome),
    /// An unhandled condition that should never occur; carries a backtrace
    /// for bug reports rather than being silently swallowed.
    #[error("internal error: {message}")]
    Internal { message: String, backtrace: String },
}

impl ScriptFailure {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            backtrace: std::backtrace::Backtrace::force_capture().to_string(),
        }
    }

    /// Control-flow outcomes are suppressed from user-facing logs; only a
    /// genuine execution or internal failure should be reported.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, ScriptFailure::ControlFlow(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_flow_outcomes_are_not_reportable() {
        let failure = ScriptFailure::from(ControlFlowOutcome::StartCancelled);
        assert!(!failure.is_reportable());
    }

    #[test]
    fn execution_failures_are_reportable() {
        let failure = ScriptFailure::from(ExecutionFailure::ExitNonZero(1));
        assert!(failure.is_reportable());
    }
}
