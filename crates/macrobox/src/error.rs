//! Error types for macro execution.

use std::fmt;

use crate::dispose::DisposeError;
use crate::execution::ExecutionId;
use crate::transpile::Diagnostic;

/// Errors returned by the execution core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A run was requested for a `singleton` macro that is already running.
    #[error("macro '{script}' is already running")]
    SingletonConflict {
        /// Display name of the macro.
        script: String,
    },

    /// The macro could not be transpiled or compiled. No code was executed.
    #[error("failed to compile macro '{script}': {}", DiagnosticList(.diagnostics))]
    Compilation {
        /// Display name of the macro.
        script: String,
        /// Positions and messages reported by the transpiler or engine.
        diagnostics: Vec<Diagnostic>,
    },

    /// The macro itself raised an error while running.
    #[error("macro run {id} failed: {message}")]
    Script {
        /// The run that failed.
        id: ExecutionId,
        /// Error message reported by the engine.
        message: String,
        /// Line the error was raised on, when the engine knows it.
        line: Option<usize>,
    },

    /// One or more disposables failed while a run was being cleaned up.
    #[error(transparent)]
    Dispose(#[from] DisposeError),

    /// The macro source could not be read.
    #[error("failed to read macro '{script}': {source}")]
    Source {
        /// Display name of the macro.
        script: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The descriptor is already live in its executor.
    #[error("run {id} is already running")]
    DescriptorInUse {
        /// The run that was requested again.
        id: ExecutionId,
    },

    /// The descriptor has already run, or was disposed before it could.
    #[error("run {id} has already finished and cannot be started again")]
    DescriptorFinished {
        /// The run that was requested again.
        id: ExecutionId,
    },

    /// The descriptor was created for a different macro.
    #[error("run {id} belongs to a different macro than '{script}'")]
    ForeignDescriptor {
        /// The rejected run.
        id: ExecutionId,
        /// Display name of the macro whose executor rejected it.
        script: String,
    },

    /// The executor for this macro has been removed from its manager.
    #[error("executor for macro '{script}' has been disposed")]
    ExecutorDisposed {
        /// Display name of the macro.
        script: String,
    },
}

impl Error {
    /// Returns `true` if this error is a compile failure that more input could fix.
    ///
    /// REPL-style callers use this to keep reading lines instead of reporting
    /// the failure, e.g. after an unclosed block.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Compilation { diagnostics, .. } => {
                !diagnostics.is_empty() && diagnostics.iter().all(|d| d.recoverable)
            }
            _ => false,
        }
    }
}

struct DiagnosticList<'a>(&'a [Diagnostic]);

impl fmt::Display for DiagnosticList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, diagnostic) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{diagnostic}")?;
        }
        Ok(())
    }
}
