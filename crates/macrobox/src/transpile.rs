//! Source transpilation: turning macro text into runnable engine code.
//!
//! Transpilation is a collaborator of the execution core. The core only needs
//! "text in, runnable text or diagnostics out"; a failure is reported before
//! any macro code runs.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::execution::LanguageKind;

/// A positioned message produced while transpiling or compiling a macro.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// 1-based line number.
    pub line: usize,
    /// 1-based column number.
    pub column: usize,
    /// Human-readable message.
    pub message: String,
    /// Whether more input could resolve the problem (e.g. unexpected end of input).
    #[serde(default)]
    pub recoverable: bool,
}

impl Diagnostic {
    /// Create a non-recoverable diagnostic.
    #[must_use]
    pub fn new(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
            recoverable: false,
        }
    }

    /// Mark this diagnostic as recoverable.
    #[must_use]
    pub fn recoverable(mut self) -> Self {
        self.recoverable = true;
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

/// Compiles macro source text into text the script engine can run.
pub trait Transpiler: Send + Sync {
    /// Transpile `source`.
    ///
    /// `location` is a hint for diagnostics and module resolution.
    ///
    /// # Errors
    ///
    /// Returns the diagnostics describing why the source cannot be run.
    fn transpile(
        &self,
        source: &str,
        language: &LanguageKind,
        location: Option<&Path>,
    ) -> Result<String, Vec<Diagnostic>>;
}

/// A transpiler that hands the source to the engine unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughTranspiler;

impl Transpiler for PassthroughTranspiler {
    fn transpile(
        &self,
        source: &str,
        _language: &LanguageKind,
        _location: Option<&Path>,
    ) -> Result<String, Vec<Diagnostic>> {
        Ok(source.to_string())
    }
}
