//! Script engines that evaluate macro code against an [`ExecutionContext`].

mod rhai_engine;

use async_trait::async_trait;

use crate::context::ExecutionContext;
use crate::transpile::Diagnostic;

pub use rhai_engine::RhaiEngine;

/// Errors reported by a script engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// The code did not compile. Nothing was executed.
    #[error("compilation failed")]
    Compile(Vec<Diagnostic>),

    /// The code raised an error while running.
    #[error("{message}")]
    Runtime {
        /// Error message.
        message: String,
        /// Line the error was raised on, when known.
        line: Option<usize>,
    },
}

impl EngineError {
    /// A runtime error without position information.
    #[must_use]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
            line: None,
        }
    }
}

/// Evaluates runnable macro code.
///
/// Each call to [`run`](Self::run) must execute in an isolated namespace
/// seeded from `context.globals` and `context.native`. Top-level variables
/// and functions left behind by the code are written back to those fields,
/// whether or not the run succeeded.
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    /// Short engine name for logs.
    fn name(&self) -> &str;

    /// Check that `code` compiles without running it.
    ///
    /// # Errors
    ///
    /// Returns the compile diagnostics.
    fn check(&self, code: &str) -> Result<(), Vec<Diagnostic>> {
        let _ = code;
        Ok(())
    }

    /// Run `code` against `context`, returning the value of its last expression.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Compile`] if the code does not compile and
    /// [`EngineError::Runtime`] if it fails while running.
    async fn run(
        &self,
        code: &str,
        context: &mut ExecutionContext,
    ) -> Result<serde_json::Value, EngineError>;
}
