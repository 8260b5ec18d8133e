//! The sandbox environment shared by every executor, and its builder.

use std::sync::Arc;
use std::time::Duration;

use crate::engine::{RhaiEngine, ScriptEngine};
use crate::library::{HostBindings, HostLibrary, OutputHandler};
use crate::manager::SandboxManager;
use crate::source::{FsScriptSource, ScriptSource};
use crate::transpile::{PassthroughTranspiler, Transpiler};

/// Engine, source, transpiler and host bindings used to run macros.
pub struct Sandbox {
    /// Evaluates runnable code.
    engine: Arc<dyn ScriptEngine>,
    /// Provides current macro text.
    source: Arc<dyn ScriptSource>,
    /// Turns macro text into runnable code.
    transpiler: Arc<dyn Transpiler>,
    /// Callbacks, prelude and output handler.
    host: HostBindings,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("engine", &self.engine.name())
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Create a sandbox builder.
    #[must_use]
    pub fn builder() -> SandboxBuilder {
        SandboxBuilder::new()
    }

    /// The script engine.
    #[must_use]
    pub fn engine(&self) -> &dyn ScriptEngine {
        self.engine.as_ref()
    }

    /// The script source.
    #[must_use]
    pub fn source(&self) -> &dyn ScriptSource {
        self.source.as_ref()
    }

    /// The transpiler.
    #[must_use]
    pub fn transpiler(&self) -> &dyn Transpiler {
        self.transpiler.as_ref()
    }

    /// Host bindings injected into every context.
    #[must_use]
    pub fn host(&self) -> &HostBindings {
        &self.host
    }
}

/// Builder for a [`Sandbox`] or a [`SandboxManager`] around one.
///
/// Defaults: [`RhaiEngine`], [`FsScriptSource`], [`PassthroughTranspiler`],
/// an empty [`HostLibrary`] and output logged through `tracing`.
#[derive(Default)]
pub struct SandboxBuilder {
    engine: Option<Arc<dyn ScriptEngine>>,
    source: Option<Arc<dyn ScriptSource>>,
    transpiler: Option<Arc<dyn Transpiler>>,
    library: HostLibrary,
    output_handler: Option<Arc<dyn OutputHandler>>,
}

impl std::fmt::Debug for SandboxBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxBuilder")
            .field("engine", &self.engine.as_ref().map(|e| e.name().to_string()))
            .field("has_source", &self.source.is_some())
            .field("has_transpiler", &self.transpiler.is_some())
            .field("library", &self.library)
            .field("has_output_handler", &self.output_handler.is_some())
            .finish()
    }
}

impl SandboxBuilder {
    /// Create a new builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different script engine.
    #[must_use]
    pub fn with_engine(mut self, engine: impl ScriptEngine + 'static) -> Self {
        self.engine = Some(Arc::new(engine));
        self
    }

    /// Read macros from a different source.
    #[must_use]
    pub fn with_source(mut self, source: impl ScriptSource + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Transpile macros before running them.
    #[must_use]
    pub fn with_transpiler(mut self, transpiler: impl Transpiler + 'static) -> Self {
        self.transpiler = Some(Arc::new(transpiler));
        self
    }

    /// Add a host library (callbacks + prelude). Libraries merge in order.
    #[must_use]
    pub fn with_library(mut self, library: HostLibrary) -> Self {
        self.library = std::mem::take(&mut self.library).merge(library);
        self
    }

    /// Receive lines logged by macros.
    #[must_use]
    pub fn with_output_handler<H: OutputHandler + 'static>(mut self, handler: H) -> Self {
        self.output_handler = Some(Arc::new(handler));
        self
    }

    /// Build the sandbox environment.
    #[must_use]
    pub fn build_sandbox(self) -> Sandbox {
        Sandbox {
            engine: self.engine.unwrap_or_else(|| Arc::new(RhaiEngine::new())),
            source: self.source.unwrap_or_else(|| Arc::new(FsScriptSource)),
            transpiler: self
                .transpiler
                .unwrap_or_else(|| Arc::new(PassthroughTranspiler)),
            host: HostBindings::new(self.library, self.output_handler),
        }
    }

    /// Build a manager around the sandbox environment.
    #[must_use]
    pub fn build(self) -> SandboxManager {
        SandboxManager::new(self.build_sandbox())
    }
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct ExecuteResult {
    /// Value of the macro's last expression, as JSON.
    pub value: serde_json::Value,
    /// Execution statistics.
    pub stats: ExecuteStats,
}

/// Statistics about one run.
#[derive(Debug, Clone)]
pub struct ExecuteStats {
    /// Time from the start of execution until the run ended, including any
    /// retained wait.
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_rhai() {
        let sandbox = Sandbox::builder().build_sandbox();
        assert_eq!(sandbox.engine().name(), "rhai");
        assert!(sandbox.host().callbacks().is_empty());
    }

    #[test]
    fn libraries_merge_in_order() {
        let sandbox = Sandbox::builder()
            .with_library(HostLibrary::new().with_prelude("fn a() { 1 }"))
            .with_library(HostLibrary::new().with_prelude("fn b() { 2 }"))
            .build_sandbox();
        assert_eq!(sandbox.host().prelude(), "fn a() { 1 }\n\nfn b() { 2 }");
    }
}
