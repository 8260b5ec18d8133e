//! Host library: callbacks plus a prelude of shared macro functions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::callback::Callback;
use crate::execution::ExecutionId;

/// A composable set of callbacks with a script prelude.
///
/// Host libraries bundle together:
/// - Callbacks that macro code can invoke
/// - Prelude source whose function definitions every macro can call
#[derive(Default)]
pub struct HostLibrary {
    /// Callbacks provided by this library.
    pub callbacks: Vec<Box<dyn Callback>>,

    /// Script source providing helper functions. Only function definitions
    /// are used; top-level statements in the prelude never run.
    pub prelude: String,
}

impl HostLibrary {
    /// Create a new empty host library.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a callback to this library.
    #[must_use]
    pub fn with_callback<C: Callback + 'static>(mut self, callback: C) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    /// Add multiple callbacks to this library.
    #[must_use]
    pub fn with_callbacks(mut self, callbacks: Vec<Box<dyn Callback>>) -> Self {
        self.callbacks.extend(callbacks);
        self
    }

    /// Set the prelude source.
    #[must_use]
    pub fn with_prelude(mut self, prelude: impl Into<String>) -> Self {
        self.prelude = prelude.into();
        self
    }

    /// Merge another library into this one.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        self.callbacks.extend(other.callbacks);

        if !other.prelude.is_empty() {
            if !self.prelude.is_empty() {
                self.prelude.push_str("\n\n");
            }
            self.prelude.push_str(&other.prelude);
        }

        self
    }
}

impl fmt::Debug for HostLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostLibrary")
            .field(
                "callbacks",
                &format!("[{} callbacks]", self.callbacks.len()),
            )
            .field("prelude", &self.prelude)
            .finish()
    }
}

/// Receives lines logged by macros.
pub trait OutputHandler: Send + Sync {
    /// Called for each line a run logs.
    fn on_output(&self, run: &ExecutionId, line: &str);
}

/// The resolved host surface shared by every run: callbacks by name, the
/// prelude and the log sink.
#[derive(Clone, Default)]
pub struct HostBindings {
    callbacks: Arc<HashMap<String, Arc<dyn Callback>>>,
    prelude: Arc<str>,
    output: Option<Arc<dyn OutputHandler>>,
}

impl fmt::Debug for HostBindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBindings")
            .field(
                "callbacks",
                &format!("[{} callbacks]", self.callbacks.len()),
            )
            .field("prelude_len", &self.prelude.len())
            .field("has_output_handler", &self.output.is_some())
            .finish()
    }
}

impl HostBindings {
    /// Resolve a library. Later callbacks replace earlier ones with the same name.
    #[must_use]
    pub fn new(library: HostLibrary, output: Option<Arc<dyn OutputHandler>>) -> Self {
        let callbacks: HashMap<String, Arc<dyn Callback>> = library
            .callbacks
            .into_iter()
            .map(|callback| (callback.name().to_string(), Arc::from(callback)))
            .collect();
        Self {
            callbacks: Arc::new(callbacks),
            prelude: library.prelude.into(),
            output,
        }
    }

    /// Registered callbacks by name.
    #[must_use]
    pub fn callbacks(&self) -> &HashMap<String, Arc<dyn Callback>> {
        &self.callbacks
    }

    /// The prelude source.
    #[must_use]
    pub fn prelude(&self) -> &str {
        &self.prelude
    }

    /// Deliver a logged line to the output handler, or to `tracing` when there is none.
    pub fn emit_output(&self, run: &ExecutionId, line: &str) {
        match &self.output {
            Some(handler) => handler.on_output(run, line),
            None => tracing::info!(target: "macrobox::script", run = %run, "{line}"),
        }
    }
}
