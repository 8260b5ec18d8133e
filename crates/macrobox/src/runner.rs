//! Drives one concrete execution of a macro.
//!
//! The runner builds the context a run executes against, hands the code to
//! the engine and applies the `retained` keep-alive policy. It also owns the
//! macro's shared context: the user globals that `persistent` runs carry over
//! from one run to the next.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::context::{ExecutionContext, Globals, RunMetadata};
use crate::engine::EngineError;
use crate::error::Error;
use crate::execution::ExecutionDescriptor;
use crate::identity::ScriptIdentity;
use crate::merge::{GlobalsDiff, NativeDiff};
use crate::sandbox::{ExecuteResult, ExecuteStats, Sandbox};

type SharedContext = Arc<Mutex<ExecutionContext>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Executes descriptors of one macro.
pub struct SandboxRunner {
    script: ScriptIdentity,
    sandbox: Arc<Sandbox>,
    /// Present only while the macro runs with `persistent`.
    shared: Mutex<Option<SharedContext>>,
}

impl std::fmt::Debug for SandboxRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRunner")
            .field("script", &self.script)
            .field("has_shared_context", &self.has_shared_context())
            .finish_non_exhaustive()
    }
}

impl SandboxRunner {
    /// Create a runner for `script`.
    #[must_use]
    pub fn new(script: ScriptIdentity, sandbox: Arc<Sandbox>) -> Self {
        Self {
            script,
            sandbox,
            shared: Mutex::new(None),
        }
    }

    /// Run the descriptor's snapshot to completion.
    ///
    /// For `retained` macros this only returns once the descriptor has been
    /// cancelled, even if the body finished long before.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Compilation`] if the snapshot cannot be transpiled or
    /// compiled and [`Error::Script`] if the macro raised an error.
    pub async fn execute(&self, descriptor: &ExecutionDescriptor) -> Result<ExecuteResult, Error> {
        let snapshot = descriptor.snapshot();
        let options = snapshot.options();
        let code = self
            .sandbox
            .transpiler()
            .transpile(snapshot.source(), snapshot.language(), Some(self.script.path()))
            .map_err(|diagnostics| Error::Compilation {
                script: self.script.short_name(),
                diagnostics,
            })?;

        let metadata = RunMetadata::for_descriptor(descriptor);
        descriptor.refresh_started_on();
        let start = Instant::now();

        let result = if options.persistent {
            self.run_shared(&code, metadata).await
        } else {
            self.run_isolated(&code, metadata).await
        };
        let value = result.map_err(|e| self.engine_error(descriptor, e))?;

        if options.retained {
            tracing::debug!(run = %descriptor.id(), "retained macro waiting for cancellation");
            descriptor.cancellation().cancelled().await;
        }

        Ok(ExecuteResult {
            value,
            stats: ExecuteStats {
                duration: start.elapsed(),
            },
        })
    }

    /// Drop the shared context so the next persistent run starts fresh.
    pub fn reset_shared_context(&self) {
        if lock(&self.shared).take().is_some() {
            tracing::debug!(script = %self.script, "shared context reset");
        }
    }

    /// Whether a shared context currently exists.
    #[must_use]
    pub fn has_shared_context(&self) -> bool {
        lock(&self.shared).is_some()
    }

    /// A copy of the shared user globals, if a shared context exists.
    #[must_use]
    pub fn shared_globals(&self) -> Option<Globals> {
        let shared = lock(&self.shared).clone()?;
        let globals = lock(&shared).globals.clone();
        Some(globals)
    }

    async fn run_isolated(
        &self,
        code: &str,
        metadata: RunMetadata,
    ) -> Result<serde_json::Value, EngineError> {
        if lock(&self.shared).take().is_some() {
            tracing::debug!(script = %self.script, "macro is no longer persistent, dropping shared context");
        }
        let mut context = ExecutionContext::new(self.sandbox.host().clone(), metadata);
        self.sandbox.engine().run(code, &mut context).await
    }

    async fn run_shared(
        &self,
        code: &str,
        metadata: RunMetadata,
    ) -> Result<serde_json::Value, EngineError> {
        let shared = self.obtain_shared(metadata);

        // Run against a copy; only this run's changes are written back.
        let mut scoped = lock(&shared).clone();
        let before = scoped.globals.clone();
        let native_before = scoped.native.clone();
        let result = self.sandbox.engine().run(code, &mut scoped).await;

        let diff = GlobalsDiff::between(&before, &scoped.globals);
        let native = NativeDiff::between(&native_before, &scoped.native);
        if !diff.is_empty() || !native.is_empty() {
            tracing::trace!(
                script = %self.script,
                changed = diff.changed.len(),
                removed = diff.removed.len(),
                native = ?native,
                "merging globals into shared context"
            );
            let mut shared = lock(&shared);
            diff.apply(&mut shared.globals);
            native.apply(&mut shared.native);
        }
        result
    }

    /// Return the shared context bound to `metadata`, creating it if needed.
    fn obtain_shared(&self, metadata: RunMetadata) -> SharedContext {
        let mut slot = lock(&self.shared);
        if let Some(shared) = slot.as_ref() {
            lock(shared).initialize(metadata);
            return shared.clone();
        }
        tracing::debug!(script = %self.script, "creating shared context");
        let shared = Arc::new(Mutex::new(ExecutionContext::new(
            self.sandbox.host().clone(),
            metadata,
        )));
        *slot = Some(shared.clone());
        shared
    }

    fn engine_error(&self, descriptor: &ExecutionDescriptor, error: EngineError) -> Error {
        match error {
            EngineError::Compile(diagnostics) => Error::Compilation {
                script: self.script.short_name(),
                diagnostics,
            },
            EngineError::Runtime { message, line } => Error::Script {
                id: descriptor.id().clone(),
                message,
                line,
            },
        }
    }
}
