//! Top-level registry of executors, one per macro.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::Error;
use crate::events::EventEmitter;
use crate::execution::{ExecuteParams, ExecutionDescriptor, ExecutionId};
use crate::executor::SandboxExecutor;
use crate::identity::ScriptIdentity;
use crate::sandbox::{ExecuteResult, Sandbox, SandboxBuilder};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves macros to their executors, creating them lazily.
///
/// Start and end events of every executor are re-emitted on the manager's
/// own emitters, so observers only need to subscribe once. A removed
/// executor keeps relaying until its cancelled runs have ended, so every
/// start seen on the manager is followed by an end.
///
/// # Example
///
/// ```rust,no_run
/// use macrobox::{ExecuteParams, SandboxManager};
///
/// # async fn example() -> Result<(), macrobox::Error> {
/// let manager = SandboxManager::builder().build();
/// let result = manager
///     .run("/home/me/macros/hello.rhai", ExecuteParams::default())
///     .await?;
/// println!("{}", result.value);
/// # Ok(())
/// # }
/// ```
pub struct SandboxManager {
    sandbox: Arc<Sandbox>,
    executors: Mutex<HashMap<ScriptIdentity, Arc<SandboxExecutor>>>,
    on_start: EventEmitter<Arc<ExecutionDescriptor>>,
    on_end: EventEmitter<Arc<ExecutionDescriptor>>,
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let executors = lock(&self.executors);
        f.debug_struct("SandboxManager")
            .field("sandbox", &self.sandbox)
            .field("executors", &executors.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl SandboxManager {
    /// Create a manager builder.
    #[must_use]
    pub fn builder() -> SandboxBuilder {
        SandboxBuilder::new()
    }

    /// Create a manager around an existing sandbox environment.
    #[must_use]
    pub fn new(sandbox: Sandbox) -> Self {
        Self {
            sandbox: Arc::new(sandbox),
            executors: Mutex::new(HashMap::new()),
            on_start: EventEmitter::new(),
            on_end: EventEmitter::new(),
        }
    }

    /// The sandbox environment shared by every executor.
    #[must_use]
    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    /// The executor for `script`, created on first use.
    pub fn ensure_executor(&self, script: impl Into<ScriptIdentity>) -> Arc<SandboxExecutor> {
        let script = script.into();
        let mut executors = lock(&self.executors);
        if let Some(executor) = executors.get(&script) {
            return executor.clone();
        }

        tracing::debug!(script = %script, "creating executor");
        let executor = Arc::new(SandboxExecutor::new(script.clone(), self.sandbox.clone()));
        let on_start = self.on_start.clone();
        let on_end = self.on_end.clone();
        executor.relay_until_drained([
            executor
                .on_execution_start()
                .subscribe(move |descriptor| on_start.emit(descriptor)),
            executor
                .on_execution_end()
                .subscribe(move |descriptor| on_end.emit(descriptor)),
        ]);
        executors.insert(script, executor.clone());
        executor
    }

    /// The executor for `script`, if one exists.
    #[must_use]
    pub fn executor(&self, script: impl Into<ScriptIdentity>) -> Option<Arc<SandboxExecutor>> {
        lock(&self.executors).get(&script.into()).cloned()
    }

    /// Every executor created so far.
    #[must_use]
    pub fn executors(&self) -> Vec<Arc<SandboxExecutor>> {
        lock(&self.executors).values().cloned().collect()
    }

    /// Remove and dispose the executor for `script`.
    ///
    /// Live runs are cancelled. Their end events still reach the manager's
    /// emitters when they finish.
    pub fn remove_executor(&self, script: impl Into<ScriptIdentity>) -> Option<Arc<SandboxExecutor>> {
        let executor = lock(&self.executors).remove(&script.into())?;
        executor.dispose();
        Some(executor)
    }

    /// Request cancellation of every live run of `script`.
    ///
    /// Returns nothing if the macro has never been run.
    pub fn cancel(&self, script: impl Into<ScriptIdentity>) -> Vec<Arc<ExecutionDescriptor>> {
        self.executor(script)
            .map(|executor| executor.cancel(None))
            .unwrap_or_default()
    }

    /// Live runs across every macro.
    #[must_use]
    pub fn descriptors(&self) -> Vec<Arc<ExecutionDescriptor>> {
        self.executors()
            .iter()
            .flat_map(|executor| executor.descriptors())
            .collect()
    }

    /// Find a live run by id, whichever macro it belongs to.
    #[must_use]
    pub fn find_descriptor(&self, id: &ExecutionId) -> Option<Arc<ExecutionDescriptor>> {
        self.executors()
            .iter()
            .find_map(|executor| executor.descriptor(id))
    }

    /// Number of live runs across every macro.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.executors()
            .iter()
            .map(|executor| executor.running_count())
            .sum()
    }

    /// Run `script` once through its executor.
    ///
    /// # Errors
    ///
    /// See [`SandboxExecutor::execute`].
    pub async fn run(
        &self,
        script: impl Into<ScriptIdentity>,
        params: ExecuteParams,
    ) -> Result<ExecuteResult, Error> {
        let executor = self.ensure_executor(script);
        executor.execute(params).await
    }

    /// Remove and dispose every executor.
    ///
    /// Runs still in flight are cancelled and finish on their own.
    pub fn shutdown(&self) {
        let executors: Vec<_> = lock(&self.executors).drain().map(|(_, e)| e).collect();
        let live: usize = executors.iter().map(|e| e.running_count()).sum();
        tracing::info!(executors = executors.len(), live, "shutting down sandbox manager");
        for executor in executors {
            executor.dispose();
        }
    }

    /// Fired when any macro run starts.
    #[must_use]
    pub fn on_execution_start(&self) -> &EventEmitter<Arc<ExecutionDescriptor>> {
        &self.on_start
    }

    /// Fired when any macro run ends.
    #[must_use]
    pub fn on_execution_end(&self) -> &EventEmitter<Arc<ExecutionDescriptor>> {
        &self.on_end
    }
}
