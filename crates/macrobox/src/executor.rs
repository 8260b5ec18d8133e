//! Per-macro coordinator: singleton policy, live runs and start/end events.
//!
//! An executor is idle while it has no live descriptors and running while it
//! has at least one. Admission of a new run (the singleton check) and its
//! registration in the live set happen under one lock, so two requests for a
//! `singleton` macro can never both be admitted.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::context::Globals;
use crate::dispose::DisposeError;
use crate::error::Error;
use crate::events::{EventEmitter, Subscription};
use crate::execution::{
    ExecuteParams, ExecutionDescriptor, ExecutionId, ExecutionSnapshot, ExecutionToken,
};
use crate::identity::ScriptIdentity;
use crate::runner::SandboxRunner;
use crate::sandbox::{ExecuteResult, Sandbox};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct ExecutorState {
    live: BTreeMap<ExecutionId, Arc<ExecutionDescriptor>>,
    next_index: u64,
    next_startup: u32,
    cached: Option<Arc<ExecutionSnapshot>>,
    disposed: bool,
}

/// Coordinates every run of one macro.
pub struct SandboxExecutor {
    script: ScriptIdentity,
    sandbox: Arc<Sandbox>,
    runner: SandboxRunner,
    state: Mutex<ExecutorState>,
    on_start: EventEmitter<Arc<ExecutionDescriptor>>,
    on_end: EventEmitter<Arc<ExecutionDescriptor>>,
    /// Listeners that relay events to an owner, such as a manager. Released
    /// once the executor is disposed and its last live run has ended.
    relays: Mutex<Vec<Subscription>>,
}

impl std::fmt::Debug for SandboxExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("SandboxExecutor")
            .field("script", &self.script)
            .field("live", &state.live.keys().collect::<Vec<_>>())
            .field("disposed", &state.disposed)
            .finish_non_exhaustive()
    }
}

impl SandboxExecutor {
    /// Create an idle executor for `script`.
    #[must_use]
    pub fn new(script: ScriptIdentity, sandbox: Arc<Sandbox>) -> Self {
        Self {
            runner: SandboxRunner::new(script.clone(), sandbox.clone()),
            script,
            sandbox,
            state: Mutex::new(ExecutorState::default()),
            on_start: EventEmitter::new(),
            on_end: EventEmitter::new(),
            relays: Mutex::new(Vec::new()),
        }
    }

    /// The macro this executor runs.
    #[must_use]
    pub fn script(&self) -> &ScriptIdentity {
        &self.script
    }

    /// Capture the macro's current text and directives.
    ///
    /// The previous snapshot is reused while the source reports the same revision.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Source`] if the macro cannot be read.
    pub async fn snapshot(&self) -> Result<Arc<ExecutionSnapshot>, Error> {
        let source = self.sandbox.source();
        let revision = source
            .revision(&self.script)
            .await
            .map_err(|e| self.source_error(e))?;

        let cached = lock(&self.state).cached.clone();
        if let Some(cached) = cached.filter(|s| s.revision() == revision) {
            return Ok(cached);
        }

        let document = source
            .load(&self.script)
            .await
            .map_err(|e| self.source_error(e))?;
        let snapshot = Arc::new(ExecutionSnapshot::new(
            document.text,
            document.language,
            document.revision,
        ));
        lock(&self.state).cached = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Create a descriptor for a future run without starting it.
    ///
    /// The descriptor gets the next sequential index, or a startup token when
    /// `params.startup` is set. Run it with
    /// [`execute_descriptor`](Self::execute_descriptor).
    ///
    /// # Errors
    ///
    /// Returns an error if the macro cannot be read or the executor has been disposed.
    pub async fn create_descriptor(
        &self,
        params: ExecuteParams,
    ) -> Result<Arc<ExecutionDescriptor>, Error> {
        let snapshot = self.snapshot().await?;
        let mut state = lock(&self.state);
        self.ensure_not_disposed(&state)?;
        Ok(Arc::new(self.new_descriptor(&mut state, params, snapshot)))
    }

    /// Run the macro once.
    ///
    /// A rejected `singleton` request consumes no index and creates no descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SingletonConflict`] if the macro is `singleton` and
    /// already running, and otherwise whatever the run or its cleanup failed with.
    pub async fn execute(&self, params: ExecuteParams) -> Result<ExecuteResult, Error> {
        let snapshot = self.snapshot().await?;
        let descriptor = {
            let mut state = lock(&self.state);
            self.admit(&state, &snapshot)?;
            let descriptor = Arc::new(self.new_descriptor(&mut state, params, snapshot));
            descriptor.mark_started();
            state
                .live
                .insert(descriptor.id().clone(), descriptor.clone());
            descriptor
        };
        self.run_live(descriptor).await
    }

    /// Run a descriptor created by [`create_descriptor`](Self::create_descriptor).
    ///
    /// The singleton check uses the descriptor's own snapshot. A descriptor
    /// runs at most once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ForeignDescriptor`] if the descriptor was created for
    /// another macro, [`Error::DescriptorInUse`] if it is already live and
    /// [`Error::DescriptorFinished`] if it already ran or was disposed.
    /// Otherwise the same as [`execute`](Self::execute).
    pub async fn execute_descriptor(
        &self,
        descriptor: Arc<ExecutionDescriptor>,
    ) -> Result<ExecuteResult, Error> {
        {
            let mut state = lock(&self.state);
            self.ensure_not_disposed(&state)?;
            self.check_unstarted(&state, &descriptor)?;
            self.admit(&state, descriptor.snapshot())?;
            descriptor.mark_started();
            state
                .live
                .insert(descriptor.id().clone(), descriptor.clone());
        }
        self.run_live(descriptor).await
    }

    /// Request cancellation of one live run, or of all of them when `id` is `None`.
    ///
    /// Returns the descriptors that were asked to cancel. Cancellation is
    /// advisory: runs end when their code observes it.
    pub fn cancel(&self, id: Option<&ExecutionId>) -> Vec<Arc<ExecutionDescriptor>> {
        let targets: Vec<_> = {
            let state = lock(&self.state);
            match id {
                Some(id) => state.live.get(id).cloned().into_iter().collect(),
                None => state.live.values().cloned().collect(),
            }
        };
        for descriptor in &targets {
            tracing::debug!(run = %descriptor.id(), "cancellation requested");
            descriptor.cancel();
        }
        targets
    }

    /// Number of live runs.
    #[must_use]
    pub fn running_count(&self) -> usize {
        lock(&self.state).live.len()
    }

    /// Whether any run is live.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running_count() > 0
    }

    /// Live runs, ordered by id.
    #[must_use]
    pub fn descriptors(&self) -> Vec<Arc<ExecutionDescriptor>> {
        lock(&self.state).live.values().cloned().collect()
    }

    /// Look up a live run.
    #[must_use]
    pub fn descriptor(&self, id: &ExecutionId) -> Option<Arc<ExecutionDescriptor>> {
        lock(&self.state).live.get(id).cloned()
    }

    /// Fired after a run is added to the live set, before its code starts.
    #[must_use]
    pub fn on_execution_start(&self) -> &EventEmitter<Arc<ExecutionDescriptor>> {
        &self.on_start
    }

    /// Fired after a run is removed from the live set, before it is disposed.
    #[must_use]
    pub fn on_execution_end(&self) -> &EventEmitter<Arc<ExecutionDescriptor>> {
        &self.on_end
    }

    /// Keep `subscriptions` registered until the executor has been disposed
    /// and every run that was live at that point has ended.
    ///
    /// Used to relay this executor's events elsewhere without losing the end
    /// events of runs cancelled by [`dispose`](Self::dispose).
    pub fn relay_until_drained(&self, subscriptions: impl IntoIterator<Item = Subscription>) {
        lock(&self.relays).extend(subscriptions);
    }

    /// Drop the shared context of a `persistent` macro.
    pub fn reset_shared_context(&self) {
        self.runner.reset_shared_context();
    }

    /// A copy of the shared user globals, if the macro has a shared context.
    #[must_use]
    pub fn shared_globals(&self) -> Option<Globals> {
        self.runner.shared_globals()
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        lock(&self.state).disposed
    }

    /// Cancel every live run, drop the shared context and reject future runs.
    ///
    /// Live runs still clean up when their code returns.
    pub fn dispose(&self) {
        {
            let mut state = lock(&self.state);
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.cached = None;
        }
        let cancelled = self.cancel(None);
        self.runner.reset_shared_context();
        if !self.is_running() {
            self.release_relays();
        }
        tracing::debug!(script = %self.script, cancelled = cancelled.len(), "executor disposed");
    }

    fn release_relays(&self) {
        let relays = std::mem::take(&mut *lock(&self.relays));
        if !relays.is_empty() {
            tracing::trace!(script = %self.script, count = relays.len(), "releasing event relays");
        }
    }

    fn source_error(&self, source: std::io::Error) -> Error {
        tracing::error!(script = %self.script, error = %source, "failed to read macro");
        Error::Source {
            script: self.script.short_name(),
            source,
        }
    }

    fn ensure_not_disposed(&self, state: &ExecutorState) -> Result<(), Error> {
        if state.disposed {
            return Err(Error::ExecutorDisposed {
                script: self.script.short_name(),
            });
        }
        Ok(())
    }

    fn check_unstarted(
        &self,
        state: &ExecutorState,
        descriptor: &ExecutionDescriptor,
    ) -> Result<(), Error> {
        let id = descriptor.id().clone();
        if descriptor.script() != &self.script {
            return Err(Error::ForeignDescriptor {
                id,
                script: self.script.short_name(),
            });
        }
        if state.live.contains_key(&id) {
            return Err(Error::DescriptorInUse { id });
        }
        if descriptor.is_started() || descriptor.is_disposed() {
            return Err(Error::DescriptorFinished { id });
        }
        Ok(())
    }

    fn admit(&self, state: &ExecutorState, snapshot: &ExecutionSnapshot) -> Result<(), Error> {
        self.ensure_not_disposed(state)?;
        if snapshot.options().singleton && !state.live.is_empty() {
            tracing::warn!(
                script = %self.script,
                live = state.live.len(),
                "rejecting run of singleton macro that is already running"
            );
            return Err(Error::SingletonConflict {
                script: self.script.short_name(),
            });
        }
        Ok(())
    }

    fn new_descriptor(
        &self,
        state: &mut ExecutorState,
        params: ExecuteParams,
        snapshot: Arc<ExecutionSnapshot>,
    ) -> ExecutionDescriptor {
        let token = if params.startup {
            state.next_startup += 1;
            ExecutionToken::Startup(state.next_startup)
        } else {
            state.next_index += 1;
            ExecutionToken::Index(state.next_index)
        };
        let id = ExecutionId::new(self.script.short_name(), token);
        tracing::debug!(run = %id, revision = snapshot.revision(), "descriptor created");
        ExecutionDescriptor::new(id, self.script.clone(), snapshot)
    }

    /// Drive a descriptor that is already in the live set.
    async fn run_live(&self, descriptor: Arc<ExecutionDescriptor>) -> Result<ExecuteResult, Error> {
        let live = LiveRun {
            executor: self,
            descriptor: descriptor.clone(),
            released: false,
        };

        tracing::info!(run = %descriptor.id(), script = %self.script, "macro run started");
        self.on_start.emit(&descriptor);

        let result = self.runner.execute(&descriptor).await;
        let disposal = live.release();

        match (result, disposal) {
            (Ok(result), Ok(())) => {
                tracing::info!(
                    run = %descriptor.id(),
                    duration = ?result.stats.duration,
                    "macro run finished"
                );
                Ok(result)
            }
            (Ok(_), Err(dispose)) => {
                tracing::error!(
                    run = %descriptor.id(),
                    script = %self.script,
                    error = %dispose,
                    "macro cleanup failed"
                );
                Err(Error::Dispose(dispose))
            }
            (Err(error), disposal) => {
                if let Err(dispose) = disposal {
                    tracing::warn!(
                        run = %descriptor.id(),
                        error = %dispose,
                        "macro cleanup failed after the run itself failed"
                    );
                }
                tracing::error!(
                    run = %descriptor.id(),
                    script = %self.script,
                    error = %error,
                    "macro run failed"
                );
                Err(error)
            }
        }
    }

    /// Remove a run from the live set, announce its end and dispose it.
    fn finish(&self, descriptor: &Arc<ExecutionDescriptor>) -> Result<(), DisposeError> {
        let (removed, drained) = {
            let mut state = lock(&self.state);
            let removed = state.live.remove(descriptor.id()).is_some();
            (removed, state.disposed && state.live.is_empty())
        };
        if removed {
            self.on_end.emit(descriptor);
        }
        if drained {
            self.release_relays();
        }
        descriptor.dispose()
    }
}

/// Releases a live run exactly once, including when its future is dropped mid-run.
struct LiveRun<'a> {
    executor: &'a SandboxExecutor,
    descriptor: Arc<ExecutionDescriptor>,
    released: bool,
}

impl LiveRun<'_> {
    fn release(mut self) -> Result<(), DisposeError> {
        self.released = true;
        self.executor.finish(&self.descriptor)
    }
}

impl Drop for LiveRun<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.executor.finish(&self.descriptor) {
            tracing::warn!(run = %self.descriptor.id(), error = %e, "cleanup of abandoned run failed");
        }
    }
}
