//! The live record of one run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;

use crate::dispose::{DisposableBag, DisposeError};
use crate::identity::ScriptIdentity;

use super::{ExecutionId, ExecutionSnapshot};

/// Resources owned by exactly one run attempt.
///
/// Shared as `Arc<ExecutionDescriptor>` between the executor's live set,
/// the runner and event listeners.
#[derive(Debug)]
pub struct ExecutionDescriptor {
    id: ExecutionId,
    script: ScriptIdentity,
    snapshot: Arc<ExecutionSnapshot>,
    cancellation: CancellationToken,
    disposables: DisposableBag,
    created_at: SystemTime,
    started_at: Mutex<SystemTime>,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl ExecutionDescriptor {
    /// Create a descriptor with a fresh cancellation token and an empty disposable bag.
    #[must_use]
    pub fn new(id: ExecutionId, script: ScriptIdentity, snapshot: Arc<ExecutionSnapshot>) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            script,
            snapshot,
            cancellation: CancellationToken::new(),
            disposables: DisposableBag::new(),
            created_at: now,
            started_at: Mutex::new(now),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// The run's id.
    #[must_use]
    pub fn id(&self) -> &ExecutionId {
        &self.id
    }

    /// The script this run belongs to.
    #[must_use]
    pub fn script(&self) -> &ScriptIdentity {
        &self.script
    }

    /// The source captured for this run.
    #[must_use]
    pub fn snapshot(&self) -> &Arc<ExecutionSnapshot> {
        &self.snapshot
    }

    /// Whether this is a startup run.
    #[must_use]
    pub fn is_startup(&self) -> bool {
        self.id.is_startup()
    }

    /// The run's cancellation token. Cancellation is advisory.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Request cancellation of this run.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Cleanup registered for this run.
    #[must_use]
    pub fn disposables(&self) -> &DisposableBag {
        &self.disposables
    }

    /// When the descriptor was created.
    #[must_use]
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// When the macro actually started executing.
    #[must_use]
    pub fn started_at(&self) -> SystemTime {
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stamp the start time. Called right before the macro code begins running.
    pub fn refresh_started_on(&self) {
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = SystemTime::now();
    }

    /// Whether an executor has admitted this descriptor. A descriptor runs at most once.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// Whether [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Cancel the token and release every registered disposable.
    ///
    /// Only the first call does anything.
    ///
    /// # Errors
    ///
    /// Returns an aggregate of every disposable that failed.
    pub fn dispose(&self) -> Result<(), DisposeError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancellation.cancel();
        self.disposables.dispose_all()
    }
}
