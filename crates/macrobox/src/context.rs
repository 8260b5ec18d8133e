//! Execution contexts: the namespace a macro runs against.
//!
//! A context has two halves:
//!
//! - **run metadata**: cancellation token, disposable bag, run id, startup flag
//!   and script location. Always belongs to the current run.
//! - **user globals**: top-level variables defined by macro code. Fresh for
//!   every run, unless the macro is `persistent`, in which case the runner
//!   carries them over between runs. Data lives in [`Globals`] as JSON;
//!   closures, functions and other values only the engine understands live
//!   in [`NativeState`].

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::callback::CallContext;
use crate::dispose::DisposableBag;
use crate::execution::{ExecutionDescriptor, ExecutionId};
use crate::library::HostBindings;

/// User-defined top-level variables, by name.
pub type Globals = BTreeMap<String, serde_json::Value>;

/// A value with no JSON form, such as a closure. Only the engine that
/// produced it can interpret it.
pub type NativeValue = Arc<dyn Any + Send + Sync>;

/// Engine-owned user state carried next to [`Globals`].
#[derive(Clone, Default)]
pub struct NativeState {
    /// Top-level variables JSON cannot represent, by name.
    pub values: BTreeMap<String, NativeValue>,
    /// Functions the macro has defined, in the engine's own representation.
    pub functions: Option<NativeValue>,
}

impl NativeState {
    /// Whether there is nothing to carry over.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.functions.is_none()
    }
}

impl fmt::Debug for NativeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeState")
            .field("values", &self.values.keys().collect::<Vec<_>>())
            .field("has_functions", &self.functions.is_some())
            .finish()
    }
}

/// Per-run fields bound into a context.
#[derive(Debug, Clone)]
pub struct RunMetadata {
    /// Id of the run.
    pub run_id: ExecutionId,
    /// The run's cancellation token.
    pub cancellation: CancellationToken,
    /// Sink for cleanup registered during the run.
    pub disposables: DisposableBag,
    /// Whether this is a startup run.
    pub startup: bool,
    /// Location of the macro being run.
    pub script_path: Option<PathBuf>,
}

impl RunMetadata {
    /// Metadata for the run described by `descriptor`.
    #[must_use]
    pub fn for_descriptor(descriptor: &ExecutionDescriptor) -> Self {
        Self {
            run_id: descriptor.id().clone(),
            cancellation: descriptor.cancellation().clone(),
            disposables: descriptor.disposables().clone(),
            startup: descriptor.is_startup(),
            script_path: Some(descriptor.script().path().to_path_buf()),
        }
    }
}

/// The namespace bound into one isolated engine scope.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    metadata: RunMetadata,
    host: HostBindings,
    /// User-defined globals. Engines read these before running and write
    /// the resulting top-level variables back afterwards.
    pub globals: Globals,
    /// User state that has no JSON form, handled the same way as `globals`.
    pub native: NativeState,
}

impl ExecutionContext {
    /// Create a context with no user globals.
    #[must_use]
    pub fn new(host: HostBindings, metadata: RunMetadata) -> Self {
        Self {
            metadata,
            host,
            globals: Globals::new(),
            native: NativeState::default(),
        }
    }

    /// Bind `metadata` as the current run, keeping user globals.
    ///
    /// Calling this again on the same context only refreshes the per-run
    /// fields, which is how a shared context is handed to its next run.
    pub fn initialize(&mut self, metadata: RunMetadata) {
        self.metadata = metadata;
    }

    /// The current run's metadata.
    #[must_use]
    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    /// The current run's id.
    #[must_use]
    pub fn run_id(&self) -> &ExecutionId {
        &self.metadata.run_id
    }

    /// The current run's cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.metadata.cancellation
    }

    /// Location of the macro, if known.
    #[must_use]
    pub fn script_path(&self) -> Option<&Path> {
        self.metadata.script_path.as_deref()
    }

    /// Host callbacks, prelude and log sink.
    #[must_use]
    pub fn host(&self) -> &HostBindings {
        &self.host
    }

    /// Context handed to host callbacks invoked from this run.
    #[must_use]
    pub fn call_context(&self) -> CallContext {
        CallContext {
            run_id: self.metadata.run_id.clone(),
            cancellation: self.metadata.cancellation.clone(),
            disposables: self.metadata.disposables.clone(),
            script_path: self.metadata.script_path.clone(),
        }
    }

    /// Write a line to the run's log channel.
    pub fn log(&self, line: &str) {
        self.host.emit_output(&self.metadata.run_id, line);
    }
}
