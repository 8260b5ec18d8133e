//! # Macrobox
//!
//! A sandboxed execution core for user-authored macros.
//!
//! Macrobox runs small scripts inside a host process and takes care of their
//! lifecycle:
//!
//! - **Isolated runs** - Every run gets its own namespace, cancellation token and cleanup bag
//! - **Directives** - `// @macro:persistent,retained,singleton` in the source selects the lifecycle
//! - **Shared state** - `persistent` macros carry their top-level variables from run to run
//! - **Concurrency control** - `singleton` macros reject overlapping runs
//! - **Deterministic cleanup** - Disposal runs exactly once per run, even when the macro fails
//! - **Host callbacks** - Embedders expose async functions to macro code
//!
//! Macros are written in [Rhai](https://rhai.rs) by default; other engines can
//! be plugged in through [`ScriptEngine`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use macrobox::{ExecuteParams, SandboxManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), macrobox::Error> {
//!     let manager = SandboxManager::builder().build();
//!
//!     let result = manager
//!         .run("macros/hello.rhai", ExecuteParams::default())
//!         .await?;
//!
//!     println!("Result: {}", result.value);
//!     Ok(())
//! }
//! ```

mod callback;
mod context;
mod dispose;
pub mod engine;
mod error;
mod events;
pub mod execution;
mod executor;
mod identity;
mod library;
mod manager;
mod merge;
mod options;
mod runner;
mod sandbox;
pub mod source;
mod transpile;

pub use callback::{CallContext, Callback, CallbackError};
pub use context::{ExecutionContext, Globals, NativeState, NativeValue, RunMetadata};
pub use dispose::{Disposable, DisposableBag, DisposeError};
pub use engine::{EngineError, RhaiEngine, ScriptEngine};
pub use error::Error;
pub use events::{EventEmitter, Subscription};
pub use execution::{
    ExecuteParams, ExecutionDescriptor, ExecutionId, ExecutionSnapshot, ExecutionToken,
    LanguageKind,
};
pub use executor::SandboxExecutor;
pub use identity::ScriptIdentity;
pub use library::{HostBindings, HostLibrary, OutputHandler};
pub use manager::SandboxManager;
pub use merge::{GlobalsDiff, NativeDiff};
pub use options::ExecutionOptions;
pub use runner::SandboxRunner;
pub use sandbox::{ExecuteResult, ExecuteStats, Sandbox, SandboxBuilder};
pub use source::{FsScriptSource, InMemoryScriptSource, ScriptDocument, ScriptSource};
pub use transpile::{Diagnostic, PassthroughTranspiler, Transpiler};
