//! Callback trait and error types for host-provided functions.
//!
//! Macro code calls callbacks as plain functions (e.g. `notify(#{ text: "hi" })`).
//! The host provides them by implementing the [`Callback`] trait. Each
//! invocation receives a [`CallContext`] describing the run that made the call.

use std::path::PathBuf;
use std::{future::Future, pin::Pin};

use tokio_util::sync::CancellationToken;

use crate::dispose::DisposableBag;
use crate::execution::ExecutionId;

/// The run a callback is invoked from.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Id of the calling run.
    pub run_id: ExecutionId,
    /// Cancellation token of the calling run.
    pub cancellation: CancellationToken,
    /// Disposable bag of the calling run. Register cleanup for anything the
    /// callback creates that should not outlive the run.
    pub disposables: DisposableBag,
    /// Location of the calling macro, if known.
    pub script_path: Option<PathBuf>,
}

/// A callback that macro code can invoke.
///
/// # Example
///
/// ```rust,ignore
/// use macrobox::{CallContext, Callback, CallbackError};
/// use serde_json::{json, Value};
/// use std::future::Future;
/// use std::pin::Pin;
///
/// struct StatusBar;
///
/// impl Callback for StatusBar {
///     fn name(&self) -> &str {
///         "set_status"
///     }
///
///     fn description(&self) -> &str {
///         "Shows a message until the run ends"
///     }
///
///     fn invoke(
///         &self,
///         call: CallContext,
///         args: Value,
///     ) -> Pin<Box<dyn Future<Output = Result<Value, CallbackError>> + Send + '_>> {
///         Box::pin(async move {
///             show(args.as_str().unwrap_or_default());
///             call.disposables
///                 .push(|| -> anyhow::Result<()> { hide(); Ok(()) })
///                 .map_err(|e| CallbackError::ExecutionFailed(e.to_string()))?;
///             Ok(json!(null))
///         })
///     }
/// }
/// ```
pub trait Callback: Send + Sync {
    /// Unique name for this callback (e.g. "set_status").
    ///
    /// This name becomes a function in the macro's namespace, so it must be a
    /// valid identifier for the engine.
    fn name(&self) -> &str;

    /// Human-readable description of what this callback does.
    ///
    /// Macros can list every callback with its description through
    /// `host_functions()`.
    fn description(&self) -> &str;

    /// Execute the callback.
    ///
    /// `args` is the single argument passed by the macro converted to JSON,
    /// or `null` when the callback was called without arguments.
    fn invoke(
        &self,
        call: CallContext,
        args: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, CallbackError>> + Send + '_>>;
}

/// Errors that can occur during callback execution.
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    /// The provided arguments are not what the callback expects.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The callback execution failed.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The calling run was cancelled before the callback finished.
    ///
    /// Returning this stops the run the same way cancellation does.
    #[error("cancelled")]
    Cancelled,
}
