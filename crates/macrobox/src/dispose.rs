//! Disposables: cleanup registered during a run and released when it ends.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Something that must be released when a run ends.
///
/// Closures returning `anyhow::Result<()>` implement this directly.
pub trait Disposable: Send {
    /// Release the resource.
    ///
    /// # Errors
    ///
    /// Returns an error if cleanup failed. Failures are collected, not fatal:
    /// every other disposable in the bag still runs.
    fn dispose(self: Box<Self>) -> anyhow::Result<()>;
}

impl<F> Disposable for F
where
    F: FnOnce() -> anyhow::Result<()> + Send,
{
    fn dispose(self: Box<Self>) -> anyhow::Result<()> {
        (*self)()
    }
}

/// Aggregate of every disposable that failed during one cleanup pass.
#[derive(Debug)]
pub struct DisposeError {
    failures: Vec<anyhow::Error>,
}

impl DisposeError {
    /// The individual failures, in disposal order.
    #[must_use]
    pub fn failures(&self) -> &[anyhow::Error] {
        &self.failures
    }
}

impl fmt::Display for DisposeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} disposable(s) failed:", self.failures.len())?;
        for failure in &self.failures {
            write!(f, " [{failure:#}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for DisposeError {}

#[derive(Default)]
struct BagState {
    items: Vec<Box<dyn Disposable>>,
    disposed: bool,
}

/// A shared list of disposables owned by one run.
///
/// Cloning the bag yields another handle to the same list, so host callbacks
/// can register cleanup while the run is executing.
#[derive(Clone, Default)]
pub struct DisposableBag {
    state: Arc<Mutex<BagState>>,
}

impl fmt::Debug for DisposableBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("DisposableBag")
            .field("len", &state.items.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}

impl DisposableBag {
    /// Create an empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a disposable.
    ///
    /// If the bag has already been disposed the item is released immediately,
    /// since nothing would ever release it otherwise.
    ///
    /// # Errors
    ///
    /// Returns the item's own failure when it is released immediately.
    pub fn push(&self, item: impl Disposable + 'static) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.disposed {
            drop(state);
            return Box::new(item).dispose();
        }
        state.items.push(Box::new(item));
        Ok(())
    }

    /// Number of registered, not yet released items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .len()
    }

    /// Whether the bag holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`dispose_all`](Self::dispose_all) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .disposed
    }

    /// Release every item in registration order.
    ///
    /// Calling this again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a [`DisposeError`] listing every item that failed.
    pub fn dispose_all(&self) -> Result<(), DisposeError> {
        let items = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.disposed = true;
            std::mem::take(&mut state.items)
        };

        let failures: Vec<_> = items
            .into_iter()
            .filter_map(|item| item.dispose().err())
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DisposeError { failures })
        }
    }
}
