//! Where macro source text comes from.
//!
//! Executors read the current text of a macro every time a run is requested.
//! [`FsScriptSource`] reads saved files; [`InMemoryScriptSource`] models
//! documents open in an editor, whose unsaved text wins over the file.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;

use crate::execution::LanguageKind;
use crate::identity::ScriptIdentity;

/// The text of a macro at one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptDocument {
    /// Source text.
    pub text: String,
    /// Revision token; changes whenever the text may have changed.
    pub revision: u64,
    /// Language of the document.
    pub language: LanguageKind,
}

/// Provides the current text of macros.
#[async_trait]
pub trait ScriptSource: Send + Sync {
    /// Current revision of the macro, without reading its text.
    ///
    /// # Errors
    ///
    /// Returns an error if the macro does not exist or cannot be inspected.
    async fn revision(&self, script: &ScriptIdentity) -> io::Result<u64>;

    /// Read the macro.
    ///
    /// # Errors
    ///
    /// Returns an error if the macro does not exist or cannot be read.
    async fn load(&self, script: &ScriptIdentity) -> io::Result<ScriptDocument>;
}

/// Reads macros from the filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsScriptSource;

impl FsScriptSource {
    fn revision_of(metadata: &std::fs::Metadata) -> u64 {
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .unwrap_or_default();
        // Truncation is fine: this is a change token, not a timestamp.
        #[allow(clippy::cast_possible_truncation)]
        let nanos = modified.as_nanos() as u64;
        nanos.wrapping_add(metadata.len())
    }
}

#[async_trait]
impl ScriptSource for FsScriptSource {
    async fn revision(&self, script: &ScriptIdentity) -> io::Result<u64> {
        let metadata = tokio::fs::metadata(script.path()).await?;
        Ok(Self::revision_of(&metadata))
    }

    async fn load(&self, script: &ScriptIdentity) -> io::Result<ScriptDocument> {
        let metadata = tokio::fs::metadata(script.path()).await?;
        let text = tokio::fs::read_to_string(script.path()).await?;
        Ok(ScriptDocument {
            text,
            revision: Self::revision_of(&metadata),
            language: LanguageKind::from_path(script.path()),
        })
    }
}

/// In-memory revisions carry the top bit so they never equal a fallback revision.
const MEMORY_REVISION_BIT: u64 = 1 << 63;

/// Open documents held in memory, with an optional fallback for closed ones.
#[derive(Clone, Default)]
pub struct InMemoryScriptSource {
    documents: Arc<Mutex<HashMap<ScriptIdentity, (String, u64)>>>,
    next_revision: Arc<AtomicU64>,
    fallback: Option<Arc<dyn ScriptSource>>,
}

impl std::fmt::Debug for InMemoryScriptSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let open = self
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("InMemoryScriptSource")
            .field("open_documents", &open)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

impl InMemoryScriptSource {
    /// Create an empty source with no fallback.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read documents that are not open from `fallback`.
    #[must_use]
    pub fn with_fallback(mut self, fallback: impl ScriptSource + 'static) -> Self {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    /// Open a document, or replace its text if it is already open.
    ///
    /// Returns the new revision.
    pub fn open(&self, script: impl Into<ScriptIdentity>, text: impl Into<String>) -> u64 {
        let revision = (self.next_revision.fetch_add(1, Ordering::SeqCst) + 1) | MEMORY_REVISION_BIT;
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(script.into(), (text.into(), revision));
        revision
    }

    /// Replace the text of a document. Same as [`open`](Self::open).
    pub fn update(&self, script: impl Into<ScriptIdentity>, text: impl Into<String>) -> u64 {
        self.open(script, text)
    }

    /// Close a document. Later reads go to the fallback.
    pub fn close(&self, script: &ScriptIdentity) -> bool {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(script)
            .is_some()
    }

    fn get(&self, script: &ScriptIdentity) -> Option<(String, u64)> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(script)
            .cloned()
    }

    fn not_found(script: &ScriptIdentity) -> io::Error {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("macro '{script}' is not open"),
        )
    }
}

#[async_trait]
impl ScriptSource for InMemoryScriptSource {
    async fn revision(&self, script: &ScriptIdentity) -> io::Result<u64> {
        if let Some((_, revision)) = self.get(script) {
            return Ok(revision);
        }
        match &self.fallback {
            Some(fallback) => fallback.revision(script).await,
            None => Err(Self::not_found(script)),
        }
    }

    async fn load(&self, script: &ScriptIdentity) -> io::Result<ScriptDocument> {
        if let Some((text, revision)) = self.get(script) {
            return Ok(ScriptDocument {
                text,
                revision,
                language: LanguageKind::from_path(script.path()),
            });
        }
        match &self.fallback {
            Some(fallback) => fallback.load(script).await,
            None => Err(Self::not_found(script)),
        }
    }
}
