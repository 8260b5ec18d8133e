//! Immutable capture of a macro at the moment a run is requested.

use std::path::Path;

use crate::options::ExecutionOptions;

/// Which language a macro is written in, derived from its file extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LanguageKind {
    /// Rhai source (`.rhai`).
    Rhai,
    /// Anything else, identified by its lower-cased extension (may be empty).
    Other(String),
}

impl LanguageKind {
    /// Infer the language from a path's extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "rhai" => Self::Rhai,
            _ => Self::Other(extension),
        }
    }
}

/// Source text, directives and revision of a macro as captured for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSnapshot {
    source: String,
    options: ExecutionOptions,
    language: LanguageKind,
    revision: u64,
}

impl ExecutionSnapshot {
    /// Capture `source`, parsing its directives.
    #[must_use]
    pub fn new(source: impl Into<String>, language: LanguageKind, revision: u64) -> Self {
        let source = source.into();
        let options = ExecutionOptions::parse(&source);
        Self {
            source,
            options,
            language,
            revision,
        }
    }

    /// The captured source text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Directives parsed from the source.
    #[must_use]
    pub fn options(&self) -> ExecutionOptions {
        self.options
    }

    /// The macro's language.
    #[must_use]
    pub fn language(&self) -> &LanguageKind {
        &self.language
    }

    /// Document revision the source was read at.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }
}
