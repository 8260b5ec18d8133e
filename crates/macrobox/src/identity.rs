//! Normalized script identities.
//!
//! The same macro can be referenced as `./macros/foo.rhai`, `macros/foo.rhai/`
//! or `file:///work/macros/foo.rhai?x#y`. All of these must map to one
//! executor, so lookups go through [`ScriptIdentity`].
//!
//! `file:` URIs are parsed with [`url`], which decodes percent-escapes and
//! drops the query and fragment.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use url::Url;

/// Comparable key for one macro, derived from its storage location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptIdentity {
    path: PathBuf,
}

impl ScriptIdentity {
    /// Build an identity from a filesystem path.
    ///
    /// The path is normalized lexically: `.` components are dropped, `..`
    /// pops the previous component and trailing separators are ignored. The
    /// filesystem is not consulted, so the macro does not need to exist.
    #[must_use]
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self {
            path: normalize(path.as_ref()),
        }
    }

    /// Build an identity from a location string: a plain path or a `file:` URI.
    ///
    /// URIs lose their query string and fragment and have percent-escapes
    /// decoded. A `file:` location that is not a valid local file URI, such
    /// as one naming a remote host, is treated as a plain path.
    #[must_use]
    pub fn parse(location: &str) -> Self {
        let location = location.trim();
        if location.starts_with("file:") {
            match Url::parse(location).map(|url| url.to_file_path()) {
                Ok(Ok(path)) => return Self::from_path(path),
                Ok(Err(())) => {
                    tracing::debug!(location, "file URI has no local path, using it verbatim");
                }
                Err(e) => tracing::debug!(location, error = %e, "invalid file URI, using it verbatim"),
            }
        }
        Self::from_path(location)
    }

    /// The normalized path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The directory containing the macro, if any.
    #[must_use]
    pub fn directory(&self) -> Option<&Path> {
        self.path.parent().filter(|p| !p.as_os_str().is_empty())
    }

    /// Short display name used in execution ids: the file name up to its first dot.
    ///
    /// `macros/foo.macro.rhai` becomes `foo`. Dot files keep their full name.
    #[must_use]
    pub fn short_name(&self) -> String {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned());
        match file_name.find('.') {
            Some(0) | None => file_name,
            Some(i) => file_name[..i].to_string(),
        }
    }
}

impl fmt::Display for ScriptIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

impl From<&Path> for ScriptIdentity {
    fn from(path: &Path) -> Self {
        Self::from_path(path)
    }
}

impl From<PathBuf> for ScriptIdentity {
    fn from(path: PathBuf) -> Self {
        Self::from_path(path)
    }
}

impl From<&ScriptIdentity> for ScriptIdentity {
    fn from(identity: &ScriptIdentity) -> Self {
        identity.clone()
    }
}

impl From<&str> for ScriptIdentity {
    fn from(location: &str) -> Self {
        Self::parse(location)
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` at the root stays at the root; a relative path keeps it.
                let popped = matches!(out.components().next_back(), Some(Component::Normal(_)))
                    && out.pop();
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
