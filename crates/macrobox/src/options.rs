//! Execution options parsed from in-source directives.
//!
//! A directive is a single-line comment of the form
//!
//! ```text
//! // @macro:persistent,singleton
//! // @macro: retained
//! ```
//!
//! Option names may be separated by commas or whitespace and several
//! directive lines union together. Unknown names are ignored.

use serde::{Deserialize, Serialize};

const DIRECTIVE: &str = "macro:";

/// Lifecycle flags for a macro. All default to `false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Share user globals across runs of the same macro.
    pub persistent: bool,
    /// Keep the run alive after the body finishes, until it is cancelled.
    pub retained: bool,
    /// Reject a new run while another run of this macro is active.
    pub singleton: bool,
}

impl ExecutionOptions {
    /// Parse every directive line in `source`.
    #[must_use]
    pub fn parse(source: &str) -> Self {
        let mut options = Self::default();
        for names in source.lines().filter_map(directive_body) {
            for name in names
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|n| !n.is_empty())
            {
                options.apply(name);
            }
        }
        options
    }

    fn apply(&mut self, name: &str) {
        match name {
            "persistent" => self.persistent = true,
            "retained" => self.retained = true,
            "singleton" => self.singleton = true,
            unknown => tracing::trace!(directive = unknown, "ignoring unknown macro directive"),
        }
    }
}

/// Returns the option list of a directive line, or `None` for any other line.
fn directive_body(line: &str) -> Option<&str> {
    let comment = line.trim_start().strip_prefix("//")?.trim_start();
    let comment = comment.strip_prefix('@').unwrap_or(comment);
    comment.strip_prefix(DIRECTIVE)
}
