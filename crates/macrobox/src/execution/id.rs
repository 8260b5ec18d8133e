//! Human-readable execution ids: `{script}@{token}`.

use std::fmt;
use std::str::FromStr;

/// The per-script part of an [`ExecutionId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExecutionToken {
    /// Sequential run index, starting at 1. Rendered zero-padded (`001`).
    Index(u64),
    /// The Nth startup run of this script, starting at 1.
    /// The first renders as `startup`, later ones as `startup(N)`.
    Startup(u32),
}

impl fmt::Display for ExecutionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "{index:03}"),
            Self::Startup(1) => f.write_str("startup"),
            Self::Startup(n) => write!(f, "startup({n})"),
        }
    }
}

/// Identity of one run attempt of one script.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionId {
    script: String,
    token: ExecutionToken,
}

impl ExecutionId {
    /// Create an id from a script short name and a token.
    #[must_use]
    pub fn new(script: impl Into<String>, token: ExecutionToken) -> Self {
        Self {
            script: script.into(),
            token,
        }
    }

    /// The script short name.
    #[must_use]
    pub fn script(&self) -> &str {
        &self.script
    }

    /// The per-script token.
    #[must_use]
    pub fn token(&self) -> ExecutionToken {
        self.token
    }

    /// Whether this id belongs to a startup run.
    #[must_use]
    pub fn is_startup(&self) -> bool {
        matches!(self.token, ExecutionToken::Startup(_))
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.script, self.token)
    }
}

/// Error returned when parsing a malformed execution id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid execution id: {0:?}")]
pub struct ParseExecutionIdError(String);

impl FromStr for ExecutionId {
    type Err = ParseExecutionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseExecutionIdError(s.to_string());
        let (script, token) = s.rsplit_once('@').ok_or_else(invalid)?;
        if script.is_empty() {
            return Err(invalid());
        }

        let token = if token == "startup" {
            ExecutionToken::Startup(1)
        } else if let Some(n) = token
            .strip_prefix("startup(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            ExecutionToken::Startup(n.parse().map_err(|_| invalid())?)
        } else if !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()) {
            ExecutionToken::Index(token.parse().map_err(|_| invalid())?)
        } else {
            return Err(invalid());
        };

        Ok(Self::new(script, token))
    }
}
