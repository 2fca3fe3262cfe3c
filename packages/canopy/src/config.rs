//! Runtime configuration: optional rendering optimizations.
//!
//! The baseline runtime renders the whole tree after every applied action.
//! Each [`RuntimeOption`] trades that simplicity for less work:
//!
//! | Option                        | Effect                                                      |
//! |-------------------------------|-------------------------------------------------------------|
//! | `render-only-when-state-changes` | skip the render pass if an action changed nothing        |
//! | `conflate-stale-renderings`   | apply every queued action before rendering again            |
//! | `partial-tree-rendering`      | escort every change to the root; re-render dirty paths only |
//!
//! # Example
//!
//! ```ignore
//! // CANOPY_RUNTIME_OPTIONS=conflate-stale-renderings,partial-tree-rendering
//! let config = RuntimeConfig::from_env()?;
//! assert!(config.contains(RuntimeOption::PartialTreeRendering));
//! ```

use std::collections::BTreeSet;
use std::env;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable read by [`RuntimeConfig::from_env`].
pub const RUNTIME_OPTIONS_ENV: &str = "CANOPY_RUNTIME_OPTIONS";

/// One optional runtime optimization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeOption {
    /// Skip rendering when an applied action did not change any state.
    RenderOnlyWhenStateChanges,
    /// Drain all immediately available actions before rendering.
    ConflateStaleRenderings,
    /// Escort every state change to the root and skip clean subtrees.
    PartialTreeRendering,
}

impl RuntimeOption {
    /// All options, in declaration order.
    pub const ALL: [RuntimeOption; 3] = [
        RuntimeOption::RenderOnlyWhenStateChanges,
        RuntimeOption::ConflateStaleRenderings,
        RuntimeOption::PartialTreeRendering,
    ];

    /// The kebab-case name used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeOption::RenderOnlyWhenStateChanges => "render-only-when-state-changes",
            RuntimeOption::ConflateStaleRenderings => "conflate-stale-renderings",
            RuntimeOption::PartialTreeRendering => "partial-tree-rendering",
        }
    }
}

impl fmt::Display for RuntimeOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeOption {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        RuntimeOption::ALL
            .into_iter()
            .find(|option| option.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ConfigError::UnknownOption {
                option: wanted.to_string(),
            })
    }
}

/// Errors from loading a [`RuntimeConfig`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// An option name was not recognized.
    #[error("unknown runtime option {option:?}")]
    UnknownOption {
        /// The unrecognized name.
        option: String,
    },

    /// The environment variable was not valid unicode.
    #[error("{var} is not valid unicode")]
    NotUnicode {
        /// The variable that failed.
        var: &'static str,
    },
}

/// The set of optimizations a tree runs with.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuntimeConfig {
    options: BTreeSet<RuntimeOption>,
}

impl RuntimeConfig {
    /// The baseline configuration: no optimizations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every optimization enabled.
    pub fn all() -> Self {
        RuntimeOption::ALL.into_iter().collect()
    }

    /// Enable `option`.
    pub fn with(mut self, option: RuntimeOption) -> Self {
        self.options.insert(option);
        self
    }

    /// Whether `option` is enabled.
    pub fn contains(&self, option: RuntimeOption) -> bool {
        self.options.contains(&option)
    }

    /// Enabled options, in declaration order.
    pub fn options(&self) -> impl Iterator<Item = RuntimeOption> + '_ {
        self.options.iter().copied()
    }

    /// Parse a comma-separated option list. Blank entries are ignored.
    pub fn parse_list(list: &str) -> Result<Self, ConfigError> {
        list.split(',')
            .filter(|entry| !entry.trim().is_empty())
            .map(RuntimeOption::from_str)
            .collect()
    }

    /// Load configuration from `CANOPY_RUNTIME_OPTIONS`.
    ///
    /// An unset variable means the baseline configuration.
    pub fn from_env() -> Result<Self, ConfigError> {
        match env::var(RUNTIME_OPTIONS_ENV) {
            Ok(list) => Self::parse_list(&list),
            Err(env::VarError::NotPresent) => Ok(Self::default()),
            Err(env::VarError::NotUnicode(_)) => Err(ConfigError::NotUnicode {
                var: RUNTIME_OPTIONS_ENV,
            }),
        }
    }
}

impl FromIterator<RuntimeOption> for RuntimeConfig {
    fn from_iter<I: IntoIterator<Item = RuntimeOption>>(iter: I) -> Self {
        Self {
            options: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.options.iter().map(RuntimeOption::as_str).collect();
        write!(f, "[{}]", names.join(", "))
    }
}
