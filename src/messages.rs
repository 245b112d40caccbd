//! Operator commands for the session controller.
//!
//! Commands are plain messages sent over an `mpsc` channel and applied by the
//! controller at its drain points, between acquisitions. Nothing else touches
//! session state.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::core::duration_from_secs;

/// Operator text that is not a known command.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandParseError {
    /// Empty input line.
    #[error("empty command")]
    Empty,
    /// First word is not a command.
    #[error("unknown command '{0}'")]
    Unknown(String),
    /// A command argument could not be read.
    #[error("invalid argument for '{command}': {argument}")]
    InvalidArgument {
        /// Command word.
        command: String,
        /// Offending argument.
        argument: String,
    },
}

/// Commands accepted by [`crate::session::SessionController`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    /// Stop the session.
    Quit,
    /// Set the y-axis upper bound from the displayed spectrum.
    Autoscale,
    /// Flip between linear and log y-axis.
    ToggleLogScale,
    /// Pause continuous mode and take one long exposure. `None` uses the
    /// requested exposure.
    Acquire {
        /// Exposure override.
        exposure: Option<Duration>,
    },
    /// Export the axis and displayed spectrum. `None` uses the configured path.
    Save {
        /// Destination override.
        path: Option<PathBuf>,
    },
    /// Return from a one-shot pause to continuous mode.
    Restart,
    /// Set the requested exposure from operator text, in seconds.
    SetRequestedExposure(String),
    /// Re-acquire the dark reference and overwrite the cache.
    RefreshDark,
}

impl SessionCommand {
    /// One-shot acquisition at the requested exposure.
    pub fn acquire() -> Self {
        Self::Acquire { exposure: None }
    }

    /// One-shot acquisition at `exposure`.
    pub fn acquire_for(exposure: Duration) -> Self {
        Self::Acquire {
            exposure: Some(exposure),
        }
    }

    /// Save to the configured export path.
    pub fn save() -> Self {
        Self::Save { path: None }
    }

    /// Save to `path`.
    pub fn save_to(path: impl Into<PathBuf>) -> Self {
        Self::Save {
            path: Some(path.into()),
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Quit => "quit",
            Self::Autoscale => "autoscale",
            Self::ToggleLogScale => "log",
            Self::Acquire { .. } => "acquire",
            Self::Save { .. } => "save",
            Self::Restart => "restart",
            Self::SetRequestedExposure(_) => "exposure",
            Self::RefreshDark => "dark",
        }
    }
}

impl FromStr for SessionCommand {
    type Err = CommandParseError;

    /// Parses an operator line: `quit`, `autoscale`, `log`, `acquire [secs]`,
    /// `save [path]`, `restart`, `exposure <secs>`, `dark`.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word.to_ascii_lowercase().as_str() {
            "" => Err(CommandParseError::Empty),
            "quit" | "q" | "exit" => Ok(Self::Quit),
            "autoscale" | "a" => Ok(Self::Autoscale),
            "log" | "logscale" => Ok(Self::ToggleLogScale),
            "acquire" => {
                if rest.is_empty() {
                    return Ok(Self::acquire());
                }
                rest.parse::<f64>()
                    .ok()
                    .and_then(duration_from_secs)
                    .map(Self::acquire_for)
                    .ok_or_else(|| CommandParseError::InvalidArgument {
                        command: word.to_string(),
                        argument: rest.to_string(),
                    })
            }
            "save" => Ok(if rest.is_empty() {
                Self::save()
            } else {
                Self::save_to(rest)
            }),
            "restart" | "resume" => Ok(Self::Restart),
            // Malformed values are the controller's to recover from.
            "exposure" | "integration" => Ok(Self::SetRequestedExposure(rest.to_string())),
            "dark" => Ok(Self::RefreshDark),
            other => Err(CommandParseError::Unknown(other.to_string())),
        }
    }
}
