//! Error types for plugin hosting
//!
//! Two families: [`PluginError`] is what a plugin reports from its own
//! calls, [`PluginLoadError`] is what the host reports to the control
//! thread when a plugin is refused. Real-time failures never surface as
//! errors; they become a [`Fault`] that the track recovers from locally.

use std::fmt;

use thiserror::Error;

/// Errors reported by a plugin implementation
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PluginError {
    /// Processing failed for this block
    #[error("processing failed: {0}")]
    Processing(String),

    /// The requested configuration is not supported
    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    /// Saved state could not be applied
    #[error("invalid state: {0}")]
    State(String),
}

/// Synthetic pass of the load-time safety check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyPass {
    NoteOn,
    NoteOff,
    Silence,
}

impl fmt::Display for SafetyPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SafetyPass::NoteOn => "note-on",
            SafetyPass::NoteOff => "note-off",
            SafetyPass::Silence => "silence",
        };
        f.write_str(name)
    }
}

/// Reasons a plugin load is rejected
///
/// A rejected load never touches the instance already in the slot.
#[derive(Debug, Error)]
pub enum PluginLoadError {
    /// None of stereo, mono or input-less layouts were accepted
    #[error("Plugin '{plugin}' accepts no supported channel layout")]
    NoSupportedLayout { plugin: String },

    /// `prepare` failed or panicked for every candidate layout
    #[error("Plugin '{plugin}' failed to prepare: {reason}")]
    PrepareFailed { plugin: String, reason: String },

    /// Restoring saved state failed or panicked
    #[error("Plugin '{plugin}' rejected its saved state: {reason}")]
    StateRestoreFailed { plugin: String, reason: String },

    /// The synthetic safety check caught a panic, an error or non-finite output
    #[error("Plugin '{plugin}' failed the {pass} safety pass: {reason}")]
    SafetyCheckFailed {
        plugin: String,
        pass: SafetyPass,
        reason: String,
    },

    /// An effect was offered as an instrument or vice versa
    #[error("Plugin '{plugin}' cannot be loaded as {expected}")]
    KindMismatch { plugin: String, expected: &'static str },

    /// Insert slot index out of range
    #[error("Insert slot {index} out of range (max {max})")]
    SlotOutOfRange { index: usize, max: usize },
}

/// Result type for plugin load operations
pub type PluginLoadResult<T> = Result<T, PluginLoadError>;

/// Real-time failure of a guarded render stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fault {
    /// Third-party code panicked
    #[error("plugin panicked")]
    Panicked,

    /// A plugin returned an error from `process`
    #[error("plugin returned an error")]
    ProcessError,

    /// A plugin produced NaN or infinite samples
    #[error("plugin produced non-finite output")]
    NonFiniteOutput,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PluginLoadError::SafetyCheckFailed {
            plugin: "Broken Verb".to_string(),
            pass: SafetyPass::NoteOff,
            reason: "non-finite output".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("Broken Verb"));
        assert!(text.contains("note-off"));

        let err = PluginLoadError::SlotOutOfRange { index: 7, max: 4 };
        assert!(err.to_string().contains('7'));
    }
}
