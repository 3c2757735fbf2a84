//! Error taxonomy for device access
//!
//! Every failure a poller can hit while talking to a device falls in one of
//! four kinds. Tick-level errors are logged and swallowed by the poller,
//! construction-level errors are returned to the supervisor.

use std::fmt;

/// Which level of a field selector was not found in the document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingField {
    /// Top-level container key absent: the device does not support this selector
    Container,
    /// Probe index (or an intermediate key) absent: probe not present this tick
    Probe,
    /// Leaf value absent or null
    Leaf,
}

impl fmt::Display for MissingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MissingField::Container => "container",
            MissingField::Probe => "probe",
            MissingField::Leaf => "leaf",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Field missing ({kind}): {path}")]
    FieldMissing { kind: MissingField, path: String },
}

impl BridgeError {
    /// Short label used as the `kind` field in log records
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Configuration(_) => "configuration",
            BridgeError::Network(_) => "network",
            BridgeError::Decode(_) => "decode",
            BridgeError::FieldMissing { .. } => "field_missing",
        }
    }

    pub(crate) fn missing(kind: MissingField, path: impl Into<String>) -> Self {
        BridgeError::FieldMissing { kind, path: path.into() }
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BridgeError::Network(format!("request timed out: {e}"))
        } else {
            BridgeError::Network(e.to_string())
        }
    }
}
