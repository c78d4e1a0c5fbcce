//! Error types outside the SMTP wire protocol

use std::path::PathBuf;
use thiserror::Error;

/// Failures while turning DATA bytes into a message record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MimeError {
    /// The header block could not be parsed; the message is rejected
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The body could only be partly decomposed; the message is still kept
    #[error("partial decomposition: {0}")]
    PartialDecomposition(String),
}

/// Failures of an on-demand spam check
#[derive(Error, Debug)]
pub enum SpamError {
    #[error("message {0} not found")]
    NotFound(String),

    #[error("spam scanner {} is unavailable: {source}", binary.display())]
    ScannerUnavailable {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("spam scanner failed: {0}")]
    ScannerError(String),
}

/// Failures reading or writing the message snapshot
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures loading the settings file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("settings IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
