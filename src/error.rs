// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

// Error hierarchy for the checkpoint store.

use std::fmt;

/// Errors that can occur while operating a checkpoint engine.
#[derive(Debug)]
pub enum Error {
    /// I/O error while touching the manifest, filter file, or a fragment file.
    Io(std::io::Error),

    /// A manifest record could not be parsed (unknown tag, missing field).
    CorruptManifest(String),

    /// A referenced column or version does not exist in the index.
    NotFound(String),

    /// An internal structural check failed. Treated as fatal: the caller
    /// should not continue using the engine.
    InvariantViolation(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::CorruptManifest(msg) => write!(f, "corrupt manifest: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
