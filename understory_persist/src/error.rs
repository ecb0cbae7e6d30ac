// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Persistence errors.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::class::ValueClass;

/// Failure opening or writing a backing store.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Reading or writing the backing file failed.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// File being accessed.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// The backing file holds something other than a JSON object of strings.
    #[error("corrupt store file {path}: {source}")]
    Corrupt {
        /// File being read.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
}

/// A stored value that could not be decoded.
///
/// Never surfaced to readers: the cell falls back to its default.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The stored text is not JSON.
    #[error("stored value is not valid JSON: {0}")]
    Syntax(#[source] serde_json::Error),
    /// The stored JSON does not match the declared class.
    #[error("expected a {expected} value, found {found}")]
    ClassMismatch {
        /// Declared class of the cell.
        expected: ValueClass,
        /// Class found in storage.
        found: ValueClass,
    },
    /// The JSON matches the class but not the cell's type.
    #[error("stored value does not fit the cell type: {0}")]
    Shape(#[source] serde_json::Error),
}
