// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Declared value classes and decoding.

use core::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;

/// The JSON class a persisted cell expects to find in storage.
///
/// `null` is accepted by every class so optional values round-trip.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueClass {
    /// `true` or `false`.
    Boolean,
    /// A JSON string.
    String,
    /// A JSON number.
    Number,
    /// Arrays and objects.
    Structured,
}

impl ValueClass {
    /// Returns the class of a JSON value, or `None` for `null`.
    #[must_use]
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(Self::Boolean),
            Value::String(_) => Some(Self::String),
            Value::Number(_) => Some(Self::Number),
            Value::Array(_) | Value::Object(_) => Some(Self::Structured),
        }
    }

    /// Returns `true` if `value` belongs to this class.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        Self::of(value).is_none_or(|found| found == self)
    }

    /// Decodes stored text into `T`, checking the class first.
    pub fn decode<T: DeserializeOwned>(self, raw: &str) -> Result<T, DecodeError> {
        let value: Value = serde_json::from_str(raw).map_err(DecodeError::Syntax)?;
        if let Some(found) = Self::of(&value)
            && found != self
        {
            return Err(DecodeError::ClassMismatch {
                expected: self,
                found,
            });
        }
        serde_json::from_value(value).map_err(DecodeError::Shape)
    }
}

impl fmt::Display for ValueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Boolean => "boolean",
            Self::String => "string",
            Self::Number => "number",
            Self::Structured => "structured",
        })
    }
}
