// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Stable keys for structured parameters.
//!
//! A [`CanonicalKey`] is a versioned, compact JSON rendering of a value with
//! object members sorted by name. Two values that serialize to structurally
//! equal JSON get the same key no matter how their maps were built; any two
//! values whose JSON differs get different keys, since the rendering is
//! unambiguous.

use core::fmt;
use core::fmt::Write as _;
use std::rc::Rc;

use serde::Serialize;
use serde_json::Value;

/// Prefix identifying the encoding version.
pub const CANONICAL_VERSION: &str = "v1";

/// A canonical string key for a parameter value.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CanonicalKey(Rc<str>);

impl CanonicalKey {
    /// Canonicalizes any serializable value.
    ///
    /// Fails only if `value`'s `Serialize` impl fails or produces a map with
    /// keys JSON cannot represent.
    pub fn of<P: Serialize + ?Sized>(value: &P) -> Result<Self, serde_json::Error> {
        Ok(Self::from_value(&serde_json::to_value(value)?))
    }

    /// Canonicalizes a JSON value.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let mut out = String::with_capacity(32);
        out.push_str(CANONICAL_VERSION);
        out.push(':');
        write_canonical(&mut out, value);
        Self(Rc::from(out))
    }

    /// Wraps a key produced by a custom canonicalization function.
    ///
    /// The caller is responsible for making the mapping injective.
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(Rc::from(raw.into()))
    }

    /// Returns the key text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            // Scalars render unambiguously through serde_json's Display.
            let _ = write!(out, "{value}");
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}", Value::String(name.clone()));
                out.push(':');
                write_canonical(out, item);
            }
            out.push('}');
        }
    }
}

impl fmt::Debug for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CanonicalKey").field(&&*self.0).finish()
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
