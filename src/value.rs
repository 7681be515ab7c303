//! Application values and their coercion to wire argument payloads.
//!
//! Richer types than the server's native bulk strings are tunneled through
//! a two-byte in-bulk marker: `0x00 '<'` introduces binary payloads and
//! `0x00 '>'` introduces frozen application objects. The server stores the
//! marked payload as opaque bytes and returns it unchanged, which lets the
//! decoder reconstitute the original kind. Interop note: a foreign client
//! reading such a value sees the marker bytes verbatim; they are part of the
//! stored payload and are never stripped server-side.

use crate::error::{PipeError, Result};
use crate::freeze::Freezer;

/// sentinel byte that begins every in-bulk type marker
pub(crate) const MARKER: u8 = 0x00;
/// marker prefix for tunneled binary payloads
pub(crate) const MARKER_BIN: [u8; 2] = [MARKER, b'<'];
/// marker prefix for tunneled frozen objects
pub(crate) const MARKER_OBJ: [u8; 2] = [MARKER, b'>'];

const NULL_ARG_MSG: &str = "Args can't begin with null terminator";

/// One application-side request argument.
///
/// The variant picks the on-wire encoding; see the module docs for the
/// marker convention.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// text; encoded as its UTF-8 bytes
    Str(String),
    /// integer; encoded as base-10 decimal text
    Int(i64),
    /// float; encoded as base-10 decimal text
    Float(f64),
    /// a byte buffer; tunneled behind the binary marker
    Bytes(Vec<u8>),
    /// pre-wrapped bytes sent verbatim, bypassing coercion and validation
    Raw(Vec<u8>),
    /// any other value, including null; tunneled behind the frozen-object
    /// marker as the freezer's serialization
    Json(serde_json::Value),
}

impl Value {
    /// Encodes this value into its wire payload.
    ///
    /// # Errors
    /// Returns [`PipeError::Coerce`] when an application-supplied payload
    /// (`Str` or `Bytes`) begins with the `0x00` marker sentinel. `Raw`
    /// bypasses the check: pre-wrapped data such as DUMP output may begin
    /// with any byte.
    pub(crate) fn coerce(&self, freezer: &dyn Freezer) -> Result<Vec<u8>> {
        match self {
            Value::Str(s) => {
                reject_leading_null(s.as_bytes())?;
                Ok(s.as_bytes().to_vec())
            }
            Value::Int(n) => Ok(n.to_string().into_bytes()),
            Value::Float(x) => Ok(x.to_string().into_bytes()),
            Value::Bytes(b) => {
                reject_leading_null(b)?;
                let mut out = Vec::with_capacity(b.len() + 2);
                out.extend_from_slice(&MARKER_BIN);
                out.extend_from_slice(b);
                Ok(out)
            }
            Value::Raw(b) => Ok(b.clone()),
            Value::Json(v) => {
                let frozen = freezer.freeze(v)?;
                let mut out = Vec::with_capacity(frozen.len() + 2);
                out.extend_from_slice(&MARKER_OBJ);
                out.extend_from_slice(&frozen);
                Ok(out)
            }
        }
    }
}

fn reject_leading_null(payload: &[u8]) -> Result<()> {
    if payload.first() == Some(&MARKER) {
        return Err(PipeError::Coerce(NULL_ARG_MSG.to_string()));
    }
    Ok(())
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}
