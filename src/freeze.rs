//! Serialization seam for arbitrary application objects ("freezing").
//!
//! Values that are neither text, numbers nor raw bytes travel as opaque
//! bulk payloads produced by a [`Freezer`]. The default implementation uses
//! serde_json, so anything representable as a [`serde_json::Value`] can ride
//! a bulk string and come back as the same value.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Options passed to [`Freezer::thaw`], carried per-request on the parser.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThawOpts {
    /// when set, a payload that fails to thaw is handed back as raw bytes
    /// instead of an in-place error reply
    pub fallback_to_bytes: bool,
}

/// Converts application objects to and from opaque byte payloads.
///
/// Implementations must be pure: the same input freezes to the same bytes,
/// and `thaw(freeze(v))` recovers `v`.
pub trait Freezer: Send + Sync {
    /// serializes a value into bytes for transport
    fn freeze(&self, value: &serde_json::Value) -> Result<Vec<u8>>;

    /// deserializes bytes previously produced by [`Freezer::freeze`]
    fn thaw(&self, bytes: &[u8], opts: &ThawOpts) -> Result<serde_json::Value>;

    /// magic prefix this freezer's output starts with, if it has one.
    ///
    /// Used to opportunistically thaw unmarked bulk payloads written by
    /// historic clients; a freezer without a recognizable header opts out by
    /// returning `None`.
    fn header(&self) -> Option<&[u8]> {
        None
    }
}

/// The default freezer: values travel as compact JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFreezer;

impl Freezer for JsonFreezer {
    fn freeze(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn thaw(&self, bytes: &[u8], _opts: &ThawOpts) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
