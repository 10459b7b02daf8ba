//! Transaction identifiers and small wire helpers.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{WireError, WireResult};

/// Identifier tying an ACK, a REP, and an optional bulk frame to their
/// originating request.
///
/// Rendered on the wire as exactly eight lowercase hex digits. Uniqueness is
/// only required for the lifetime of one outstanding transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TransactionId(u32);

impl TransactionId {
    /// Creates a transaction id from its numeric value.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the numeric value.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Parses the eight-hex-digit wire form.
    pub fn from_hex(text: &str) -> WireResult<Self> {
        if text.len() != 8 {
            return Err(WireError::BadFrame(format!(
                "ill-formed transaction id {text:?}"
            )));
        }
        u32::from_str_radix(text, 16)
            .map(Self)
            .map_err(|_| WireError::BadFrame(format!("ill-formed transaction id {text:?}")))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl From<u32> for TransactionId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<TransactionId> for u32 {
    fn from(id: TransactionId) -> Self {
        id.0
    }
}

impl Serialize for TransactionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TransactionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(IdVisitor)
    }
}

/// Accepts the 8-hex-digit string form, or a bare integer from legacy
/// producers. Serialization always emits the string form.
struct IdVisitor;

impl<'de> Visitor<'de> for IdVisitor {
    type Value = TransactionId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an eight-hex-digit string or a 32-bit integer")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
        TransactionId::from_hex(value).map_err(E::custom)
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
        u32::try_from(value)
            .map(TransactionId::new)
            .map_err(|_| E::custom("transaction id out of 32-bit range"))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
        u32::try_from(value)
            .map(TransactionId::new)
            .map_err(|_| E::custom("transaction id out of 32-bit range"))
    }
}

/// Current time as floating-point seconds since the UNIX epoch, the `time`
/// field of every descriptor.
pub fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

/// The store owning a dotted element name: the segment before the first dot.
///
/// Returns `None` when the name has no dot or either side is empty.
pub fn store_of(fullname: &str) -> Option<&str> {
    let (store, element) = fullname.split_once('.')?;
    if store.is_empty() || element.is_empty() {
        return None;
    }
    Some(store)
}

#[cfg(test)]
mod id_tests {
    use super::*;

    #[test]
    fn renders_eight_lowercase_hex_digits() {
        assert_eq!(TransactionId::new(10).to_string(), "0000000a");
        assert_eq!(TransactionId::new(0).to_string(), "00000000");
        assert_eq!(TransactionId::new(u32::MAX).to_string(), "ffffffff");
    }

    #[test]
    fn parses_wire_form() {
        assert_eq!(
            TransactionId::from_hex("0000000a").unwrap(),
            TransactionId::new(10)
        );
        assert!(TransactionId::from_hex("a").is_err());
        assert!(TransactionId::from_hex("0000000g").is_err());
        assert!(TransactionId::from_hex("000000001").is_err());
    }

    #[test]
    fn json_accepts_string_or_integer() {
        let from_string: TransactionId = serde_json::from_str("\"000003e8\"").unwrap();
        let from_integer: TransactionId = serde_json::from_str("1000").unwrap();
        assert_eq!(from_string, from_integer);
        assert_eq!(serde_json::to_string(&from_string).unwrap(), "\"000003e8\"");
    }

    #[test]
    fn store_extraction() {
        assert_eq!(store_of("kpfguide.DISP2MSG"), Some("kpfguide"));
        assert_eq!(store_of("kpfguide"), None);
        assert_eq!(store_of(".DISP2MSG"), None);
        assert_eq!(store_of("kpfguide."), None);
    }
}
