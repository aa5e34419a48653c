//! Record locators.

use crate::error::ProtocolError;
use crate::value::Value;
use std::fmt;
use std::str::FromStr;

/// Identifies a record by storage cluster and position within it.
///
/// Canonical string form is `#cluster:position`. Position `-1` marks a
/// record the server has not assigned a position yet (new record).
/// Immutable once assigned; structural equality and hashing make it
/// the key space for reference resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId {
    pub cluster: i16,
    pub position: i64,
}

impl RecordId {
    pub fn new(cluster: i16, position: i64) -> Self {
        Self { cluster, position }
    }

    /// A locator for a record not yet created in the given cluster.
    pub fn unassigned(cluster: i16) -> Self {
        Self {
            cluster,
            position: -1,
        }
    }

    /// Whether the server has assigned a position.
    pub fn is_assigned(&self) -> bool {
        self.position >= 0
    }

    /// Extracts a locator from a value, if it carries one.
    ///
    /// `None` is the "not a locator" signal, not an error: callers use
    /// it to distinguish reference fields from ordinary values.
    pub fn from_value(value: &Value) -> Option<RecordId> {
        match value {
            Value::Link(rid) => Some(*rid),
            Value::String(s) => s.parse().ok(),
            Value::Record(record) => record.read().rid(),
            _ => None,
        }
    }
}

impl FromStr for RecordId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ProtocolError::InvalidRid(s.to_string());

        let rest = s.strip_prefix('#').ok_or_else(err)?;
        let (cluster, position) = rest.split_once(':').ok_or_else(err)?;
        let cluster: i16 = cluster.parse().map_err(|_| err())?;
        let position: i64 = position.parse().map_err(|_| err())?;

        if cluster < 0 || position < -1 {
            return Err(err());
        }

        Ok(RecordId { cluster, position })
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster, self.position)
    }
}
