//! Transaction isolation levels.
//!
//! The level is a request passed through to the storage provider when a
//! boundary is opened; the coordinator itself does not interpret it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transaction isolation level, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Reads may observe uncommitted writes of other transactions.
    #[serde(rename = "READ UNCOMMITTED")]
    ReadUncommitted,

    /// Each read sees the most recently committed data at the time of the read.
    ///
    /// Different reads within the same transaction might see different
    /// data if another transaction commits in between.
    #[default]
    #[serde(rename = "READ COMMITTED")]
    ReadCommitted,

    /// All reads see a consistent snapshot taken at transaction start.
    #[serde(rename = "REPEATABLE READ")]
    RepeatableRead,

    /// Transactions behave as if executed one after another.
    #[serde(rename = "SERIALIZABLE")]
    Serializable,
}

impl IsolationLevel {
    /// Check if this isolation level uses snapshot reads.
    pub fn uses_snapshot(&self) -> bool {
        matches!(
            self,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        )
    }

    /// SQL spelling, e.g. `READ COMMITTED`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Parse isolation level from string (SQL syntax).
impl std::str::FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().replace(['_', '-'], " ").as_str() {
            "READ UNCOMMITTED" | "READUNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
            "READ COMMITTED" | "READCOMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "REPEATABLE READ" | "REPEATABLEREAD" | "SNAPSHOT" => {
                Ok(IsolationLevel::RepeatableRead)
            }
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            _ => Err(format!("unknown isolation level: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_isolation() {
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
    }

    #[test]
    fn test_uses_snapshot() {
        assert!(!IsolationLevel::ReadUncommitted.uses_snapshot());
        assert!(!IsolationLevel::ReadCommitted.uses_snapshot());
        assert!(IsolationLevel::RepeatableRead.uses_snapshot());
        assert!(IsolationLevel::Serializable.uses_snapshot());
    }

    #[test]
    fn test_parse_isolation() {
        assert_eq!(
            "READ COMMITTED".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            "read_uncommitted".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadUncommitted
        );
        assert_eq!(
            "snapshot".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::RepeatableRead
        );
        assert!("chaos".parse::<IsolationLevel>().is_err());
    }

    #[test]
    fn test_serde_uses_sql_spelling() {
        let json = serde_json::to_string(&IsolationLevel::Serializable).unwrap();
        assert_eq!(json, "\"SERIALIZABLE\"");
        let level: IsolationLevel = serde_json::from_str("\"REPEATABLE READ\"").unwrap();
        assert_eq!(level, IsolationLevel::RepeatableRead);
    }
}
