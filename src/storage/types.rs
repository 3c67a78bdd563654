//! validated identifiers for the storage collaborator.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A validated table name.
///
/// Valid names:
/// - 1-64 characters
/// - Alphanumeric, underscores, hyphens only
/// - Must start with a letter or underscore
/// - Cannot be reserved names (_schema, _meta, etc.)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName(String);

impl TableName {
    /// reserved table names that can't be used
    const RESERVED: &'static [&'static str] = &["_schema", "_meta", "_system", "_saga"];

    /// create a new TableName, validating the input
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    fn validate(name: &str) -> Result<(), InvalidNameError> {
        let Some(first_char) = name.chars().next() else {
            return Err(InvalidNameError::Empty);
        };

        if name.len() > 64 {
            return Err(InvalidNameError::TooLong(name.len()));
        }

        if !first_char.is_ascii_alphabetic() && first_char != '_' {
            return Err(InvalidNameError::InvalidStart(first_char));
        }

        for (i, c) in name.chars().enumerate() {
            if !c.is_ascii_alphanumeric() && c != '_' && c != '-' {
                return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
            }
        }

        if Self::RESERVED.contains(&name.to_lowercase().as_str()) {
            return Err(InvalidNameError::Reserved(name.to_string()));
        }

        Ok(())
    }

    /// get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TableName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A validated row key (primary key).
///
/// keys handed out by inserts are ULIDs; caller-chosen keys follow the
/// same character rules as table names without the leading-letter rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey(String);

impl RowKey {
    pub fn new(key: impl Into<String>) -> Result<Self, InvalidNameError> {
        let key = key.into();
        Self::validate(&key)?;
        Ok(Self(key))
    }

    fn validate(key: &str) -> Result<(), InvalidNameError> {
        if key.is_empty() {
            return Err(InvalidNameError::Empty);
        }

        if key.len() > 128 {
            return Err(InvalidNameError::TooLong(key.len()));
        }

        for (i, c) in key.chars().enumerate() {
            if !c.is_ascii_alphanumeric() && c != '_' && c != '-' {
                return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
            }
        }

        Ok(())
    }

    /// get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generate a new ULID-based row key.
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RowKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// error type for invalid table and row names
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidNameError {
    Empty,
    TooLong(usize),
    InvalidStart(char),
    InvalidCharacter { char: char, position: usize },
    Reserved(String),
}

impl fmt::Display for InvalidNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::TooLong(len) => write!(f, "name too long: {} characters", len),
            Self::InvalidStart(c) => write!(f, "name cannot start with '{}'", c),
            Self::InvalidCharacter { char, position } => {
                write!(f, "invalid character '{}' at position {}", char, position)
            }
            Self::Reserved(name) => write!(f, "'{}' is a reserved name", name),
        }
    }
}

impl std::error::Error for InvalidNameError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_valid() {
        assert!(TableName::new("accounts").is_ok());
        assert!(TableName::new("ledger_entries").is_ok());
        assert!(TableName::new("Orders2024").is_ok());
        assert!(TableName::new("_staging").is_ok());
        assert!(TableName::new("audit-log").is_ok());
    }

    #[test]
    fn test_table_name_invalid() {
        assert_eq!(TableName::new(""), Err(InvalidNameError::Empty));
        assert_eq!(
            TableName::new("9lives"),
            Err(InvalidNameError::InvalidStart('9'))
        );
        assert!(TableName::new("orders/archive").is_err());
        assert!(TableName::new("_SAGA").is_err());
        assert!(TableName::new("a".repeat(65)).is_err());
    }

    #[test]
    fn test_row_key_rules() {
        assert!(RowKey::new("order-17").is_ok());
        assert!(RowKey::new("01ARZ3NDEKTSV4RRFFQ69G5FAV").is_ok());
        assert!(RowKey::new("has space").is_err());
        assert!(RowKey::new("x".repeat(129)).is_err());
    }

    #[test]
    fn test_row_key_generate() {
        let key1 = RowKey::generate();
        let key2 = RowKey::generate();
        assert_ne!(key1, key2);
        assert_eq!(key1.as_str().len(), 26);
        assert_eq!(key1.as_str(), key1.as_str().to_lowercase());
    }
}
