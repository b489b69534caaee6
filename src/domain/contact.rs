//! Contact entity and its insert payload.

use crate::db::StoreError;
use serde::{Deserialize, Serialize};

pub const NAME_MAX_CHARS: usize = 100;
pub const ADDRESS_MAX_CHARS: usize = 500;

/// A persisted contact row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    pub name: String,
    pub address: String,
}

/// Data for a contact that has not been assigned an id yet.
///
/// Construction enforces the storage invariants only (non-blank, within the
/// column limits). Friendlier input rules belong to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContact {
    name: String,
    address: String,
}

impl NewContact {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Result<Self, StoreError> {
        let name = name.into();
        let address = address.into();
        check_field("name", &name, NAME_MAX_CHARS)?;
        check_field("address", &address, ADDRESS_MAX_CHARS)?;
        Ok(NewContact { name, address })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

fn check_field(field: &str, value: &str, max_chars: usize) -> Result<(), StoreError> {
    if value.trim().is_empty() {
        return Err(StoreError::ConstraintViolation(format!(
            "{} must not be empty",
            field
        )));
    }
    let len = value.chars().count();
    if len > max_chars {
        return Err(StoreError::ConstraintViolation(format!(
            "{} must be at most {} characters, got {}",
            field, max_chars, len
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_contact() {
        let contact = NewContact::new("Ada Lovelace", "1 Analytical Engine Way").unwrap();
        assert_eq!(contact.name(), "Ada Lovelace");
        assert_eq!(contact.address(), "1 Analytical Engine Way");
    }

    #[test]
    fn test_blank_fields_rejected() {
        let err = NewContact::new("", "somewhere").unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(ref m) if m.contains("name")));

        let err = NewContact::new("Ada", "   ").unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(ref m) if m.contains("address")));
    }

    #[test]
    fn test_length_limits_are_inclusive() {
        assert!(NewContact::new("n".repeat(NAME_MAX_CHARS), "a").is_ok());
        assert!(NewContact::new("n".repeat(NAME_MAX_CHARS + 1), "a").is_err());
        assert!(NewContact::new("n", "a".repeat(ADDRESS_MAX_CHARS)).is_ok());
        assert!(NewContact::new("n", "a".repeat(ADDRESS_MAX_CHARS + 1)).is_err());
    }

    #[test]
    fn test_length_counts_characters_not_bytes() {
        // 100 two-byte characters fit the 100-character column.
        assert!(NewContact::new("é".repeat(NAME_MAX_CHARS), "Paris").is_ok());
    }

    #[test]
    fn test_contact_serializes_flat() {
        let contact = Contact {
            id: 7,
            name: "Jane Smith".to_string(),
            address: "456 Oak Avenue".to_string(),
        };
        let json = serde_json::to_value(&contact).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["name"], "Jane Smith");
        assert_eq!(json["address"], "456 Oak Avenue");
    }
}
