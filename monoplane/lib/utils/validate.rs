use std::sync::LazyLock;

use regex::Regex;

use crate::{MonoplaneError, MonoplaneResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]{2,255}$").unwrap());

static SNAPSHOT_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.:/-]{2,255}$").unwrap());

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Validates a region name: letters, digits, `_`, `.` and `-`, 2 to 255 characters.
pub fn validate_name(name: &str) -> MonoplaneResult<()> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(MonoplaneError::Validation(format!("invalid name: {name:?}")))
    }
}

/// Validates a snapshot name. Same as [`validate_name`] with `:` and `/` also allowed.
pub fn validate_snapshot_name(name: &str) -> MonoplaneResult<()> {
    if SNAPSHOT_NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(MonoplaneError::Validation(format!(
            "invalid snapshot name: {name:?}"
        )))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("eu-central.1_a").is_ok());
        assert!(validate_name("us").is_ok());
        assert!(validate_name(&"a".repeat(255)).is_ok());

        assert!(validate_name("a").is_err());
        assert!(validate_name(&"a".repeat(256)).is_err());
        assert!(validate_name("eu central").is_err());
        assert!(validate_name("eu/central").is_err());
        assert!(validate_name("région").is_err());
    }

    #[test]
    fn test_validate_snapshot_name() {
        assert!(validate_snapshot_name("ubuntu:22.04").is_ok());
        assert!(validate_snapshot_name("acme/python:3.12").is_ok());
        assert!(validate_snapshot_name("bad name").is_err());
    }
}
