//! Tenant identity

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{CraneError, CraneResult};

/// Ownership and isolation key. Verified upstream; this crate never checks credentials.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Parse a tenant identity supplied by the identity collaborator
    pub fn parse(raw: &str) -> CraneResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CraneError::InvalidRequest(
                "tenant identity must not be empty".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TenantId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trims_and_rejects_empty() {
        assert_eq!(TenantId::parse("  alice ").unwrap().as_str(), "alice");
        assert!(TenantId::parse("   ").is_err());
    }
}
