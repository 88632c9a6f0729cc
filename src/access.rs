//! Namespace access checks
//!
//! Used when a read falls through to a fallback namespace: the caller must be
//! allowed to read the fallback as well as the namespace it asked for.

use crate::common::{Error, NamespaceId, Result};
use std::collections::{HashMap, HashSet};

/// Identity of a caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
}

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

pub trait NamespaceAccess: Send + Sync {
    /// `Authorization` error if `principal` may not read `ns`
    fn authorize_read(&self, principal: &Principal, ns: &NamespaceId) -> Result<()>;
}

/// Grants everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl NamespaceAccess for AllowAll {
    fn authorize_read(&self, _principal: &Principal, _ns: &NamespaceId) -> Result<()> {
        Ok(())
    }
}

/// Per-principal namespace grants
#[derive(Debug, Clone, Default)]
pub struct ScopedAccess {
    grants: HashMap<String, HashSet<NamespaceId>>,
}

impl ScopedAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, principal: impl Into<String>, ns: NamespaceId) -> Self {
        self.grants.entry(principal.into()).or_default().insert(ns);
        self
    }
}

impl NamespaceAccess for ScopedAccess {
    fn authorize_read(&self, principal: &Principal, ns: &NamespaceId) -> Result<()> {
        let allowed = self
            .grants
            .get(&principal.name)
            .map(|namespaces| namespaces.contains(ns))
            .unwrap_or(false);
        if allowed {
            Ok(())
        } else {
            Err(Error::Authorization(format!(
                "{} may not read namespace {}",
                principal.name, ns
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_access() {
        let ns = NamespaceId::new("fallback").unwrap();
        let access = ScopedAccess::new().grant("builder", ns.clone());
        assert!(access.authorize_read(&Principal::new("builder"), &ns).is_ok());
        assert!(matches!(
            access.authorize_read(&Principal::new("stranger"), &ns),
            Err(Error::Authorization(_))
        ));
        assert!(AllowAll.authorize_read(&Principal::new("stranger"), &ns).is_ok());
    }
}
