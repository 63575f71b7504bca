//! Resource identity types shared across cabinetry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of cloud resource managed by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// Resource group; the root of the dependency chain.
    Group,
    /// Storage account holding the cabinet containers.
    StorageAccount,
    /// Secret vault holding the cabinet access records.
    Vault,
}

impl ResourceKind {
    /// Whether resources of this kind live inside a resource group.
    pub fn requires_parent(&self) -> bool {
        !matches!(self, ResourceKind::Group)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResourceKind::Group => "resource group",
            ResourceKind::StorageAccount => "storage account",
            ResourceKind::Vault => "key vault",
        };
        f.write_str(label)
    }
}

/// Identifying and configuration data for a managed cloud resource.
///
/// Identity is `(kind, name)` within a subscription. Group descriptors have
/// no parent; every other kind names the group it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    kind: ResourceKind,
    name: String,
    location: String,
    parent: Option<String>,
}

impl ResourceDescriptor {
    /// Create a descriptor.
    ///
    /// # Errors
    /// - `name` or `location` is empty
    /// - a group is given a parent, or a non-group is missing one
    pub fn new(
        kind: ResourceKind,
        name: impl Into<String>,
        location: impl Into<String>,
        parent: Option<String>,
    ) -> crate::Result<Self> {
        let name = name.into();
        let location = location.into();

        if name.is_empty() {
            return Err(crate::Error::InvalidInput(format!(
                "{} name cannot be empty",
                kind
            )));
        }
        if location.is_empty() {
            return Err(crate::Error::InvalidInput(format!(
                "{} '{}' needs a location",
                kind, name
            )));
        }
        match (kind.requires_parent(), parent.as_deref()) {
            (true, None) | (true, Some("")) => {
                return Err(crate::Error::InvalidInput(format!(
                    "{} '{}' must name its resource group",
                    kind, name
                )));
            }
            (false, Some(_)) => {
                return Err(crate::Error::InvalidInput(format!(
                    "resource group '{}' cannot have a parent",
                    name
                )));
            }
            _ => {}
        }

        Ok(Self {
            kind,
            name,
            location,
            parent,
        })
    }

    /// Descriptor for a resource group.
    pub fn group(name: impl Into<String>, location: impl Into<String>) -> crate::Result<Self> {
        Self::new(ResourceKind::Group, name, location, None)
    }

    /// Descriptor for a storage account inside `group`.
    pub fn storage_account(
        group: impl Into<String>,
        name: impl Into<String>,
        location: impl Into<String>,
    ) -> crate::Result<Self> {
        Self::new(ResourceKind::StorageAccount, name, location, Some(group.into()))
    }

    /// Descriptor for a key vault inside `group`.
    pub fn vault(
        group: impl Into<String>,
        name: impl Into<String>,
        location: impl Into<String>,
    ) -> crate::Result<Self> {
        Self::new(ResourceKind::Vault, name, location, Some(group.into()))
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// The parent group name, for kinds that require one.
    pub fn parent_group(&self) -> crate::Result<&str> {
        self.parent.as_deref().ok_or_else(|| {
            crate::Error::InvalidInput(format!("{} '{}' has no resource group", self.kind, self.name))
        })
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.parent {
            Some(parent) => write!(f, "{} {}/{}", self.kind, parent, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_descriptor() {
        let d = ResourceDescriptor::group("demo-rg", "westeurope").unwrap();
        assert_eq!(d.kind(), ResourceKind::Group);
        assert_eq!(d.parent(), None);
        assert_eq!(d.to_string(), "resource group demo-rg");
    }

    #[test]
    fn test_child_descriptor_requires_parent() {
        let result = ResourceDescriptor::new(ResourceKind::Vault, "demo-kv", "westeurope", None);
        assert!(matches!(result, Err(crate::Error::InvalidInput(_))));

        let vault = ResourceDescriptor::vault("demo-rg", "demo-kv", "westeurope").unwrap();
        assert_eq!(vault.parent_group().unwrap(), "demo-rg");
        assert_eq!(vault.to_string(), "key vault demo-rg/demo-kv");
    }

    #[test]
    fn test_group_rejects_parent() {
        let result = ResourceDescriptor::new(
            ResourceKind::Group,
            "demo-rg",
            "westeurope",
            Some("other".to_string()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_name_and_location_fail() {
        assert!(ResourceDescriptor::group("", "westeurope").is_err());
        assert!(ResourceDescriptor::group("demo-rg", "").is_err());
    }
}
