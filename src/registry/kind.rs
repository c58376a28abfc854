//! Closed set of resource kinds known to the registry.

use serde::{Deserialize, Serialize};

/// Length of every resource identifier prefix.
pub const PREFIX_LEN: usize = 6;

/// A cloud resource kind tracked per stack.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Azure resource group.
    ResourceGroup,
    /// Azure container app.
    ContainerApp,
    /// Azure storage account.
    StorageAccount,
    /// Blob container inside a storage account.
    StorageContainer,
    /// DNS CNAME record.
    DnsCnameRecord,
}

impl ResourceKind {
    /// Every kind, in prefix order.
    pub const ALL: [Self; 5] = [
        Self::ResourceGroup,
        Self::ContainerApp,
        Self::StorageAccount,
        Self::StorageContainer,
        Self::DnsCnameRecord,
    ];

    /// Identifier prefix assigned to the kind by default.
    #[must_use]
    pub const fn default_prefix(self) -> &'static str {
        match self {
            Self::ResourceGroup => "res000",
            Self::ContainerApp => "res001",
            Self::StorageAccount => "res002",
            Self::StorageContainer => "res003",
            Self::DnsCnameRecord => "res005",
        }
    }

    /// Terraform resource type the kind maps to.
    #[must_use]
    pub const fn terraform_type(self) -> &'static str {
        match self {
            Self::ResourceGroup => "azurerm_resource_group",
            Self::ContainerApp => "azurerm_container_app",
            Self::StorageAccount => "azurerm_storage_account",
            Self::StorageContainer => "azurerm_storage_container",
            Self::DnsCnameRecord => "azurerm_dns_cname_record",
        }
    }

    /// Snake-case name used in logs and serialized records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ResourceGroup => "resource_group",
            Self::ContainerApp => "container_app",
            Self::StorageAccount => "storage_account",
            Self::StorageContainer => "storage_container",
            Self::DnsCnameRecord => "dns_cname_record",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const fn bytes_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut i = 0;
    while i < a.len() {
        if a[i] != b[i] {
            return false;
        }
        i += 1;
    }
    true
}

const fn default_prefixes_valid(kinds: &[ResourceKind]) -> bool {
    let mut i = 0;
    while i < kinds.len() {
        let prefix = kinds[i].default_prefix().as_bytes();
        if prefix.len() != PREFIX_LEN {
            return false;
        }
        let mut j = i + 1;
        while j < kinds.len() {
            if bytes_equal(prefix, kinds[j].default_prefix().as_bytes()) {
                return false;
            }
            j += 1;
        }
        i += 1;
    }
    true
}

const _: () = assert!(
    default_prefixes_valid(&ResourceKind::ALL),
    "default resource prefixes must be distinct and six bytes long"
);
