//! Validated attribute schemas for each resource kind.
//!
//! Incoming attributes are deserialized into the kind's schema struct,
//! completed with stack-derived defaults, validated, and serialized back.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use validator::{Validate, ValidationError};

use crate::error::{RegistryError, Result};

use super::kind::ResourceKind;

/// Default Azure location for new resources.
pub const DEFAULT_LOCATION: &str = "eastus";

/// Behaviour shared by every resource schema.
pub trait ResourceSchema: Serialize + DeserializeOwned + Validate {
    /// Fills computed defaults that depend on the owning stack.
    fn apply_defaults(&mut self, stack_id: &str);
}

/// Attributes of an Azure resource group.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ResourceGroupAttributes {
    /// Resource group name in Azure.
    #[serde(default)]
    #[validate(length(min = 1, max = 90))]
    pub azurerm_name: Option<String>,
    /// Azure location.
    #[serde(default = "default_location")]
    #[validate(length(min = 1))]
    pub location: String,
    /// Resource tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Attributes of an Azure container app.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ContainerAppAttributes {
    /// Logical name of the app.
    #[validate(length(min = 1, max = 32))]
    pub name: String,
    /// Container app name in Azure; defaults to `name`.
    #[serde(default)]
    #[validate(length(min = 2, max = 32))]
    pub azurerm_name: Option<String>,
    /// Owning resource group name.
    #[serde(default)]
    pub resource_group_name: Option<String>,
    /// Azure resource id, once known.
    #[serde(default)]
    pub azurerm_id: Option<String>,
}

/// Attributes of an Azure storage account.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct StorageAccountAttributes {
    /// Storage account name in Azure.
    #[serde(default)]
    #[validate(length(min = 3, max = 24))]
    pub azurerm_name: Option<String>,
    /// Azure location.
    #[serde(default = "default_location")]
    pub location: String,
    /// Performance tier.
    #[serde(default = "default_account_tier")]
    #[validate(custom(function = "validate_account_tier"))]
    pub account_tier: String,
    /// Replication strategy.
    #[serde(default = "default_replication_type")]
    #[validate(custom(function = "validate_replication_type"))]
    pub account_replication_type: String,
    /// Account kind.
    #[serde(default = "default_account_kind")]
    pub account_kind: String,
    /// Blob access tier.
    #[serde(default = "default_access_tier")]
    #[validate(custom(function = "validate_access_tier"))]
    pub access_tier: String,
    /// Minimum accepted TLS version.
    #[serde(default = "default_min_tls_version")]
    pub min_tls_version: String,
    /// Owning resource group name.
    #[serde(default)]
    pub resource_group_name: Option<String>,
    /// Resource tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Attributes of a blob container.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct StorageContainerAttributes {
    /// Container name in Azure.
    #[validate(length(min = 3, max = 63))]
    pub azurerm_name: String,
    /// Id of the owning storage account.
    #[validate(length(min = 1))]
    pub storage_account_id: String,
    /// Anonymous access level.
    #[serde(default = "default_container_access_type")]
    #[validate(custom(function = "validate_container_access_type"))]
    pub container_access_type: String,
}

/// Attributes of a DNS CNAME record.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct DnsCnameRecordAttributes {
    /// Record name.
    #[serde(default)]
    #[validate(length(min = 1, max = 63))]
    pub azurerm_name: Option<String>,
    /// DNS zone the record lives in.
    #[validate(length(min = 1))]
    pub zone_name: String,
    /// Resource group holding the zone.
    #[serde(default)]
    pub resource_group_name: Option<String>,
    /// Time to live in seconds.
    #[serde(default = "default_ttl")]
    #[validate(range(min = 1))]
    pub ttl: u32,
    /// Target host name.
    #[validate(length(min = 1))]
    pub record: String,
    /// Fully qualified name, once known.
    #[serde(default)]
    pub fqdn: Option<String>,
    /// Resource tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ResourceSchema for ResourceGroupAttributes {
    fn apply_defaults(&mut self, stack_id: &str) {
        self.azurerm_name
            .get_or_insert_with(|| format!("{stack_id}-rg"));
    }
}

impl ResourceSchema for ContainerAppAttributes {
    fn apply_defaults(&mut self, stack_id: &str) {
        if self.azurerm_name.is_none() {
            self.azurerm_name = Some(self.name.clone());
        }
        self.resource_group_name
            .get_or_insert_with(|| format!("{stack_id}-rg"));
    }
}

impl ResourceSchema for StorageAccountAttributes {
    fn apply_defaults(&mut self, stack_id: &str) {
        self.azurerm_name
            .get_or_insert_with(|| storage_account_name(stack_id));
        self.resource_group_name
            .get_or_insert_with(|| format!("{stack_id}-rg"));
    }
}

impl ResourceSchema for StorageContainerAttributes {
    fn apply_defaults(&mut self, _stack_id: &str) {}
}

impl ResourceSchema for DnsCnameRecordAttributes {
    fn apply_defaults(&mut self, stack_id: &str) {
        self.azurerm_name
            .get_or_insert_with(|| format!("{stack_id}-cname"));
        self.resource_group_name
            .get_or_insert_with(|| format!("{stack_id}-rg"));
    }
}

/// Validates `data` against the kind's schema and fills defaults.
///
/// # Errors
///
/// Returns [`RegistryError::Schema`] if the data does not match the schema.
pub fn normalize(kind: ResourceKind, stack_id: &str, data: Value) -> Result<Map<String, Value>> {
    match kind {
        ResourceKind::ResourceGroup => normalize_as::<ResourceGroupAttributes>(kind, stack_id, data),
        ResourceKind::ContainerApp => normalize_as::<ContainerAppAttributes>(kind, stack_id, data),
        ResourceKind::StorageAccount => {
            normalize_as::<StorageAccountAttributes>(kind, stack_id, data)
        }
        ResourceKind::StorageContainer => {
            normalize_as::<StorageContainerAttributes>(kind, stack_id, data)
        }
        ResourceKind::DnsCnameRecord => {
            normalize_as::<DnsCnameRecordAttributes>(kind, stack_id, data)
        }
    }
}

fn normalize_as<S: ResourceSchema>(
    kind: ResourceKind,
    stack_id: &str,
    data: Value,
) -> Result<Map<String, Value>> {
    let schema_error = |message: String| RegistryError::Schema {
        kind: kind.to_string(),
        message,
    };

    let mut attributes: S = serde_json::from_value(data).map_err(|e| schema_error(e.to_string()))?;
    attributes.apply_defaults(stack_id);
    attributes
        .validate()
        .map_err(|e| schema_error(e.to_string()))?;

    match serde_json::to_value(attributes).map_err(|e| schema_error(e.to_string()))? {
        Value::Object(map) => Ok(map),
        _ => Err(schema_error(String::from("attributes must be an object")).into()),
    }
}

/// Azure storage account names are 3-24 lowercase alphanumerics.
fn storage_account_name(stack_id: &str) -> String {
    let mut name: String = stack_id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    name.truncate(22);
    name.push_str("sa");
    name
}

fn one_of(value: &str, allowed: &[&str], code: &'static str) -> std::result::Result<(), ValidationError> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        let mut error = ValidationError::new(code);
        error.message = Some(format!("'{value}' is not one of {}", allowed.join(", ")).into());
        Err(error)
    }
}

fn validate_account_tier(value: &str) -> std::result::Result<(), ValidationError> {
    one_of(value, &["Standard", "Premium"], "account_tier")
}

fn validate_replication_type(value: &str) -> std::result::Result<(), ValidationError> {
    one_of(
        value,
        &["LRS", "GRS", "RAGRS", "ZRS", "GZRS", "RAGZRS"],
        "account_replication_type",
    )
}

fn validate_access_tier(value: &str) -> std::result::Result<(), ValidationError> {
    one_of(value, &["Hot", "Cool"], "access_tier")
}

fn validate_container_access_type(value: &str) -> std::result::Result<(), ValidationError> {
    one_of(value, &["private", "blob", "container"], "container_access_type")
}

fn default_location() -> String {
    String::from(DEFAULT_LOCATION)
}

fn default_account_tier() -> String {
    String::from("Standard")
}

fn default_replication_type() -> String {
    String::from("LRS")
}

fn default_account_kind() -> String {
    String::from("StorageV2")
}

fn default_access_tier() -> String {
    String::from("Hot")
}

fn default_min_tls_version() -> String {
    String::from("TLS1_2")
}

fn default_container_access_type() -> String {
    String::from("private")
}

const fn default_ttl() -> u32 {
    3600
}
