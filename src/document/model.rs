//! The declarative document handed to the infrastructure executor.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{PlanError, Result, StateError};

/// Attribute key holding a container image reference.
pub const IMAGE_KEY: &str = "image";

/// Key marking an `image` value as an unresolved build task.
pub const BUILD_TASK_KEY: &str = "task";

/// `terraform` key listing provider sources and version constraints.
pub const REQUIRED_PROVIDERS_KEY: &str = "required_providers";

/// Placeholder printed in place of credential values.
pub const REDACTED: &str = "(sensitive)";

/// Attribute names whose string values are credentials.
const SENSITIVE_KEYS: &[&str] = &[
    "client_secret",
    "private_key",
    "password",
    "access_key",
    "primary_access_key",
    "secret_key",
];

/// Container-app block whose entries carry a secret `value`.
const SECRET_BLOCK_KEY: &str = "secret";

/// Resources of one kind, keyed by resource name.
pub type ResourceSet = BTreeMap<String, Value>;

/// Merged provider and resource configuration in Terraform JSON syntax.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Top-level `terraform` settings such as `required_providers`.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub terraform: Map<String, Value>,
    /// Provider name to provider settings.
    #[serde(default)]
    pub provider: BTreeMap<String, Value>,
    /// Resource kind to resource name to attributes.
    #[serde(default)]
    pub resource: BTreeMap<String, ResourceSet>,
}

impl Document {
    /// Creates an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a document from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON does not describe a document.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse document: {e}")).into())
    }

    /// Converts an arbitrary JSON value into a document.
    ///
    /// # Errors
    ///
    /// Returns an error if the value does not describe a document.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| StateError::corrupted(format!("Failed to parse document: {e}")).into())
    }

    /// Serializes the document as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            StateError::serialization(format!("Failed to serialize document: {e}")).into()
        })
    }

    /// Copy of the document with credential values replaced by [`REDACTED`].
    ///
    /// Masks provider and resource attributes named in the sensitive key
    /// list and the `value` of every `secret` block entry.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.provider.values_mut().for_each(redact);
        copy.resource
            .values_mut()
            .flat_map(BTreeMap::values_mut)
            .for_each(redact);
        copy
    }

    /// Converts the document into a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Returns true if the document has no providers, resources or settings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terraform.is_empty() && self.provider.is_empty() && self.resource.is_empty()
    }

    /// Total number of resources across all kinds.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.resource.values().map(BTreeMap::len).sum()
    }

    /// Inserts or replaces one resource.
    pub fn insert_resource(&mut self, kind: &str, name: &str, attributes: Value) {
        self.resource
            .entry(kind.to_string())
            .or_default()
            .insert(name.to_string(), attributes);
    }

    /// Returns the resources of a kind, if any.
    #[must_use]
    pub fn resources_of(&self, kind: &str) -> Option<&ResourceSet> {
        self.resource.get(kind)
    }

    /// Returns true if the resource kind belongs to the provider namespace.
    #[must_use]
    pub fn kind_in_namespace(kind: &str, namespace: &str) -> bool {
        kind.strip_prefix(namespace)
            .is_some_and(|rest| rest.starts_with('_'))
    }

    /// Extracts the part of the document owned by one provider namespace.
    ///
    /// Only resource kinds named `<namespace>_*`, the provider entry of
    /// the same name and its `required_providers` entry are carried over.
    #[must_use]
    pub fn namespace_subset(&self, namespace: &str) -> Self {
        let resource = self
            .resource
            .iter()
            .filter(|(kind, _)| Self::kind_in_namespace(kind, namespace))
            .map(|(kind, set)| (kind.clone(), set.clone()))
            .collect();

        let provider = self
            .provider
            .get(namespace)
            .map(|settings| BTreeMap::from([(namespace.to_string(), settings.clone())]))
            .unwrap_or_default();

        let mut terraform = Map::new();
        if let Some(entry) = self
            .terraform
            .get(REQUIRED_PROVIDERS_KEY)
            .and_then(|required| required.get(namespace))
        {
            let mut required = Map::new();
            required.insert(namespace.to_string(), entry.clone());
            terraform.insert(REQUIRED_PROVIDERS_KEY.to_string(), Value::Object(required));
        }

        Self {
            terraform,
            provider,
            resource,
        }
    }

    /// Everything not owned by any of the given namespaces.
    ///
    /// `required_providers` entries of those namespaces are dropped along
    /// with their resources.
    #[must_use]
    pub fn without_namespaces(&self, namespaces: &[&str]) -> Self {
        let owned = |kind: &str| namespaces.iter().any(|ns| Self::kind_in_namespace(kind, ns));

        let mut terraform = self.terraform.clone();
        let emptied = match terraform.get_mut(REQUIRED_PROVIDERS_KEY) {
            Some(Value::Object(required)) => {
                required.retain(|name, _| !namespaces.contains(&name.as_str()));
                required.is_empty()
            }
            _ => false,
        };
        if emptied {
            terraform.remove(REQUIRED_PROVIDERS_KEY);
        }

        Self {
            terraform,
            provider: self
                .provider
                .iter()
                .filter(|(name, _)| !namespaces.contains(&name.as_str()))
                .map(|(name, settings)| (name.clone(), settings.clone()))
                .collect(),
            resource: self
                .resource
                .iter()
                .filter(|(kind, _)| !owned(kind))
                .map(|(kind, set)| (kind.clone(), set.clone()))
                .collect(),
        }
    }

    /// Merges a fragment into this document without overwriting anything.
    ///
    /// New resource kinds, new resource names and new provider entries are
    /// added. An existing entry may only be "merged" with an identical value.
    /// Nested `terraform` settings are merged key by key under the same rule.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::MergeConflict`] naming the first conflicting path.
    /// The document is left untouched on error.
    pub fn merge(&mut self, fragment: Self, planner: &str) -> Result<()> {
        let conflict = |path: String| PlanError::MergeConflict {
            planner: planner.to_string(),
            path,
        };

        for (name, settings) in &fragment.provider {
            if self.provider.get(name).is_some_and(|existing| existing != settings) {
                return Err(conflict(format!("provider.{name}")).into());
            }
        }

        for (kind, set) in &fragment.resource {
            if let Some(existing_set) = self.resource.get(kind) {
                for (name, attributes) in set {
                    if existing_set.get(name).is_some_and(|existing| existing != attributes) {
                        return Err(conflict(format!("resource.{kind}.{name}")).into());
                    }
                }
            }
        }

        let mut terraform = self.terraform.clone();
        merge_settings(&mut terraform, fragment.terraform, "terraform")
            .map_err(conflict)?;

        self.terraform = terraform;
        self.provider.extend(fragment.provider);
        for (kind, set) in fragment.resource {
            self.resource.entry(kind).or_default().extend(set);
        }

        Ok(())
    }

    /// Every `image` attribute that is still a build task, in document order.
    #[must_use]
    pub fn build_task_slots(&self) -> Vec<BuildTaskSlot> {
        let mut slots = Vec::new();
        for (kind, set) in &self.resource {
            for (name, attributes) in set {
                let mut found = Vec::new();
                collect_build_tasks(attributes, &format!("{kind}.{name}"), "", &mut found);
                slots.extend(found.into_iter().map(|(path, pointer)| BuildTaskSlot {
                    kind: kind.clone(),
                    name: name.clone(),
                    pointer,
                    path,
                }));
            }
        }
        slots
    }

    /// Dotted paths of every `image` attribute that is still a build task.
    #[must_use]
    pub fn build_task_paths(&self) -> Vec<String> {
        self.build_task_slots().into_iter().map(|s| s.path).collect()
    }

    /// The task definition held at a slot, if it is still unresolved.
    #[must_use]
    pub fn build_task(&self, slot: &BuildTaskSlot) -> Option<&Value> {
        self.resource
            .get(&slot.kind)?
            .get(&slot.name)?
            .pointer(&slot.pointer)?
            .get(BUILD_TASK_KEY)
    }

    /// Replaces the build task at a slot with a resolved image reference.
    ///
    /// Returns false if the slot no longer exists.
    pub fn resolve_build_task(&mut self, slot: &BuildTaskSlot, image: impl Into<String>) -> bool {
        let target = self
            .resource
            .get_mut(&slot.kind)
            .and_then(|set| set.get_mut(&slot.name))
            .and_then(|attributes| attributes.pointer_mut(&slot.pointer));
        match target {
            Some(value) => {
                *value = Value::String(image.into());
                true
            }
            None => false,
        }
    }

    /// Returns true if any build-task placeholder remains.
    #[must_use]
    pub fn has_build_tasks(&self) -> bool {
        !self.build_task_paths().is_empty()
    }

    /// Fails if any build-task placeholder remains.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::UnresolvedBuildTasks`] with the placeholder count.
    pub fn ensure_resolved(&self) -> Result<()> {
        let count = self.build_task_paths().len();
        if count == 0 {
            Ok(())
        } else {
            Err(PlanError::UnresolvedBuildTasks { count }.into())
        }
    }
}

/// Position of an unresolved build task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTaskSlot {
    /// Resource kind.
    pub kind: String,
    /// Resource name.
    pub name: String,
    /// JSON pointer to the `image` value inside the resource attributes.
    pub pointer: String,
    /// Dotted path for messages, e.g. `kind.name.template.container[0].image`.
    pub path: String,
}

/// Returns true if the value is a build-task placeholder.
#[must_use]
pub fn is_build_task(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|object| object.contains_key(BUILD_TASK_KEY))
}

fn collect_build_tasks(
    value: &Value,
    path: &str,
    pointer: &str,
    found: &mut Vec<(String, String)>,
) {
    match value {
        Value::Object(object) => {
            for (key, child) in object {
                let child_path = format!("{path}.{key}");
                let child_pointer = format!("{pointer}/{}", key.replace('~', "~0").replace('/', "~1"));
                if key == IMAGE_KEY && is_build_task(child) {
                    found.push((child_path, child_pointer));
                } else {
                    collect_build_tasks(child, &child_path, &child_pointer, found);
                }
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                collect_build_tasks(
                    child,
                    &format!("{path}[{index}]"),
                    &format!("{pointer}/{index}"),
                    found,
                );
            }
        }
        _ => {}
    }
}

fn redact(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if child.is_string() && SENSITIVE_KEYS.contains(&key.as_str()) {
                    *child = Value::from(REDACTED);
                    continue;
                }
                if key == SECRET_BLOCK_KEY {
                    let entries = child.as_array_mut().into_iter().flatten();
                    for entry in entries.filter_map(Value::as_object_mut) {
                        if let Some(secret) = entry.get_mut("value") {
                            *secret = Value::from(REDACTED);
                        }
                    }
                }
                redact(child);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact),
        _ => {}
    }
}

fn merge_settings(
    target: &mut Map<String, Value>,
    source: Map<String, Value>,
    path: &str,
) -> std::result::Result<(), String> {
    for (key, value) in source {
        let child_path = format!("{path}.{key}");
        match target.get_mut(&key) {
            None => {
                target.insert(key, value);
            }
            Some(existing) if *existing == value => {}
            Some(Value::Object(existing)) => match value {
                Value::Object(incoming) => merge_settings(existing, incoming, &child_path)?,
                _ => return Err(child_path),
            },
            Some(_) => return Err(child_path),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Document {
        Document::from_value(json!({
            "provider": {"azurerm": {"features": {}}},
            "resource": {
                "azurerm_resource_group": {"rg": {"name": "s1-rg"}},
                "azurerm_container_app": {
                    "app": {"template": {"container": [{"image": {"task": {"location": "eastus"}}}]}}
                },
                "mongodbatlas_project": {"p": {"name": "proj"}},
                "random_password": {"pw": {"length": 16}}
            }
        }))
        .expect("sample document")
    }

    #[test]
    fn test_namespace_subset() {
        let doc = sample();
        let azure = doc.namespace_subset("azurerm");
        assert_eq!(azure.resource.len(), 2);
        assert!(azure.provider.contains_key("azurerm"));

        let mongo = doc.namespace_subset("mongodbatlas");
        assert_eq!(mongo.resource.len(), 1);
        assert!(mongo.provider.is_empty());

        let rest = doc.without_namespaces(&["azurerm", "mongodbatlas"]);
        assert_eq!(rest.resource.keys().collect::<Vec<_>>(), vec!["random_password"]);
        assert!(rest.provider.is_empty());
    }

    #[test]
    fn test_namespace_subset_carries_required_provider_entry() {
        let mut doc = sample();
        doc.terraform.insert(
            REQUIRED_PROVIDERS_KEY.to_string(),
            json!({"mongodbatlas": {"version": "~> 1.15"}, "random": {"source": "hashicorp/random"}}),
        );
        doc.terraform.insert(String::from("required_version"), json!(">= 1.5"));

        let mongo = doc.namespace_subset("mongodbatlas");
        assert_eq!(
            Value::Object(mongo.terraform),
            json!({"required_providers": {"mongodbatlas": {"version": "~> 1.15"}}})
        );
        assert!(doc.namespace_subset("azurerm").terraform.is_empty());

        let rest = doc.without_namespaces(&["azurerm", "mongodbatlas"]);
        assert_eq!(
            Value::Object(rest.terraform),
            json!({
                "required_providers": {"random": {"source": "hashicorp/random"}},
                "required_version": ">= 1.5"
            })
        );
    }

    #[test]
    fn test_redacted_masks_credentials() {
        let doc = Document::from_value(json!({
            "provider": {
                "azurerm": {"client_id": "client", "client_secret": "arm-secret"},
                "mongodbatlas": {"public_key": "pub", "private_key": "atlas-key"}
            },
            "resource": {
                "azurerm_container_app": {"web": {
                    "registry": [{"server": "cr.azurecr.io", "password_secret_name": "acr-password"}],
                    "secret": [{"name": "acr-password", "value": "acr-pw"}]
                }},
                "mongodbatlas_database_user": {"app": {"username": "app", "password": "db-pw"}}
            }
        }))
        .expect("document");

        let redacted = doc.redacted();
        let text = redacted.to_json_pretty().expect("json");
        for secret in ["arm-secret", "atlas-key", "acr-pw", "db-pw"] {
            assert!(!text.contains(secret), "{secret} leaked");
        }

        let app = &redacted.resource["azurerm_container_app"]["web"];
        assert_eq!(app["secret"][0]["name"], "acr-password");
        assert_eq!(app["secret"][0]["value"], REDACTED);
        assert_eq!(app["registry"][0]["password_secret_name"], "acr-password");
        assert_eq!(redacted.provider["mongodbatlas"]["public_key"], "pub");
        assert_eq!(doc.provider["azurerm"]["client_secret"], "arm-secret");
    }

    #[test]
    fn test_namespace_requires_separator() {
        assert!(Document::kind_in_namespace("azurerm_container_app", "azurerm"));
        assert!(!Document::kind_in_namespace("azurermx_thing", "azurerm"));
        assert!(!Document::kind_in_namespace("azurerm", "azurerm"));
    }

    #[test]
    fn test_merge_adds_kinds_and_names() {
        let mut doc = Document::new();
        let mut first = Document::new();
        first.insert_resource("azurerm_resource_group", "rg", json!({"name": "a"}));
        doc.merge(first, "azurerm").expect("first merge");

        let mut second = Document::new();
        second.insert_resource("azurerm_resource_group", "rg2", json!({"name": "b"}));
        second.insert_resource("mongodbatlas_project", "p", json!({"name": "c"}));
        second.provider.insert(String::from("mongodbatlas"), json!({}));
        doc.merge(second, "mongodbatlas").expect("second merge");

        assert_eq!(doc.resource_count(), 3);
        assert_eq!(doc.provider.len(), 1);
    }

    #[test]
    fn test_merge_rejects_overwrite() {
        let mut doc = Document::new();
        let mut first = Document::new();
        first.insert_resource("azurerm_resource_group", "rg", json!({"name": "a"}));
        doc.merge(first, "azurerm").expect("first merge");

        let mut second = Document::new();
        second.insert_resource("azurerm_resource_group", "rg", json!({"name": "hijacked"}));
        second.insert_resource("other_kind", "x", json!({}));
        let err = doc.merge(second, "other").expect_err("overwrite must fail");

        assert!(err.to_string().contains("resource.azurerm_resource_group.rg"));
        assert_eq!(doc.resource_count(), 1);
        assert_eq!(doc.resource["azurerm_resource_group"]["rg"]["name"], "a");
    }

    #[test]
    fn test_merge_terraform_settings() {
        let mut doc = Document::new();
        let mut first = Document::new();
        first.terraform.insert(
            String::from("required_providers"),
            json!({"azurerm": {"source": "hashicorp/azurerm"}}),
        );
        doc.merge(first, "azurerm").expect("first merge");

        let mut second = Document::new();
        second.terraform.insert(
            String::from("required_providers"),
            json!({"mongodbatlas": {"source": "mongodb/mongodbatlas"}}),
        );
        doc.merge(second, "mongodbatlas").expect("second merge");

        let providers = doc.terraform["required_providers"].as_object().expect("object");
        assert_eq!(providers.len(), 2);
    }

    #[test]
    fn test_build_task_detection() {
        let doc = sample();
        assert_eq!(
            doc.build_task_paths(),
            vec!["azurerm_container_app.app.template.container[0].image"]
        );
        assert!(doc.ensure_resolved().is_err());

        let mut resolved = doc;
        resolved.insert_resource(
            "azurerm_container_app",
            "app",
            json!({"template": {"container": [{"image": "acr.azurecr.io/app:latest"}]}}),
        );
        assert!(!resolved.has_build_tasks());
        assert!(resolved.ensure_resolved().is_ok());
    }

    #[test]
    fn test_resolve_build_task_slot() {
        let mut doc = sample();
        let slots = doc.build_task_slots();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].pointer, "/template/container/0/image");
        assert_eq!(doc.build_task(&slots[0]), Some(&json!({"location": "eastus"})));

        assert!(doc.resolve_build_task(&slots[0], "acr.azurecr.io/app:latest"));
        assert!(doc.build_task(&slots[0]).is_none());
        assert_eq!(
            doc.resource["azurerm_container_app"]["app"]["template"]["container"][0]["image"],
            "acr.azurecr.io/app:latest"
        );
    }
}
