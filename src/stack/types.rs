//! Stack records and lifecycle status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::document::{expand_attributes, Document};
use crate::error::Result;

/// Lifecycle status of a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StackStatus {
    /// A provisioning run is in progress.
    #[default]
    Starting,
    /// The last run succeeded.
    Running,
    /// Stopped by its owner.
    Stopped,
    /// The last run failed.
    Error,
    /// Teardown is in progress.
    Deleting,
    /// Infrastructure was torn down; the record is kept.
    Deleted,
}

impl std::fmt::Display for StackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "STARTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Error => write!(f, "ERROR"),
            Self::Deleting => write!(f, "DELETING"),
            Self::Deleted => write!(f, "DELETED"),
        }
    }
}

/// Reference to the purchasable template a stack was created from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TemplateRef {
    /// Template family, e.g. `mern`.
    pub kind: String,
    /// Template variant, e.g. `free`.
    #[serde(default)]
    pub variant: String,
    /// Template version.
    #[serde(default)]
    pub version: String,
}

/// A tenant's deployed instance of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    /// Stack identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Owning project.
    pub project_id: String,
    /// Owning organization, used for resource tags.
    #[serde(default)]
    pub organization_id: Option<String>,
    /// Template reference.
    #[serde(default)]
    pub template: TemplateRef,
    /// Lifecycle status.
    #[serde(default)]
    pub status: StackStatus,
    /// Desired declarative document.
    #[serde(default)]
    pub document: Document,
    /// Flattened attribute overrides applied on top of `document`.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Document of the last successful apply, with images resolved.
    #[serde(default)]
    pub applied_document: Option<Document>,
    /// Last applied execution state (opaque executor output).
    #[serde(default)]
    pub execution_state: Option<Value>,
    /// Source-code root subdirectory inside the stack's repository.
    #[serde(default)]
    pub root_directory: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl Stack {
    /// Creates a new stack in `STARTING` status with an empty document.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, project_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            project_id: project_id.into(),
            organization_id: None,
            template: TemplateRef::default(),
            status: StackStatus::Starting,
            document: Document::new(),
            attributes: BTreeMap::new(),
            applied_document: None,
            execution_state: None,
            root_directory: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the desired document.
    #[must_use]
    pub fn with_document(mut self, document: Document) -> Self {
        self.document = document;
        self
    }

    /// Sets the owning organization.
    #[must_use]
    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    /// Changes the status and bumps `updated_at`.
    pub fn set_status(&mut self, status: StackStatus) {
        self.status = status;
        self.touch();
    }

    /// Bumps `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// The desired document with flattened attributes applied.
    ///
    /// Attribute values override values at the same path in `document`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if an attribute path is malformed.
    pub fn desired_document(&self) -> Result<Document> {
        let mut document = self.document.clone();
        if self.attributes.is_empty() {
            return Ok(document);
        }

        let overrides = expand_attributes(&self.attributes)?;
        for (kind, set) in overrides.resource {
            let target = document.resource.entry(kind).or_default();
            for (name, attributes) in set {
                match target.get_mut(&name) {
                    Some(existing) => overlay(existing, attributes),
                    None => {
                        target.insert(name, attributes);
                    }
                }
            }
        }

        Ok(document)
    }
}

/// Deep-merges `top` onto `base`.
///
/// Objects merge by key and arrays by position (`null` entries in `top`
/// keep the base element); any other value replaces.
fn overlay(base: &mut Value, top: Value) {
    match (base, top) {
        (Value::Object(base), Value::Object(top)) => {
            for (key, value) in top {
                match base.get_mut(&key) {
                    Some(existing) => overlay(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(base), Value::Array(top)) => {
            for (index, value) in top.into_iter().enumerate() {
                if value.is_null() {
                    continue;
                }
                match base.get_mut(index) {
                    Some(existing) => overlay(existing, value),
                    None => base.push(value),
                }
            }
        }
        (base, top) => *base = top,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_serialization() {
        let text = serde_json::to_string(&StackStatus::Deleting).expect("serialize");
        assert_eq!(text, "\"DELETING\"");
        assert_eq!(StackStatus::Running.to_string(), "RUNNING");
    }

    #[test]
    fn test_desired_document_applies_attributes() {
        let document = Document::from_value(json!({
            "resource": {
                "azurerm_container_app": {
                    "app-1": {"revision_mode": "Single", "template": {"container": [{"cpu": 0.5}]}}
                }
            }
        }))
        .expect("document");

        let mut stack = Stack::new("s1", "demo", "p1").with_document(document);
        stack.attributes.insert(
            String::from("azurerm_container_app.app-1.template.container[0].image"),
            String::from("acr.azurecr.io/web:latest"),
        );
        stack.attributes.insert(
            String::from("azurerm_container_app.app-1.revision_mode"),
            String::from("Multiple"),
        );

        let desired = stack.desired_document().expect("desired");
        let app = &desired.resource["azurerm_container_app"]["app-1"];
        assert_eq!(app["revision_mode"], "Multiple");
        assert_eq!(app["template"]["container"][0]["image"], "acr.azurecr.io/web:latest");
        assert_eq!(app["template"]["container"][0]["cpu"], 0.5);
    }

    #[test]
    fn test_set_status_touches() {
        let mut stack = Stack::new("s1", "demo", "p1");
        let before = stack.updated_at;
        stack.set_status(StackStatus::Error);
        assert_eq!(stack.status, StackStatus::Error);
        assert!(stack.updated_at >= before);
    }
}
