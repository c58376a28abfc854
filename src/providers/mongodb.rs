//! Planner for the `mongodbatlas` provider.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::document::{Document, REQUIRED_PROVIDERS_KEY};
use crate::error::Result;
use crate::state::ProvisioningState;

use super::planner::{expect_object, with_defaults, PlanContext, ProviderPlanner};

/// Provider namespace.
pub const MONGODB_NAMESPACE: &str = "mongodbatlas";

/// Provider source published in the Terraform registry.
pub const MONGODB_PROVIDER_SOURCE: &str = "mongodb/mongodbatlas";

/// Provider version constraint.
pub const MONGODB_PROVIDER_VERSION: &str = "~> 1.4";

const PROJECT_KIND: &str = "mongodbatlas_project";

/// API keys and default project for Atlas resources.
#[derive(Debug, Clone, Default)]
pub struct MongoAtlasSettings {
    /// Programmatic API public key.
    pub public_key: String,
    /// Programmatic API private key.
    pub private_key: String,
    /// Project applied to resources that name none.
    pub project_id: Option<String>,
}

/// Emits the Atlas provider block and passes Atlas resources through.
#[derive(Debug, Clone)]
pub struct MongoAtlasPlanner {
    settings: MongoAtlasSettings,
}

impl MongoAtlasPlanner {
    /// Creates a planner.
    #[must_use]
    pub const fn new(settings: MongoAtlasSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl ProviderPlanner for MongoAtlasPlanner {
    fn namespace(&self) -> &'static str {
        MONGODB_NAMESPACE
    }

    async fn plan(
        &self,
        ctx: &PlanContext,
        desired: &Document,
        prior: &mut ProvisioningState,
    ) -> Result<Document> {
        let mut fragment = Document {
            terraform: desired.terraform.clone(),
            ..Document::new()
        };
        if desired.resource.is_empty() {
            info!("Stack {}: no {MONGODB_NAMESPACE} resources, nothing to plan", ctx.stack_id);
            return Ok(fragment);
        }

        let pinned = json!({"source": MONGODB_PROVIDER_SOURCE, "version": MONGODB_PROVIDER_VERSION});
        let entry = desired
            .terraform
            .get(REQUIRED_PROVIDERS_KEY)
            .and_then(|required| required.get(MONGODB_NAMESPACE))
            .map_or_else(|| pinned.clone(), |caller| with_defaults(pinned.clone(), caller));
        let mut required = Map::new();
        required.insert(MONGODB_NAMESPACE.to_string(), entry);
        fragment
            .terraform
            .insert(REQUIRED_PROVIDERS_KEY.to_string(), Value::Object(required));

        let block = json!({
            "public_key": self.settings.public_key,
            "private_key": self.settings.private_key,
        });
        let provider = desired
            .provider
            .get(MONGODB_NAMESPACE)
            .map_or_else(|| block.clone(), |caller| with_defaults(block.clone(), caller));
        fragment.provider.insert(MONGODB_NAMESPACE.to_string(), provider);

        for (kind, set) in &desired.resource {
            for (name, attributes) in set {
                expect_object(kind, name, attributes)?;
                let planned = match &self.settings.project_id {
                    Some(project_id) if kind != PROJECT_KIND => {
                        with_defaults(json!({"project_id": project_id}), attributes)
                    }
                    _ => attributes.clone(),
                };
                fragment.insert_resource(kind, name, planned);
            }
        }

        if let Some(project_id) = &self.settings.project_id {
            prior.set(MONGODB_NAMESPACE, "project_id", project_id.as_str());
        }

        Ok(fragment)
    }
}
