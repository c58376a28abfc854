//! Planner for the `azurerm` provider.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::document::Document;
use crate::error::Result;
use crate::registry::DEFAULT_LOCATION;
use crate::state::ProvisioningState;

use super::planner::{expect_object, with_defaults, PlanContext, ProviderPlanner};

/// Provider namespace.
pub const AZURE_NAMESPACE: &str = "azurerm";

const RESOURCE_GROUP: &str = "azurerm_resource_group";
const CONTAINER_APP_ENVIRONMENT: &str = "azurerm_container_app_environment";
const CONTAINER_APP: &str = "azurerm_container_app";

/// Resource name used for the planned resource group.
const RESOURCE_GROUP_KEY: &str = "rg";

/// Resource name used for the planned container-app environment.
const ENVIRONMENT_KEY: &str = "env";

/// Secret holding the registry password inside each container app.
const REGISTRY_SECRET: &str = "acr-password";

/// Prior-state key for the allocated resource group name.
pub const RESOURCE_GROUP_NAME_KEY: &str = "resource_group_name";

/// Prior-state key for the allocated environment name.
pub const ENVIRONMENT_NAME_KEY: &str = "container_app_environment_name";

/// Kinds that live in a region inside the stack's resource group.
const REGIONAL_KINDS: &[&str] = &[
    "azurerm_storage_account",
    "azurerm_log_analytics_workspace",
    "azurerm_key_vault",
    "azurerm_container_registry",
    "azurerm_user_assigned_identity",
];

/// Kinds that only need the stack's resource group.
const GROUPED_KINDS: &[&str] = &["azurerm_dns_zone", "azurerm_dns_cname_record"];

/// Credentials and placement for Azure resources.
#[derive(Debug, Clone, Default)]
pub struct AzureProviderSettings {
    /// Subscription to deploy into.
    pub subscription_id: String,
    /// Directory (tenant) identifier.
    pub tenant_id: String,
    /// Service principal application identifier.
    pub client_id: String,
    /// Service principal secret.
    pub client_secret: String,
    /// Default region.
    pub location: String,
    /// Container registry images are pulled from, if any.
    pub registry_name: Option<String>,
    /// Password for the registry's admin user.
    pub registry_password: Option<String>,
}

/// Fills in Azure defaults and wires resources to the stack's resource
/// group and container-app environment.
#[derive(Debug, Clone)]
pub struct AzurePlanner {
    settings: AzureProviderSettings,
}

impl AzurePlanner {
    /// Creates a planner. An empty location falls back to `eastus`.
    #[must_use]
    pub fn new(mut settings: AzureProviderSettings) -> Self {
        if settings.location.is_empty() {
            settings.location = DEFAULT_LOCATION.to_string();
        }
        Self { settings }
    }

    fn provider_block(&self) -> Value {
        json!({
            "features": {},
            "subscription_id": self.settings.subscription_id,
            "tenant_id": self.settings.tenant_id,
            "client_id": self.settings.client_id,
            "client_secret": self.settings.client_secret,
        })
    }

    fn registry_defaults(&self) -> Option<(Value, Value)> {
        let registry = self.settings.registry_name.as_deref()?;
        let password = self.settings.registry_password.as_deref().unwrap_or_default();
        Some((
            json!([{
                "server": format!("{registry}.azurecr.io"),
                "username": registry,
                "password_secret_name": REGISTRY_SECRET,
            }]),
            json!({"name": REGISTRY_SECRET, "value": password}),
        ))
    }

    fn container_app(
        &self,
        ctx: &PlanContext,
        index: usize,
        name: &str,
        caller: &Map<String, Value>,
        links: &Links,
    ) -> Value {
        let mut defaults = json!({
            "name": format!("container-app-{index}").replace('_', "-"),
            "resource_group_name": links.resource_group_name,
            "container_app_environment_id": links.environment_id,
            "revision_mode": "Single",
            "ingress": {
                "external_enabled": true,
                "target_port": 80,
                "transport": "auto",
                "traffic_weight": [{"latest_revision": true, "percentage": 100}],
            },
            "tags": ctx.tags(),
        });

        let mut secrets: Vec<Value> = caller
            .get("secret")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if let Some((registry, secret)) = self.registry_defaults() {
            defaults["registry"] = registry;
            let present = secrets
                .iter()
                .any(|s| s.get("name").and_then(Value::as_str) == Some(REGISTRY_SECRET));
            if !present {
                secrets.insert(0, secret);
            }
        }

        let caller_value = Value::Object(caller.clone());
        let mut app = with_defaults(defaults, &caller_value);
        if !secrets.is_empty() {
            app["secret"] = Value::Array(secrets);
        }

        let template = caller.get("template").cloned().unwrap_or_else(|| json!({}));
        app["template"] = container_template(name, &template);
        app
    }
}

/// Interpolated references shared by planned resources.
struct Links {
    resource_group_name: String,
    environment_id: String,
}

fn container_template(resource: &str, caller: &Value) -> Value {
    let mut template = with_defaults(json!({"min_replicas": 0, "max_replicas": 10}), caller);

    if let Some(containers) = template.get_mut("container").and_then(Value::as_array_mut) {
        for (index, container) in containers.iter_mut().enumerate() {
            let defaults = json!({
                "name": format!("{resource}-container-{index}").replace('_', "-"),
                "cpu": 0.25,
                "memory": "0.5Gi",
                "env": [],
            });
            *container = with_defaults(defaults, container);
        }
    }

    template
}

/// First resource name of a kind, or the planner's own key.
fn entry_key<'a>(desired: &'a Document, kind: &str, fallback: &'a str) -> &'a str {
    desired
        .resources_of(kind)
        .and_then(|set| set.keys().next())
        .map_or(fallback, String::as_str)
}

#[async_trait]
impl ProviderPlanner for AzurePlanner {
    fn namespace(&self) -> &'static str {
        AZURE_NAMESPACE
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
            info!("Stack {}: no {AZURE_NAMESPACE} resources, nothing to plan", ctx.stack_id);
            return Ok(fragment);
        }

        let provider = desired
            .provider
            .get(AZURE_NAMESPACE)
            .map_or_else(|| self.provider_block(), |caller| with_defaults(self.provider_block(), caller));
        fragment.provider.insert(AZURE_NAMESPACE.to_string(), provider);

        let rg_name = prior
            .get(AZURE_NAMESPACE, RESOURCE_GROUP_NAME_KEY)
            .map_or_else(|| format!("{}-rg", ctx.stack_id), str::to_string);
        let rg_key = entry_key(desired, RESOURCE_GROUP, RESOURCE_GROUP_KEY);
        let rg_defaults = json!({
            "name": rg_name,
            "location": self.settings.location,
            "tags": ctx.tags(),
        });
        let rg_caller = desired
            .resources_of(RESOURCE_GROUP)
            .and_then(|set| set.get(rg_key))
            .cloned()
            .unwrap_or_else(|| json!({}));
        expect_object(RESOURCE_GROUP, rg_key, &rg_caller)?;
        let rg = with_defaults(rg_defaults, &rg_caller);
        let rg_name = rg
            .get("name")
            .and_then(Value::as_str)
            .map_or(rg_name, str::to_string);
        let region = rg
            .get("location")
            .and_then(Value::as_str)
            .unwrap_or(&self.settings.location)
            .to_string();
        fragment.insert_resource(RESOURCE_GROUP, rg_key, rg);
        prior.set(AZURE_NAMESPACE, RESOURCE_GROUP_NAME_KEY, rg_name);

        let links = Links {
            resource_group_name: format!("${{{RESOURCE_GROUP}.{rg_key}.name}}"),
            environment_id: String::new(),
        };

        let apps = desired.resources_of(CONTAINER_APP);
        let wants_environment =
            apps.is_some_and(|set| !set.is_empty()) || desired.resources_of(CONTAINER_APP_ENVIRONMENT).is_some();

        let links = if wants_environment {
            let env_name = prior
                .get(AZURE_NAMESPACE, ENVIRONMENT_NAME_KEY)
                .map_or_else(|| format!("{}-ca-env", ctx.stack_id), str::to_string);
            let env_key = entry_key(desired, CONTAINER_APP_ENVIRONMENT, ENVIRONMENT_KEY);
            let env_caller = desired
                .resources_of(CONTAINER_APP_ENVIRONMENT)
                .and_then(|set| set.get(env_key))
                .cloned()
                .unwrap_or_else(|| json!({}));
            expect_object(CONTAINER_APP_ENVIRONMENT, env_key, &env_caller)?;

            let env = with_defaults(
                json!({
                    "name": env_name,
                    "location": region,
                    "resource_group_name": links.resource_group_name,
                    "tags": ctx.tags(),
                }),
                &env_caller,
            );
            fragment.insert_resource(CONTAINER_APP_ENVIRONMENT, env_key, env);
            prior.set(AZURE_NAMESPACE, ENVIRONMENT_NAME_KEY, env_name);

            Links {
                environment_id: format!("${{{CONTAINER_APP_ENVIRONMENT}.{env_key}.id}}"),
                ..links
            }
        } else {
            links
        };

        for (kind, set) in &desired.resource {
            if kind == RESOURCE_GROUP || kind == CONTAINER_APP_ENVIRONMENT {
                for (name, attributes) in set {
                    if !fragment.resources_of(kind).is_some_and(|s| s.contains_key(name)) {
                        expect_object(kind, name, attributes)?;
                        fragment.insert_resource(kind, name, attributes.clone());
                    }
                }
                continue;
            }

            for (index, (name, attributes)) in set.iter().enumerate() {
                let caller = expect_object(kind, name, attributes)?;
                let planned = if kind == CONTAINER_APP {
                    self.container_app(ctx, index, name, caller, &links)
                } else if REGIONAL_KINDS.contains(&kind.as_str()) {
                    with_defaults(
                        json!({
                            "location": region,
                            "resource_group_name": links.resource_group_name,
                            "tags": ctx.tags(),
                        }),
                        attributes,
                    )
                } else if GROUPED_KINDS.contains(&kind.as_str()) {
                    with_defaults(
                        json!({"resource_group_name": links.resource_group_name}),
                        attributes,
                    )
                } else {
                    attributes.clone()
                };
                fragment.insert_resource(kind, name, planned);
            }
        }

        debug!(
            "Stack {}: {AZURE_NAMESPACE} fragment has {} resource(s)",
            ctx.stack_id,
            fragment.resource_count()
        );
        Ok(fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner() -> AzurePlanner {
        AzurePlanner::new(AzureProviderSettings {
            subscription_id: String::from("sub"),
            tenant_id: String::from("tenant"),
            client_id: String::from("client"),
            client_secret: String::from("secret"),
            location: String::new(),
            registry_name: Some(String::from("deployboxcr")),
            registry_password: Some(String::from("pw")),
        })
    }

    fn ctx() -> PlanContext {
        PlanContext::new("stack123", "proj1").with_organization(Some(String::from("org1")))
    }

    #[tokio::test]
    async fn test_empty_input_is_noop() {
        let mut state = ProvisioningState::new();
        let fragment = planner()
            .plan(&ctx(), &Document::new(), &mut state)
            .await
            .expect("plan");
        assert!(fragment.is_empty());
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_container_app_defaults() {
        let desired = Document::from_value(json!({
            "resource": {"azurerm_container_app": {
                "web_app": {
                    "ingress": {"target_port": 3000},
                    "template": {"container": [{"image": "nginx:latest", "cpu": 0.5}]}
                }
            }}
        }))
        .expect("desired");

        let mut state = ProvisioningState::new();
        let fragment = planner().plan(&ctx(), &desired, &mut state).await.expect("plan");

        assert_eq!(fragment.provider["azurerm"]["features"], json!({}));
        assert_eq!(fragment.provider["azurerm"]["client_secret"], "secret");

        let rg = &fragment.resource["azurerm_resource_group"]["rg"];
        assert_eq!(rg["name"], "stack123-rg");
        assert_eq!(rg["location"], "eastus");
        assert_eq!(rg["tags"]["organization"], "org1");

        let env = &fragment.resource["azurerm_container_app_environment"]["env"];
        assert_eq!(env["name"], "stack123-ca-env");
        assert_eq!(env["resource_group_name"], "${azurerm_resource_group.rg.name}");

        let app = &fragment.resource["azurerm_container_app"]["web_app"];
        assert_eq!(app["name"], "container-app-0");
        assert_eq!(app["revision_mode"], "Single");
        assert_eq!(
            app["container_app_environment_id"],
            "${azurerm_container_app_environment.env.id}"
        );
        assert_eq!(app["ingress"]["target_port"], 3000);
        assert_eq!(app["ingress"]["external_enabled"], true);
        assert_eq!(app["ingress"]["traffic_weight"][0]["percentage"], 100);
        assert_eq!(app["registry"][0]["server"], "deployboxcr.azurecr.io");
        assert_eq!(app["secret"][0]["name"], "acr-password");
        assert_eq!(app["template"]["min_replicas"], 0);
        assert_eq!(app["template"]["max_replicas"], 10);

        let container = &app["template"]["container"][0];
        assert_eq!(container["name"], "web-app-container-0");
        assert_eq!(container["cpu"], 0.5);
        assert_eq!(container["memory"], "0.5Gi");
        assert_eq!(container["image"], "nginx:latest");

        assert_eq!(state.get("azurerm", RESOURCE_GROUP_NAME_KEY), Some("stack123-rg"));
        assert_eq!(state.get("azurerm", ENVIRONMENT_NAME_KEY), Some("stack123-ca-env"));
    }

    #[tokio::test]
    async fn test_caller_values_and_prior_allocations_win() {
        let desired = Document::from_value(json!({
            "resource": {
                "azurerm_resource_group": {"main": {"location": "westeurope"}},
                "azurerm_container_app": {"api": {
                    "name": "api",
                    "secret": [{"name": "acr-password", "value": "override"}],
                    "template": {"container": [{"image": {"task": {}}}]}
                }},
                "azurerm_storage_account": {"files": {"name": "stack123sa"}},
                "azurerm_storage_container": {"uploads": {"name": "uploads"}}
            }
        }))
        .expect("desired");

        let mut state = ProvisioningState::new();
        state.set("azurerm", RESOURCE_GROUP_NAME_KEY, "legacy-rg");

        let fragment = planner().plan(&ctx(), &desired, &mut state).await.expect("plan");

        let rg = &fragment.resource["azurerm_resource_group"]["main"];
        assert_eq!(rg["name"], "legacy-rg");
        assert_eq!(rg["location"], "westeurope");

        let app = &fragment.resource["azurerm_container_app"]["api"];
        assert_eq!(app["name"], "api");
        assert_eq!(app["resource_group_name"], "${azurerm_resource_group.main.name}");
        assert_eq!(app["secret"].as_array().map(Vec::len), Some(1));
        assert_eq!(app["secret"][0]["value"], "override");
        assert_eq!(app["template"]["container"][0]["image"], json!({"task": {}}));

        let storage = &fragment.resource["azurerm_storage_account"]["files"];
        assert_eq!(storage["location"], "westeurope");
        assert_eq!(storage["resource_group_name"], "${azurerm_resource_group.main.name}");

        assert_eq!(
            fragment.resource["azurerm_storage_container"]["uploads"],
            json!({"name": "uploads"})
        );
        assert_eq!(state.get("azurerm", RESOURCE_GROUP_NAME_KEY), Some("legacy-rg"));
    }

    #[tokio::test]
    async fn test_caller_resource_group_name_is_recorded() {
        let desired = Document::from_value(json!({
            "terraform": {"required_providers": {"azurerm": {"version": "~> 3.90"}}},
            "resource": {"azurerm_resource_group": {"rg": {"name": "shop-prod-rg"}}}
        }))
        .expect("desired");

        let mut state = ProvisioningState::new();
        state.set("azurerm", RESOURCE_GROUP_NAME_KEY, "stack123-rg");

        let fragment = planner().plan(&ctx(), &desired, &mut state).await.expect("plan");

        assert_eq!(fragment.resource["azurerm_resource_group"]["rg"]["name"], "shop-prod-rg");
        assert_eq!(state.get("azurerm", RESOURCE_GROUP_NAME_KEY), Some("shop-prod-rg"));
        assert_eq!(
            fragment.terraform["required_providers"]["azurerm"]["version"],
            "~> 3.90"
        );
    }

    #[tokio::test]
    async fn test_rejects_non_object_resource() {
        let desired = Document::from_value(json!({
            "resource": {"azurerm_container_app": {"bad": "not-an-object"}}
        }))
        .expect("desired");

        let mut state = ProvisioningState::new();
        let err = planner()
            .plan(&ctx(), &desired, &mut state)
            .await
            .expect_err("invalid");
        assert!(err.to_string().contains("resource.azurerm_container_app.bad"));
    }
}
