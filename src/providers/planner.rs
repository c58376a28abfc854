//! The planner contract and fixed-order composition.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

use crate::document::Document;
use crate::error::{PlanError, Result};
use crate::state::ProvisioningState;

/// Merge label for resources no planner owns.
pub const PASSTHROUGH: &str = "passthrough";

/// Per-run facts every planner may use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanContext {
    /// Stack being planned.
    pub stack_id: String,
    /// Owning project.
    pub project_id: String,
    /// Owning organization, if known.
    pub organization_id: Option<String>,
}

impl PlanContext {
    /// Creates a context.
    #[must_use]
    pub fn new(stack_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            stack_id: stack_id.into(),
            project_id: project_id.into(),
            organization_id: None,
        }
    }

    /// Sets the owning organization.
    #[must_use]
    pub fn with_organization(mut self, organization_id: Option<String>) -> Self {
        self.organization_id = organization_id;
        self
    }

    /// Ownership tags applied to taggable resources.
    #[must_use]
    pub fn tags(&self) -> Value {
        let mut tags = Map::new();
        if let Some(organization) = &self.organization_id {
            tags.insert(String::from("organization"), Value::from(organization.as_str()));
        }
        tags.insert(String::from("project"), Value::from(self.project_id.as_str()));
        tags.insert(String::from("stack"), Value::from(self.stack_id.as_str()));
        Value::Object(tags)
    }
}

/// Emits one provider's fragment of the merged document.
///
/// Planners hold only construction-time settings; everything that varies
/// per run arrives as arguments.
#[async_trait]
pub trait ProviderPlanner: Send + Sync {
    /// Provider namespace, e.g. `azurerm`. Owns kinds named `<namespace>_*`.
    fn namespace(&self) -> &'static str;

    /// Plans the fragment for `desired`, which holds only this namespace's
    /// resources, provider entry and `required_providers` entry. Caller
    /// values in those entries win over planner defaults. Allocations are
    /// recorded in `prior`.
    async fn plan(
        &self,
        ctx: &PlanContext,
        desired: &Document,
        prior: &mut ProvisioningState,
    ) -> Result<Document>;
}

/// Runs planners in order and merges their fragments.
///
/// Resources and provider entries outside every planner's namespace are
/// merged last, unchanged.
///
/// # Errors
///
/// Returns the first planner error or [`PlanError::MergeConflict`] if a
/// fragment would overwrite an earlier one.
pub async fn plan_document(
    planners: &[Arc<dyn ProviderPlanner>],
    ctx: &PlanContext,
    desired: &Document,
    state: &mut ProvisioningState,
) -> Result<Document> {
    let mut merged = Document::new();

    for planner in planners {
        let namespace = planner.namespace();
        let subset = desired.namespace_subset(namespace);
        let fragment = planner.plan(ctx, &subset, state).await?;
        debug!(
            "Stack {}: {namespace} planned {} resource(s)",
            ctx.stack_id,
            fragment.resource_count()
        );
        merged.merge(fragment, namespace)?;
    }

    let owned: Vec<&str> = planners.iter().map(|p| p.namespace()).collect();
    let rest = desired.without_namespaces(&owned);
    if !rest.is_empty() {
        info!(
            "Stack {}: passing through {} unowned resource(s)",
            ctx.stack_id,
            rest.resource_count()
        );
    }
    merged.merge(rest, PASSTHROUGH)?;

    Ok(merged)
}

/// Layers caller input over defaults.
///
/// Objects merge key by key; any other caller value replaces the default.
#[must_use]
pub fn with_defaults(defaults: Value, caller: &Value) -> Value {
    match (defaults, caller) {
        (Value::Object(mut base), Value::Object(top)) => {
            for (key, value) in top {
                let layered = match base.remove(key) {
                    Some(default) => with_defaults(default, value),
                    None => value.clone(),
                };
                base.insert(key.clone(), layered);
            }
            Value::Object(base)
        }
        (_, caller) => caller.clone(),
    }
}

/// Checks that a resource's attributes are an object.
///
/// # Errors
///
/// Returns [`PlanError::InvalidResource`] otherwise.
pub fn expect_object<'a>(kind: &str, name: &str, attributes: &'a Value) -> Result<&'a Map<String, Value>> {
    attributes.as_object().ok_or_else(|| {
        PlanError::InvalidResource {
            path: format!("resource.{kind}.{name}"),
            message: String::from("attributes must be an object"),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DeployBoxError, ErrorKind};
    use serde_json::json;

    /// Planner emitting a fixed fragment.
    struct Fixed {
        namespace: &'static str,
        fragment: Value,
    }

    #[async_trait]
    impl ProviderPlanner for Fixed {
        fn namespace(&self) -> &'static str {
            self.namespace
        }

        async fn plan(
            &self,
            _ctx: &PlanContext,
            desired: &Document,
            prior: &mut ProvisioningState,
        ) -> Result<Document> {
            prior.set(self.namespace, "seen", desired.resource_count().to_string());
            Document::from_value(self.fragment.clone())
        }
    }

    fn planner(namespace: &'static str, fragment: Value) -> Arc<dyn ProviderPlanner> {
        Arc::new(Fixed {
            namespace,
            fragment,
        })
    }

    #[tokio::test]
    async fn test_plan_document_merges_in_order_with_passthrough() {
        let desired = Document::from_value(json!({
            "resource": {
                "alpha_thing": {"a": {}},
                "beta_thing": {"b": {}, "c": {}},
                "random_password": {"pw": {"length": 16}}
            }
        }))
        .expect("desired");

        let planners = [
            planner("alpha", json!({"resource": {"alpha_thing": {"a": {"x": 1}}}})),
            planner("beta", json!({"provider": {"beta": {}}})),
        ];
        let mut state = ProvisioningState::new();
        let merged = plan_document(&planners, &PlanContext::new("s1", "p1"), &desired, &mut state)
            .await
            .expect("plan");

        assert_eq!(merged.resource["alpha_thing"]["a"]["x"], 1);
        assert!(merged.provider.contains_key("beta"));
        assert_eq!(merged.resource["random_password"]["pw"]["length"], 16);
        assert!(!merged.resource.contains_key("beta_thing"));
        assert_eq!(state.get("alpha", "seen"), Some("1"));
        assert_eq!(state.get("beta", "seen"), Some("2"));
    }

    #[tokio::test]
    async fn test_later_planner_cannot_overwrite_earlier() {
        let planners = [
            planner("alpha", json!({"resource": {"shared_kind": {"x": {"v": 1}}}})),
            planner("beta", json!({"resource": {"shared_kind": {"x": {"v": 2}}}})),
        ];
        let mut state = ProvisioningState::new();
        let err = plan_document(
            &planners,
            &PlanContext::new("s1", "p1"),
            &Document::new(),
            &mut state,
        )
        .await
        .expect_err("conflict");

        assert!(matches!(
            err,
            DeployBoxError::Plan(PlanError::MergeConflict { ref planner, .. }) if planner == "beta"
        ));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_with_defaults_caller_wins() {
        let layered = with_defaults(
            json!({"ingress": {"external_enabled": true, "target_port": 80}, "revision_mode": "Single"}),
            &json!({"ingress": {"target_port": 3000}, "extra": [1]}),
        );
        assert_eq!(
            layered,
            json!({
                "ingress": {"external_enabled": true, "target_port": 3000},
                "revision_mode": "Single",
                "extra": [1]
            })
        );
    }

    #[test]
    fn test_context_tags() {
        let ctx = PlanContext::new("s1", "p1").with_organization(Some(String::from("o1")));
        assert_eq!(ctx.tags(), json!({"organization": "o1", "project": "p1", "stack": "s1"}));
        assert_eq!(PlanContext::new("s1", "p1").tags(), json!({"project": "p1", "stack": "s1"}));
    }
}
