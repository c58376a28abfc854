//! Provider planners.
//!
//! Each planner owns one provider namespace and turns the desired
//! resources of that namespace into a fragment with provider-specific
//! defaults. [`plan_document`] runs them in a fixed order and merges the
//! fragments without letting a later planner overwrite an earlier one.

mod azure;
mod mongodb;
mod planner;

pub use azure::{
    AzurePlanner, AzureProviderSettings, AZURE_NAMESPACE, ENVIRONMENT_NAME_KEY,
    RESOURCE_GROUP_NAME_KEY,
};
pub use mongodb::{
    MongoAtlasPlanner, MongoAtlasSettings, MONGODB_NAMESPACE, MONGODB_PROVIDER_SOURCE,
    MONGODB_PROVIDER_VERSION,
};
pub use planner::{
    expect_object, plan_document, with_defaults, PlanContext, ProviderPlanner, PASSTHROUGH,
};
