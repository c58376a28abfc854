//! Month-to-date cost per stack.
//!
//! Costs come from one Cost Management query grouped by resource group.
//! Each stack owns the resource group `{stack_id}-rg`, so the suffix is
//! stripped to attribute rows back to stacks.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::azure::ArmClient;
use crate::clock::Clock;
use crate::error::{DeployBoxError, Result, UpstreamError};

/// Cost Management API version.
pub const COST_API_VERSION: &str = "2023-03-01";

/// Resource group listing API version.
pub const RESOURCE_GROUPS_API_VERSION: &str = "2021-04-01";

/// Default number of query attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Suffix of every stack's resource group.
const RESOURCE_GROUP_SUFFIX: &str = "-rg";

const SERVICE: &str = "cost management";

/// Month-to-date cost of one stack.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StackCost {
    /// Pre-tax cost in the billing currency.
    pub cost: f64,
}

/// A resource group in the subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceGroupInfo {
    /// Resource group name.
    pub name: String,
    /// Value of the `org` tag, if set.
    pub organization: Option<String>,
}

/// Queries and aggregates costs with rate-limit backoff.
#[derive(Debug, Clone)]
pub struct BillingAggregator {
    arm: ArmClient,
    subscription_id: String,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    base_delay: Duration,
}

impl BillingAggregator {
    /// Creates an aggregator with five attempts and a one second base delay.
    #[must_use]
    pub fn new(arm: ArmClient, subscription_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            arm,
            subscription_id: subscription_id.into(),
            clock,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(1),
        }
    }

    /// Sets the maximum number of query attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Sets the base backoff, doubled after every throttled attempt.
    #[must_use]
    pub const fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Returns month-to-date cost per stack for the given resource groups.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::RateLimitExceeded`] when every attempt was
    /// throttled, or the first non-throttling failure.
    pub async fn aggregate(
        &self,
        resource_group_names: &[String],
    ) -> Result<BTreeMap<String, StackCost>> {
        info!(
            "Querying costs for {} resource group(s)",
            resource_group_names.len()
        );

        let path = format!(
            "/subscriptions/{}/providers/Microsoft.CostManagement/query?api-version={COST_API_VERSION}",
            self.subscription_id
        );
        let body = cost_query(resource_group_names);

        let mut attempt = 0;
        loop {
            match self.arm.post_json(&path, &body).await {
                Ok(response) => return aggregate_rows(&response),
                Err(DeployBoxError::Upstream(UpstreamError::RateLimited { .. })) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        warn!("Cost query still throttled after {attempt} attempts");
                        return Err(UpstreamError::RateLimitExceeded { attempts: attempt }.into());
                    }
                    let delay = self.base_delay * 2u32.saturating_pow(attempt - 1);
                    debug!(
                        "Cost query throttled (attempt {attempt}/{}), retrying in {delay:?}",
                        self.max_attempts
                    );
                    self.clock.sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Lists every resource group in the subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the response is malformed.
    pub async fn resource_groups(&self) -> Result<Vec<ResourceGroupInfo>> {
        let path = format!(
            "/subscriptions/{}/resourcegroups?api-version={RESOURCE_GROUPS_API_VERSION}",
            self.subscription_id
        );
        let response = self.arm.get_json(&path).await?;
        let groups = response
            .get("value")
            .and_then(Value::as_array)
            .ok_or_else(|| UpstreamError::invalid_response(SERVICE, "missing value array"))?;

        Ok(groups
            .iter()
            .filter_map(|group| {
                let name = group.get("name")?.as_str()?.to_string();
                let organization = group
                    .pointer("/tags/org")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Some(ResourceGroupInfo { name, organization })
            })
            .collect())
    }
}

fn cost_query(resource_group_names: &[String]) -> Value {
    json!({
        "type": "ActualCost",
        "timeframe": "MonthToDate",
        "dataset": {
            "granularity": "Monthly",
            "aggregation": {
                "totalCost": {"name": "PreTaxCost", "function": "Sum"}
            },
            "grouping": [
                {"type": "Dimension", "name": "ResourceGroupName"}
            ],
            "filter": {
                "dimensions": {
                    "name": "ResourceGroupName",
                    "operator": "In",
                    "values": resource_group_names
                }
            }
        }
    })
}

/// Sums `[cost, _, resource_group, ...]` rows per stack.
fn aggregate_rows(response: &Value) -> Result<BTreeMap<String, StackCost>> {
    let rows = response
        .pointer("/properties/rows")
        .and_then(Value::as_array)
        .ok_or_else(|| UpstreamError::invalid_response(SERVICE, "missing properties.rows"))?;

    let mut costs: BTreeMap<String, StackCost> = BTreeMap::new();
    for row in rows {
        let (Some(cost), Some(group)) = (
            row.get(0).and_then(Value::as_f64),
            row.get(2).and_then(Value::as_str),
        ) else {
            warn!("Skipping malformed cost row: {row}");
            continue;
        };

        let stack_id = group.strip_suffix(RESOURCE_GROUP_SUFFIX).unwrap_or(group);
        costs
            .entry(stack_id.to_string())
            .or_insert(StackCost { cost: 0.0 })
            .cost += cost;
    }

    debug!("Aggregated costs for {} stack(s)", costs.len());
    Ok(costs)
}
