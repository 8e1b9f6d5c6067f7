//! Selection rules that decide what an enforcement point receives.

use policy_pipeline_core::{
    distribution::{
        DataConnection, DataSourceSelector, DistributionConfig, EnforcementPoint, PolicySelector,
        ResolvedDataSource,
    },
    paths::DEFAULT_RESOURCE,
    Environment, LifecycleStage, PolicyRecord,
};

/// Derives an enforcement point's configuration. This is a pure function of
/// the enforcement point: limits come from its environment, never from the
/// values it declared.
pub fn compute_config(ep: &EnforcementPoint) -> DistributionConfig {
    let limits = ep.environment.limits();
    DistributionConfig {
        enforcement_point: ep.id,
        policy_selector: PolicySelector {
            environment: ep.environment,
            resource_scope: ep.resource_scope.clone(),
        },
        data_source_selector: DataSourceSelector {
            environment: ep.environment,
        },
        cache_ttl: limits.cache_ttl,
        rate_limit: limits.rate_limit,
    }
}

/// Sandbox sees its own enabled records plus anything already promoted.
/// Production sees only promoted, enabled records.
pub fn selects(selector: &PolicySelector, record: &PolicyRecord) -> bool {
    if record.lifecycle_stage != LifecycleStage::Enabled {
        return false;
    }

    let eligible = match selector.environment {
        Environment::Sandbox => {
            record.is_available_to(Environment::Sandbox) || record.promoted_from_sandbox
        }
        Environment::Production => {
            record.is_available_to(Environment::Production) && record.promoted_from_sandbox
        }
    };

    eligible
        && selector.resource_scope.as_deref().map_or(true, |scope| {
            record.resource_name.as_deref().unwrap_or(DEFAULT_RESOURCE) == scope
        })
}

/// Returns the selected records ordered by id.
pub fn select_policies<'r>(
    selector: &PolicySelector,
    records: impl IntoIterator<Item = &'r PolicyRecord>,
) -> Vec<PolicyRecord> {
    let mut selected = records
        .into_iter()
        .filter(|r| selects(selector, r))
        .cloned()
        .collect::<Vec<_>>();
    selected.sort_by_key(|r| r.id);
    selected
}

/// Resolves every connection that exposes an endpoint to the selector's
/// environment, ordered by id. Connections without one are left out.
pub fn select_data_sources<'c>(
    selector: &DataSourceSelector,
    connections: impl IntoIterator<Item = &'c DataConnection>,
) -> Vec<ResolvedDataSource> {
    let mut resolved = connections
        .into_iter()
        .filter_map(|conn| {
            let endpoint = conn.endpoint_for(selector.environment)?;
            Some(ResolvedDataSource {
                id: conn.id,
                name: conn.name.clone(),
                endpoint: endpoint.to_string(),
            })
        })
        .collect::<Vec<_>>();
    resolved.sort_by_key(|ds| ds.id);
    resolved
}
