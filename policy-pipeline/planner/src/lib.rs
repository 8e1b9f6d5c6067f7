#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Decides what each enforcement point should receive and keeps the
//! computed state current.
//!
//! The planner never pushes to enforcement points. It maintains the
//! applied distribution of every enforcement point in the catalog and
//! publishes the resulting [`Distribution`] through an index that the pull
//! endpoint reads from.

mod index;
mod metrics;
pub mod select;


pub use self::{index::Reader, metrics::PlannerMetrics, select::compute_config};

use chrono::offset::Utc;
use policy_pipeline_core::{
    distribution::{
        AppliedDistribution, DataConnectionId, DistributedPolicy, Distribution,
        DistributionConfig, EnforcementPoint, EnforcementPointId, ResolvedDataSource,
    },
    Catalog, CatalogSnapshot, Environment, Fingerprint, PolicyId, PolicyRecord,
};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{Mutex, MutexGuard},
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, info_span, instrument, warn, Instrument};

pub struct Planner {
    catalog: Arc<dyn Catalog>,
    index: index::Writer,
    sandbox: Mutex<()>,
    production: Mutex<()>,
    metrics: PlannerMetrics,
}

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("enforcement point {0} is not registered")]
    UnknownEnforcementPoint(EnforcementPointId),

    #[error(transparent)]
    Catalog(#[from] anyhow::Error),
}

/// The outcome of one reconcile sweep over an environment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub environment: Environment,

    /// Enforcement points that were recomputed.
    pub checked: usize,
    pub changed: Vec<DistributionChange>,

    /// Enforcement points that disappeared from the catalog.
    pub deregistered: Vec<EnforcementPointId>,
}

/// How an enforcement point's computed distribution differs from the one
/// applied before.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DistributionChange {
    pub enforcement_point: EnforcementPointId,
    pub revision: u64,
    pub added_policies: Vec<PolicyId>,
    pub removed_policies: Vec<PolicyId>,

    /// Policies whose content changed.
    pub updated_policies: Vec<PolicyId>,
    pub added_data_sources: Vec<DataConnectionId>,
    pub removed_data_sources: Vec<DataConnectionId>,
    pub config_changed: bool,
}

struct Computed {
    applied: AppliedDistribution,
    policies: Vec<PolicyRecord>,
    data_sources: Vec<ResolvedDataSource>,
}

// === impl Planner ===

impl Planner {
    pub fn new(catalog: Arc<dyn Catalog>, metrics: PlannerMetrics) -> Self {
        Self {
            catalog,
            index: Default::default(),
            sandbox: Mutex::new(()),
            production: Mutex::new(()),
            metrics,
        }
    }

    /// A handle for serving published distributions.
    pub fn reader(&self) -> Reader {
        self.index.reader(self.catalog.clone())
    }

    /// Computes an enforcement point's configuration. The first computation
    /// for an enforcement point is also persisted as its applied
    /// distribution; later ones leave the catalog untouched.
    #[instrument(skip_all, fields(enforcement_point = %ep.id))]
    pub async fn compute_config(
        &self,
        ep: &EnforcementPoint,
    ) -> Result<DistributionConfig, PlannerError> {
        let config = select::compute_config(ep);
        if self.catalog.get_applied(ep.id).await?.is_some() {
            return Ok(config);
        }

        let _sweep = self.lock(ep.environment).await;
        let snapshot = self.catalog.snapshot(ep.environment).await?;
        if !snapshot.applied.contains_key(&ep.id) {
            self.apply(ep, &snapshot).await?;
        }
        Ok(config)
    }

    /// Returns the records an enforcement point currently receives, ordered
    /// by id.
    pub async fn select_policies(
        &self,
        ep: &EnforcementPoint,
    ) -> Result<Vec<PolicyRecord>, PlannerError> {
        let snapshot = self.catalog.snapshot(ep.environment).await?;
        let config = select::compute_config(ep);
        Ok(select::select_policies(
            &config.policy_selector,
            &snapshot.records,
        ))
    }

    /// Recomputes every active enforcement point in an environment against
    /// one consistent catalog snapshot.
    ///
    /// Changed enforcement points get a new revision and are marked for
    /// resync. Enforcement points that are no longer registered have their
    /// distribution revoked.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, env: Environment) -> Result<ReconcileReport, PlannerError> {
        let start = Instant::now();
        let res = self.reconcile_inner(env).await;
        self.metrics.sweep(env, res.is_ok(), start.elapsed());
        if let Ok(report) = &res {
            self.metrics.changed(env, report.changed.len());
        }
        self.metrics.set_published(self.index.len());
        res
    }

    async fn reconcile_inner(&self, env: Environment) -> Result<ReconcileReport, PlannerError> {
        let _sweep = self.lock(env).await;
        let snapshot = self.catalog.snapshot(env).await?;

        let mut report = ReconcileReport {
            environment: env,
            checked: 0,
            changed: Vec::new(),
            deregistered: Vec::new(),
        };
        for ep in &snapshot.enforcement_points {
            report.checked += 1;
            if let Some(change) = self.apply(ep, &snapshot).await? {
                report.changed.push(change);
            }
        }

        // Applied state survives restarts while the index does not.
        let mut stale = snapshot.retired.clone();
        stale.extend(self.index.published_in(env));
        for id in stale {
            if snapshot.enforcement_points.iter().all(|ep| ep.id != id) {
                self.revoke(env, id).await?;
                report.deregistered.push(id);
            }
        }

        debug!(
            checked = report.checked,
            changed = report.changed.len(),
            deregistered = report.deregistered.len(),
            "Reconciled"
        );
        Ok(report)
    }

    /// (Re)computes the distribution of a newly registered or updated
    /// enforcement point.
    #[instrument(skip_all, fields(enforcement_point = %id))]
    pub async fn register(
        &self,
        id: EnforcementPointId,
    ) -> Result<Option<DistributionChange>, PlannerError> {
        let ep = self
            .catalog
            .get_enforcement_point(id)
            .await?
            .ok_or(PlannerError::UnknownEnforcementPoint(id))?;

        let _sweep = self.lock(ep.environment).await;
        // The environment may have changed since it was last published.
        if let Some(env) = Environment::ALL.into_iter().find(|env| {
            *env != ep.environment && self.index.published_in(*env).contains(&id)
        }) {
            self.index.revoke(id);
            debug!(previous = %env, "Enforcement point changed environment");
        }
        let snapshot = self.catalog.snapshot(ep.environment).await?;
        let change = self.apply(&ep, &snapshot).await?;
        self.metrics.set_published(self.index.len());
        Ok(change)
    }

    /// Revokes an enforcement point's distribution and forgets its applied
    /// state.
    #[instrument(skip_all, fields(enforcement_point = %id))]
    pub async fn deregister(&self, id: EnforcementPointId) -> Result<(), PlannerError> {
        let env = Environment::ALL
            .into_iter()
            .find(|env| self.index.published_in(*env).contains(&id));
        match env {
            Some(env) => {
                let _sweep = self.lock(env).await;
                self.revoke(env, id).await?;
            }
            None => self.catalog.remove_applied(id).await?,
        }
        self.metrics.set_published(self.index.len());
        Ok(())
    }

    /// Reconciles every environment each `period` until shutdown is
    /// signaled.
    pub async fn reconcile_every(self: Arc<Self>, period: Duration, drain: drain::Watch) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin! {
            let shutdown = drain.signaled();
        }

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = (&mut shutdown) => {
                    debug!("Reconcile loop shutting down");
                    return;
                }
            }

            for env in Environment::ALL {
                let res = self
                    .reconcile(env)
                    .instrument(info_span!("sweep", %env))
                    .await;
                if let Err(error) = res {
                    warn!(%error, %env, "Failed to reconcile environment");
                }
            }
        }
    }

    async fn lock(&self, env: Environment) -> MutexGuard<'_, ()> {
        match env {
            Environment::Sandbox => self.sandbox.lock().await,
            Environment::Production => self.production.lock().await,
        }
    }

    async fn revoke(&self, env: Environment, id: EnforcementPointId) -> Result<(), PlannerError> {
        self.catalog.remove_applied(id).await?;
        self.index.revoke(id);
        self.metrics.deregistered(env);
        info!(enforcement_point = %id, "Deregistered enforcement point");
        Ok(())
    }

    /// Recomputes one enforcement point, persists the result if it changed
    /// and publishes it.
    async fn apply(
        &self,
        ep: &EnforcementPoint,
        snapshot: &CatalogSnapshot,
    ) -> Result<Option<DistributionChange>, PlannerError> {
        let mut computed = compute(ep, snapshot);
        let previous = snapshot.applied.get(&ep.id);

        let change = match previous {
            Some(prev) if prev.config == computed.applied.config
                && prev.policies == computed.applied.policies
                && prev.data_sources == computed.applied.data_sources =>
            {
                computed.applied = prev.clone();
                None
            }
            Some(prev) => {
                computed.applied.revision = prev.revision + 1;
                computed.applied.acknowledged_revision = prev.acknowledged_revision;
                self.catalog.store_applied(&computed.applied).await?;
                Some(DistributionChange::between(Some(prev), &computed.applied))
            }
            None => {
                if !self.catalog.store_applied_if_absent(&computed.applied).await? {
                    // Another writer stored a first computation concurrently.
                    if let Some(stored) = self.catalog.get_applied(ep.id).await? {
                        computed.applied = stored;
                    }
                }
                Some(DistributionChange::between(None, &computed.applied))
            }
        };

        if let Some(change) = &change {
            info!(
                enforcement_point = %ep.id,
                revision = change.revision,
                added_policies = ?change.added_policies,
                removed_policies = ?change.removed_policies,
                updated_policies = ?change.updated_policies,
                added_data_sources = ?change.added_data_sources,
                removed_data_sources = ?change.removed_data_sources,
                config_changed = change.config_changed,
                "Distribution changed"
            );
        }

        self.index.publish(computed.into_distribution(ep));
        Ok(change)
    }
}

fn compute(ep: &EnforcementPoint, snapshot: &CatalogSnapshot) -> Computed {
    let config = select::compute_config(ep);
    let policies = select::select_policies(&config.policy_selector, &snapshot.records);
    let data_sources =
        select::select_data_sources(&config.data_source_selector, &snapshot.data_connections);

    let applied = AppliedDistribution {
        revision: 1,
        policies: policies
            .iter()
            .map(|r| (r.id, r.content_fingerprint.clone()))
            .collect::<BTreeMap<PolicyId, Fingerprint>>(),
        data_sources: data_sources
            .iter()
            .map(|ds| (ds.id, ds.endpoint.clone()))
            .collect(),
        config,
        resync_required: true,
        acknowledged_revision: None,
        computed_at: Utc::now(),
    };
    Computed {
        applied,
        policies,
        data_sources,
    }
}

// === impl Computed ===

impl Computed {
    fn into_distribution(self, ep: &EnforcementPoint) -> Distribution {
        let Self {
            applied,
            policies,
            data_sources,
        } = self;
        Distribution {
            enforcement_point: ep.id,
            environment: ep.environment,
            revision: applied.revision,
            cache_ttl: applied.config.cache_ttl,
            rate_limit: applied.config.rate_limit,
            policies: policies
                .into_iter()
                .map(|r| DistributedPolicy {
                    id: r.id,
                    resource_name: r.resource_name,
                    fingerprint: r.content_fingerprint,
                    content: r.content,
                })
                .collect(),
            data_sources,
        }
    }
}

// === impl DistributionChange ===

impl DistributionChange {
    fn between(prev: Option<&AppliedDistribution>, next: &AppliedDistribution) -> Self {
        let empty = BTreeMap::new();
        let empty_ds = BTreeMap::new();
        let prev_policies = prev.map_or(&empty, |p| &p.policies);
        let prev_sources = prev.map_or(&empty_ds, |p| &p.data_sources);

        Self {
            enforcement_point: next.config.enforcement_point,
            revision: next.revision,
            added_policies: keys_missing(&next.policies, prev_policies),
            removed_policies: keys_missing(prev_policies, &next.policies),
            updated_policies: next
                .policies
                .iter()
                .filter(|(id, fp)| prev_policies.get(*id).is_some_and(|p| p != *fp))
                .map(|(id, _)| *id)
                .collect(),
            added_data_sources: keys_missing(&next.data_sources, prev_sources),
            removed_data_sources: keys_missing(prev_sources, &next.data_sources),
            config_changed: prev.is_some_and(|p| p.config != next.config),
        }
    }
}

fn keys_missing<K: Copy + Ord, V>(from: &BTreeMap<K, V>, other: &BTreeMap<K, V>) -> Vec<K> {
    from.keys().filter(|k| !other.contains_key(*k)).copied().collect()
}
