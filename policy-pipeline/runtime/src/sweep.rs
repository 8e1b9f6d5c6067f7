//! Background maintenance loops.

use anyhow::Result;
use policy_pipeline_core::{
    drift::{DriftReport, Severity},
    Catalog,
};
use policy_pipeline_store::{PolicyStore, StructureReport};
use policy_pipeline_validator::Validator;
use std::{collections::BTreeMap, future::Future, sync::Arc};
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

/// What one sweep found in a resource folder.
#[derive(Debug)]
pub(crate) struct ResourceCheck {
    pub(crate) drift: DriftReport,
    pub(crate) structure: StructureReport,
}

/// Compares each resource's stored files with the catalog and records what
/// was found.
pub(crate) async fn detect_drift_every(
    store: Arc<PolicyStore>,
    catalog: Arc<dyn Catalog>,
    configured: Vec<String>,
    period: Duration,
    drain: drain::Watch,
) {
    every(period, drain, || async {
        if let Err(error) = sweep(&store, &*catalog, &configured).await {
            warn!(%error, "Failed to list resources");
        }
    })
    .await
}

/// Checks every resource folder found in the repository or the catalog, as
/// well as any configured ones.
pub(crate) async fn sweep(
    store: &PolicyStore,
    catalog: &dyn Catalog,
    configured: &[String],
) -> Result<BTreeMap<String, ResourceCheck>> {
    let mut resources = store.list_resources().await?;
    resources.extend(catalog.resources().await?);
    resources.extend(configured.iter().cloned());

    let mut checks = BTreeMap::new();
    for resource in resources {
        let res = check_resource(store, catalog, &resource)
            .instrument(info_span!("sweep", %resource))
            .await;
        match res {
            Ok(check) => {
                let ResourceCheck { drift, structure } = &check;
                if drift.is_clean() {
                    debug!(%resource, "No drift");
                } else {
                    info!(
                        %resource,
                        critical = drift.count(Severity::Critical),
                        high = drift.count(Severity::High),
                        "Recorded drift",
                    );
                }
                if !structure.missing.is_empty() {
                    info!(%resource, missing = ?structure.missing, "Stage folders missing");
                }
                checks.insert(resource, check);
            }
            Err(error) => warn!(%error, %resource, "Failed to check for drift"),
        }
    }
    Ok(checks)
}

pub(crate) async fn purge_validations_every(
    validator: Validator,
    period: Duration,
    drain: drain::Watch,
) {
    every(period, drain, || async {
        let purged = validator.purge_expired();
        if purged > 0 {
            debug!(purged, "Purged expired validations");
        }
    })
    .await
}

pub(crate) async fn detect_drift(
    store: &PolicyStore,
    catalog: &dyn Catalog,
    resource: &str,
) -> Result<DriftReport> {
    let known = catalog.known_ids(resource).await?;
    let report = store.detect_unauthorized_files(resource, &known).await?;
    catalog.record_drift(&report).await?;
    Ok(report)
}

pub(crate) async fn check_resource(
    store: &PolicyStore,
    catalog: &dyn Catalog,
    resource: &str,
) -> Result<ResourceCheck> {
    let drift = detect_drift(store, catalog, resource).await?;
    let structure = store.validate_folder_structure(resource).await?;
    Ok(ResourceCheck { drift, structure })
}

async fn every<F, Fut>(period: Duration, drain: drain::Watch, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::pin! {
        let shutdown = drain.signaled();
    }

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = (&mut shutdown) => return,
        }
        tick().await;
    }
}
