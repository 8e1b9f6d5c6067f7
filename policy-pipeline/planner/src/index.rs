use ahash::AHashMap as HashMap;
use anyhow::Result;
use policy_pipeline_core::{
    distribution::{DiscoverDistribution, Distribution, DistributionStream, EnforcementPointId},
    Catalog, Environment,
};
use parking_lot::RwLock;
use std::{collections::hash_map::Entry, sync::Arc};
use tokio::sync::watch;
use tracing::debug;

#[derive(Clone, Debug, Default)]
pub(crate) struct Writer(ByPoint);

/// Serves the most recently computed distribution of each enforcement point.
#[derive(Clone)]
pub struct Reader {
    index: ByPoint,
    catalog: Arc<dyn Catalog>,
}

type ByPoint = Arc<RwLock<HashMap<EnforcementPointId, Published>>>;

#[derive(Debug)]
struct Published {
    environment: Environment,
    tx: watch::Sender<Distribution>,
}

// === impl Writer ===

impl Writer {
    pub(crate) fn reader(&self, catalog: Arc<dyn Catalog>) -> Reader {
        Reader {
            index: self.0.clone(),
            catalog,
        }
    }

    /// Publishes a distribution, notifying watchers only if it differs from
    /// what they last observed.
    pub(crate) fn publish(&self, distribution: Distribution) -> bool {
        match self.0.write().entry(distribution.enforcement_point) {
            Entry::Occupied(entry) => entry.get().tx.send_if_modified(|current| {
                if *current == distribution {
                    return false;
                }
                *current = distribution;
                true
            }),
            Entry::Vacant(entry) => {
                let environment = distribution.environment;
                let (tx, _) = watch::channel(distribution);
                entry.insert(Published { environment, tx });
                true
            }
        }
    }

    /// Drops an enforcement point's distribution. Its open watches end.
    pub(crate) fn revoke(&self, id: EnforcementPointId) -> bool {
        let removed = self.0.write().remove(&id).is_some();
        if removed {
            debug!(enforcement_point = %id, "Revoked distribution");
        }
        removed
    }

    pub(crate) fn published_in(&self, env: Environment) -> Vec<EnforcementPointId> {
        self.0
            .read()
            .iter()
            .filter(|(_, p)| p.environment == env)
            .map(|(id, _)| *id)
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.0.read().len()
    }
}

// === impl Reader ===

impl Reader {
    #[inline]
    fn lookup(&self, id: EnforcementPointId) -> Option<watch::Receiver<Distribution>> {
        self.index.read().get(&id).map(|p| p.tx.subscribe())
    }
}

#[async_trait::async_trait]
impl DiscoverDistribution for Reader {
    async fn get_distribution(&self, id: EnforcementPointId) -> Result<Option<Distribution>> {
        Ok(self.lookup(id).map(|rx| (*rx.borrow()).clone()))
    }

    async fn watch_distribution(&self, id: EnforcementPointId) -> Result<Option<DistributionStream>> {
        Ok(self.lookup(id).map(into_stream))
    }

    async fn acknowledge(&self, id: EnforcementPointId, revision: u64) -> Result<()> {
        if !self.catalog.acknowledge(id, revision).await? {
            debug!(enforcement_point = %id, revision, "Ignoring acknowledgement of a stale revision");
        }
        Ok(())
    }
}

/// Streams distribution updates, starting with the current state. The
/// stream ends when the distribution is revoked.
fn into_stream(mut rx: watch::Receiver<Distribution>) -> DistributionStream {
    Box::pin(async_stream::stream! {
        let mut current = (*rx.borrow_and_update()).clone();
        yield current.clone();

        while rx.changed().await.is_ok() {
            let next = (*rx.borrow_and_update()).clone();
            if next != current {
                yield next.clone();
                current = next;
            }
        }
    })
}
