use crate::remote::StoreError;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug)]
pub struct StoreMetrics {
    operations: Family<OperationLabels, Counter>,
    retries: Family<RetryLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OperationLabels {
    op: &'static str,
    result: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RetryLabels {
    op: &'static str,
}

impl StoreMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let operations = Family::default();
        reg.register(
            "operations",
            "Count of policy store operations by result",
            operations.clone(),
        );

        let retries = Family::default();
        reg.register(
            "retries",
            "Count of remote repository calls retried after a transient failure",
            retries.clone(),
        );

        Self {
            operations,
            retries,
        }
    }

    pub(crate) fn observe<T>(&self, op: &'static str, res: &Result<T, StoreError>) {
        self.record(
            op,
            match res {
                Ok(_) => "ok",
                Err(e) => e.kind(),
            },
        );
    }

    pub(crate) fn record(&self, op: &'static str, result: &'static str) {
        self.operations
            .get_or_create(&OperationLabels { op, result })
            .inc();
    }

    pub(crate) fn retried(&self, op: &'static str) {
        self.retries.get_or_create(&RetryLabels { op }).inc();
    }
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}
