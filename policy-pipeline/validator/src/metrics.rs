use crate::result::ValidationStatus;
use parking_lot::Mutex;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use serde::Serialize;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Weight given to the newest sample in the execution time average.
const EMA_ALPHA: f64 = 0.2;

#[derive(Clone, Debug)]
pub struct ValidatorMetrics {
    validations: Family<StatusLabels, Counter>,
    cache_hits: Counter,
    duration: Histogram,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct StatusLabels {
    status: &'static str,
}

/// Running totals kept alongside the Prometheus metrics for health
/// reporting.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    total: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
    timeout: AtomicU64,
    cache_hits: AtomicU64,
    avg_execution_ms: Mutex<Option<f64>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ValidatorStats {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub timeout: u64,
    pub cache_hits: u64,

    /// Exponential moving average over executions that reached the tool.
    pub avg_execution_ms: f64,
}

// === impl ValidatorMetrics ===

impl ValidatorMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let validations = Family::default();
        reg.register(
            "validations",
            "Count of policy validations by result status",
            validations.clone(),
        );

        let cache_hits = Counter::default();
        reg.register(
            "cache_hits",
            "Count of policy validations answered from the result cache",
            cache_hits.clone(),
        );

        let duration = Histogram::new([0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0]);
        reg.register_with_unit(
            "execution_duration",
            "Histogram of validator tool execution time",
            Unit::Seconds,
            duration.clone(),
        );

        Self {
            validations,
            cache_hits,
            duration,
        }
    }

    pub(crate) fn observe(&self, status: ValidationStatus, cache_hit: bool) {
        self.validations
            .get_or_create(&StatusLabels {
                status: status.as_str(),
            })
            .inc();
        if cache_hit {
            self.cache_hits.inc();
        }
    }

    pub(crate) fn observe_execution(&self, elapsed: Duration) {
        self.duration.observe(elapsed.as_secs_f64());
    }
}

impl Default for ValidatorMetrics {
    /// Metrics that are not exported anywhere.
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}

// === impl Counters ===

impl Counters {
    pub fn record(&self, status: ValidationStatus, cache_hit: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match status {
            ValidationStatus::Valid => &self.success,
            ValidationStatus::Invalid | ValidationStatus::Error => &self.failure,
            ValidationStatus::Timeout => &self.timeout,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_execution(&self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1000.0;
        let mut avg = self.avg_execution_ms.lock();
        *avg = Some(match *avg {
            Some(prev) => EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * prev,
            None => sample,
        });
    }

    pub fn snapshot(&self) -> ValidatorStats {
        ValidatorStats {
            total: self.total.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            failure: self.failure.load(Ordering::Relaxed),
            timeout: self.timeout.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            avg_execution_ms: self.avg_execution_ms.lock().unwrap_or_default(),
        }
    }
}
