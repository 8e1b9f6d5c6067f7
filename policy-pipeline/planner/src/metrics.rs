use policy_pipeline_core::Environment;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter,
        family::Family,
        gauge::Gauge,
        histogram::{exponential_buckets, Histogram},
    },
    registry::{Registry, Unit},
};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct PlannerMetrics {
    sweeps: Family<SweepLabels, Counter>,
    changes: Family<EnvLabels, Counter>,
    deregistrations: Family<EnvLabels, Counter>,
    sweep_duration: Histogram,
    published: Gauge,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SweepLabels {
    environment: &'static str,
    result: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct EnvLabels {
    environment: &'static str,
}

impl PlannerMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let sweeps = Family::default();
        reg.register(
            "sweeps",
            "Count of reconcile sweeps by environment and result",
            sweeps.clone(),
        );

        let changes = Family::default();
        reg.register(
            "changes",
            "Count of enforcement points whose computed distribution changed",
            changes.clone(),
        );

        let deregistrations = Family::default();
        reg.register(
            "deregistrations",
            "Count of enforcement points whose distribution was revoked",
            deregistrations.clone(),
        );

        let sweep_duration = Histogram::new(exponential_buckets(0.005, 2.0, 12));
        reg.register_with_unit(
            "sweep_duration",
            "Time taken to reconcile an environment",
            Unit::Seconds,
            sweep_duration.clone(),
        );

        let published = Gauge::default();
        reg.register(
            "published",
            "Number of enforcement points with a published distribution",
            published.clone(),
        );

        Self {
            sweeps,
            changes,
            deregistrations,
            sweep_duration,
            published,
        }
    }

    pub(crate) fn sweep(&self, env: Environment, ok: bool, elapsed: Duration) {
        self.sweeps
            .get_or_create(&SweepLabels {
                environment: env.as_str(),
                result: if ok { "ok" } else { "error" },
            })
            .inc();
        self.sweep_duration.observe(elapsed.as_secs_f64());
    }

    pub(crate) fn changed(&self, env: Environment, n: usize) {
        self.changes
            .get_or_create(&EnvLabels {
                environment: env.as_str(),
            })
            .inc_by(n as u64);
    }

    pub(crate) fn deregistered(&self, env: Environment) {
        self.deregistrations
            .get_or_create(&EnvLabels {
                environment: env.as_str(),
            })
            .inc();
    }

    pub(crate) fn set_published(&self, n: usize) {
        self.published.set(n as i64);
    }
}

impl Default for PlannerMetrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}
