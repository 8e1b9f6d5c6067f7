use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct HttpMetrics {
    started: Family<RouteLabels, Counter>,
    handled: Family<StatusLabels, Counter>,
    handling: Family<RouteLabels, Histogram>,
}

/// Completes a request's metrics when the response status is known.
pub(crate) struct ResponseHandle {
    start: time::Instant,
    labels: RouteLabels,
    handled: Family<StatusLabels, Counter>,
    handling: Family<RouteLabels, Histogram>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RouteLabels {
    route: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct StatusLabels {
    route: &'static str,
    status: String,
}

// === impl HttpMetrics ===

impl HttpMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let started = Family::default();
        reg.register(
            "requests_started",
            "Total number of HTTP requests started",
            started.clone(),
        );

        let handled = Family::default();
        reg.register(
            "requests_handled",
            "Total number of HTTP requests completed, by response status",
            handled.clone(),
        );

        let handling = Family::<RouteLabels, Histogram>::new_with_constructor(|| {
            // Long-polled distribution requests may be held for most of the
            // request timeout.
            Histogram::new([0.005, 0.05, 0.5, 1.0, 5.0, 30.0])
        });
        reg.register_with_unit(
            "request_duration",
            "Histogram of HTTP request latency",
            Unit::Seconds,
            handling.clone(),
        );

        Self {
            started,
            handled,
            handling,
        }
    }

    pub(crate) fn start(&self, route: &'static str) -> ResponseHandle {
        let labels = RouteLabels { route };
        self.started.get_or_create(&labels).inc();
        ResponseHandle {
            start: time::Instant::now(),
            labels,
            handled: self.handled.clone(),
            handling: self.handling.clone(),
        }
    }
}

impl Default for HttpMetrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}

// === impl ResponseHandle ===

impl ResponseHandle {
    pub(crate) fn end(self, status: http::StatusCode) {
        self.handling
            .get_or_create(&self.labels)
            .observe(self.start.elapsed().as_secs_f64());
        self.handled
            .get_or_create(&StatusLabels {
                route: self.labels.route,
                status: status.as_u16().to_string(),
            })
            .inc();
    }
}
