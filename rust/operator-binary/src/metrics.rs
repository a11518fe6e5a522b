//! Process wide counters shared by the TLS reconcilers.

use std::{
    collections::BTreeSet,
    sync::{Mutex, PoisonError},
};

use prometheus_client::{
    encoding::{text::encode, EncodeLabel, EncodeLabelSet, LabelSetEncoder},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use tracing::error;

pub const TRANSPORT_TLS_CONTROLLER: &str = "transport_tls";
pub const API_TLS_CONTROLLER: &str = "api_tls";

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ControllerLabels {
    pub controller: String,
}

impl EncodeLabelSet for ControllerLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("controller", self.controller.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

pub struct Metrics {
    /// Failed TLS reconciles, across every controller.
    pub total_errors: Counter,
    /// Live clusters handled by each controller.
    pub resource_total: Family<ControllerLabels, Gauge>,
    /// `(controller, cluster uid)` pairs behind `resource_total`.
    tracked: Mutex<BTreeSet<(String, String)>>,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("opensearch_operator");

        let total_errors = Counter::default();
        registry.register(
            "total_errors",
            "Number of failed TLS reconciliations",
            total_errors.clone(),
        );

        let resource_total = Family::<ControllerLabels, Gauge>::default();
        registry.register(
            "resource_total",
            "Number of clusters handled by each controller",
            resource_total.clone(),
        );

        Self {
            total_errors,
            resource_total,
            tracked: Mutex::default(),
            registry,
        }
    }

    pub fn record_error(&self) {
        self.total_errors.inc();
    }

    fn gauge(&self, controller: &str) -> Gauge {
        self.resource_total
            .get_or_create(&ControllerLabels {
                controller: controller.to_string(),
            })
            .clone()
    }

    /// Counts the cluster for `controller`, once per uid.
    pub fn track_resource(&self, controller: &str, uid: &str) {
        let mut tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        if tracked.insert((controller.to_string(), uid.to_string())) {
            self.gauge(controller).inc();
        }
    }

    /// Stops counting a deleted cluster. Unknown uids are ignored.
    pub fn forget_resource(&self, controller: &str, uid: &str) {
        let mut tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        if tracked.remove(&(controller.to_string(), uid.to_string())) {
            self.gauge(controller).dec();
        }
    }

    pub fn resources(&self, controller: &str) -> i64 {
        self.resource_total
            .get_or_create(&ControllerLabels {
                controller: controller.to_string(),
            })
            .get()
    }

    /// OpenMetrics text exposition of every registered metric.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            error!("failed to encode metrics");
            return String::new();
        }
        buffer
    }
}
