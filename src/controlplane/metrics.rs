//! Disk Metrics
//!
//! Prometheus collectors for disk creation, deletion and the usage watcher,
//! registered on a registry owned by the operator rather than the global one.

use crate::error::{Error, Result};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

const NAMESPACE: &str = "tenant_disks";

/// Why a disk was deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    /// Tenant request
    Api,
    /// Life span ran out
    Expired,
    /// Usage exceeded the requested capacity
    Overuse,
}

impl DeleteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteReason::Api => "api",
            DeleteReason::Expired => "expired",
            DeleteReason::Overuse => "overuse",
        }
    }
}

impl std::fmt::Display for DeleteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metrics bundle shared by the API path and the watcher
pub struct DiskMetrics {
    registry: Registry,
    pub disks_created: IntCounter,
    /// Creation failures by reason (`quota`, `name_taken`, `unavailable`, `error`)
    pub creation_rejections: IntCounterVec,
    pub disks_deleted: IntCounterVec,
    pub watcher_cycles: IntCounter,
    pub watcher_failed_cycles: IntCounter,
    pub watcher_skipped_disks: IntCounter,
    pub orphans_cleared: IntCounter,
    pub cycle_duration: Histogram,
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}

impl DiskMetrics {
    /// Create and register all collectors
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let disks_created = IntCounter::with_opts(
            Opts::new("created_total", "Disks created").namespace(NAMESPACE),
        )
        .map_err(metric_error)?;
        let creation_rejections = IntCounterVec::new(
            Opts::new("creation_rejections_total", "Disk creations rejected")
                .namespace(NAMESPACE),
            &["reason"],
        )
        .map_err(metric_error)?;
        let disks_deleted = IntCounterVec::new(
            Opts::new("deleted_total", "Disks deleted").namespace(NAMESPACE),
            &["reason"],
        )
        .map_err(metric_error)?;
        let watcher_cycles = IntCounter::with_opts(
            Opts::new("watcher_cycles_total", "Usage watcher cycles run").namespace(NAMESPACE),
        )
        .map_err(metric_error)?;
        let watcher_failed_cycles = IntCounter::with_opts(
            Opts::new("watcher_failed_cycles_total", "Usage watcher cycles that failed")
                .namespace(NAMESPACE),
        )
        .map_err(metric_error)?;
        let watcher_skipped_disks = IntCounter::with_opts(
            Opts::new(
                "watcher_skipped_disks_total",
                "Disks skipped by the watcher after a permanent failure",
            )
            .namespace(NAMESPACE),
        )
        .map_err(metric_error)?;
        let orphans_cleared = IntCounter::with_opts(
            Opts::new("orphans_cleared_total", "Orphaned name reservations removed")
                .namespace(NAMESPACE),
        )
        .map_err(metric_error)?;
        let cycle_duration = Histogram::with_opts(
            HistogramOpts::new(
                "watcher_cycle_duration_seconds",
                "Duration of usage watcher cycles",
            )
            .namespace(NAMESPACE),
        )
        .map_err(metric_error)?;

        registry
            .register(Box::new(disks_created.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(creation_rejections.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(disks_deleted.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(watcher_cycles.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(watcher_failed_cycles.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(watcher_skipped_disks.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(orphans_cleared.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(cycle_duration.clone()))
            .map_err(metric_error)?;

        Ok(Self {
            registry,
            disks_created,
            creation_rejections,
            disks_deleted,
            watcher_cycles,
            watcher_failed_cycles,
            watcher_skipped_disks,
            orphans_cleared,
            cycle_duration,
        })
    }

    /// Count a creation failure
    pub fn record_rejection(&self, err: &Error) {
        let reason = match err {
            Error::QuotaExceeded { .. } => "quota",
            Error::NameTaken { .. } => "name_taken",
            Error::Unavailable { .. } | Error::Kube(_) => "unavailable",
            _ => "error",
        };
        self.creation_rejections.with_label_values(&[reason]).inc();
    }

    pub fn record_deleted(&self, reason: DeleteReason) {
        self.disks_deleted.with_label_values(&[reason.as_str()]).inc();
    }

    pub fn deleted(&self, reason: DeleteReason) -> u64 {
        self.disks_deleted.with_label_values(&[reason.as_str()]).get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the text exposition format
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_encode() {
        let metrics = DiskMetrics::new().unwrap();
        metrics.disks_created.inc();
        metrics.record_deleted(DeleteReason::Expired);
        metrics.record_rejection(&Error::NameTaken {
            scope: "acme/ml".into(),
            name: "logs".into(),
        });

        let (content_type, body) = metrics.encode().unwrap();
        let body = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(body.contains("tenant_disks_created_total 1"));
        assert!(body.contains(r#"tenant_disks_deleted_total{reason="expired"} 1"#));
        assert!(body.contains(r#"tenant_disks_creation_rejections_total{reason="name_taken"} 1"#));
        assert_eq!(metrics.deleted(DeleteReason::Expired), 1);
        assert_eq!(metrics.deleted(DeleteReason::Api), 0);
    }

    #[test]
    fn test_registries_are_independent() {
        let a = DiskMetrics::new().unwrap();
        let b = DiskMetrics::new().unwrap();
        a.orphans_cleared.inc();
        assert_eq!(b.orphans_cleared.get(), 0);
    }
}
