use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use pin_project_lite::pin_project;
use prometheus::{HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry};
use utils::id::{TenantId, TimelineId};

/// Prometheus histogram buckets (in seconds) for remote storage operations: from a millisecond
/// for small index parts against a local directory, up to minutes for large layer files.
fn get_buckets_for_remote_operations() -> Vec<f64> {
    vec![
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 180.0,
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOpKind {
    Upload,
    Download,
    Delete,
}
impl RemoteOpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum RemoteOpFileKind {
    Layer,
    Index,
}
impl RemoteOpFileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Layer => "layer",
            Self::Index => "index",
        }
    }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum RemoteOpStatus {
    Success,
    Failure,
}
impl RemoteOpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Destination of everything the storage engine measures.
///
/// Passed in at construction of the [`crate::tenant::mgr::TenantManager`], so that several
/// engines in one process (tests, mostly) never share counters.
pub trait MetricsSink: Send + Sync + 'static {
    /// One finished remote storage operation.
    fn remote_operation(
        &self,
        tenant_id: &TenantId,
        timeline_id: &TimelineId,
        file_kind: RemoteOpFileKind,
        op_kind: RemoteOpKind,
        status: RemoteOpStatus,
        elapsed: Duration,
    );

    fn resident_physical_size_add(&self, tenant_id: &TenantId, timeline_id: &TimelineId, sz: u64);

    fn resident_physical_size_sub(&self, tenant_id: &TenantId, timeline_id: &TimelineId, sz: u64);

    /// Forget every series of the timeline, called when its tenant is detached.
    fn remove_timeline(&self, tenant_id: &TenantId, timeline_id: &TimelineId);
}

pub const REMOTE_OPERATION_TIME: &str = "pageserver_remote_operation_seconds";
pub const RESIDENT_PHYSICAL_SIZE: &str = "pageserver_resident_physical_size";

/// [`MetricsSink`] backed by prometheus collectors living in a registry of their own.
pub struct PrometheusMetrics {
    registry: Registry,
    remote_operation_time: HistogramVec,
    resident_physical_size: IntGaugeVec,
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let remote_operation_time = HistogramVec::new(
            HistogramOpts::new(
                REMOTE_OPERATION_TIME,
                "Time spent on remote storage operations. \
                Grouped by tenant, timeline, file_kind, op_kind and status.",
            )
            .buckets(get_buckets_for_remote_operations()),
            &["tenant_id", "timeline_id", "file_kind", "op_kind", "status"],
        )
        .expect("failed to define a metric");
        let resident_physical_size = IntGaugeVec::new(
            Opts::new(
                RESIDENT_PHYSICAL_SIZE,
                "The size of the layer files present in the pageserver's filesystem.",
            ),
            &["tenant_id", "timeline_id"],
        )
        .expect("failed to define a metric");

        registry
            .register(Box::new(remote_operation_time.clone()))
            .expect("failed to register a metric");
        registry
            .register(Box::new(resident_physical_size.clone()))
            .expect("failed to register a metric");

        PrometheusMetrics {
            registry,
            remote_operation_time,
            resident_physical_size,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Number of finished operations matching all labels, zero if none was ever recorded.
    pub fn remote_operation_count(
        &self,
        tenant_id: &TenantId,
        timeline_id: &TimelineId,
        file_kind: RemoteOpFileKind,
        op_kind: RemoteOpKind,
        status: RemoteOpStatus,
    ) -> u64 {
        let tenant_id = tenant_id.to_string();
        let timeline_id = timeline_id.to_string();
        let wanted = [
            ("tenant_id", tenant_id.as_str()),
            ("timeline_id", timeline_id.as_str()),
            ("file_kind", file_kind.as_str()),
            ("op_kind", op_kind.as_str()),
            ("status", status.as_str()),
        ];

        // go through gather() so that looking does not create the series
        self.registry
            .gather()
            .iter()
            .filter(|family| family.get_name() == REMOTE_OPERATION_TIME)
            .flat_map(|family| family.get_metric())
            .filter(|metric| {
                wanted.iter().all(|(name, value)| {
                    metric
                        .get_label()
                        .iter()
                        .any(|label| label.get_name() == *name && label.get_value() == *value)
                })
            })
            .map(|metric| metric.get_histogram().get_sample_count())
            .sum()
    }

    /// Successful layer downloads of the timeline.
    pub fn download_count(&self, tenant_id: &TenantId, timeline_id: &TimelineId) -> u64 {
        self.remote_operation_count(
            tenant_id,
            timeline_id,
            RemoteOpFileKind::Layer,
            RemoteOpKind::Download,
            RemoteOpStatus::Success,
        )
    }

    /// `None` if the timeline has no series, e.g. after detach.
    pub fn resident_physical_size(
        &self,
        tenant_id: &TenantId,
        timeline_id: &TimelineId,
    ) -> Option<u64> {
        let tenant_id = tenant_id.to_string();
        let timeline_id = timeline_id.to_string();
        self.registry
            .gather()
            .iter()
            .filter(|family| family.get_name() == RESIDENT_PHYSICAL_SIZE)
            .flat_map(|family| family.get_metric())
            .find(|metric| {
                let labels = metric.get_label();
                labels
                    .iter()
                    .any(|l| l.get_name() == "tenant_id" && l.get_value() == tenant_id)
                    && labels
                        .iter()
                        .any(|l| l.get_name() == "timeline_id" && l.get_value() == timeline_id)
            })
            .map(|metric| metric.get_gauge().get_value() as u64)
    }
}

impl MetricsSink for PrometheusMetrics {
    fn remote_operation(
        &self,
        tenant_id: &TenantId,
        timeline_id: &TimelineId,
        file_kind: RemoteOpFileKind,
        op_kind: RemoteOpKind,
        status: RemoteOpStatus,
        elapsed: Duration,
    ) {
        self.remote_operation_time
            .with_label_values(&[
                &tenant_id.to_string(),
                &timeline_id.to_string(),
                file_kind.as_str(),
                op_kind.as_str(),
                status.as_str(),
            ])
            .observe(elapsed.as_secs_f64());
    }

    fn resident_physical_size_add(&self, tenant_id: &TenantId, timeline_id: &TimelineId, sz: u64) {
        self.resident_physical_size
            .with_label_values(&[&tenant_id.to_string(), &timeline_id.to_string()])
            .add(sz as i64);
    }

    fn resident_physical_size_sub(&self, tenant_id: &TenantId, timeline_id: &TimelineId, sz: u64) {
        self.resident_physical_size
            .with_label_values(&[&tenant_id.to_string(), &timeline_id.to_string()])
            .sub(sz as i64);
    }

    fn remove_timeline(&self, tenant_id: &TenantId, timeline_id: &TimelineId) {
        let tenant_id = tenant_id.to_string();
        let timeline_id = timeline_id.to_string();
        let _ = self
            .resident_physical_size
            .remove_label_values(&[&tenant_id, &timeline_id]);

        for file_kind in [RemoteOpFileKind::Layer, RemoteOpFileKind::Index] {
            for op_kind in [
                RemoteOpKind::Upload,
                RemoteOpKind::Download,
                RemoteOpKind::Delete,
            ] {
                for status in [RemoteOpStatus::Success, RemoteOpStatus::Failure] {
                    let _ = self.remote_operation_time.remove_label_values(&[
                        &tenant_id,
                        &timeline_id,
                        file_kind.as_str(),
                        op_kind.as_str(),
                        status.as_str(),
                    ]);
                }
            }
        }
    }
}

/// Per-timeline view of the [`MetricsSink`], which also keeps the timeline's own copy of the
/// resident physical size for [`crate::tenant::timeline::Timeline::detail`].
pub(crate) struct TimelineMetrics {
    pub tenant_id: TenantId,
    pub timeline_id: TimelineId,
    sink: Arc<dyn MetricsSink>,
    resident_physical_size: AtomicU64,
    removed: AtomicBool,
}

impl TimelineMetrics {
    pub fn new(tenant_id: TenantId, timeline_id: TimelineId, sink: Arc<dyn MetricsSink>) -> Self {
        TimelineMetrics {
            tenant_id,
            timeline_id,
            sink,
            resident_physical_size: AtomicU64::new(0),
            removed: AtomicBool::new(false),
        }
    }

    pub fn resident_physical_size_add(&self, sz: u64) {
        self.resident_physical_size.fetch_add(sz, Ordering::AcqRel);
        if !self.removed.load(Ordering::Acquire) {
            self.sink
                .resident_physical_size_add(&self.tenant_id, &self.timeline_id, sz);
        }
    }

    pub fn resident_physical_size_sub(&self, sz: u64) {
        let prev = self.resident_physical_size.fetch_sub(sz, Ordering::AcqRel);
        debug_assert!(prev >= sz, "resident physical size underflow: {prev} - {sz}");
        if !self.removed.load(Ordering::Acquire) {
            self.sink
                .resident_physical_size_sub(&self.tenant_id, &self.timeline_id, sz);
        }
    }

    pub fn resident_physical_size_get(&self) -> u64 {
        self.resident_physical_size.load(Ordering::Acquire)
    }

    pub fn record_remote_op(
        &self,
        file_kind: RemoteOpFileKind,
        op_kind: RemoteOpKind,
        status: RemoteOpStatus,
        elapsed: Duration,
    ) {
        if self.removed.load(Ordering::Acquire) {
            return;
        }
        self.sink.remote_operation(
            &self.tenant_id,
            &self.timeline_id,
            file_kind,
            op_kind,
            status,
            elapsed,
        );
    }

    /// Drops the timeline's series from the sink. Later updates only touch the local copy.
    pub fn shutdown(&self) {
        if !self.removed.swap(true, Ordering::AcqRel) {
            self.sink.remove_timeline(&self.tenant_id, &self.timeline_id);
        }
    }
}

/// Wrapper future that measures the time spent by a remote storage operation,
/// and records the time and success/failure into the timeline's metrics.
pub(crate) trait MeasureRemoteOp: Sized {
    fn measure_remote_op(
        self,
        file_kind: RemoteOpFileKind,
        op: RemoteOpKind,
        metrics: Arc<TimelineMetrics>,
    ) -> MeasuredRemoteOp<Self> {
        let start = Instant::now();
        MeasuredRemoteOp {
            inner: self,
            file_kind,
            op,
            start,
            metrics,
        }
    }
}

impl<T: Sized> MeasureRemoteOp for T {}

pin_project! {
    pub(crate) struct MeasuredRemoteOp<F>
    {
        #[pin]
        inner: F,
        file_kind: RemoteOpFileKind,
        op: RemoteOpKind,
        start: Instant,
        metrics: Arc<TimelineMetrics>,
    }
}

impl<F: Future<Output = Result<O, E>>, O, E> Future for MeasuredRemoteOp<F> {
    type Output = Result<O, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let poll_result = this.inner.poll(cx);
        if let Poll::Ready(ref res) = poll_result {
            let duration = this.start.elapsed();
            let status = if res.is_ok() {
                RemoteOpStatus::Success
            } else {
                RemoteOpStatus::Failure
            };
            this.metrics
                .record_remote_op(*this.file_kind, *this.op, status, duration);
        }
        poll_result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn measured_op_records_status() {
        let sink = Arc::new(PrometheusMetrics::new());
        let tenant_id = TenantId::generate();
        let timeline_id = TimelineId::generate();
        let metrics = Arc::new(TimelineMetrics::new(tenant_id, timeline_id, sink.clone()));

        async { Ok::<_, ()>(()) }
            .measure_remote_op(
                RemoteOpFileKind::Layer,
                RemoteOpKind::Download,
                metrics.clone(),
            )
            .await
            .unwrap();
        async { Err::<(), _>(()) }
            .measure_remote_op(
                RemoteOpFileKind::Layer,
                RemoteOpKind::Download,
                metrics.clone(),
            )
            .await
            .unwrap_err();

        assert_eq!(sink.download_count(&tenant_id, &timeline_id), 1);
        assert_eq!(
            sink.remote_operation_count(
                &tenant_id,
                &timeline_id,
                RemoteOpFileKind::Layer,
                RemoteOpKind::Download,
                RemoteOpStatus::Failure
            ),
            1
        );
        assert_eq!(
            sink.remote_operation_count(
                &tenant_id,
                &timeline_id,
                RemoteOpFileKind::Index,
                RemoteOpKind::Download,
                RemoteOpStatus::Success
            ),
            0
        );
    }

    #[test]
    fn shutdown_removes_series() {
        let sink = Arc::new(PrometheusMetrics::new());
        let tenant_id = TenantId::generate();
        let timeline_id = TimelineId::generate();
        let metrics = TimelineMetrics::new(tenant_id, timeline_id, sink.clone());

        metrics.resident_physical_size_add(100);
        metrics.resident_physical_size_add(20);
        metrics.resident_physical_size_sub(100);
        assert_eq!(metrics.resident_physical_size_get(), 20);
        assert_eq!(
            sink.resident_physical_size(&tenant_id, &timeline_id),
            Some(20)
        );

        metrics.shutdown();
        assert_eq!(sink.resident_physical_size(&tenant_id, &timeline_id), None);

        metrics.resident_physical_size_add(5);
        assert_eq!(sink.resident_physical_size(&tenant_id, &timeline_id), None);
        assert_eq!(metrics.resident_physical_size_get(), 25);
    }
}
