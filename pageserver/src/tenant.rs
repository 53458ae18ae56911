//! Timeline repository implementation that keeps old data in layer files, and
//! the recent changes in in-memory layers.
//!
//! See tenant/storage_layer for the layers. The functions here are responsible for the
//! tenant's lifecycle: attaching its timelines from the remote index parts, creating new
//! timelines, and detaching.
//!
//! The files are stored in the <workdir>/tenants/<tenant_id>/timelines/<timeline_id>
//! directory, mirroring the layout in remote storage. Only layers that were written
//! locally or downloaded on demand are present there.
//!

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
pub use pageserver_api::models::TenantState;
use pageserver_api::models::TimelineState;
use remote_storage::GenericRemoteStorage;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::*;
use utils::crashsafe;
use utils::id::{TenantId, TimelineId};
use utils::lsn::Lsn;
use utils::sync::gate::Gate;

use self::config::{TenantConf, TenantConfOpt};
use self::gc_result::GcResult;
use self::mgr::AttachError;
use self::remote_timeline_client::{list_remote_timelines, IndexPart, RemoteTimelineClient};
use self::timeline::compaction::CompactionError;
use self::timeline::{CheckpointError, Timeline};
use crate::config::PageServerConf;
use crate::metrics::{MetricsSink, TimelineMetrics};

pub mod config;
pub mod gc_result;
pub mod layer_map;
pub mod mgr;
pub mod remote_timeline_client;
pub mod storage_layer;
pub(crate) mod tasks;
pub mod timeline;

pub const TENANTS_SEGMENT_NAME: &str = "tenants";
pub const TIMELINES_SEGMENT_NAME: &str = "timelines";

/// Classification shared by every error the tenant and timeline operations return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ErrorKind {
    /// The key, layer, timeline or tenant does not exist.
    NotFound,
    /// Remote storage could not be reached, or failed the request.
    RemoteUnavailable,
    /// A remote file failed its checksum or could not be parsed.
    Corrupt,
    /// The operation is not allowed in the current state.
    InvalidState,
    /// The tenant or timeline shut down while the operation was running.
    Cancelled,
    Other,
}

#[derive(thiserror::Error, Debug)]
pub enum GetTimelineError {
    #[error("Timeline {tenant_id}/{timeline_id} is not active, state: {state:?}")]
    NotActive {
        tenant_id: TenantId,
        timeline_id: TimelineId,
        state: TimelineState,
    },
    #[error("Timeline {tenant_id}/{timeline_id} was not found")]
    NotFound {
        tenant_id: TenantId,
        timeline_id: TimelineId,
    },
}

impl GetTimelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GetTimelineError::NotActive { .. } => ErrorKind::InvalidState,
            GetTimelineError::NotFound { .. } => ErrorKind::NotFound,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum TenantStateError {
    #[error("Tenant {0} not found")]
    NotFound(TenantId),
    #[error("Tenant {tenant_id} is not active, state: {state:?}")]
    NotActive {
        tenant_id: TenantId,
        state: TenantState,
    },
    #[error("Tenant {0} is shutting down")]
    Cancelled(TenantId),
    #[error("Timeline {tenant_id}/{timeline_id} already exists")]
    TimelineExists {
        tenant_id: TenantId,
        timeline_id: TimelineId,
    },
    #[error("remote storage operation failed: {0:#}")]
    Remote(anyhow::Error),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TenantStateError {
    pub(crate) fn kind(&self) -> ErrorKind {
        match self {
            TenantStateError::NotFound(_) => ErrorKind::NotFound,
            TenantStateError::NotActive { .. } | TenantStateError::TimelineExists { .. } => {
                ErrorKind::InvalidState
            }
            TenantStateError::Cancelled(_) => ErrorKind::Cancelled,
            TenantStateError::Remote(_) => ErrorKind::RemoteUnavailable,
            TenantStateError::Checkpoint(e) => e.kind(),
            TenantStateError::Other(_) => ErrorKind::Other,
        }
    }
}

///
/// Tenant consists of multiple timelines. Keep them in a hash table.
///
pub struct Tenant {
    // Global pageserver config parameters
    pub conf: &'static PageServerConf,

    tenant_id: TenantId,

    state: watch::Sender<TenantState>,

    // Overridden tenant-specific config parameters, shared with the timelines.
    // Unset parameters fall back to the pageserver-wide defaults.
    tenant_conf: Arc<std::sync::RwLock<TenantConfOpt>>,

    timelines: Mutex<HashMap<TimelineId, Arc<Timeline>>>,

    remote_storage: GenericRemoteStorage,

    metrics_sink: Arc<dyn MetricsSink>,

    /// Attach, timeline creation, checkpoint and the background loop iterations hold a guard.
    /// Detach closes the gate before shutting down the timelines.
    gate: Gate,

    /// Stops the background loops.
    pub(crate) cancel: CancellationToken,
}

impl std::fmt::Debug for Tenant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.tenant_id, self.current_state())
    }
}

impl Tenant {
    pub(crate) fn new(
        state: TenantState,
        conf: &'static PageServerConf,
        tenant_id: TenantId,
        tenant_conf: TenantConfOpt,
        remote_storage: GenericRemoteStorage,
        metrics_sink: Arc<dyn MetricsSink>,
    ) -> Tenant {
        let (state, _) = watch::channel(state);
        Tenant {
            conf,
            tenant_id,
            state,
            tenant_conf: Arc::new(std::sync::RwLock::new(tenant_conf)),
            timelines: Mutex::new(HashMap::new()),
            remote_storage,
            metrics_sink,
            gate: Gate::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn current_state(&self) -> TenantState {
        self.state.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        self.current_state() == TenantState::Active
    }

    pub(crate) fn subscribe_for_state_updates(&self) -> watch::Receiver<TenantState> {
        self.state.subscribe()
    }

    fn ensure_active(&self) -> Result<(), TenantStateError> {
        match self.current_state() {
            TenantState::Active => Ok(()),
            state => Err(TenantStateError::NotActive {
                tenant_id: self.tenant_id,
                state,
            }),
        }
    }

    fn set_broken(&self, reason: String) {
        warn!("tenant is now broken: {reason}");
        self.state.send_replace(TenantState::broken(reason));
        self.cancel.cancel();
    }

    /// Loads every timeline listed in remote storage: downloads its index part and builds
    /// its layer map with all layers remote only. No layer content is downloaded.
    ///
    /// Local files from an earlier attachment are removed first. On failure the tenant is
    /// Broken.
    #[instrument(skip_all, fields(tenant_id = %self.tenant_id))]
    pub(crate) async fn attach(&self) -> Result<(), AttachError> {
        match self.attach_timelines().await {
            Ok(()) => {
                for timeline in self.list_timelines() {
                    timeline.activate();
                }
                self.state.send_replace(TenantState::Active);
                info!("tenant attached");
                Ok(())
            }
            Err(e) => {
                error!("attach failed: {e:#}");
                self.set_broken(e.to_string());
                Err(e)
            }
        }
    }

    async fn attach_timelines(&self) -> Result<(), AttachError> {
        let _gate = self.gate.enter().map_err(|_| AttachError::Cancelled)?;

        let tenant_path = self.conf.tenant_path(&self.tenant_id);
        match tokio::fs::remove_dir_all(&tenant_path).await {
            Ok(()) => info!("removed local files of an earlier attachment"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("remove local tenant directory {tenant_path}"))
                    .into())
            }
        }
        crashsafe::create_dir_all(self.conf.timelines_path(&self.tenant_id))
            .await
            .context("create timelines directory")?;

        let timeline_ids = list_remote_timelines(&self.remote_storage, self.tenant_id)
            .await
            .map_err(AttachError::ListTimelines)?;

        for timeline_id in timeline_ids {
            let timeline = self.create_timeline_struct(timeline_id);
            let res = async {
                let index_part = timeline
                    .remote_client
                    .download_index_part()
                    .await
                    .map_err(|source| AttachError::IndexPart {
                        timeline_id,
                        source,
                    })?;
                crashsafe::create_dir_all(timeline.timeline_path())
                    .await
                    .context("create timeline directory")?;
                timeline.load_layer_map(&index_part).await?;
                Ok::<_, AttachError>(())
            }
            .await;

            if let Err(e) = res {
                timeline.metrics.shutdown();
                return Err(e);
            }
            self.timelines
                .lock()
                .unwrap()
                .insert(timeline_id, timeline);
        }
        Ok(())
    }

    fn create_timeline_struct(&self, timeline_id: TimelineId) -> Arc<Timeline> {
        let metrics = Arc::new(TimelineMetrics::new(
            self.tenant_id,
            timeline_id,
            Arc::clone(&self.metrics_sink),
        ));
        let remote_client = Arc::new(RemoteTimelineClient::new(
            self.remote_storage.clone(),
            self.tenant_id,
            timeline_id,
            Arc::clone(&metrics),
        ));
        Arc::new(Timeline::new(
            self.conf,
            Arc::clone(&self.tenant_conf),
            self.tenant_id,
            timeline_id,
            remote_client,
            metrics,
        ))
    }

    /// Creates an empty timeline, and uploads its index part so that a later attach
    /// finds it.
    #[instrument(skip_all, fields(tenant_id = %self.tenant_id, %timeline_id))]
    pub(crate) async fn create_timeline(
        &self,
        timeline_id: TimelineId,
    ) -> Result<Arc<Timeline>, TenantStateError> {
        let _gate = self
            .gate
            .enter()
            .map_err(|_| TenantStateError::Cancelled(self.tenant_id))?;
        self.ensure_active()?;

        if self.timelines.lock().unwrap().contains_key(&timeline_id) {
            return Err(TenantStateError::TimelineExists {
                tenant_id: self.tenant_id,
                timeline_id,
            });
        }

        let timeline = self.create_timeline_struct(timeline_id);
        let res = async {
            crashsafe::create_dir_all(timeline.timeline_path())
                .await
                .context("create timeline directory")?;
            let index_part = IndexPart::empty(Lsn(0));
            timeline
                .remote_client
                .upload_index_part(index_part.clone())
                .await
                .map_err(TenantStateError::Remote)?;
            timeline.load_layer_map(&index_part).await?;
            Ok::<_, TenantStateError>(())
        }
        .await;
        if let Err(e) = res {
            timeline.metrics.shutdown();
            return Err(e);
        }

        {
            let mut timelines = self.timelines.lock().unwrap();
            // detach stops the timelines it finds in the map, so a late one must not appear
            if let Err(e) = self.ensure_active() {
                timeline.metrics.shutdown();
                return Err(e);
            }
            match timelines.entry(timeline_id) {
                Entry::Occupied(_) => {
                    return Err(TenantStateError::TimelineExists {
                        tenant_id: self.tenant_id,
                        timeline_id,
                    })
                }
                Entry::Vacant(v) => {
                    v.insert(Arc::clone(&timeline));
                }
            }
            timeline.activate();
        }
        info!("created timeline");
        Ok(timeline)
    }

    /// Get Timeline handle for given timeline ID.
    /// This function is idempotent. It doesn't change internal state in any way.
    pub fn get_timeline(
        &self,
        timeline_id: TimelineId,
        active_only: bool,
    ) -> Result<Arc<Timeline>, GetTimelineError> {
        let timelines_accessor = self.timelines.lock().unwrap();
        let timeline = timelines_accessor
            .get(&timeline_id)
            .ok_or(GetTimelineError::NotFound {
                tenant_id: self.tenant_id,
                timeline_id,
            })?;

        if active_only && !timeline.is_active() {
            Err(GetTimelineError::NotActive {
                tenant_id: self.tenant_id,
                timeline_id,
                state: timeline.current_state(),
            })
        } else {
            Ok(Arc::clone(timeline))
        }
    }

    /// Lists timelines the tenant contains.
    /// It's up to callers to omit certain timelines that are not considered ready for use.
    pub fn list_timelines(&self) -> Vec<Arc<Timeline>> {
        self.timelines.lock().unwrap().values().cloned().collect()
    }

    /// Checkpoints every timeline of the tenant. Returns after the new layers and index parts
    /// are uploaded.
    pub(crate) async fn checkpoint(&self) -> Result<(), TenantStateError> {
        let _gate = self
            .gate
            .enter()
            .map_err(|_| TenantStateError::Cancelled(self.tenant_id))?;
        self.ensure_active()?;

        for timeline in self.list_timelines() {
            timeline.checkpoint().await?;
        }
        Ok(())
    }

    /// One compaction pass over all active timelines, as run by the background loop.
    ///
    /// Timelines buffering more than `checkpoint_distance` of writes are checkpointed first.
    pub(crate) async fn compaction_iteration(&self) -> Result<(), CompactionError> {
        let _gate = self
            .gate
            .enter()
            .map_err(|_| CompactionError::ShuttingDown)?;
        if !self.is_active() {
            return Ok(());
        }
        for timeline in self.list_timelines() {
            if !timeline.is_active() {
                continue;
            }
            if timeline.should_checkpoint().await {
                match timeline.checkpoint().await {
                    Ok(_) => {}
                    Err(CheckpointError::Cancelled) => return Err(CompactionError::ShuttingDown),
                    Err(CheckpointError::Upload(e)) => return Err(CompactionError::Remote(e)),
                    Err(e) => return Err(CompactionError::Other(anyhow::Error::new(e))),
                }
            }
            timeline.compact().await?;
        }
        Ok(())
    }

    /// One GC pass over all active timelines, as run by the background loop.
    pub(crate) async fn gc_iteration(&self) -> Result<GcResult, CompactionError> {
        let _gate = self
            .gate
            .enter()
            .map_err(|_| CompactionError::ShuttingDown)?;
        let mut totals = GcResult::default();
        if !self.is_active() {
            return Ok(totals);
        }
        for timeline in self.list_timelines() {
            if timeline.is_active() {
                totals += timeline.gc().await?;
            }
        }
        Ok(totals)
    }

    /// Refuses new work, waits for running operations and downloads to finish, then drops
    /// the timelines and the tenant's local files. Remote storage is left untouched.
    #[instrument(skip_all, fields(tenant_id = %self.tenant_id))]
    pub(crate) async fn detach(&self) -> anyhow::Result<()> {
        self.state.send_replace(TenantState::Detaching);
        self.cancel.cancel();

        // new reads are refused from here on; the running ones are drained below
        for timeline in self.list_timelines() {
            timeline.set_state(TimelineState::Stopping);
        }

        debug!("waiting for tenant operations to finish");
        self.gate.close().await;

        let timelines: Vec<Arc<Timeline>> = self
            .timelines
            .lock()
            .unwrap()
            .drain()
            .map(|(_, timeline)| timeline)
            .collect();
        futures::future::join_all(timelines.iter().map(|timeline| timeline.shutdown())).await;

        let tenant_path = self.conf.tenant_path(&self.tenant_id);
        match tokio::fs::remove_dir_all(&tenant_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("remove tenant directory {tenant_path}"))
            }
        }

        self.state.send_replace(TenantState::Detached);
        info!("tenant detached");
        Ok(())
    }

    pub(crate) fn set_new_tenant_config(&self, new_tenant_conf: TenantConfOpt) {
        *self.tenant_conf.write().unwrap() = new_tenant_conf;
    }

    fn get_tenant_conf(&self) -> TenantConf {
        let tenant_conf = self.tenant_conf.read().unwrap();
        tenant_conf.merge(self.conf.default_tenant_conf)
    }

    pub(crate) fn get_compaction_period(&self) -> Duration {
        self.get_tenant_conf().compaction_period
    }

    pub(crate) fn get_gc_period(&self) -> Duration {
        self.get_tenant_conf().gc_period
    }
}


#[cfg(test)]
mod tests {
    use super::harness::TenantHarness;
    use super::*;
    use bytes::Bytes;
    use pageserver_api::key::Key;
    use pageserver_api::value::Value;
    use remote_storage::RemoteOp;

    #[tokio::test]
    async fn create_timeline_twice() -> anyhow::Result<()> {
        let harness = TenantHarness::create("create_timeline_twice")?;
        let tenant = harness.load().await;
        let timeline_id = TimelineId::generate();

        let tl = tenant.create_timeline(timeline_id).await?;
        assert!(tl.is_active());
        assert!(tl.timeline_path().exists());

        let err = tenant.create_timeline(timeline_id).await.unwrap_err();
        assert!(matches!(err, TenantStateError::TimelineExists { .. }));
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        assert!(Arc::ptr_eq(&tenant.get_timeline(timeline_id, true)?, &tl));
        let err = tenant
            .get_timeline(TimelineId::generate(), false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        Ok(())
    }

    #[tokio::test]
    async fn failed_timeline_creation_leaves_no_timeline() -> anyhow::Result<()> {
        let harness = TenantHarness::create("failed_timeline_creation_leaves_no_timeline")?;
        let tenant = harness.load().await;
        let timeline_id = TimelineId::generate();

        harness.unreliable.set_outage(true);
        let err = tenant.create_timeline(timeline_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteUnavailable);
        assert!(tenant.get_timeline(timeline_id, false).is_err());

        harness.unreliable.set_outage(false);
        tenant.create_timeline(timeline_id).await?;
        Ok(())
    }

    #[tokio::test]
    async fn tenant_checkpoint_covers_all_timelines() -> anyhow::Result<()> {
        let harness = TenantHarness::create("tenant_checkpoint_covers_all_timelines")?;
        let tenant = harness.load().await;

        let mut timelines = Vec::new();
        for _ in 0..3 {
            let tl = tenant.create_timeline(TimelineId::generate()).await?;
            let writer = tl.writer().await;
            writer
                .put(
                    Key::new(1, 0),
                    Lsn(0x10),
                    &Value::Image(Bytes::from_static(b"x")),
                )
                .await?;
            writer.finish_write(Lsn(0x10));
            drop(writer);
            timelines.push(tl);
        }

        tenant.checkpoint().await?;
        for tl in &timelines {
            assert_eq!(tl.get_remote_consistent_lsn(), Some(Lsn(0x10)));
        }
        Ok(())
    }

    #[tokio::test]
    async fn compaction_iteration_checkpoints_large_buffers() -> anyhow::Result<()> {
        let harness = TenantHarness::create("compaction_iteration_checkpoints_large_buffers")?;
        let tenant = harness.load().await;
        tenant.set_new_tenant_config(TenantConfOpt {
            checkpoint_distance: Some(1024),
            ..TenantConfOpt::default()
        });
        let tl = tenant.create_timeline(TimelineId::generate()).await?;

        let put = |lsn: Lsn, value: Bytes| {
            let tl = Arc::clone(&tl);
            async move {
                let writer = tl.writer().await;
                writer.put(Key::new(1, 0), lsn, &Value::Image(value)).await?;
                writer.finish_write(lsn);
                anyhow::Ok(())
            }
        };

        put(Lsn(0x10), Bytes::from_static(b"small")).await?;
        assert!(!tl.should_checkpoint().await);
        tenant.compaction_iteration().await?;
        assert_eq!(tl.get_disk_consistent_lsn(), Lsn(0));
        assert!(tl.layer_map_info().await?.historic_layers.is_empty());

        put(Lsn(0x20), Bytes::from(vec![7u8; 2048])).await?;
        assert!(tl.should_checkpoint().await);
        tenant.compaction_iteration().await?;
        assert_eq!(tl.get_disk_consistent_lsn(), Lsn(0x20));
        assert_eq!(tl.get_remote_consistent_lsn(), Some(Lsn(0x20)));
        assert_eq!(tl.layer_map_info().await?.historic_layers.len(), 1);
        assert!(!tl.should_checkpoint().await);
        Ok(())
    }

    #[tokio::test]
    async fn detach_removes_local_files_only() -> anyhow::Result<()> {
        let harness = TenantHarness::create("detach_removes_local_files_only")?;
        let tenant = harness.load().await;
        let tl = tenant.create_timeline(TimelineId::generate()).await?;

        tenant.detach().await?;
        assert_eq!(tenant.current_state(), TenantState::Detached);
        assert!(!harness.conf.tenant_path(&harness.tenant_id).exists());
        assert_eq!(tl.current_state(), TimelineState::Stopping);
        assert!(tenant.list_timelines().is_empty());

        let err = tenant
            .create_timeline(TimelineId::generate())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        // the remote index part is still there
        let remote_index =
            remote_timeline_client::remote_index_path(&tl.tenant_id, &tl.timeline_id);
        assert!(remote_index
            .with_base(&harness.conf.workdir.join("remote_storage"))
            .exists());
        assert_eq!(harness.unreliable.calls(&RemoteOp::Delete(remote_index)), 0);
        Ok(())
    }
}
