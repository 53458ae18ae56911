//! This module acts as a switchboard to access the tenants managed by this page server.

use std::collections::{hash_map, HashMap};
use std::sync::Arc;

use remote_storage::{DownloadError, GenericRemoteStorage};
use tokio::sync::RwLock;
use tracing::*;
use utils::id::{TenantId, TimelineId};

use crate::config::PageServerConf;
use crate::metrics::MetricsSink;
use crate::tenant::config::TenantConfOpt;
use crate::tenant::remote_timeline_client::download::download_error_kind;
use crate::tenant::remote_timeline_client::DownloadIndexError;
use crate::tenant::{tasks, ErrorKind, Tenant, TenantState, TenantStateError};

#[derive(Debug, thiserror::Error)]
pub enum GetTenantError {
    #[error("Tenant {0} not found")]
    NotFound(TenantId),
    #[error("Tenant {tenant_id} is not active, state: {state:?}")]
    NotActive {
        tenant_id: TenantId,
        state: TenantState,
    },
}

impl GetTenantError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GetTenantError::NotFound(_) => ErrorKind::NotFound,
            GetTenantError::NotActive { .. } => ErrorKind::InvalidState,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum AttachError {
    #[error("tenant {0} is already attached")]
    AlreadyAttached(TenantId),
    #[error("failed to list remote timelines: {0}")]
    ListTimelines(DownloadError),
    #[error("failed to load index part of timeline {timeline_id}: {source}")]
    IndexPart {
        timeline_id: TimelineId,
        source: DownloadIndexError,
    },
    #[error("tenant is shutting down")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AttachError {
    pub(crate) fn kind(&self) -> ErrorKind {
        match self {
            AttachError::AlreadyAttached(_) => ErrorKind::InvalidState,
            AttachError::ListTimelines(e) => download_error_kind(e),
            AttachError::IndexPart { source, .. } => source.kind(),
            AttachError::Cancelled => ErrorKind::Cancelled,
            AttachError::Other(_) => ErrorKind::Other,
        }
    }
}

/// The tenants attached to this page server, and what they share: the config, the remote
/// storage, and the metrics sink.
pub struct TenantManager {
    conf: &'static PageServerConf,
    remote_storage: GenericRemoteStorage,
    metrics_sink: Arc<dyn MetricsSink>,
    tenants: RwLock<HashMap<TenantId, Arc<Tenant>>>,
}

impl TenantManager {
    pub fn new(
        conf: &'static PageServerConf,
        remote_storage: GenericRemoteStorage,
        metrics_sink: Arc<dyn MetricsSink>,
    ) -> Self {
        TenantManager {
            conf,
            remote_storage,
            metrics_sink,
            tenants: RwLock::new(HashMap::new()),
        }
    }

    /// Attaches the tenant from remote storage and starts its background loops.
    ///
    /// Returns once every timeline's layer map is loaded. No layer file is downloaded. A
    /// tenant that failed to attach stays in memory as Broken until it is attached again or
    /// detached.
    pub(crate) async fn attach_tenant(
        &self,
        tenant_id: TenantId,
    ) -> Result<Arc<Tenant>, AttachError> {
        self.attach_with_config(tenant_id, TenantConfOpt::default())
            .await
    }

    /// Like [`Self::attach_tenant`], with overrides for the tenant's config. A tenant that has
    /// nothing in remote storage yet starts without timelines.
    pub(crate) async fn create_tenant(
        &self,
        tenant_id: TenantId,
        tenant_conf: TenantConfOpt,
    ) -> Result<Arc<Tenant>, AttachError> {
        self.attach_with_config(tenant_id, tenant_conf).await
    }

    #[instrument(skip_all, fields(%tenant_id))]
    async fn attach_with_config(
        &self,
        tenant_id: TenantId,
        tenant_conf: TenantConfOpt,
    ) -> Result<Arc<Tenant>, AttachError> {
        let tenant = Arc::new(Tenant::new(
            TenantState::Attaching,
            self.conf,
            tenant_id,
            tenant_conf,
            self.remote_storage.clone(),
            Arc::clone(&self.metrics_sink),
        ));

        let replaced = match self.tenants.write().await.entry(tenant_id) {
            hash_map::Entry::Occupied(mut e) => match e.get().current_state() {
                TenantState::Broken { .. } | TenantState::Detached => {
                    Some(e.insert(Arc::clone(&tenant)))
                }
                state => {
                    debug!("tenant is already attached, state: {state}");
                    return Err(AttachError::AlreadyAttached(tenant_id));
                }
            },
            hash_map::Entry::Vacant(v) => {
                v.insert(Arc::clone(&tenant));
                None
            }
        };

        if let Some(old) = replaced {
            info!("replacing tenant in state {}", old.current_state());
            if let Err(e) = old.detach().await {
                warn!("failed to clean up the replaced tenant: {e:#}");
            }
        }

        tenant.attach().await?;
        tasks::start_background_loops(&tenant);
        Ok(tenant)
    }

    /// Stops the tenant and removes its local files. Remote storage is left as is.
    ///
    /// If the cleanup fails, the tenant stays in memory as Broken, and another detach is
    /// needed to remove it.
    #[instrument(skip_all, fields(%tenant_id))]
    pub(crate) async fn detach_tenant(&self, tenant_id: TenantId) -> Result<(), TenantStateError> {
        let tenant = {
            let tenants = self.tenants.read().await;
            let tenant = tenants
                .get(&tenant_id)
                .ok_or(TenantStateError::NotFound(tenant_id))?;
            match tenant.current_state() {
                TenantState::Detaching => return Err(TenantStateError::Cancelled(tenant_id)),
                TenantState::Attaching => {
                    return Err(TenantStateError::NotActive {
                        tenant_id,
                        state: TenantState::Attaching,
                    })
                }
                TenantState::Active | TenantState::Broken { .. } | TenantState::Detached => {
                    Arc::clone(tenant)
                }
            }
        };

        match tenant.detach().await {
            Ok(()) => {
                let mut tenants = self.tenants.write().await;
                match tenants.get(&tenant_id) {
                    Some(current) if Arc::ptr_eq(current, &tenant) => {
                        tenants.remove(&tenant_id);
                    }
                    _ => warn!("tenant got replaced in memory before detach finished"),
                }
                Ok(())
            }
            Err(e) => {
                tenant.set_broken(format!("detach failed: {e:#}"));
                Err(TenantStateError::Other(e))
            }
        }
    }

    /// Gets the tenant from the in-memory data, erroring if it's absent or is not fitting to
    /// the query. `active_only = true` allows to query only tenants that are ready for
    /// operations, erroring on other kinds of tenants.
    pub async fn get_tenant(
        &self,
        tenant_id: TenantId,
        active_only: bool,
    ) -> Result<Arc<Tenant>, GetTenantError> {
        let m = self.tenants.read().await;
        let tenant = m
            .get(&tenant_id)
            .ok_or(GetTenantError::NotFound(tenant_id))?;
        if active_only && !tenant.is_active() {
            Err(GetTenantError::NotActive {
                tenant_id,
                state: tenant.current_state(),
            })
        } else {
            Ok(Arc::clone(tenant))
        }
    }

    pub async fn list_tenants(&self) -> Vec<(TenantId, TenantState)> {
        self.tenants
            .read()
            .await
            .iter()
            .map(|(id, tenant)| (*id, tenant.current_state()))
            .collect()
    }
}
