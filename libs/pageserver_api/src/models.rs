use serde::{Deserialize, Serialize};
use utils::{
    id::{TenantId, TimelineId},
    lsn::Lsn,
};

/// Current state of a tenant in pageserver's memory.
///
/// ```mermaid
/// stateDiagram-v2
///
///     [*] --> Attaching: attach()
///     Attaching --> Active: all index parts loaded
///     Attaching --> Broken: attach() failure
///
///     Active --> Detaching: detach()
///     Detaching --> Detached: in-flight work drained, local state dropped
///
///     Active --> Broken: unrecoverable corruption
///     Broken --> [*]: re-attach or detach
///     Detached --> [*]
/// ```
#[derive(
    Clone,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::VariantNames,
    strum_macros::AsRefStr,
    strum_macros::IntoStaticStr,
)]
#[serde(tag = "slug", content = "data")]
pub enum TenantState {
    /// Timelines and their layer maps are being rebuilt from remote index parts.
    Attaching,
    /// Attach finished, the tenant serves reads and checkpoints.
    Active,
    /// Detach started: no new operations are admitted, in-flight ones are draining.
    Detaching,
    /// Local state is gone. Remote state is untouched.
    Detached,
    /// The tenant can no longer be used, until it is attached anew.
    Broken { reason: String },
}

impl TenantState {
    pub fn is_active(&self) -> bool {
        matches!(self, TenantState::Active)
    }

    /// States the tenant never leaves on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TenantState::Detached | TenantState::Broken { .. })
    }

    pub fn broken(reason: impl std::fmt::Display) -> Self {
        TenantState::Broken {
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Debug for TenantState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Broken { reason } => f.debug_struct("Broken").field("reason", reason).finish(),
            _ => write!(f, "{self}"),
        }
    }
}

/// A state of a timeline in pageserver's memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
pub enum TimelineState {
    /// The layer map is being built and the timeline does not serve requests yet.
    Loading,
    /// The timeline is fully operational.
    Active,
    /// The timeline was previously Loading or Active but is shutting down.
    /// It cannot transition back into any other state.
    Stopping,
    /// The timeline is broken and not operational.
    Broken { reason: String },
}

/// Read-only summary of a timeline, for the control surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineDetail {
    pub tenant_id: TenantId,
    pub timeline_id: TimelineId,
    /// Sum of the sizes of locally resident layer files.
    pub current_physical_size: u64,
    pub last_record_lsn: Lsn,
    pub disk_consistent_lsn: Lsn,
    /// Highest LSN covered by an uploaded index part, if any was uploaded.
    pub remote_consistent_lsn: Option<Lsn>,
    pub state: TimelineState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerMapInfo {
    pub in_memory_layers: Vec<InMemoryLayerInfo>,
    pub historic_layers: Vec<HistoricLayerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum InMemoryLayerInfo {
    Open { lsn_start: Lsn },
    Frozen { lsn_start: Lsn, lsn_end: Lsn },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum HistoricLayerInfo {
    Delta {
        layer_file_name: String,
        layer_file_size: u64,

        lsn_start: Lsn,
        lsn_end: Lsn,
        remote: bool,
    },
    Image {
        layer_file_name: String,
        layer_file_size: u64,

        lsn_start: Lsn,
        remote: bool,
    },
}

impl HistoricLayerInfo {
    pub fn layer_file_name(&self) -> &str {
        match self {
            HistoricLayerInfo::Delta {
                layer_file_name, ..
            } => layer_file_name,
            HistoricLayerInfo::Image {
                layer_file_name, ..
            } => layer_file_name,
        }
    }

    /// Only known remotely, the content is not on local disk.
    pub fn is_remote(&self) -> bool {
        match self {
            HistoricLayerInfo::Delta { remote, .. } => *remote,
            HistoricLayerInfo::Image { remote, .. } => *remote,
        }
    }
}
