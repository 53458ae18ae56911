//! Functions for handling page server configuration options
//!
//! Configuration options are set in the `pageserver.toml` configuration file.
//! Every option has a default except `remote_storage`, which has to name the
//! durable storage the tenants are backed up to.

use std::time::Duration;

use anyhow::{ensure, Context};
use camino::{Utf8Path, Utf8PathBuf};
use remote_storage::{RemotePath, RemoteStorageConfig};
use serde::Deserialize;
use utils::id::{TenantId, TimelineId};
use utils::logging::LogFormat;

use crate::tenant::config::{TenantConf, TenantConfOpt};
use crate::tenant::{TENANTS_SEGMENT_NAME, TIMELINES_SEGMENT_NAME};

pub mod defaults {
    pub const DEFAULT_LOG_FORMAT: &str = "plain";
    pub const DEFAULT_BACKGROUND_TASK_MAXIMUM_DELAY: &str = "10s";
}

/// Contents of `pageserver.toml`, before defaults are filled in.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    log_format: Option<String>,
    remote_storage: Option<RemoteStorageConfig>,
    #[serde(default, with = "humantime_serde")]
    background_task_maximum_delay: Option<Duration>,
    #[serde(default)]
    tenant_config: TenantConfOpt,
}

/// Global state of pageserver: where it keeps its files, and where it backs them up.
#[derive(Debug, Clone)]
pub struct PageServerConf {
    /// Local directory holding every attached tenant's layer files.
    pub workdir: Utf8PathBuf,

    pub log_format: LogFormat,

    pub remote_storage_config: RemoteStorageConfig,

    /// Background loops start at a random offset below this, so that tenants attached at once
    /// do not run compaction in lockstep.
    pub background_task_maximum_delay: Duration,

    pub default_tenant_conf: TenantConf,
}

impl PageServerConf {
    //
    // Repository paths, relative to workdir.
    //

    pub fn tenants_path(&self) -> Utf8PathBuf {
        self.workdir.join(TENANTS_SEGMENT_NAME)
    }

    pub fn tenant_path(&self, tenant_id: &TenantId) -> Utf8PathBuf {
        self.tenants_path().join(tenant_id.to_string())
    }

    pub fn timelines_path(&self, tenant_id: &TenantId) -> Utf8PathBuf {
        self.tenant_path(tenant_id).join(TIMELINES_SEGMENT_NAME)
    }

    pub fn timeline_path(&self, tenant_id: &TenantId, timeline_id: &TimelineId) -> Utf8PathBuf {
        self.timelines_path(tenant_id)
            .join(timeline_id.to_string())
    }

    /// Turns storage remote path of a file into its local path.
    pub fn local_path(&self, remote_path: &RemotePath) -> Utf8PathBuf {
        remote_path.with_base(&self.workdir)
    }

    /// Parses `pageserver.toml` content, filling in defaults for everything not set.
    pub fn parse_and_validate(toml: &str, workdir: &Utf8Path) -> anyhow::Result<Self> {
        let ConfigToml {
            log_format,
            remote_storage,
            background_task_maximum_delay,
            tenant_config,
        } = toml::from_str(toml).context("parse pageserver config")?;

        ensure!(
            workdir.is_absolute(),
            "workdir {workdir:?} must be an absolute path"
        );

        let log_format = LogFormat::from_config(
            log_format
                .as_deref()
                .unwrap_or(defaults::DEFAULT_LOG_FORMAT),
        )?;
        let remote_storage_config =
            remote_storage.context("`remote_storage` must be configured")?;
        let background_task_maximum_delay = match background_task_maximum_delay {
            Some(delay) => delay,
            None => humantime::parse_duration(defaults::DEFAULT_BACKGROUND_TASK_MAXIMUM_DELAY)
                .context("parse default background task maximum delay")?,
        };

        Ok(PageServerConf {
            workdir: workdir.to_owned(),
            log_format,
            remote_storage_config,
            background_task_maximum_delay,
            default_tenant_conf: tenant_config.merge(TenantConf::default()),
        })
    }

    /// Configuration for tests: everything under `repo_dir`, with the remote storage being a
    /// directory inside it. Background loops are off, tests drive compaction and gc directly.
    pub fn dummy_conf(repo_dir: Utf8PathBuf) -> Self {
        let remote_root = repo_dir.join("remote_storage");
        PageServerConf {
            workdir: repo_dir,
            log_format: LogFormat::Test,
            remote_storage_config: RemoteStorageConfig {
                storage: remote_storage::RemoteStorageKind::LocalFs {
                    local_path: remote_root,
                },
                timeout: RemoteStorageConfig::DEFAULT_TIMEOUT,
            },
            background_task_maximum_delay: Duration::ZERO,
            default_tenant_conf: TenantConf {
                compaction_period: Duration::ZERO,
                gc_period: Duration::ZERO,
                ..TenantConf::default()
            },
        }
    }
}
