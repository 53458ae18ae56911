//! This module contains per-tenant background processes, e.g. compaction and GC.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::tenant::{Tenant, TenantState};

const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// How often a loop whose period is zero checks whether it got enabled.
const DISABLED_RECHECK_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, PartialEq, Eq, Clone, Copy, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
enum BackgroundLoopKind {
    Compaction,
    Gc,
}

/// Start per-tenant background loops: compaction and gc. They stop when the tenant's
/// cancellation token fires.
pub(crate) fn start_background_loops(tenant: &Arc<Tenant>) {
    let tenant_id = tenant.tenant_id();
    tokio::spawn(
        compaction_loop(Arc::clone(tenant), tenant.cancel.clone())
            .instrument(info_span!("compaction_loop", %tenant_id)),
    );
    tokio::spawn(
        gc_loop(Arc::clone(tenant), tenant.cancel.clone())
            .instrument(info_span!("gc_loop", %tenant_id)),
    );
}

///
/// Compaction task's main loop
///
async fn compaction_loop(tenant: Arc<Tenant>, cancel: CancellationToken) {
    let mut error_run = 0; // consecutive errors
    let mut first = true;
    debug!("starting");

    loop {
        if wait_for_active_tenant(&tenant, &cancel).await.is_break() {
            break;
        }

        let period = tenant.get_compaction_period();
        if first {
            first = false;
            if sleep_random(period.min(tenant.conf.background_task_maximum_delay), &cancel)
                .await
                .is_err()
            {
                break;
            }
        }

        let sleep_duration = if period == Duration::ZERO {
            debug!("automatic compaction is disabled");
            DISABLED_RECHECK_INTERVAL
        } else {
            let started_at = Instant::now();
            match tenant.compaction_iteration().await {
                Ok(()) => {
                    error_run = 0;
                    warn_when_period_overrun(
                        started_at.elapsed(),
                        period,
                        BackgroundLoopKind::Compaction,
                    );
                    period
                }
                Err(e) if e.is_cancel() => {
                    debug!("compaction cancelled: {e}");
                    break;
                }
                Err(e) => {
                    error_run += 1;
                    let wait_duration = backoff_duration(error_run);
                    error!(
                        "Compaction failed {error_run} times, retrying in {wait_duration:?}: {e:#}"
                    );
                    wait_duration
                }
            }
        };

        // Sleep
        if tokio::time::timeout(sleep_duration, cancel.cancelled())
            .await
            .is_ok()
        {
            break;
        }
    }
    debug!("compaction loop stopped");
}

///
/// GC task's main loop
///
async fn gc_loop(tenant: Arc<Tenant>, cancel: CancellationToken) {
    let mut error_run = 0; // consecutive errors
    let mut first = true;
    debug!("starting");

    loop {
        if wait_for_active_tenant(&tenant, &cancel).await.is_break() {
            break;
        }

        let period = tenant.get_gc_period();
        if first {
            first = false;
            if sleep_random(period.min(tenant.conf.background_task_maximum_delay), &cancel)
                .await
                .is_err()
            {
                break;
            }
        }

        let sleep_duration = if period == Duration::ZERO {
            debug!("automatic GC is disabled");
            DISABLED_RECHECK_INTERVAL
        } else {
            let started_at = Instant::now();
            match tenant.gc_iteration().await {
                Ok(result) => {
                    error_run = 0;
                    if result.layers_removed > 0 {
                        info!(
                            layers_removed = result.layers_removed,
                            layers_total = result.layers_total,
                            "gc iteration complete"
                        );
                    }
                    warn_when_period_overrun(started_at.elapsed(), period, BackgroundLoopKind::Gc);
                    period
                }
                Err(e) if e.is_cancel() => {
                    debug!("gc cancelled: {e}");
                    break;
                }
                Err(e) => {
                    error_run += 1;
                    let wait_duration = backoff_duration(error_run);
                    error!("Gc failed {error_run} times, retrying in {wait_duration:?}: {e:#}");
                    wait_duration
                }
            }
        };

        if tokio::time::timeout(sleep_duration, cancel.cancelled())
            .await
            .is_ok()
        {
            break;
        }
    }
    debug!("gc loop stopped");
}

async fn wait_for_active_tenant(
    tenant: &Arc<Tenant>,
    cancel: &CancellationToken,
) -> ControlFlow<()> {
    if tenant.current_state() == TenantState::Active {
        return ControlFlow::Continue(());
    }

    let mut update_rx = tenant.subscribe_for_state_updates();
    tokio::select! {
        result = update_rx.wait_for(|s| s == &TenantState::Active || s.is_terminal()) => {
            match result {
                Ok(state) if *state == TenantState::Active => {
                    debug!("Tenant state changed to active, continuing the task loop");
                    ControlFlow::Continue(())
                }
                _ => ControlFlow::Break(()),
            }
        },
        _ = cancel.cancelled() => ControlFlow::Break(()),
    }
}

#[derive(thiserror::Error, Debug)]
#[error("cancelled")]
struct Cancelled;

/// Sleeps a random duration up to `max`, so that loops of tenants attached together do not
/// run in lockstep.
async fn sleep_random(max: Duration, cancel: &CancellationToken) -> Result<Duration, Cancelled> {
    let delay = rand::thread_rng().gen_range(Duration::ZERO..=max);
    if delay == Duration::ZERO {
        return Ok(delay);
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(Cancelled),
        _ = tokio::time::sleep(delay) => Ok(delay),
    }
}

fn backoff_duration(error_run: u32) -> Duration {
    Duration::from_secs_f64(2f64.powi(error_run.min(16) as i32)).min(MAX_BACKOFF)
}

fn warn_when_period_overrun(elapsed: Duration, period: Duration, task: BackgroundLoopKind) {
    // Duration::ZERO will happen because it's the "disable [bgtask]" value.
    if elapsed >= period && period != Duration::ZERO {
        warn!(
            ?elapsed,
            period = %humantime::format_duration(period),
            %task,
            "task iteration took longer than the configured period"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::config::TenantConfOpt;
    use crate::tenant::harness::TenantHarness;
    use bytes::Bytes;
    use pageserver_api::key::Key;
    use pageserver_api::value::Value;
    use utils::id::TimelineId;
    use utils::lsn::Lsn;

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff_duration(1), Duration::from_secs(2));
        assert_eq!(backoff_duration(3), Duration::from_secs(8));
        assert_eq!(backoff_duration(100), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn compaction_loop_merges_deltas() -> anyhow::Result<()> {
        let harness = TenantHarness::create("compaction_loop_merges_deltas")?;
        let tenant = harness.load().await;
        let tl = tenant.create_timeline(TimelineId::generate()).await?;

        for i in 1..=3u64 {
            let writer = tl.writer().await;
            writer
                .put(
                    Key::new(1, i as u32),
                    Lsn(0x10 * i),
                    &Value::Image(Bytes::from_static(b"x")),
                )
                .await?;
            writer.finish_write(Lsn(0x10 * i));
            drop(writer);
            tl.checkpoint().await?;
        }
        assert_eq!(tl.layer_map_info().await?.historic_layers.len(), 3);

        tenant.set_new_tenant_config(TenantConfOpt {
            compaction_period: Some(Duration::from_millis(10)),
            compaction_threshold: Some(3),
            ..TenantConfOpt::default()
        });
        start_background_loops(&tenant);

        let deadline = Instant::now() + Duration::from_secs(10);
        while tl.layer_map_info().await?.historic_layers.len() != 1 {
            assert!(Instant::now() < deadline, "compaction loop did not run");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(&tl.get(Key::new(1, 2), Lsn(0x30)).await?[..], b"x");

        tenant.cancel.cancel();
        Ok(())
    }

    #[tokio::test]
    async fn zero_delay_ignores_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(sleep_random(Duration::ZERO, &cancel).await.ok(), Some(Duration::ZERO));
    }
}
