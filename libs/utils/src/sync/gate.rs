use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

/// Gates are a concurrency helper for draining a resource before tearing it down.
///
/// Users of a resource call `enter()` to acquire a [`GateGuard`], and the owner of the resource
/// calls `close()` when it wants to ensure that all holders of guards have released them, and
/// that no future guards will be issued.
pub struct Gate {
    inner: Arc<GateInner>,
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("ptr", &Arc::as_ptr(&self.inner))
            .field("closing", &self.inner.closing.load(Ordering::Relaxed))
            .finish()
    }
}

struct GateInner {
    sem: tokio::sync::Semaphore,
    closing: AtomicBool,
}

/// RAII guard for a [`Gate`]: as long as this exists, calls to [`Gate::close`] will
/// not complete.
#[derive(Debug)]
pub struct GateGuard {
    // where the gate was entered, to name who is blocking Gate::close
    span_at_enter: tracing::Span,
    gate: Arc<GateInner>,
}

impl std::fmt::Debug for GateInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateInner")
            .field("avail_permits", &self.sem.available_permits())
            .finish()
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        if self.gate.closing.load(Ordering::Relaxed) {
            self.span_at_enter.in_scope(
                || tracing::info!(gate = ?Arc::as_ptr(&self.gate), "kept the gate from closing"),
            );
        }

        // the permit was forgotten on enter, give it back by hand
        self.gate.sem.add_permits(1);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("gate is closed")]
    GateClosed,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            inner: Arc::new(GateInner {
                sem: tokio::sync::Semaphore::new(Self::MAX_UNITS as usize),
                closing: AtomicBool::new(false),
            }),
        }
    }
}

impl Gate {
    const MAX_UNITS: u32 = u32::MAX >> 3;

    /// Acquire a guard that will prevent close() calls from completing. If close()
    /// was already called, this will return an error which should be interpreted
    /// as "shutting down".
    pub fn enter(&self) -> Result<GateGuard, GateError> {
        let permit = self
            .inner
            .sem
            .try_acquire()
            .map_err(|_| GateError::GateClosed)?;

        permit.forget();

        Ok(GateGuard {
            span_at_enter: tracing::Span::current(),
            gate: self.inner.clone(),
        })
    }

    /// Wait for all guards to be dropped, and refuse any new ones.
    ///
    /// Holders of guards are expected to notice cancellation of the owning resource, otherwise
    /// this waits for as long as they keep running.
    pub async fn close(&self) {
        let started_at = std::time::Instant::now();
        let mut do_close = std::pin::pin!(self.do_close());

        let nag_after = Duration::from_millis(100);

        let Err(_timeout) = tokio::time::timeout(nag_after, &mut do_close).await else {
            return;
        };

        tracing::info!(
            gate = ?Arc::as_ptr(&self.inner),
            elapsed_ms = started_at.elapsed().as_millis(),
            "closing is taking longer than expected"
        );

        // only for observability: guards dropped from now on log where they were entered
        self.inner.closing.store(true, Ordering::Relaxed);

        do_close.await;

        tracing::info!(
            gate = ?Arc::as_ptr(&self.inner),
            elapsed_ms = started_at.elapsed().as_millis(),
            "close completed"
        );
    }

    /// Has [`Self::close`] finished waiting for all [`Self::enter`] users.
    pub fn close_complete(&self) -> bool {
        self.inner.sem.is_closed()
    }

    async fn do_close(&self) {
        match self.inner.sem.acquire_many(Self::MAX_UNITS).await {
            Ok(_permit) => {
                // holding all units: nobody else is inside, close for good
                self.inner.sem.close();
            }
            Err(_closed) => {
                tracing::debug!("double close")
            }
        }
    }
}
