use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

type OnTimeout = Arc<dyn Fn() + Send + Sync>;

struct ActiveDeadline {
    generation: u64,
    token: CancellationToken,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Slot {
    active: Option<ActiveDeadline>,
    generation: u64,
}

/// One logical operation slot with at most one live deadline.
///
/// Must be used from within a tokio runtime; the deadline timer is a spawned
/// task.
#[derive(Clone)]
pub struct TimeoutController {
    timeout: Duration,
    on_timeout: OnTimeout,
    slot: Arc<Mutex<Slot>>,
}

impl TimeoutController {
    pub fn new(timeout: Duration) -> Self {
        Self::with_callback(timeout, || {})
    }

    pub fn with_callback(timeout: Duration, on_timeout: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            timeout,
            on_timeout: Arc::new(on_timeout),
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Issues a fresh token whose deadline is `timeout` from now, cancelling
    /// the previous token and timer of this slot first.
    pub fn start_timeout(&self) -> CancellationToken {
        let mut slot = self.slot();
        if let Some(previous) = slot.active.take() {
            debug!(generation = previous.generation, "timeout: superseding deadline");
            previous.token.cancel();
            if let Some(timer) = previous.timer {
                timer.abort();
            }
        }

        slot.generation += 1;
        let generation = slot.generation;
        let token = CancellationToken::new();

        let timer = {
            let slot_ref = Arc::clone(&self.slot);
            let token = token.clone();
            let on_timeout = Arc::clone(&self.on_timeout);
            let timeout = self.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                {
                    let mut slot = slot_ref.lock().unwrap_or_else(PoisonError::into_inner);
                    let is_current = slot
                        .active
                        .as_ref()
                        .is_some_and(|active| active.generation == generation);
                    if !is_current {
                        return;
                    }
                    if let Some(active) = slot.active.as_mut() {
                        active.timer = None;
                    }
                }
                info!(
                    timeout_ms = timeout.as_millis() as u64,
                    "timeout: deadline reached, cancelling operation"
                );
                token.cancel();
                on_timeout();
            })
        };

        slot.active = Some(ActiveDeadline {
            generation,
            token: token.clone(),
            timer: Some(timer),
        });
        token
    }

    /// Clears the pending timer but leaves the token live. Called once the
    /// operation settled on its own.
    pub fn cancel_timeout(&self) {
        let mut slot = self.slot();
        if let Some(timer) = slot.active.as_mut().and_then(|active| active.timer.take()) {
            timer.abort();
        }
    }

    /// Cancels the current token immediately and clears its timer.
    pub fn abort(&self) {
        let Some(active) = self.slot().active.take() else {
            return;
        };
        debug!(generation = active.generation, "timeout: aborting operation");
        active.token.cancel();
        if let Some(timer) = active.timer {
            timer.abort();
        }
    }

    pub fn has_pending_timer(&self) -> bool {
        self.slot()
            .active
            .as_ref()
            .is_some_and(|active| active.timer.as_ref().is_some_and(|t| !t.is_finished()))
    }

    pub fn current_token(&self) -> Option<CancellationToken> {
        self.slot().active.as_ref().map(|active| active.token.clone())
    }
}

#[cfg(test)]
#[path = "tests/timeout_tests.rs"]
mod tests;
