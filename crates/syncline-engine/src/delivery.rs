use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use syncline_core::{DeliveryRetryPolicy, SyncError};

use crate::traits::SessionHooks;

/// Identifier of a delivery operation, in creation order.
pub type OperationId = u64;

/// Lifecycle of a delivery operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Registered, not yet attempted.
    Pending,
    /// Waiting out a retry delay.
    Scheduled,
    /// An attempt is on the wire.
    Resending,
}

struct OpEntry {
    description: String,
    state: DeliveryState,
    /// The current scheduled wait is server-mandated pacing and must
    /// run its course; an early wake would land inside the throttle.
    pacing: bool,
    cancel: CancellationToken,
    resume: Arc<Notify>,
    /// `None` for operations queued while offline; those never age out.
    created_at: Option<Instant>,
}

/// Drives failed operations through retry with backoff until they
/// succeed, exhaust their budget, or hit a failure retrying cannot fix.
///
/// Only one retry attempt is on the wire at any time; a completing
/// resend hands the wire to the next waiter whose timer has fired.
/// When connectivity returns, the oldest operation waiting out a
/// backoff is resent immediately, while a wait mandated by a server
/// retry-after always runs its course. Configuration-fatal and
/// security failures bypass retry and go straight to the session hooks.
pub struct DeliveryManager {
    policy: DeliveryRetryPolicy,
    hooks: Arc<dyn SessionHooks>,
    ops: Mutex<BTreeMap<OperationId, OpEntry>>,
    next_id: AtomicU64,
    resend_slot: tokio::sync::Mutex<()>,
}

impl DeliveryManager {
    pub fn new(policy: DeliveryRetryPolicy, hooks: Arc<dyn SessionHooks>) -> Self {
        Self {
            policy,
            hooks,
            ops: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            resend_slot: tokio::sync::Mutex::new(()),
        }
    }

    /// Register an operation before running it. `queued_offline` exempts
    /// it from the lifetime cap, for work created without connectivity.
    pub fn register(&self, description: impl Into<String>, queued_offline: bool) -> OperationId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut ops = self.ops.lock().expect("ops lock");
        ops.insert(
            id,
            OpEntry {
                description: description.into(),
                state: DeliveryState::Pending,
                pacing: false,
                cancel: CancellationToken::new(),
                resume: Arc::new(Notify::new()),
                created_at: (!queued_offline).then(Instant::now),
            },
        );
        id
    }

    /// State of a live operation; `None` once it reached a terminal
    /// outcome (or was never registered).
    pub fn state(&self, id: OperationId) -> Option<DeliveryState> {
        let ops = self.ops.lock().expect("ops lock");
        ops.get(&id).map(|entry| entry.state)
    }

    pub fn active_count(&self) -> usize {
        self.ops.lock().expect("ops lock").len()
    }

    /// Cancel one operation. Idempotent; its `run` resolves to
    /// [`SyncError::Cancelled`].
    pub fn cancel(&self, id: OperationId) {
        let ops = self.ops.lock().expect("ops lock");
        if let Some(entry) = ops.get(&id) {
            entry.cancel.cancel();
        }
    }

    pub fn cancel_all(&self) {
        let ops = self.ops.lock().expect("ops lock");
        for entry in ops.values() {
            entry.cancel.cancel();
        }
    }

    /// Connectivity is back; resend the oldest operation waiting out a
    /// backoff. Rate-limit pacing waits keep sleeping.
    pub fn on_connectivity_restored(&self) {
        self.wake_oldest_scheduled();
    }

    /// Run an operation to completion under the retry policy. `attempt`
    /// is called once per try.
    pub async fn run<T, F, Fut>(&self, id: OperationId, mut attempt: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let (cancel, resume, created_at) = {
            let ops = self.ops.lock().expect("ops lock");
            let Some(entry) = ops.get(&id) else {
                return Err(SyncError::Unexpected(format!(
                    "delivery operation {id} was never registered"
                )));
            };
            (entry.cancel.clone(), entry.resume.clone(), entry.created_at)
        };

        let mut retry_count = 0_u32;
        let mut first_attempt = true;

        loop {
            if cancel.is_cancelled() {
                return self.conclude(id, Err(SyncError::Cancelled));
            }

            self.set_state(id, DeliveryState::Resending);
            let result = if first_attempt {
                first_attempt = false;
                attempt().await
            } else {
                // one retry on the wire at a time, system-wide
                let _slot = self.resend_slot.lock().await;
                if cancel.is_cancelled() {
                    return self.conclude(id, Err(SyncError::Cancelled));
                }
                attempt().await
            };

            let err = match result {
                Ok(value) => return self.conclude(id, Ok(value)),
                Err(err) => err,
            };

            if err.is_configuration_fatal() {
                warn!(id, %err, "delivery hit a configuration error");
                self.hooks.on_configuration_error(&err);
                return self.conclude(id, Err(err));
            }
            if err.is_security() {
                warn!(id, %err, "delivery hit a security error");
                self.hooks.on_security_error(&err);
                return self.conclude(id, Err(err));
            }

            // Rate limiting is the server pacing us, not the operation
            // failing; it never consumes retry budget.
            let rate_limited = err.is_rate_limited();
            if !rate_limited {
                retry_count += 1;
            }

            let age = created_at.map(|t| t.elapsed());
            if self.policy.is_exhausted(retry_count, age) {
                warn!(id, retry_count, %err, "delivery exhausted, surfacing last failure");
                return self.conclude(id, Err(err));
            }

            let delay = if rate_limited {
                self.policy
                    .delay_for_retry(retry_count.max(1), err.retry_after())
            } else {
                self.policy.delay_for_retry(retry_count, None)
            };
            self.set_scheduled(id, rate_limited);
            debug!(id, retry_count, ?delay, "delivery retry scheduled");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return self.conclude(id, Err(SyncError::Cancelled));
                }
                _ = resume.notified() => {
                    debug!(id, "delivery retry resumed early");
                }
            }

            // The wait itself may have spent the lifetime; no attempt
            // goes out past it.
            let age = created_at.map(|t| t.elapsed());
            if self.policy.is_exhausted(retry_count, age) {
                warn!(id, retry_count, "delivery lifetime spent while waiting");
                return self.conclude(id, Err(err));
            }
        }
    }

    fn conclude<T>(&self, id: OperationId, outcome: Result<T, SyncError>) -> Result<T, SyncError> {
        let removed = {
            let mut ops = self.ops.lock().expect("ops lock");
            ops.remove(&id)
        };
        if let Some(entry) = removed {
            debug!(id, description = %entry.description, ok = outcome.is_ok(), "delivery finished");
        }
        outcome
    }

    fn set_state(&self, id: OperationId, state: DeliveryState) {
        let mut ops = self.ops.lock().expect("ops lock");
        if let Some(entry) = ops.get_mut(&id) {
            entry.state = state;
        }
    }

    fn set_scheduled(&self, id: OperationId, pacing: bool) {
        let mut ops = self.ops.lock().expect("ops lock");
        if let Some(entry) = ops.get_mut(&id) {
            entry.state = DeliveryState::Scheduled;
            entry.pacing = pacing;
        }
    }

    fn wake_oldest_scheduled(&self) {
        let ops = self.ops.lock().expect("ops lock");
        if let Some(entry) = ops
            .values()
            .find(|e| e.state == DeliveryState::Scheduled && !e.pacing)
        {
            entry.resume.notify_one();
        }
    }
}
