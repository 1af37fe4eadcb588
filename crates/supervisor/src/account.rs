//! Per-account runtime: the connect/pump/reconnect loop and the mapping
//! flush loop.
//!
//! Each started account owns exactly one task running [`AccountTask::run`].
//! The task builds a fresh session per attempt (sessions are never resumed
//! across reconnects), pumps its events into the pipeline, and applies the
//! backoff policy between attempts. A manual stop cancels the shared
//! token, which is checked at every resumption point.

use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use {
    courier_config::{AccountDesiredState, AccountState, StatusSink},
    courier_relay::RelayPipeline,
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    backoff::{ReconnectDecision, ReconnectPolicy, ReconnectState},
    session::{SessionConnector, SessionControl, SessionEvent},
};

/// Shared slot holding the account's live session control, if any.
pub(crate) type ControlSlot = Arc<RwLock<Option<Arc<dyn SessionControl>>>>;

/// Everything the supervisor keeps per running account. Owned exclusively
/// by the supervisor; never shared across accounts.
pub(crate) struct AccountRuntime {
    pub desired: Arc<RwLock<AccountDesiredState>>,
    pub pipeline: Arc<RelayPipeline>,
    pub cancel: CancellationToken,
    pub control: ControlSlot,
}

impl AccountRuntime {
    pub fn desired_snapshot(&self) -> AccountDesiredState {
        read(&self.desired).clone()
    }

    pub fn current_control(&self) -> Option<Arc<dyn SessionControl>> {
        read(&self.control).clone()
    }
}

enum PumpEnd {
    Cancelled,
    Disconnected(String),
}

/// The connect/pump/reconnect loop for one account.
pub(crate) struct AccountTask {
    pub account_id: String,
    pub desired: Arc<RwLock<AccountDesiredState>>,
    pub connector: Arc<dyn SessionConnector>,
    pub pipeline: Arc<RelayPipeline>,
    pub status: Arc<StatusSink>,
    pub cancel: CancellationToken,
    pub policy: ReconnectPolicy,
    pub control: ControlSlot,
}

impl AccountTask {
    pub async fn run(self) {
        let mut reconnect = ReconnectState::default();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            // Race guard: if a live session is already installed (a
            // concurrent start won the slot), this loop has nothing to do.
            if let Some(control) = read(&self.control).clone()
                && control.is_connected()
            {
                debug!(account_id = %self.account_id, "session already connected, skipping reconnect");
                break;
            }

            let desired = read(&self.desired).clone();
            match self.connector.connect(&desired).await {
                Ok(handle) => {
                    *write(&self.control) = Some(Arc::clone(&handle.control));
                    self.pipeline.set_history(handle.history.clone());
                    self.status
                        .set(&self.account_id, AccountState::Online, "connected");
                    self.policy.reset(&mut reconnect);
                    info!(account_id = %self.account_id, "session online");

                    let end = self.pump(handle.events).await;

                    // The session object is torn down either way; a later
                    // attempt reconstructs it from scratch.
                    handle.control.destroy().await;
                    *write(&self.control) = None;
                    self.pipeline.set_history(None);

                    match end {
                        PumpEnd::Cancelled => break,
                        PumpEnd::Disconnected(reason) => {
                            warn!(account_id = %self.account_id, %reason, "session disconnected");
                            self.status.set(
                                &self.account_id,
                                AccountState::Error,
                                format!("disconnected: {reason}"),
                            );
                        },
                    }
                },
                Err(e) if e.is_terminal() => {
                    warn!(account_id = %self.account_id, error = %e, "login rejected, stopping account");
                    self.status
                        .set(&self.account_id, AccountState::Error, e.to_string());
                    break;
                },
                Err(e) => {
                    warn!(account_id = %self.account_id, error = %e, "connect failed");
                    self.status
                        .set(&self.account_id, AccountState::Error, e.to_string());
                },
            }

            match self
                .policy
                .next(&mut reconnect, tokio::time::Instant::now())
            {
                ReconnectDecision::GiveUp => {
                    warn!(account_id = %self.account_id, "reconnect budget exhausted, stopping account");
                    self.status.set(
                        &self.account_id,
                        AccountState::Error,
                        "reconnect budget exhausted",
                    );
                    break;
                },
                ReconnectDecision::Retry(delay) => {
                    self.status.set(
                        &self.account_id,
                        AccountState::Pending,
                        format!("reconnecting in {}s", delay.as_secs()),
                    );
                    tokio::select! {
                        () = self.cancel.cancelled() => break,
                        () = tokio::time::sleep(delay) => {},
                    }
                },
            }
        }
    }

    /// Drain session events until disconnect or cancellation. Message
    /// events become independent tasks so a slow dispatch never blocks
    /// the stream.
    async fn pump(&self, mut events: mpsc::Receiver<SessionEvent>) -> PumpEnd {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return PumpEnd::Cancelled,
                event = events.recv() => match event {
                    Some(SessionEvent::Ready { self_id }) => {
                        debug!(account_id = %self.account_id, %self_id, "session ready");
                        self.pipeline.set_self_identity(self_id);
                        let pipeline = Arc::clone(&self.pipeline);
                        tokio::spawn(async move { pipeline.prepare().await });
                    },
                    Some(SessionEvent::Message(msg)) => {
                        let pipeline = Arc::clone(&self.pipeline);
                        let cancel = self.cancel.clone();
                        tokio::spawn(async move {
                            if cancel.is_cancelled() {
                                return;
                            }
                            pipeline.on_message(msg).await;
                        });
                    },
                    Some(SessionEvent::Resume) => {
                        debug!(account_id = %self.account_id, "session resumed");
                    },
                    Some(SessionEvent::Error(e)) => {
                        warn!(account_id = %self.account_id, error = %e, "session error");
                    },
                    Some(SessionEvent::Disconnect { reason }) => {
                        return PumpEnd::Disconnected(reason);
                    },
                    None => return PumpEnd::Disconnected("event stream closed".into()),
                }
            }
        }
    }
}

/// Dirty-gated periodic mapping persistence, plus a final flush when the
/// account stops.
pub(crate) async fn flush_loop(
    pipeline: Arc<RelayPipeline>,
    cancel: CancellationToken,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = pipeline.flush() {
                    warn!(account_id = %pipeline.account_id(), error = %e, "mapping flush failed");
                }
            },
        }
    }
    if let Err(e) = pipeline.flush() {
        warn!(account_id = %pipeline.account_id(), error = %e, "final mapping flush failed");
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
