//! Desired-vs-running reconciliation.
//!
//! The supervisor owns every running account and converges them toward
//! the desired-state document: start what is missing, stop what is gone,
//! hot-update what a live session can absorb, and restart the rest. The
//! previously reconciled snapshot lives inside each account's runtime
//! state and is passed into the diff explicitly.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{Arc, RwLock},
    time::Duration,
};

use {
    courier_config::{AccountDesiredState, AccountState, StatusSink},
    courier_relay::{
        MappingStore, PipelineSettings, RelayPipeline, Sender, SenderConfig, Translator,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    account::{AccountRuntime, AccountTask, flush_loop},
    backoff::ReconnectPolicy,
    diff::AccountDiff,
    session::SessionConnector,
};

/// Supervisor tunables. Defaults are the production values.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Capacity of each account's mapping table.
    pub mapping_capacity: usize,
    pub pipeline: PipelineSettings,
    /// Cadence of the dirty-gated mapping persistence.
    pub flush_interval: Duration,
    pub policy: ReconnectPolicy,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            mapping_capacity: 5000,
            pipeline: PipelineSettings::default(),
            flush_interval: Duration::from_secs(60),
            policy: ReconnectPolicy::default(),
        }
    }
}

/// Owns the set of running accounts and converges them toward desired
/// state. Reconciliation is single-flight: the caller (the watcher loop)
/// invokes `reconcile` serially.
pub struct AccountSupervisor {
    connector: Arc<dyn SessionConnector>,
    status: Arc<StatusSink>,
    mappings_dir: PathBuf,
    translator: Option<Arc<dyn Translator>>,
    http: reqwest::Client,
    options: SupervisorOptions,
    accounts: HashMap<String, AccountRuntime>,
    /// Ids already warned about a missing token, so the log line fires
    /// once per id rather than once per pass.
    missing_token_logged: HashSet<String>,
}

impl AccountSupervisor {
    #[must_use]
    pub fn new(
        connector: Arc<dyn SessionConnector>,
        status: Arc<StatusSink>,
        mappings_dir: PathBuf,
        translator: Option<Arc<dyn Translator>>,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            connector,
            status,
            mappings_dir,
            translator,
            http: reqwest::Client::new(),
            options,
            accounts: HashMap::new(),
            missing_token_logged: HashSet::new(),
        }
    }

    /// Ids of currently running accounts.
    pub fn running(&self) -> Vec<String> {
        self.accounts.keys().cloned().collect()
    }

    /// Converge running state toward `desired`.
    pub async fn reconcile(&mut self, desired: &[AccountDesiredState]) {
        let desired_ids: HashSet<&str> = desired.iter().map(|a| a.id.as_str()).collect();

        // Running accounts absent from the document are gone for good.
        let stale: Vec<String> = self
            .accounts
            .keys()
            .filter(|id| !desired_ids.contains(id.as_str()))
            .cloned()
            .collect();
        for id in stale {
            info!(account_id = %id, "account removed from desired state");
            self.stop_account(&id, false).await;
            self.status.remove(&id);
            self.missing_token_logged.remove(&id);
        }

        for next in desired {
            self.reconcile_account(next).await;
        }
    }

    async fn reconcile_account(&mut self, next: &AccountDesiredState) {
        let id = next.id.as_str();

        // Requested but unusable: an error status, never a crash.
        if next.login_requested && next.token_is_empty() {
            if self.missing_token_logged.insert(id.to_string()) {
                warn!(account_id = %id, "login requested but no token configured");
            }
            self.status
                .set(id, AccountState::Error, "no token configured");
            return;
        }
        self.missing_token_logged.remove(id);

        let Some(runtime) = self.accounts.get(id) else {
            if next.login_requested {
                self.start_account(next.clone()).await;
            } else if self.status.get(id).is_none() {
                self.status.set(id, AccountState::Idle, "");
            }
            return;
        };

        let prev = runtime.desired_snapshot();
        let diff = AccountDiff::between(&prev, next);
        let state = self.status.get(id).map(|s| s.state);
        let online = state == Some(AccountState::Online);
        let connecting = state == Some(AccountState::Pending);

        // Decision table, first match wins.
        if online && diff.login_became_false {
            info!(account_id = %id, "login toggled off");
            self.stop_account(id, true).await;
        } else if online && !diff.requires_restart() && diff.hot_updatable() {
            self.hot_update(next);
        } else if online && diff.is_noop() {
            // Converged.
        } else if !online && !next.login_requested {
            if connecting {
                info!(account_id = %id, "login no longer requested while connecting");
                self.stop_account(id, true).await;
            }
        } else if diff.requires_restart() {
            info!(account_id = %id, "restarting for desired-state change");
            self.stop_account(id, false).await;
            self.start_account(next.clone()).await;
        } else if diff.hot_updatable() {
            self.hot_update(next);
        }
    }

    /// Build the route table: one sender per distinct endpoint, shared
    /// across the source channels that point at it.
    fn build_routes(
        &self,
        desired: &AccountDesiredState,
    ) -> anyhow::Result<HashMap<String, Arc<Sender>>> {
        if desired.routes.is_empty() {
            anyhow::bail!("no routes configured");
        }
        let mut by_endpoint: HashMap<String, Arc<Sender>> = HashMap::new();
        let mut routes = HashMap::new();
        for rule in &desired.routes {
            let sender = by_endpoint
                .entry(rule.endpoint.clone())
                .or_insert_with(|| {
                    Arc::new(Sender::new(
                        SenderConfig {
                            endpoint: rule.endpoint.clone(),
                            impersonate: desired.impersonate,
                            replacements: desired.replacements.clone(),
                            translation: desired.translation.clone(),
                        },
                        self.http.clone(),
                        self.translator.clone(),
                    ))
                })
                .clone();
            routes.insert(rule.source_channel.clone(), sender);
        }
        Ok(routes)
    }

    async fn start_account(&mut self, desired: AccountDesiredState) {
        let id = desired.id.clone();
        let routes = match self.build_routes(&desired) {
            Ok(routes) => routes,
            Err(e) => {
                warn!(account_id = %id, error = %e, "account not startable");
                self.status.set(&id, AccountState::Error, e.to_string());
                return;
            },
        };

        let mappings = MappingStore::new(
            self.mappings_dir.join(format!("{id}.json")),
            self.options.mapping_capacity,
        );
        let pipeline = Arc::new(RelayPipeline::new(
            id.clone(),
            routes,
            desired.filters.clone(),
            desired.reply_scan.clone(),
            mappings,
            &self.options.pipeline,
            None,
        ));

        let cancel = CancellationToken::new();
        let control = Arc::new(RwLock::new(None));
        let desired = Arc::new(RwLock::new(desired));

        self.status.set(&id, AccountState::Pending, "connecting");

        let task = AccountTask {
            account_id: id.clone(),
            desired: Arc::clone(&desired),
            connector: Arc::clone(&self.connector),
            pipeline: Arc::clone(&pipeline),
            status: Arc::clone(&self.status),
            cancel: cancel.clone(),
            policy: self.options.policy.clone(),
            control: Arc::clone(&control),
        };
        tokio::spawn(task.run());
        tokio::spawn(flush_loop(
            Arc::clone(&pipeline),
            cancel.clone(),
            self.options.flush_interval,
        ));

        self.accounts.insert(
            id.clone(),
            AccountRuntime {
                desired,
                pipeline,
                cancel,
                control,
            },
        );
        info!(account_id = %id, "account started");
    }

    /// Idempotent stop: cancels the reconnect timer and event pump,
    /// flushes the pipeline, destroys the session, removes runtime state.
    pub async fn stop_account(&mut self, id: &str, manual: bool) {
        let Some(runtime) = self.accounts.remove(id) else {
            return;
        };
        runtime.cancel.cancel();
        if let Some(control) = runtime.current_control() {
            control.destroy().await;
        }
        if let Err(e) = runtime.pipeline.flush() {
            warn!(account_id = %id, error = %e, "mapping flush on stop failed");
        }
        if manual {
            self.status.set(id, AccountState::Stopped, "stopped");
        }
        info!(account_id = %id, manual, "account stopped");
    }

    /// Apply route/filter/translation changes to a running account
    /// without touching its session.
    fn hot_update(&self, next: &AccountDesiredState) {
        let Some(runtime) = self.accounts.get(&next.id) else {
            return;
        };
        runtime
            .pipeline
            .update_filters(next.filters.clone(), next.reply_scan.clone());
        match self.build_routes(next) {
            Ok(routes) => runtime.pipeline.update_routes(routes),
            Err(e) => {
                // Keep relaying with the old routes rather than going dark.
                warn!(account_id = %next.id, error = %e, "hot-update kept previous routes");
            },
        }
        match runtime.desired.write() {
            Ok(mut guard) => *guard = next.clone(),
            Err(poisoned) => *poisoned.into_inner() = next.clone(),
        }
        debug!(account_id = %next.id, "account hot-updated");
    }

    /// Stop everything, flushing stores. Statuses are left as-is so the
    /// dashboard still shows the last known state after a process exit.
    pub async fn shutdown(&mut self) {
        let ids = self.running();
        for id in ids {
            self.stop_account(&id, false).await;
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::session::{ConnectError, SessionControl, SessionEvent, SessionHandle},
        async_trait::async_trait,
        courier_config::RouteRule,
        secrecy::Secret,
        std::sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        tempfile::TempDir,
        tokio::sync::mpsc,
    };

    #[derive(Clone, Copy, PartialEq)]
    enum Mode {
        Succeed,
        FailRetriable,
        FailCredential,
    }

    struct FakeControl {
        connected: AtomicBool,
        _keep: mpsc::Sender<SessionEvent>,
    }

    #[async_trait]
    impl SessionControl for FakeControl {
        async fn destroy(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    struct FakeConnector {
        mode: std::sync::Mutex<Mode>,
        connects: AtomicUsize,
    }

    impl FakeConnector {
        fn new(mode: Mode) -> Arc<Self> {
            Arc::new(Self {
                mode: std::sync::Mutex::new(mode),
                connects: AtomicUsize::new(0),
            })
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SessionConnector for FakeConnector {
        async fn connect(
            &self,
            _desired: &AccountDesiredState,
        ) -> Result<SessionHandle, ConnectError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let mode = *self.mode.lock().unwrap();
            match mode {
                Mode::Succeed => {
                    let (tx, rx) = mpsc::channel(8);
                    tx.send(SessionEvent::Ready {
                        self_id: "999".into(),
                    })
                    .await
                    .unwrap();
                    Ok(SessionHandle {
                        events: rx,
                        control: Arc::new(FakeControl {
                            connected: AtomicBool::new(true),
                            _keep: tx,
                        }),
                        history: None,
                    })
                },
                Mode::FailRetriable => Err(ConnectError::Retriable("gateway unreachable".into())),
                Mode::FailCredential => {
                    Err(ConnectError::CredentialInvalid("401 unauthorized".into()))
                },
            }
        }
    }

    fn account(id: &str) -> AccountDesiredState {
        AccountDesiredState {
            id: id.into(),
            token: Secret::new("tok".into()),
            login_requested: true,
            login_nonce: 1,
            routes: vec![RouteRule {
                source_channel: "111".into(),
                endpoint: "https://sink.invalid/hook".into(),
            }],
            ..Default::default()
        }
    }

    fn supervisor(tmp: &TempDir, connector: Arc<FakeConnector>) -> (AccountSupervisor, Arc<StatusSink>) {
        let status = Arc::new(StatusSink::new(tmp.path().join("status.json")));
        let supervisor = AccountSupervisor::new(
            connector,
            Arc::clone(&status),
            tmp.path().join("mappings"),
            None,
            SupervisorOptions::default(),
        );
        (supervisor, status)
    }

    async fn wait_for(
        status: &StatusSink,
        id: &str,
        predicate: impl Fn(&courier_config::AccountStatus) -> bool,
    ) {
        // Paused-clock tests: each sleep auto-advances virtual time, so
        // long backoff schedules still complete in milliseconds of real
        // time.
        for _ in 0..2000 {
            if status.get(id).as_ref().is_some_and(&predicate) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        panic!("status condition not reached for {id}: {:?}", status.get(id));
    }

    #[tokio::test(start_paused = true)]
    async fn starts_requested_accounts() {
        let tmp = TempDir::new().unwrap();
        let connector = FakeConnector::new(Mode::Succeed);
        let (mut supervisor, status) = supervisor(&tmp, Arc::clone(&connector));

        supervisor.reconcile(&[account("a1")]).await;

        assert_eq!(supervisor.running(), vec!["a1".to_string()]);
        wait_for(&status, "a1", |s| s.state == AccountState::Online).await;
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_document_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let connector = FakeConnector::new(Mode::Succeed);
        let (mut supervisor, status) = supervisor(&tmp, Arc::clone(&connector));

        let doc = [account("a1")];
        supervisor.reconcile(&doc).await;
        wait_for(&status, "a1", |s| s.state == AccountState::Online).await;

        supervisor.reconcile(&doc).await;
        supervisor.reconcile(&doc).await;

        assert_eq!(connector.connects(), 1);
        assert_eq!(supervisor.running().len(), 1);
        assert_eq!(status.get("a1").unwrap().state, AccountState::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn filter_change_hot_updates_without_reconnect() {
        let tmp = TempDir::new().unwrap();
        let connector = FakeConnector::new(Mode::Succeed);
        let (mut supervisor, status) = supervisor(&tmp, Arc::clone(&connector));

        supervisor.reconcile(&[account("a1")]).await;
        wait_for(&status, "a1", |s| s.state == AccountState::Online).await;

        let mut changed = account("a1");
        changed.filters.excluded_keywords.push("spoiler".into());
        supervisor.reconcile(&[changed.clone()]).await;

        assert_eq!(connector.connects(), 1);
        assert_eq!(status.get("a1").unwrap().state, AccountState::Online);

        // The snapshot was advanced: reapplying the same record is a no-op.
        supervisor.reconcile(&[changed]).await;
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn token_change_restarts_session() {
        let tmp = TempDir::new().unwrap();
        let connector = FakeConnector::new(Mode::Succeed);
        let (mut supervisor, status) = supervisor(&tmp, Arc::clone(&connector));

        supervisor.reconcile(&[account("a1")]).await;
        wait_for(&status, "a1", |s| s.state == AccountState::Online).await;

        let mut changed = account("a1");
        changed.token = Secret::new("rotated".into());
        supervisor.reconcile(&[changed]).await;
        wait_for(&status, "a1", |s| s.state == AccountState::Online).await;

        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn login_toggled_off_stops_account() {
        let tmp = TempDir::new().unwrap();
        let connector = FakeConnector::new(Mode::Succeed);
        let (mut supervisor, status) = supervisor(&tmp, Arc::clone(&connector));

        supervisor.reconcile(&[account("a1")]).await;
        wait_for(&status, "a1", |s| s.state == AccountState::Online).await;

        let mut changed = account("a1");
        changed.login_requested = false;
        supervisor.reconcile(&[changed]).await;

        assert!(supervisor.running().is_empty());
        assert_eq!(status.get("a1").unwrap().state, AccountState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn removed_account_is_stopped_and_forgotten() {
        let tmp = TempDir::new().unwrap();
        let connector = FakeConnector::new(Mode::Succeed);
        let (mut supervisor, status) = supervisor(&tmp, Arc::clone(&connector));

        supervisor.reconcile(&[account("a1")]).await;
        wait_for(&status, "a1", |s| s.state == AccountState::Online).await;

        supervisor.reconcile(&[]).await;

        assert!(supervisor.running().is_empty());
        assert!(status.get("a1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_token_is_an_error_status_not_a_start() {
        let tmp = TempDir::new().unwrap();
        let connector = FakeConnector::new(Mode::Succeed);
        let (mut supervisor, status) = supervisor(&tmp, Arc::clone(&connector));

        let mut acc = account("a1");
        acc.token = Secret::new(String::new());
        supervisor.reconcile(&[acc.clone()]).await;
        supervisor.reconcile(&[acc]).await;

        assert!(supervisor.running().is_empty());
        assert_eq!(connector.connects(), 0);
        let got = status.get("a1").unwrap();
        assert_eq!(got.state, AccountState::Error);
        assert!(got.message.contains("no token"));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_routes_are_not_startable() {
        let tmp = TempDir::new().unwrap();
        let connector = FakeConnector::new(Mode::Succeed);
        let (mut supervisor, status) = supervisor(&tmp, Arc::clone(&connector));

        let mut acc = account("a1");
        acc.routes.clear();
        supervisor.reconcile(&[acc]).await;

        assert!(supervisor.running().is_empty());
        assert_eq!(connector.connects(), 0);
        assert_eq!(status.get("a1").unwrap().state, AccountState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_credential_is_terminal() {
        let tmp = TempDir::new().unwrap();
        let connector = FakeConnector::new(Mode::FailCredential);
        let (mut supervisor, status) = supervisor(&tmp, Arc::clone(&connector));

        supervisor.reconcile(&[account("a1")]).await;
        wait_for(&status, "a1", |s| {
            s.state == AccountState::Error && s.message.contains("credential")
        })
        .await;

        // Give any stray retry a chance to fire, then confirm none did.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_budget_exhaustion_is_terminal() {
        let tmp = TempDir::new().unwrap();
        let connector = FakeConnector::new(Mode::FailRetriable);
        let (mut supervisor, status) = supervisor(&tmp, Arc::clone(&connector));

        supervisor.reconcile(&[account("a1")]).await;
        wait_for(&status, "a1", |s| s.message.contains("budget exhausted")).await;

        // Initial attempt plus the full 10-attempt budget, never more.
        assert_eq!(connector.connects(), 11);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.connects(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn login_withdrawn_while_connecting_stops_account() {
        let tmp = TempDir::new().unwrap();
        let connector = FakeConnector::new(Mode::FailRetriable);
        let (mut supervisor, status) = supervisor(&tmp, Arc::clone(&connector));

        supervisor.reconcile(&[account("a1")]).await;
        wait_for(&status, "a1", |s| s.state == AccountState::Pending).await;

        let mut changed = account("a1");
        changed.login_requested = false;
        supervisor.reconcile(&[changed]).await;

        assert!(supervisor.running().is_empty());
        assert_eq!(status.get("a1").unwrap().state, AccountState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_everything() {
        let tmp = TempDir::new().unwrap();
        let connector = FakeConnector::new(Mode::Succeed);
        let (mut supervisor, status) = supervisor(&tmp, Arc::clone(&connector));

        supervisor.reconcile(&[account("a1"), account("a2")]).await;
        wait_for(&status, "a1", |s| s.state == AccountState::Online).await;
        wait_for(&status, "a2", |s| s.state == AccountState::Online).await;

        supervisor.shutdown().await;
        assert!(supervisor.running().is_empty());
    }
}
