//! Per-account message processor.
//!
//! One pipeline owns the account's route table, dedup window, and mapping
//! store. The supervisor hot-swaps routes and filters on configuration
//! changes without touching the session; message events are spawned tasks
//! that call [`RelayPipeline::on_message`].
//!
//! Every stage may drop the message; stage failures are logged and
//! swallowed so a bad message can never take the pipeline down.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, RwLock},
};

use {
    courier_common::types::{MessageRef, RelayMessage},
    courier_config::{FilterConfig, ReplyScanConfig},
    tracing::{debug, error, trace},
};

use crate::{
    dedup::DedupWindow,
    filter,
    mapping::{MappingStore, TargetLocation},
    reply::{self, HistoryReader},
    sender::{DispatchItem, Sender, jump_url},
    transform,
};

/// Tunables for one pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Capacity of the recently-seen-id window.
    pub dedup_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            dedup_capacity: 5000,
        }
    }
}

/// State swapped wholesale by hot-updates.
struct RouteState {
    routes: HashMap<String, Arc<Sender>>,
    filters: FilterConfig,
    reply_scan: ReplyScanConfig,
}

/// Per-account message processor. Shared behind an `Arc` between the
/// supervisor and the spawned per-event tasks.
pub struct RelayPipeline {
    account_id: String,
    state: RwLock<RouteState>,
    dedup: Mutex<DedupWindow>,
    mappings: Mutex<MappingStore>,
    /// History access comes from the live session, installed after login
    /// and cleared when the session is torn down.
    history: RwLock<Option<Arc<dyn HistoryReader>>>,
    /// Own identity, learned at login; gates the ignore-self rule.
    self_id: RwLock<Option<String>>,
}

impl RelayPipeline {
    #[must_use]
    pub fn new(
        account_id: String,
        routes: HashMap<String, Arc<Sender>>,
        filters: FilterConfig,
        reply_scan: ReplyScanConfig,
        mappings: MappingStore,
        settings: &PipelineSettings,
        history: Option<Arc<dyn HistoryReader>>,
    ) -> Self {
        Self {
            account_id,
            state: RwLock::new(RouteState {
                routes,
                filters,
                reply_scan,
            }),
            dedup: Mutex::new(DedupWindow::new(settings.dedup_capacity)),
            mappings: Mutex::new(mappings),
            history: RwLock::new(history),
            self_id: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Record the session's own identity once login completes.
    pub fn set_self_identity(&self, id: impl Into<String>) {
        *write_lock(&self.self_id) = Some(id.into());
    }

    /// Install (or clear) history access for reply-scan fallbacks.
    pub fn set_history(&self, history: Option<Arc<dyn HistoryReader>>) {
        *write_lock(&self.history) = history;
    }

    /// Hot-swap the route table, keeping dedup and mapping state.
    pub fn update_routes(&self, routes: HashMap<String, Arc<Sender>>) {
        write_lock(&self.state).routes = routes;
        debug!(account_id = %self.account_id, "route table swapped");
    }

    /// Hot-swap filters and reply-scan settings.
    pub fn update_filters(&self, filters: FilterConfig, reply_scan: ReplyScanConfig) {
        let mut state = write_lock(&self.state);
        state.filters = filters;
        state.reply_scan = reply_scan;
        debug!(account_id = %self.account_id, "filters swapped");
    }

    /// Distinct senders currently routed to, one per endpoint.
    pub fn senders(&self) -> Vec<Arc<Sender>> {
        let state = read_lock(&self.state);
        let mut seen = HashSet::new();
        state
            .routes
            .values()
            .filter(|s| seen.insert(s.endpoint().to_string()))
            .cloned()
            .collect()
    }

    /// Resolve destination metadata for every sender. Failures are
    /// non-fatal and already logged by the senders.
    pub async fn prepare(&self) {
        for sender in self.senders() {
            let _ = sender.prepare().await;
        }
    }

    /// Persist the mapping store if anything changed.
    pub fn flush(&self) -> crate::error::Result<()> {
        lock(&self.mappings).flush()
    }

    /// Process one observed message. Never returns an error: each stage
    /// drops the message and logs instead.
    pub async fn on_message(&self, msg: RelayMessage) {
        // Dedup: one synchronous check-and-insert, no await in between.
        if !lock_dedup(&self.dedup).check_and_insert(&msg.id) {
            trace!(account_id = %self.account_id, message_id = %msg.id, "duplicate message ignored");
            return;
        }

        let (sender, reply_scan) = {
            let state = read_lock(&self.state);

            if self.should_ignore(&msg, &state.filters) {
                return;
            }

            // Unmapped source channels are expected, not an error.
            let Some(sender) = state.routes.get(&msg.channel_id).cloned() else {
                trace!(
                    account_id = %self.account_id,
                    channel_id = %msg.channel_id,
                    "no route for channel"
                );
                return;
            };

            if !msg.webhook_origin
                && let Some(author) = &msg.author
                && !filter::author_passes(author, &state.filters)
            {
                debug!(account_id = %self.account_id, author = %author.name, "author filtered");
                return;
            }

            let surfaces = msg.text_surfaces();
            if !filter::required_keywords_pass(&surfaces, &state.filters.required_keywords) {
                trace!(account_id = %self.account_id, message_id = %msg.id, "required keywords missing");
                return;
            }
            if !filter::excluded_keywords_pass(&surfaces, &state.filters.excluded_keywords) {
                debug!(account_id = %self.account_id, message_id = %msg.id, "excluded keyword matched");
                return;
            }

            (sender, state.reply_scan.clone())
        };

        // Reply resolution may suspend (history scan); the dedup/mapping
        // lookups inside are still synchronous lockings.
        let mut reply_to = None;
        let mut jump = None;
        if let Some(reference) = &msg.reference
            && let Some(target) = self.resolve_reply(reference, &reply_scan).await
        {
            let url = sender.destination().and_then(|meta| {
                meta.guild_id
                    .map(|g| jump_url(&g, &target.channel_id, &target.message_id))
            });
            jump = Some(reply::jump_line(url.as_deref(), reference.has_media));
            reply_to = Some(target);
        }

        let mut content = transform::resolve_mentions(&msg.content, &msg.mentions);
        let pure_link =
            transform::is_pure_social_link(&content) || transform::is_pure_gif_link(&content);
        // Pure link posts go out bare so the destination renders its own
        // preview.
        let embeds = if pure_link {
            Vec::new()
        } else {
            msg.embeds.clone()
        };
        if let Some(line) = jump {
            content = format!("{line}\n{content}");
        }

        let item = DispatchItem {
            source_id: msg.id.clone(),
            content,
            reply_to,
            username: msg.author.as_ref().map(|a| a.display().to_string()),
            avatar_url: msg.author.as_ref().and_then(|a| a.avatar_url.clone()),
            attachments: msg.attachments.clone(),
            embeds,
        };

        match sender.dispatch(item).await {
            Ok(records) => {
                if let Some(first) = records.into_iter().find(|r| r.source_id.is_some()) {
                    lock(&self.mappings).record(
                        &msg.id,
                        TargetLocation {
                            channel_id: first.channel_id,
                            message_id: first.message_id,
                        },
                    );
                }
            },
            Err(e) => {
                error!(
                    account_id = %self.account_id,
                    message_id = %msg.id,
                    error = %e,
                    "dispatch failed, message dropped"
                );
            },
        }
    }

    fn should_ignore(&self, msg: &RelayMessage, filters: &FilterConfig) -> bool {
        if filters.ignore_self
            && let Some(author) = &msg.author
            && read_lock(&self.self_id).as_deref() == Some(author.id.as_str())
        {
            return true;
        }
        if filters.ignore_bots
            && (msg.webhook_origin || msg.author.as_ref().is_some_and(|a| a.is_bot))
        {
            return true;
        }
        msg.attachments
            .iter()
            .any(|a| filter::attachment_ignored(a, filters))
    }

    async fn resolve_reply(
        &self,
        reference: &MessageRef,
        reply_scan: &ReplyScanConfig,
    ) -> Option<TargetLocation> {
        if let Some(hit) = lock(&self.mappings).get(&reference.message_id) {
            return Some(hit);
        }

        let history = read_lock(&self.history).clone()?;

        let mut channels = reply_scan.channels.clone();
        if channels.is_empty() {
            // Auto-discover from prepared sender destinations.
            for sender in self.senders() {
                if let Some(meta) = sender.prepare().await
                    && let Some(channel_id) = meta.channel_id
                    && !channels.contains(&channel_id)
                {
                    channels.push(channel_id);
                }
            }
        }
        if channels.is_empty() {
            return None;
        }

        reply::scan_for_source(
            history.as_ref(),
            &self.mappings,
            &channels,
            &reference.message_id,
            reply_scan.depth,
        )
        .await
    }
}

fn lock<'a>(mappings: &'a Mutex<MappingStore>) -> MutexGuard<'a, MappingStore> {
    match mappings.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock_dedup<'a>(dedup: &'a Mutex<DedupWindow>) -> MutexGuard<'a, DedupWindow> {
    match dedup.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
