//! Per-instance listener subscriptions and the polling loops that feed the
//! message store.
//!
//! Subscription lifecycle:
//!
//! ```text
//! UNSUBSCRIBED --add--> ACTIVE --idle past timeout--> INACTIVE --remove--> UNSUBSCRIBED
//!                         ^                               |
//!                         +------------- add -------------+
//! ```
//!
//! Manual and fixed subscriptions never leave ACTIVE on their own.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        Arc, Mutex as StdMutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    tokio::{sync::Mutex, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
    wxrelay_channels::{
        EchoGuard, Endpoint, EndpointRegistry, FetchOptions, Message, MessageStore, RawMessage,
        filter_batch, prepare, split_at_marker,
    },
    wxrelay_common::{ConfigChangeEvent, ConfigChangeKind, ConfigSubscriber, bounded, now_ms},
    wxrelay_config::{FixedListenerSeed, ListenerConfig},
    wxrelay_routing::RuleEngine,
};

#[cfg(feature = "metrics")]
use wxrelay_metrics::{counter, gauge, labels, listener as listener_metrics};

use crate::{
    Error, Result,
    model::{FixedListener, ListenerKey, ListenerSubscription},
    pause::{PauseGate, PauseGuard},
    store::ListenerStore,
};

fn key(instance_id: &str, who: &str) -> ListenerKey {
    (instance_id.to_string(), who.to_string())
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Sleep for `period` unless cancelled first. Returns `false` on cancel.
async fn sleep_or_cancel(token: &CancellationToken, period: Duration) -> bool {
    tokio::select! {
        () = token.cancelled() => false,
        () = tokio::time::sleep(period) => true,
    }
}

pub struct ListenerRegistry {
    endpoints: Arc<EndpointRegistry>,
    messages: Arc<dyn MessageStore>,
    store: Arc<dyn ListenerStore>,
    rules: Arc<RuleEngine>,
    echo: Arc<EchoGuard>,
    gate: PauseGate,
    settings: RwLock<ListenerConfig>,
    fetch_options: FetchOptions,
    listeners: Mutex<HashMap<ListenerKey, ListenerSubscription>>,
    /// Serializes adds per instance so the capacity check stays exact while
    /// the remote call runs without the subscription map locked.
    add_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    started_at_ms: AtomicU64,
    cancel: StdMutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ListenerRegistry {
    pub fn new(
        endpoints: Arc<EndpointRegistry>,
        messages: Arc<dyn MessageStore>,
        store: Arc<dyn ListenerStore>,
        rules: Arc<RuleEngine>,
        echo: Arc<EchoGuard>,
        settings: ListenerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoints,
            messages,
            store,
            rules,
            echo,
            gate: PauseGate::new(),
            settings: RwLock::new(settings),
            fetch_options: FetchOptions::default(),
            listeners: Mutex::new(HashMap::new()),
            add_locks: StdMutex::new(HashMap::new()),
            started_at_ms: AtomicU64::new(0),
            cancel: StdMutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn settings(&self) -> ListenerConfig {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Swap the tuning used by subsequent cycles.
    pub fn update_settings(&self, settings: ListenerConfig) {
        info!(
            max_listeners = settings.max_listeners_per_instance,
            timeout_minutes = settings.timeout_minutes,
            "listener settings updated"
        );
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
    }

    fn endpoint(&self, instance_id: &str) -> Result<Arc<dyn Endpoint>> {
        self.endpoints
            .get(instance_id)
            .ok_or_else(|| Error::unknown_instance(instance_id))
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Restore persisted subscriptions, apply fixed listeners and launch the
    /// polling loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let token = {
            let mut slot = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_some() {
                warn!("listener registry already running");
                return Ok(());
            }
            let token = CancellationToken::new();
            *slot = Some(token.clone());
            token
        };
        self.started_at_ms.store(now_ms(), Ordering::SeqCst);

        let restored = match self.restore().await {
            Ok(n) => n,
            Err(e) => {
                *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = None;
                return Err(e);
            },
        };
        let fixed = self.apply_fixed_listeners().await;

        let settings = self.settings();
        let mut tasks = Vec::with_capacity(3);
        if settings.main_window_enabled {
            tasks.push(self.spawn_supervised("main_window", token.clone(), |this, token| {
                async move { this.main_window_loop(token).await }
            }));
        }
        tasks.push(
            self.spawn_supervised("listener_messages", token.clone(), |this, token| {
                async move { this.listener_loop(token).await }
            }),
        );
        tasks.push(self.spawn_supervised("eviction", token, |this, token| async move {
            this.eviction_loop(token).await
        }));
        self.tasks.lock().await.extend(tasks);

        info!(
            restored,
            fixed,
            instances = self.endpoints.len(),
            "listener registry started"
        );
        Ok(())
    }

    /// Cancel every loop and wait for them to finish.
    pub async fn stop(&self) {
        let token = self
            .cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(token) = token else {
            return;
        };
        token.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "listener task ended abnormally");
            }
        }
        info!("listener registry stopped");
    }

    pub fn is_running(&self) -> bool {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    async fn restore(&self) -> Result<usize> {
        let persisted = self.store.load_all().await?;
        let timeout = self.settings().endpoint_timeout();
        let mut restored = 0;
        for sub in persisted.iter().filter(|sub| sub.active) {
            let Some(endpoint) = self.endpoints.get(&sub.instance_id) else {
                debug!(
                    instance_id = %sub.instance_id,
                    who = %sub.who,
                    "subscription for unregistered instance"
                );
                continue;
            };
            match bounded(
                "add_listener",
                timeout,
                endpoint.add_listener(&sub.who, &self.fetch_options),
            )
            .await
            {
                Ok(true) => restored += 1,
                Ok(false) => warn!(
                    instance_id = %sub.instance_id,
                    who = %sub.who,
                    "instance refused restored listener, keeping subscription"
                ),
                Err(e) => warn!(
                    instance_id = %sub.instance_id,
                    who = %sub.who,
                    timeout = e.is_timeout(),
                    error = %e,
                    "failed to restore listener, keeping subscription"
                ),
            }
        }
        let mut map = self.listeners.lock().await;
        for sub in persisted {
            map.insert(sub.key(), sub);
        }
        Ok(restored)
    }

    fn add_lock(&self, instance_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.add_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(instance_id.to_string()).or_default())
    }

    /// Run `body` until the token is cancelled, restarting it after a panic.
    fn spawn_supervised<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        token: CancellationToken,
        body: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let run = tokio::spawn(body(Arc::clone(&this), token.clone()));
                match run.await {
                    Ok(()) => break,
                    Err(e) if e.is_panic() => {
                        error!(task = name, "listener loop panicked, restarting");
                        #[cfg(feature = "metrics")]
                        counter!(listener_metrics::LOOP_RESTARTS_TOTAL, labels::SOURCE => name)
                            .increment(1);
                    },
                    Err(e) => {
                        debug!(task = name, error = %e, "listener loop cancelled");
                        break;
                    },
                }
                if !sleep_or_cancel(&token, this.settings().restart_delay()).await {
                    break;
                }
            }
        })
    }

    // ── Loops ───────────────────────────────────────────────────────────────

    async fn main_window_loop(&self, token: CancellationToken) {
        loop {
            self.main_window_cycle(&token).await;
            if !sleep_or_cancel(&token, self.settings().poll_interval()).await {
                return;
            }
        }
    }

    async fn listener_loop(&self, token: CancellationToken) {
        loop {
            self.listener_cycle(&token).await;
            if !sleep_or_cancel(&token, self.settings().listener_poll_interval()).await {
                return;
            }
        }
    }

    async fn eviction_loop(&self, token: CancellationToken) {
        loop {
            if !sleep_or_cancel(&token, self.settings().eviction_interval()).await {
                return;
            }
            self.eviction_sweep().await;
        }
    }

    /// Block while paused. Returns `false` when cancelled instead.
    async fn wait_gate(&self, token: &CancellationToken) -> bool {
        if self.gate.is_paused() {
            debug!("polling paused");
            #[cfg(feature = "metrics")]
            counter!(listener_metrics::PAUSED_CYCLES_TOTAL).increment(1);
        }
        tokio::select! {
            () = token.cancelled() => false,
            () = self.gate.wait_resumed() => true,
        }
    }

    /// One pass of the main-window poll over every instance, in order.
    /// Returns the number of messages persisted.
    pub async fn main_window_cycle(&self, token: &CancellationToken) -> usize {
        let mut persisted = 0;
        for instance_id in self.endpoints.ids() {
            if !self.wait_gate(token).await {
                break;
            }
            if !self.ensure_ready(&instance_id).await {
                continue;
            }
            match self.check_main_window_messages(&instance_id).await {
                Ok(n) => persisted += n,
                Err(e) => warn!(
                    instance_id = %instance_id,
                    timeout = e.is_timeout(),
                    error = %e,
                    "main window poll failed"
                ),
            }
        }
        persisted
    }

    /// One pass of the listener-window poll over every instance, in order.
    pub async fn listener_cycle(&self, token: &CancellationToken) -> usize {
        let mut persisted = 0;
        for instance_id in self.endpoints.ids() {
            if !self.wait_gate(token).await {
                break;
            }
            if !self.ensure_ready(&instance_id).await {
                continue;
            }
            match self.check_listener_messages(&instance_id).await {
                Ok(n) => persisted += n,
                Err(e) => warn!(
                    instance_id = %instance_id,
                    timeout = e.is_timeout(),
                    error = %e,
                    "listener poll failed"
                ),
            }
        }
        persisted
    }

    /// Health gate: one re-initialise attempt when the instance is not ready.
    pub async fn ensure_ready(&self, instance_id: &str) -> bool {
        let Some(endpoint) = self.endpoints.get(instance_id) else {
            return false;
        };
        let timeout = self.settings().endpoint_timeout();
        match bounded("health_check", timeout, endpoint.health_check()).await {
            Ok(true) => return true,
            Ok(false) => debug!(instance_id, "instance not ready, re-initialising"),
            Err(e) => warn!(instance_id, error = %e, "health check failed, re-initialising"),
        }
        match bounded("initialize", timeout, endpoint.initialize()).await {
            Ok(true) => {
                info!(instance_id, "instance re-initialised");
                true
            },
            Ok(false) => {
                warn!(instance_id, "instance did not initialise, skipping cycle");
                false
            },
            Err(e) => {
                warn!(instance_id, error = %e, "instance did not initialise, skipping cycle");
                false
            },
        }
    }

    // ── Polling ─────────────────────────────────────────────────────────────

    /// Fetch main-window unread messages. Each surviving message subscribes
    /// its conversation first and is only persisted when that succeeded.
    pub async fn check_main_window_messages(&self, instance_id: &str) -> Result<usize> {
        let endpoint = self.endpoint(instance_id)?;
        let timeout = self.settings().endpoint_timeout();
        let batch = bounded(
            "fetch_unread",
            timeout,
            endpoint.fetch_unread(&self.fetch_options),
        )
        .await?;
        #[cfg(feature = "metrics")]
        counter!(
            listener_metrics::MESSAGES_RECEIVED_TOTAL,
            labels::INSTANCE => instance_id.to_string(),
            labels::SOURCE => "main_window"
        )
        .increment(batch.len() as u64);

        let now = now_ms();
        let mut persisted = 0;
        for raw in filter_batch(batch) {
            let Some(chat) = raw.chat_name.clone().filter(|c| !c.trim().is_empty()) else {
                debug!(instance_id, id = ?raw.id, "main window message without conversation");
                continue;
            };
            let message = build_message(instance_id, &chat, &raw, now);
            if !self.add_listener(instance_id, &chat, false, false).await {
                warn!(
                    instance_id,
                    who = %chat,
                    message_id = %message.message_id,
                    "could not subscribe conversation, message discarded"
                );
                continue;
            }
            self.touch(instance_id, &chat, now).await;
            if self.persist(message).await {
                persisted += 1;
            }
        }
        if persisted > 0 {
            debug!(instance_id, persisted, "main window messages stored");
        }
        Ok(persisted)
    }

    /// Fetch new messages for every listener window of the instance.
    pub async fn check_listener_messages(&self, instance_id: &str) -> Result<usize> {
        let endpoint = self.endpoint(instance_id)?;
        let timeout = self.settings().endpoint_timeout();
        let batches = bounded(
            "fetch_all_listener_messages",
            timeout,
            endpoint.fetch_all_listener_messages(),
        )
        .await?;

        let now = now_ms();
        let mut persisted = 0;
        for (who, batch) in batches {
            #[cfg(feature = "metrics")]
            counter!(
                listener_metrics::MESSAGES_RECEIVED_TOTAL,
                labels::INSTANCE => instance_id.to_string(),
                labels::SOURCE => "listener"
            )
            .increment(batch.len() as u64);

            let kept = filter_batch(split_at_marker(batch));
            if kept.is_empty() {
                continue;
            }
            self.touch(instance_id, &who, now).await;
            persisted += self.persist_batch(instance_id, &who, &kept, now).await;
        }
        self.mark_checked(instance_id, now).await;
        if persisted > 0 {
            debug!(instance_id, persisted, "listener messages stored");
        }
        Ok(persisted)
    }

    async fn persist_batch(&self, instance_id: &str, who: &str, batch: &[RawMessage], now: u64) -> usize {
        let mut persisted = 0;
        for raw in batch {
            if self.persist(build_message(instance_id, who, raw, now)).await {
                persisted += 1;
            }
        }
        persisted
    }

    /// Insert a message, pre-marking our own echoed replies as processed.
    async fn persist(&self, mut message: Message) -> bool {
        if self.echo.is_echo(
            &message.instance_id,
            &message.chat_name,
            &message.content,
            now_ms(),
        ) {
            debug!(message_id = %message.message_id, "echo of a sent reply, stored as processed");
            message.processed = true;
            #[cfg(feature = "metrics")]
            counter!(listener_metrics::ECHOES_SUPPRESSED_TOTAL).increment(1);
        }
        match self.messages.insert(&message).await {
            Ok(true) => {
                #[cfg(feature = "metrics")]
                counter!(
                    listener_metrics::MESSAGES_PERSISTED_TOTAL,
                    labels::INSTANCE => message.instance_id.clone()
                )
                .increment(1);
                true
            },
            Ok(false) => {
                debug!(message_id = %message.message_id, "duplicate message ignored");
                false
            },
            Err(e) => {
                error!(message_id = %message.message_id, error = %e, "failed to store message");
                false
            },
        }
    }

    /// Record activity on a subscription.
    async fn touch(&self, instance_id: &str, who: &str, at_ms: u64) {
        let mut map = self.listeners.lock().await;
        let Some(sub) = map.get_mut(&key(instance_id, who)) else {
            return;
        };
        sub.last_message_at_ms = sub.last_message_at_ms.max(at_ms);
        sub.last_checked_at_ms = at_ms;
        sub.marked_for_removal = false;
        if let Err(e) = self.store.upsert(sub).await {
            warn!(instance_id, who, error = %e, "failed to persist listener activity");
        }
    }

    async fn mark_checked(&self, instance_id: &str, at_ms: u64) {
        let mut map = self.listeners.lock().await;
        for sub in map
            .values_mut()
            .filter(|s| s.active && s.instance_id == instance_id)
        {
            sub.last_checked_at_ms = at_ms;
        }
    }

    // ── Eviction ────────────────────────────────────────────────────────────

    pub async fn eviction_sweep(&self) -> usize {
        self.eviction_sweep_at(now_ms()).await
    }

    /// Evict idle, non-exempt subscriptions as of `now`. A subscription whose
    /// last-chance fetch finds new messages is refreshed instead.
    pub async fn eviction_sweep_at(&self, now: u64) -> usize {
        let settings = self.settings();
        let started = self.started_at_ms.load(Ordering::SeqCst);
        if now < started.saturating_add(duration_ms(settings.startup_grace())) {
            debug!("eviction suppressed during startup grace");
            return 0;
        }
        let threshold =
            duration_ms(settings.timeout()).saturating_add(duration_ms(settings.last_chance_buffer()));
        let timeout = settings.endpoint_timeout();

        let candidates: Vec<ListenerSubscription> = {
            let mut map = self.listeners.lock().await;
            map.values_mut()
                .filter(|s| s.active && !s.is_exempt() && s.idle_ms(now) > threshold)
                .map(|s| {
                    s.marked_for_removal = true;
                    s.clone()
                })
                .collect()
        };

        let token = self.running_token();
        let mut evicted = 0;
        for sub in candidates {
            if !self.wait_gate(&token).await {
                let mut map = self.listeners.lock().await;
                for pending in map.values_mut() {
                    pending.marked_for_removal = false;
                }
                break;
            }
            let endpoint = self.endpoints.get(&sub.instance_id);
            if let Some(endpoint) = &endpoint {
                match bounded(
                    "fetch_listener_messages",
                    timeout,
                    endpoint.fetch_listener_messages(&sub.who),
                )
                .await
                {
                    Ok(batch) => {
                        let kept = filter_batch(split_at_marker(batch));
                        if !kept.is_empty() {
                            debug!(
                                instance_id = %sub.instance_id,
                                who = %sub.who,
                                count = kept.len(),
                                "last-chance fetch found messages, keeping listener"
                            );
                            self.touch(&sub.instance_id, &sub.who, now).await;
                            self.persist_batch(&sub.instance_id, &sub.who, &kept, now)
                                .await;
                            continue;
                        }
                    },
                    Err(e) => debug!(
                        instance_id = %sub.instance_id,
                        who = %sub.who,
                        error = %e,
                        "last-chance fetch failed"
                    ),
                }
            }

            if !self.deactivate(&sub, now).await {
                continue;
            }
            if let Some(endpoint) = &endpoint
                && let Err(e) =
                    bounded("remove_listener", timeout, endpoint.remove_listener(&sub.who)).await
            {
                debug!(instance_id = %sub.instance_id, who = %sub.who, error = %e, "remote remove failed");
            }
            info!(
                instance_id = %sub.instance_id,
                who = %sub.who,
                idle_secs = sub.idle_ms(now) / 1000,
                "listener evicted"
            );
            #[cfg(feature = "metrics")]
            counter!(listener_metrics::EVICTED_TOTAL, labels::INSTANCE => sub.instance_id.clone())
                .increment(1);
            evicted += 1;
        }
        evicted
    }

    /// Token of the running loops, or a fresh one when the registry is idle.
    fn running_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_default()
    }

    /// Flip a candidate to INACTIVE unless it saw activity meanwhile.
    async fn deactivate(&self, candidate: &ListenerSubscription, now: u64) -> bool {
        let mut map = self.listeners.lock().await;
        let Some(sub) = map.get_mut(&candidate.key()) else {
            return false;
        };
        sub.marked_for_removal = false;
        if !sub.active || sub.is_exempt() || sub.last_message_at_ms != candidate.last_message_at_ms
        {
            return false;
        }
        sub.active = false;
        sub.last_checked_at_ms = now;
        if let Err(e) = self.store.upsert(sub).await {
            warn!(instance_id = %sub.instance_id, who = %sub.who, error = %e, "failed to persist eviction");
        }
        #[cfg(feature = "metrics")]
        report_active(&map, &candidate.instance_id);
        true
    }

    // ── Subscriptions ───────────────────────────────────────────────────────

    /// Subscribe `who` on the instance. Idempotent: an ACTIVE subscription is
    /// returned as-is (flags are only ever upgraded) without a remote call.
    pub async fn add_listener(
        &self,
        instance_id: &str,
        who: &str,
        manually_added: bool,
        fixed_listener: bool,
    ) -> bool {
        let who = who.trim();
        if who.is_empty() {
            return false;
        }
        let Some(endpoint) = self.endpoints.get(instance_id) else {
            warn!(instance_id, who, "cannot add listener for unknown instance");
            return false;
        };
        let settings = self.settings();
        let k = key(instance_id, who);

        let add_lock = self.add_lock(instance_id);
        let _serial = add_lock.lock().await;

        {
            let mut map = self.listeners.lock().await;
            if let Some(existing) = map.get_mut(&k)
                && existing.active
            {
                let upgraded = (manually_added && !existing.manually_added)
                    || (fixed_listener && !existing.fixed_listener);
                if upgraded {
                    existing.manually_added |= manually_added;
                    existing.fixed_listener |= fixed_listener;
                    if let Err(e) = self.store.upsert(existing).await {
                        warn!(instance_id, who, error = %e, "failed to persist listener flags");
                    }
                }
                return true;
            }

            let active = map
                .values()
                .filter(|s| s.active && s.instance_id == instance_id)
                .count();
            if active >= settings.max_listeners_per_instance {
                warn!(
                    instance_id,
                    who,
                    active,
                    max = settings.max_listeners_per_instance,
                    "listener capacity reached"
                );
                return false;
            }
        }

        match bounded(
            "add_listener",
            settings.endpoint_timeout(),
            endpoint.add_listener(who, &self.fetch_options),
        )
        .await
        {
            Ok(true) => {},
            Ok(false) => {
                warn!(instance_id, who, "instance refused listener");
                return false;
            },
            Err(e) => {
                warn!(instance_id, who, timeout = e.is_timeout(), error = %e, "failed to add listener");
                return false;
            },
        }

        let now = now_ms();
        let mut map = self.listeners.lock().await;
        let sub = match map.remove(&k) {
            Some(mut sub) => {
                sub.active = true;
                sub.marked_for_removal = false;
                sub.reset_attempts = 0;
                sub.last_message_at_ms = now;
                sub.last_checked_at_ms = now;
                sub.manually_added |= manually_added;
                sub.fixed_listener |= fixed_listener;
                sub
            },
            None => {
                let mut sub = ListenerSubscription::new(instance_id, who, now);
                sub.manually_added = manually_added;
                sub.fixed_listener = fixed_listener;
                sub
            },
        };
        if let Err(e) = self.store.upsert(&sub).await {
            error!(instance_id, who, error = %e, "failed to persist listener");
        }
        map.insert(k, sub);
        info!(instance_id, who, manually_added, fixed_listener, "listener added");

        #[cfg(feature = "metrics")]
        {
            counter!(listener_metrics::ADDED_TOTAL, labels::INSTANCE => instance_id.to_string())
                .increment(1);
            report_active(&map, instance_id);
        }

        true
    }

    /// Unsubscribe `who`. The remote remove is best-effort; local state and
    /// the persisted row are dropped regardless.
    pub async fn remove_listener(&self, instance_id: &str, who: &str) -> bool {
        let removed = self
            .listeners
            .lock()
            .await
            .remove(&key(instance_id, who))
            .is_some();

        if let Some(endpoint) = self.endpoints.get(instance_id) {
            let timeout = self.settings().endpoint_timeout();
            match bounded("remove_listener", timeout, endpoint.remove_listener(who)).await {
                Ok(true) => {},
                Ok(false) => debug!(instance_id, who, "instance had no such listener"),
                Err(e) => warn!(instance_id, who, error = %e, "remote listener remove failed"),
            }
        }
        let deleted = match self.store.delete(instance_id, who).await {
            Ok(deleted) => deleted,
            Err(e) => {
                error!(instance_id, who, error = %e, "failed to delete listener");
                false
            },
        };

        #[cfg(feature = "metrics")]
        report_active(&*self.listeners.lock().await, instance_id);

        if removed || deleted {
            info!(instance_id, who, "listener removed");
        }
        removed || deleted
    }

    pub async fn has_listener(&self, instance_id: &str, who: &str) -> bool {
        self.listeners
            .lock()
            .await
            .get(&key(instance_id, who))
            .is_some_and(|s| s.active)
    }

    pub async fn subscription(&self, instance_id: &str, who: &str) -> Option<ListenerSubscription> {
        self.listeners
            .lock()
            .await
            .get(&key(instance_id, who))
            .cloned()
    }

    /// Active conversations per instance, both sorted by name.
    pub async fn active_listeners(&self) -> BTreeMap<String, Vec<String>> {
        let map = self.listeners.lock().await;
        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for sub in map.values().filter(|s| s.active) {
            out.entry(sub.instance_id.clone())
                .or_default()
                .push(sub.who.clone());
        }
        for names in out.values_mut() {
            names.sort();
        }
        out
    }

    /// Every subscription, active first, then most recently active first.
    pub async fn all_listeners_sorted(&self) -> Vec<ListenerSubscription> {
        let map = self.listeners.lock().await;
        let mut all: Vec<_> = map.values().cloned().collect();
        all.sort_by(|a, b| {
            b.active
                .cmp(&a.active)
                .then(b.last_message_at_ms.cmp(&a.last_message_at_ms))
                .then_with(|| a.key().cmp(&b.key()))
        });
        all
    }

    // ── Fixed listeners ─────────────────────────────────────────────────────

    pub async fn list_fixed_listeners(&self) -> Result<Vec<FixedListener>> {
        Ok(self.store.list_fixed().await?)
    }

    /// Returns `false` when the session name is already configured.
    pub async fn add_fixed_listener(&self, mut fixed: FixedListener) -> Result<bool> {
        fixed.session_name = fixed.session_name.trim().to_string();
        if fixed.session_name.is_empty() {
            return Err(Error::Message("fixed listener session name is empty".into()));
        }
        if !self.store.insert_fixed(&fixed).await? {
            return Ok(false);
        }
        info!(session_name = %fixed.session_name, "fixed listener added");
        self.apply_fixed_listeners().await;
        Ok(true)
    }

    pub async fn update_fixed_listener(&self, fixed: FixedListener) -> Result<bool> {
        if !self.store.update_fixed(&fixed).await? {
            return Ok(false);
        }
        info!(session_name = %fixed.session_name, enabled = fixed.enabled, "fixed listener updated");
        self.apply_fixed_listeners().await;
        Ok(true)
    }

    pub async fn remove_fixed_listener(&self, session_name: &str) -> Result<bool> {
        if !self.store.delete_fixed(session_name).await? {
            return Ok(false);
        }
        info!(session_name, "fixed listener removed");
        self.apply_fixed_listeners().await;
        Ok(true)
    }

    /// Insert config-declared fixed listeners that are not stored yet.
    pub async fn seed_fixed_listeners(&self, seeds: &[FixedListenerSeed]) -> Result<usize> {
        let mut inserted = 0;
        for seed in seeds {
            let fixed = FixedListener::from(seed);
            if fixed.session_name.is_empty() {
                continue;
            }
            if self.store.insert_fixed(&fixed).await? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Subscribe every enabled fixed listener on every instance and release
    /// the exemption of subscriptions no longer pinned. Returns the number of
    /// subscriptions in place afterwards.
    pub async fn apply_fixed_listeners(&self) -> usize {
        let fixed = match self.store.list_fixed().await {
            Ok(fixed) => fixed,
            Err(e) => {
                error!(error = %e, "failed to load fixed listeners");
                return 0;
            },
        };
        let pinned: BTreeSet<String> = fixed
            .into_iter()
            .filter(|f| f.enabled)
            .map(|f| f.session_name)
            .collect();

        {
            let mut map = self.listeners.lock().await;
            for sub in map
                .values_mut()
                .filter(|s| s.fixed_listener && !pinned.contains(&s.who))
            {
                sub.fixed_listener = false;
                debug!(instance_id = %sub.instance_id, who = %sub.who, "fixed pin released");
                if let Err(e) = self.store.upsert(sub).await {
                    warn!(instance_id = %sub.instance_id, who = %sub.who, error = %e, "failed to persist listener flags");
                }
            }
        }

        let mut applied = 0;
        for instance_id in self.endpoints.ids() {
            for who in &pinned {
                if self.add_listener(&instance_id, who, false, true).await {
                    applied += 1;
                }
            }
        }
        applied
    }

    // ── Pause ───────────────────────────────────────────────────────────────

    /// Pause polling until [`ListenerRegistry::resume`].
    pub fn pause(&self) {
        self.gate.acquire();
    }

    pub fn resume(&self) {
        self.gate.release();
    }

    /// Pause polling for as long as the guard lives.
    pub fn pause_scope(&self) -> PauseGuard {
        self.gate.pause()
    }

    /// Shared handle to the gate, for senders.
    pub fn pause_gate(&self) -> PauseGate {
        self.gate.clone()
    }
}

fn build_message(instance_id: &str, chat_name: &str, raw: &RawMessage, now: u64) -> Message {
    let mut message = Message::from_raw(instance_id, chat_name, raw, now);
    let prepared = prepare(&message.message_type, &message.content);
    message.content = prepared.content;
    message.local_file_path = prepared.attachment.map(|a| a.path);
    message
}

#[cfg(feature = "metrics")]
fn report_active(map: &HashMap<ListenerKey, ListenerSubscription>, instance_id: &str) {
    let active = map
        .values()
        .filter(|s| s.active && s.instance_id == instance_id)
        .count();
    gauge!(listener_metrics::ACTIVE, labels::INSTANCE => instance_id.to_string()).set(active as f64);
}

#[async_trait]
impl ConfigSubscriber for ListenerRegistry {
    fn name(&self) -> &str {
        "listener-registry"
    }

    async fn on_config_change(&self, event: &ConfigChangeEvent) -> anyhow::Result<()> {
        match event.kind {
            kind if kind.affects_routing() => {
                let count = self.rules.reload().await?;
                debug!(%kind, count, "rules reloaded after config change");
            },
            ConfigChangeKind::ListenerSettingsUpdated => {
                let settings: ListenerConfig = serde_json::from_value(event.payload.clone())?;
                self.update_settings(settings);
            },
            ConfigChangeKind::FixedListenersChanged => {
                self.apply_fixed_listeners().await;
            },
            _ => {},
        }
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicBool, AtomicUsize},
    };

    use {
        serde_json::json,
        wxrelay_channels::{InMemoryMessageStore, SendOptions, SendOutcome},
        wxrelay_common::ConfigNotifier,
        wxrelay_routing::InMemoryRuleStore,
    };

    use {super::*, crate::store_memory::InMemoryListenerStore};

    type Hook = Box<dyn Fn() + Send + Sync>;

    struct FakeEndpoint {
        id: String,
        healthy: AtomicBool,
        init_ok: AtomicBool,
        refuse_add: AtomicBool,
        fail_remove: AtomicBool,
        init_calls: AtomicUsize,
        add_calls: AtomicUsize,
        remove_calls: AtomicUsize,
        unread_calls: AtomicUsize,
        window_calls: AtomicUsize,
        add_delay: StdMutex<Option<Duration>>,
        unread: StdMutex<Vec<RawMessage>>,
        windows: StdMutex<HashMap<String, Vec<RawMessage>>>,
        on_fetch: StdMutex<Option<Hook>>,
        on_window: StdMutex<Option<Hook>>,
    }

    impl FakeEndpoint {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                healthy: AtomicBool::new(true),
                init_ok: AtomicBool::new(true),
                refuse_add: AtomicBool::new(false),
                fail_remove: AtomicBool::new(false),
                init_calls: AtomicUsize::new(0),
                add_calls: AtomicUsize::new(0),
                remove_calls: AtomicUsize::new(0),
                unread_calls: AtomicUsize::new(0),
                window_calls: AtomicUsize::new(0),
                add_delay: StdMutex::new(None),
                unread: StdMutex::new(Vec::new()),
                windows: StdMutex::new(HashMap::new()),
                on_fetch: StdMutex::new(None),
                on_window: StdMutex::new(None),
            })
        }

        fn push_window(&self, who: &str, batch: Vec<RawMessage>) {
            self.windows.lock().unwrap().insert(who.into(), batch);
        }
    }

    #[async_trait]
    impl Endpoint for FakeEndpoint {
        fn instance_id(&self) -> &str {
            &self.id
        }

        async fn initialize(&self) -> wxrelay_channels::Result<bool> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.init_ok.load(Ordering::SeqCst))
        }

        async fn health_check(&self) -> wxrelay_channels::Result<bool> {
            Ok(self.healthy.load(Ordering::SeqCst))
        }

        async fn fetch_unread(&self, _opts: &FetchOptions) -> wxrelay_channels::Result<Vec<RawMessage>> {
            self.unread_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(hook) = self.on_fetch.lock().unwrap().as_ref() {
                hook();
            }
            Ok(std::mem::take(&mut *self.unread.lock().unwrap()))
        }

        async fn add_listener(&self, _who: &str, _opts: &FetchOptions) -> wxrelay_channels::Result<bool> {
            self.add_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.add_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(!self.refuse_add.load(Ordering::SeqCst))
        }

        async fn remove_listener(&self, _who: &str) -> wxrelay_channels::Result<bool> {
            self.remove_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_remove.load(Ordering::SeqCst) {
                return Err(wxrelay_channels::Error::unavailable("offline"));
            }
            Ok(true)
        }

        async fn fetch_all_listener_messages(
            &self,
        ) -> wxrelay_channels::Result<HashMap<String, Vec<RawMessage>>> {
            Ok(std::mem::take(&mut *self.windows.lock().unwrap()))
        }

        async fn fetch_listener_messages(&self, who: &str) -> wxrelay_channels::Result<Vec<RawMessage>> {
            self.window_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(hook) = self.on_window.lock().unwrap().as_ref() {
                hook();
            }
            Ok(self.windows.lock().unwrap().remove(who).unwrap_or_default())
        }

        async fn send_message(
            &self,
            _who: &str,
            _text: &str,
            _opts: &SendOptions,
        ) -> wxrelay_channels::Result<SendOutcome> {
            Ok(SendOutcome::ok())
        }
    }

    struct Harness {
        registry: Arc<ListenerRegistry>,
        messages: Arc<InMemoryMessageStore>,
        store: Arc<InMemoryListenerStore>,
        echo: Arc<EchoGuard>,
    }

    fn harness(endpoints: &[Arc<FakeEndpoint>], settings: ListenerConfig) -> Harness {
        let registry_endpoints = Arc::new(EndpointRegistry::new());
        for ep in endpoints {
            registry_endpoints.register(Arc::clone(ep) as Arc<dyn Endpoint>);
        }
        let messages = Arc::new(InMemoryMessageStore::new());
        let store = Arc::new(InMemoryListenerStore::new());
        let echo = Arc::new(EchoGuard::default());
        let rules = Arc::new(RuleEngine::new(Arc::new(InMemoryRuleStore::new())));
        let registry = ListenerRegistry::new(
            registry_endpoints,
            Arc::clone(&messages) as Arc<dyn MessageStore>,
            Arc::clone(&store) as Arc<dyn ListenerStore>,
            rules,
            Arc::clone(&echo),
            settings,
        );
        Harness {
            registry,
            messages,
            store,
            echo,
        }
    }

    fn raw(id: &str, chat: Option<&str>, sender: &str, content: &str) -> RawMessage {
        RawMessage {
            id: Some(id.into()),
            sender: Some(sender.into()),
            kind: Some("text".into()),
            content: Some(content.into()),
            chat_name: chat.map(String::from),
            ..Default::default()
        }
    }

    const MINUTE: u64 = 60_000;

    #[tokio::test]
    async fn add_is_idempotent() {
        let ep = FakeEndpoint::new("wx1");
        let h = harness(&[ep.clone()], ListenerConfig::default());

        assert!(h.registry.add_listener("wx1", "Family", false, false).await);
        assert!(h.registry.add_listener("wx1", "Family", false, false).await);

        assert_eq!(ep.add_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.registry.all_listeners_sorted().await.len(), 1);
        assert!(h.registry.has_listener("wx1", "Family").await);
    }

    #[tokio::test]
    async fn second_add_upgrades_flags_without_remote_call() {
        let ep = FakeEndpoint::new("wx1");
        let h = harness(&[ep.clone()], ListenerConfig::default());
        h.registry.add_listener("wx1", "Family", false, false).await;
        h.registry.add_listener("wx1", "Family", true, false).await;

        assert_eq!(ep.add_calls.load(Ordering::SeqCst), 1);
        let sub = h.registry.subscription("wx1", "Family").await.unwrap();
        assert!(sub.manually_added);
        let stored = h.store.load_all().await.unwrap();
        assert!(stored[0].manually_added);
    }

    #[tokio::test]
    async fn capacity_is_enforced_per_instance() {
        let a = FakeEndpoint::new("a");
        let b = FakeEndpoint::new("b");
        let settings = ListenerConfig {
            max_listeners_per_instance: 1,
            ..Default::default()
        };
        let h = harness(&[a.clone(), b.clone()], settings);

        assert!(h.registry.add_listener("a", "one", false, false).await);
        assert!(!h.registry.add_listener("a", "two", false, false).await);
        assert!(h.registry.add_listener("b", "two", false, false).await);
        assert_eq!(a.add_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refused_or_unknown_add_fails() {
        let ep = FakeEndpoint::new("wx1");
        ep.refuse_add.store(true, Ordering::SeqCst);
        let h = harness(&[ep.clone()], ListenerConfig::default());
        assert!(!h.registry.add_listener("wx1", "Family", false, false).await);
        assert!(!h.registry.add_listener("missing", "Family", false, false).await);
        assert!(!h.registry.add_listener("wx1", "  ", false, false).await);
        assert!(h.store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn idle_listener_evicted_but_manual_kept() {
        let ep = FakeEndpoint::new("wx1");
        let h = harness(&[ep.clone()], ListenerConfig::default());
        h.registry.add_listener("wx1", "auto", false, false).await;
        h.registry.add_listener("wx1", "manual", true, false).await;
        h.registry.add_listener("wx1", "pinned", false, true).await;

        let later = now_ms() + 31 * MINUTE;
        assert_eq!(h.registry.eviction_sweep_at(later).await, 1);
        assert!(!h.registry.has_listener("wx1", "auto").await);
        assert!(h.registry.has_listener("wx1", "manual").await);
        assert!(h.registry.has_listener("wx1", "pinned").await);
        assert_eq!(ep.remove_calls.load(Ordering::SeqCst), 1);

        // History is kept: the row survives with active = false.
        let stored = h.store.load_all().await.unwrap();
        let auto = stored.iter().find(|s| s.who == "auto").unwrap();
        assert!(!auto.active);

        let much_later = later + 24 * 60 * MINUTE;
        assert_eq!(h.registry.eviction_sweep_at(much_later).await, 0);
        assert!(h.registry.has_listener("wx1", "manual").await);
    }

    #[tokio::test]
    async fn fresh_listener_is_not_evicted() {
        let ep = FakeEndpoint::new("wx1");
        let h = harness(&[ep.clone()], ListenerConfig::default());
        h.registry.add_listener("wx1", "Family", false, false).await;
        assert_eq!(h.registry.eviction_sweep_at(now_ms() + 29 * MINUTE).await, 0);
        assert!(h.registry.has_listener("wx1", "Family").await);
    }

    #[tokio::test]
    async fn last_chance_fetch_keeps_listener() {
        let ep = FakeEndpoint::new("wx1");
        let h = harness(&[ep.clone()], ListenerConfig::default());
        h.registry.add_listener("wx1", "Family", false, false).await;
        ep.push_window("Family", vec![raw("9", None, "alice", "still here")]);

        let later = now_ms() + 31 * MINUTE;
        assert_eq!(h.registry.eviction_sweep_at(later).await, 0);
        assert!(h.registry.has_listener("wx1", "Family").await);
        let sub = h.registry.subscription("wx1", "Family").await.unwrap();
        assert_eq!(sub.last_message_at_ms, later);
        assert!(!sub.marked_for_removal);
        assert!(h.messages.get("wx1:9").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn evicted_listener_can_be_reactivated() {
        let ep = FakeEndpoint::new("wx1");
        let h = harness(&[ep.clone()], ListenerConfig::default());
        h.registry.add_listener("wx1", "Family", false, false).await;
        h.registry
            .eviction_sweep_at(now_ms() + 31 * MINUTE)
            .await;
        assert!(!h.registry.has_listener("wx1", "Family").await);

        assert!(h.registry.add_listener("wx1", "Family", false, false).await);
        assert!(h.registry.has_listener("wx1", "Family").await);
        assert_eq!(ep.add_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn remove_cleans_up_even_when_remote_fails() {
        let ep = FakeEndpoint::new("wx1");
        ep.fail_remove.store(true, Ordering::SeqCst);
        let h = harness(&[ep.clone()], ListenerConfig::default());
        h.registry.add_listener("wx1", "Family", true, false).await;

        assert!(h.registry.remove_listener("wx1", "Family").await);
        assert!(!h.registry.has_listener("wx1", "Family").await);
        assert!(h.store.load_all().await.unwrap().is_empty());
        assert!(!h.registry.remove_listener("wx1", "Family").await);
    }

    #[tokio::test]
    async fn main_window_persists_after_subscribing() {
        let ep = FakeEndpoint::new("wx1");
        *ep.unread.lock().unwrap() = vec![
            raw("1", Some("Family"), "Self", "my own message"),
            raw("2", Some("Family"), "alice", "[语音]3秒"),
            raw("3", None, "bob", "no conversation"),
        ];
        let h = harness(&[ep.clone()], ListenerConfig::default());

        assert_eq!(h.registry.check_main_window_messages("wx1").await.unwrap(), 1);
        assert!(h.registry.has_listener("wx1", "Family").await);
        let stored = h.messages.get("wx1:2").await.unwrap().unwrap();
        assert_eq!(stored.chat_name, "Family");
        assert_eq!(stored.content, "3秒");
        assert!(h.messages.get("wx1:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn main_window_discards_when_subscription_fails() {
        let ep = FakeEndpoint::new("wx1");
        ep.refuse_add.store(true, Ordering::SeqCst);
        *ep.unread.lock().unwrap() = vec![raw("1", Some("Family"), "alice", "hi")];
        let h = harness(&[ep.clone()], ListenerConfig::default());

        assert_eq!(h.registry.check_main_window_messages("wx1").await.unwrap(), 0);
        assert!(h.messages.get("wx1:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn listener_messages_keep_only_new_tail() {
        let ep = FakeEndpoint::new("wx1");
        let h = harness(&[ep.clone()], ListenerConfig::default());
        h.registry.add_listener("wx1", "Family", false, false).await;

        let mut marker = raw("m", None, "sys", "以下为新消息");
        marker.kind = Some("sys".into());
        ep.push_window("Family", vec![
            raw("old", None, "alice", "already read"),
            marker,
            raw("new", None, "alice", "fresh"),
            raw("mine", None, "self", "echo"),
        ]);

        assert_eq!(h.registry.check_listener_messages("wx1").await.unwrap(), 1);
        let stored = h.messages.get("wx1:new").await.unwrap().unwrap();
        assert_eq!(stored.chat_name, "Family");
        assert!(h.messages.get("wx1:old").await.unwrap().is_none());
        assert!(h.messages.get("wx1:mine").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn echoed_reply_is_stored_processed() {
        let ep = FakeEndpoint::new("wx1");
        let h = harness(&[ep.clone()], ListenerConfig::default());
        h.registry.add_listener("wx1", "Family", false, false).await;
        h.echo.record("wx1", "Family", "on it", now_ms());

        ep.push_window("Family", vec![
            raw("e", None, "bot", "on it"),
            raw("n", None, "alice", "thanks"),
        ]);
        assert_eq!(h.registry.check_listener_messages("wx1").await.unwrap(), 2);
        assert!(h.messages.get("wx1:e").await.unwrap().unwrap().processed);
        assert!(!h.messages.get("wx1:n").await.unwrap().unwrap().processed);
    }

    #[tokio::test]
    async fn health_gate_reinitialises_once() {
        let ep = FakeEndpoint::new("wx1");
        ep.healthy.store(false, Ordering::SeqCst);
        let h = harness(&[ep.clone()], ListenerConfig::default());

        assert!(h.registry.ensure_ready("wx1").await);
        assert_eq!(ep.init_calls.load(Ordering::SeqCst), 1);

        ep.init_ok.store(false, Ordering::SeqCst);
        assert!(!h.registry.ensure_ready("wx1").await);
        assert_eq!(ep.init_calls.load(Ordering::SeqCst), 2);

        *ep.unread.lock().unwrap() = vec![raw("1", Some("Family"), "alice", "hi")];
        let token = CancellationToken::new();
        assert_eq!(h.registry.main_window_cycle(&token).await, 0);
        assert_eq!(ep.unread_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_mid_poll_suspends_remaining_instances() {
        let a = FakeEndpoint::new("a");
        let b = FakeEndpoint::new("b");
        let h = harness(&[a.clone(), b.clone()], ListenerConfig::default());

        let held: Arc<StdMutex<Option<PauseGuard>>> = Arc::new(StdMutex::new(None));
        {
            let gate = h.registry.pause_gate();
            let held = Arc::clone(&held);
            *a.on_fetch.lock().unwrap() = Some(Box::new(move || {
                *held.lock().unwrap() = Some(gate.pause());
            }));
        }

        let registry = Arc::clone(&h.registry);
        let cycle = tokio::spawn(async move {
            registry.main_window_cycle(&CancellationToken::new()).await
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(a.unread_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.unread_calls.load(Ordering::SeqCst), 0);
        assert!(!cycle.is_finished());

        held.lock().unwrap().take();
        cycle.await.unwrap();
        assert_eq!(b.unread_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_mid_sweep_holds_remaining_candidates() {
        let ep = FakeEndpoint::new("wx1");
        let h = harness(&[ep.clone()], ListenerConfig::default());
        h.registry.add_listener("wx1", "Family", false, false).await;
        h.registry.add_listener("wx1", "Team", false, false).await;

        let held: Arc<StdMutex<Option<PauseGuard>>> = Arc::new(StdMutex::new(None));
        {
            let gate = h.registry.pause_gate();
            let held = Arc::clone(&held);
            *ep.on_window.lock().unwrap() = Some(Box::new(move || {
                held.lock().unwrap().get_or_insert_with(|| gate.pause());
            }));
        }

        let registry = Arc::clone(&h.registry);
        let later = now_ms() + 31 * MINUTE;
        let sweep = tokio::spawn(async move { registry.eviction_sweep_at(later).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ep.window_calls.load(Ordering::SeqCst), 1);
        assert!(!sweep.is_finished());

        held.lock().unwrap().take();
        *ep.on_window.lock().unwrap() = None;
        assert_eq!(sweep.await.unwrap(), 2);
        assert_eq!(ep.window_calls.load(Ordering::SeqCst), 2);
        assert_eq!(ep.remove_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_add_leaves_other_instances_responsive() {
        let slow = FakeEndpoint::new("slow");
        let fast = FakeEndpoint::new("fast");
        *slow.add_delay.lock().unwrap() = Some(Duration::from_secs(5));
        let h = harness(&[slow.clone(), fast.clone()], ListenerConfig::default());
        assert!(h.registry.add_listener("fast", "Ops", false, false).await);

        let registry = Arc::clone(&h.registry);
        let pending =
            tokio::spawn(async move { registry.add_listener("slow", "Family", false, false).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(slow.add_calls.load(Ordering::SeqCst), 1);

        let started = tokio::time::Instant::now();
        assert!(h.registry.has_listener("fast", "Ops").await);
        assert!(h.registry.add_listener("fast", "Team", false, false).await);
        assert!(h.registry.remove_listener("fast", "Ops").await);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!pending.is_finished());

        assert!(pending.await.unwrap());
        assert!(h.registry.has_listener("slow", "Family").await);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_adds_respect_capacity() {
        let ep = FakeEndpoint::new("wx1");
        *ep.add_delay.lock().unwrap() = Some(Duration::from_secs(1));
        let settings = ListenerConfig {
            max_listeners_per_instance: 1,
            ..ListenerConfig::default()
        };
        let h = harness(&[ep.clone()], settings);

        let first = {
            let registry = Arc::clone(&h.registry);
            tokio::spawn(async move { registry.add_listener("wx1", "Family", false, false).await })
        };
        let second = {
            let registry = Arc::clone(&h.registry);
            tokio::spawn(async move { registry.add_listener("wx1", "Team", false, false).await })
        };
        let added = [first.await.unwrap(), second.await.unwrap()];

        assert_eq!(added.iter().filter(|ok| **ok).count(), 1);
        assert_eq!(ep.add_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.registry.active_listeners().await["wx1"].len(), 1);
    }

    #[tokio::test]
    async fn start_restores_applies_fixed_and_honours_grace() {
        let ep = FakeEndpoint::new("wx1");
        let h = harness(&[ep.clone()], ListenerConfig::default());

        let stale = ListenerSubscription::new("wx1", "Old Friends", 0);
        h.store.upsert(&stale).await.unwrap();
        let mut gone = ListenerSubscription::new("wx1", "Gone", 0);
        gone.active = false;
        h.store.upsert(&gone).await.unwrap();
        h.store
            .insert_fixed(&FixedListener::new("Ops Room"))
            .await
            .unwrap();

        let before = now_ms();
        h.registry.start().await.unwrap();
        assert!(h.registry.is_running());
        // One restore plus one fixed subscription.
        assert_eq!(ep.add_calls.load(Ordering::SeqCst), 2);
        assert!(h.registry.has_listener("wx1", "Old Friends").await);
        assert!(!h.registry.has_listener("wx1", "Gone").await);
        let ops = h.registry.subscription("wx1", "Ops Room").await.unwrap();
        assert!(ops.fixed_listener);

        assert_eq!(h.registry.eviction_sweep_at(before + 1_000).await, 0);
        assert_eq!(h.registry.eviction_sweep_at(now_ms() + 11_000).await, 1);
        assert!(!h.registry.has_listener("wx1", "Old Friends").await);

        h.registry.stop().await;
        assert!(!h.registry.is_running());
    }

    #[tokio::test]
    async fn fixed_listener_crud_pins_and_releases() {
        let ep = FakeEndpoint::new("wx1");
        let h = harness(&[ep.clone()], ListenerConfig::default());

        assert!(h.registry.add_fixed_listener(FixedListener::new(" Ops ")).await.unwrap());
        assert!(!h.registry.add_fixed_listener(FixedListener::new("Ops")).await.unwrap());
        assert!(h.registry.subscription("wx1", "Ops").await.unwrap().fixed_listener);

        let mut disabled = FixedListener::new("Ops");
        disabled.enabled = false;
        assert!(h.registry.update_fixed_listener(disabled).await.unwrap());
        assert!(!h.registry.subscription("wx1", "Ops").await.unwrap().fixed_listener);

        assert!(h.registry.remove_fixed_listener("Ops").await.unwrap());
        assert!(!h.registry.remove_fixed_listener("Ops").await.unwrap());
        assert!(h.registry.list_fixed_listeners().await.unwrap().is_empty());
        assert!(h.registry.add_fixed_listener(FixedListener::new("  ")).await.is_err());
    }

    #[tokio::test]
    async fn config_events_update_settings_and_fixed_listeners() {
        let ep = FakeEndpoint::new("wx1");
        let h = harness(&[ep.clone()], ListenerConfig::default());
        let notifier = ConfigNotifier::new();
        notifier.subscribe_all(Arc::clone(&h.registry) as Arc<dyn ConfigSubscriber>);

        let settings = ListenerConfig {
            max_listeners_per_instance: 3,
            ..Default::default()
        };
        let handled = notifier
            .notify(
                ConfigChangeKind::ListenerSettingsUpdated,
                serde_json::to_value(&settings).unwrap(),
            )
            .await;
        assert_eq!(handled, 1);
        assert_eq!(h.registry.settings().max_listeners_per_instance, 3);

        h.store
            .insert_fixed(&FixedListener::new("Ops"))
            .await
            .unwrap();
        notifier
            .notify(ConfigChangeKind::FixedListenersChanged, json!({}))
            .await;
        assert!(h.registry.has_listener("wx1", "Ops").await);

        assert_eq!(
            notifier
                .notify(ConfigChangeKind::RuleAdded, json!({ "rule_id": "r" }))
                .await,
            1
        );
    }

    #[tokio::test]
    async fn active_listeners_grouped_by_instance() {
        let a = FakeEndpoint::new("a");
        let b = FakeEndpoint::new("b");
        let h = harness(&[a, b], ListenerConfig::default());
        h.registry.add_listener("a", "zeta", false, false).await;
        h.registry.add_listener("a", "alpha", false, false).await;
        h.registry.add_listener("b", "beta", false, false).await;

        let active = h.registry.active_listeners().await;
        assert_eq!(active["a"], vec!["alpha", "zeta"]);
        assert_eq!(active["b"], vec!["beta"]);
        let names: HashSet<_> = h
            .registry
            .all_listeners_sorted()
            .await
            .into_iter()
            .map(|s| s.who)
            .collect();
        assert_eq!(names.len(), 3);
    }
}
