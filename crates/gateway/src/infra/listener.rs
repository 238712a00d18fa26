//! On-chain transfer event listener.
//!
//! Watches Transfer events for the routing NFT collection and invalidates
//! the ownership cache for every touched token. Invalidation never installs
//! the new owner; the next read-path call re-fetches on chain. The listener
//! is a single worker task driven by a command channel, reconnecting with
//! bounded jittered exponential backoff.

use {
    dashmap::DashMap,
    rand::Rng,
    serde::Deserialize,
    std::{
        sync::{Arc, Mutex},
        time::Duration,
    },
    tokio::sync::mpsc,
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransferEvent {
    pub collection: String,
    pub token_id: String,
    pub from: String,
    pub to: String,
}

/// Handle returned by a successful watch; dropping it without calling
/// [`WatchHandle::unwatch`] leaks the subscription.
pub struct WatchHandle {
    unwatch: Box<dyn FnOnce() + Send>,
}

impl WatchHandle {
    pub fn new(unwatch: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unwatch: Box::new(unwatch),
        }
    }

    pub fn unwatch(self) {
        (self.unwatch)();
    }
}

/// Chain RPC collaborator. Batches arrive on the given sender; the sender
/// closing signals a subscription error.
#[async_trait::async_trait]
pub trait EventWatcherClient: Send + Sync {
    async fn watch_transfer_events(
        &self,
        collection: &str,
        events: mpsc::Sender<Vec<TransferEvent>>,
    ) -> anyhow::Result<WatchHandle>;
}

/// Cache of (collection, token) → owner. Transfer processing only ever
/// removes entries.
#[derive(Clone, Default)]
pub struct OwnershipCache(Arc<DashMap<(String, String), String>>);

impl OwnershipCache {
    pub fn insert(&self, collection: &str, token_id: &str, owner: String) {
        self.0
            .insert((collection.to_string(), token_id.to_string()), owner);
    }

    pub fn get(&self, collection: &str, token_id: &str) -> Option<String> {
        self.0
            .get(&(collection.to_string(), token_id.to_string()))
            .map(|entry| entry.clone())
    }

    pub fn invalidate(&self, collection: &str, token_id: &str) {
        self.0
            .remove(&(collection.to_string(), token_id.to_string()));
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ListenerConfig {
    pub collection: String,
    #[serde(with = "humantime_serde")]
    pub base_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    pub max_retries: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            collection: "loa-fingerprints".to_string(),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_retries: 10,
        }
    }
}

pub type TransferCallback = Arc<dyn Fn(&TransferEvent) + Send + Sync>;

enum Command {
    Stop,
}

/// idle → running → running(reconnecting) → running | stopped
#[derive(Clone)]
pub struct TransferListener(Arc<Inner>);

struct Inner {
    watcher: Arc<dyn EventWatcherClient>,
    cache: OwnershipCache,
    config: ListenerConfig,
    on_transfer: Option<TransferCallback>,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
}

impl TransferListener {
    pub fn new(
        watcher: Arc<dyn EventWatcherClient>,
        cache: OwnershipCache,
        config: ListenerConfig,
        on_transfer: Option<TransferCallback>,
    ) -> Self {
        Self(Arc::new(Inner {
            watcher,
            cache,
            config,
            on_transfer,
            commands: Mutex::new(None),
        }))
    }

    /// Starts the worker task. A second start while running is a no-op.
    pub fn start(&self) {
        let mut commands = self.0.commands.lock().unwrap();
        if commands.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel(1);
        *commands = Some(tx);
        tokio::spawn(self.clone().run(rx));
    }

    /// Stops the worker, cancelling any pending reconnect. Idempotent.
    pub fn stop(&self) {
        let Some(tx) = self.0.commands.lock().unwrap().take() else {
            return;
        };
        // The worker observes the closed channel even if the buffer is full.
        let _ = tx.try_send(Command::Stop);
    }

    async fn run(self, mut commands: mpsc::Receiver<Command>) {
        let config = &self.0.config;
        let mut retry: u32 = 0;
        loop {
            let (events_tx, mut events_rx) = mpsc::channel::<Vec<TransferEvent>>(16);
            match self
                .0
                .watcher
                .watch_transfer_events(&config.collection, events_tx)
                .await
            {
                Ok(handle) => {
                    tracing::info!(collection = %config.collection, "transfer listener watching");
                    retry = 0;
                    loop {
                        tokio::select! {
                            command = commands.recv() => {
                                let _ = command;
                                handle.unwatch();
                                tracing::info!("transfer listener stopped");
                                return;
                            }
                            batch = events_rx.recv() => match batch {
                                Some(events) => self.process(events),
                                None => {
                                    // Stream failed; the handle is dead.
                                    handle.unwatch();
                                    break;
                                }
                            },
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(?err, "transfer event subscription failed");
                }
            }

            retry += 1;
            if retry > config.max_retries {
                Metrics::get().reconnect_exhausted.inc();
                tracing::error!(
                    retries = config.max_retries,
                    "transfer listener giving up after repeated failures"
                );
                return;
            }
            let backoff = reconnect_backoff(config, retry);
            tracing::debug!(?backoff, retry, "transfer listener reconnecting");
            tokio::select! {
                command = commands.recv() => {
                    let _ = command;
                    tracing::info!("transfer listener stopped while reconnecting");
                    return;
                }
                _ = tokio::time::sleep(backoff) => (),
            }
        }
    }

    fn process(&self, events: Vec<TransferEvent>) {
        for event in &events {
            self.0.cache.invalidate(&event.collection, &event.token_id);
            if let Some(callback) = &self.0.on_transfer {
                callback(event);
            }
        }
        if !events.is_empty() {
            Metrics::get().transfers.inc_by(events.len() as u64);
            tracing::debug!(count = events.len(), "invalidated ownership cache entries");
        }
    }
}

fn reconnect_backoff(config: &ListenerConfig, retry: u32) -> Duration {
    let exponential = config
        .base_backoff
        .saturating_mul(1u32 << (retry - 1).min(16))
        .min(config.max_backoff);
    exponential.mul_f64(rand::thread_rng().gen_range(0.75..=1.25))
}

#[derive(prometheus_metric_storage::MetricStorage)]
#[metric(subsystem = "transfer_listener")]
struct Metrics {
    /// Transfer events processed.
    transfers: prometheus::IntCounter,
    /// Reconnect loops that ran out of retries.
    reconnect_exhausted: prometheus::IntCounter,
}

impl Metrics {
    fn get() -> &'static Self {
        Self::instance(observe::metrics::get_metric_storage_registry())
            .expect("unexpected error getting metrics instance")
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::atomic::{AtomicU32, Ordering},
    };

    /// Watcher that succeeds after a configurable number of failures and
    /// hands the event sender to the test.
    struct FlakyWatcher {
        failures_left: AtomicU32,
        attempts: AtomicU32,
        sender: Mutex<Option<mpsc::Sender<Vec<TransferEvent>>>>,
        unwatched: Arc<AtomicU32>,
    }

    impl FlakyWatcher {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                attempts: AtomicU32::new(0),
                sender: Mutex::new(None),
                unwatched: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    #[async_trait::async_trait]
    impl EventWatcherClient for FlakyWatcher {
        async fn watch_transfer_events(
            &self,
            _: &str,
            events: mpsc::Sender<Vec<TransferEvent>>,
        ) -> anyhow::Result<WatchHandle> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_ok()
            {
                anyhow::bail!("rpc unavailable");
            }
            *self.sender.lock().unwrap() = Some(events);
            let unwatched = self.unwatched.clone();
            Ok(WatchHandle::new(move || {
                unwatched.fetch_add(1, Ordering::SeqCst);
            }))
        }
    }

    fn transfer(token_id: &str) -> TransferEvent {
        TransferEvent {
            collection: "loa-fingerprints".into(),
            token_id: token_id.into(),
            from: "0xaaa".into(),
            to: "0xbbb".into(),
        }
    }

    async fn settle() {
        // Lets the worker task observe channel activity under paused time.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transfers_invalidate_without_installing() {
        let watcher = Arc::new(FlakyWatcher::new(0));
        let cache = OwnershipCache::default();
        cache.insert("loa-fingerprints", "42", "0xaaa".into());
        cache.insert("loa-fingerprints", "77", "0xccc".into());

        let listener = TransferListener::new(
            watcher.clone(),
            cache.clone(),
            ListenerConfig::default(),
            None,
        );
        listener.start();
        settle().await;

        let sender = watcher.sender.lock().unwrap().clone().unwrap();
        sender.send(vec![transfer("42")]).await.unwrap();
        settle().await;

        assert_eq!(cache.get("loa-fingerprints", "42"), None);
        // Untouched tokens keep their cached owner.
        assert_eq!(
            cache.get("loa-fingerprints", "77"),
            Some("0xccc".to_string())
        );
        listener.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_stream_failure() {
        let watcher = Arc::new(FlakyWatcher::new(2));
        let listener = TransferListener::new(
            watcher.clone(),
            OwnershipCache::default(),
            ListenerConfig::default(),
            None,
        );
        listener.start();

        // Paused time auto-advances through the backoff sleeps.
        for _ in 0..50 {
            if watcher.sender.lock().unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert!(watcher.sender.lock().unwrap().is_some());
        assert_eq!(watcher.attempts.load(Ordering::SeqCst), 3);
        listener.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let watcher = Arc::new(FlakyWatcher::new(u32::MAX));
        let config = ListenerConfig {
            max_retries: 3,
            ..Default::default()
        };
        let listener = TransferListener::new(
            watcher.clone(),
            OwnershipCache::default(),
            config,
            None,
        );
        listener.start();
        for _ in 0..50 {
            if watcher.attempts.load(Ordering::SeqCst) >= 4 {
                break;
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        settle().await;
        // Initial attempt plus three retries, then the worker exits.
        assert_eq!(watcher.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_are_idempotent() {
        let watcher = Arc::new(FlakyWatcher::new(0));
        let listener = TransferListener::new(
            watcher.clone(),
            OwnershipCache::default(),
            ListenerConfig::default(),
            None,
        );
        listener.start();
        listener.start();
        settle().await;
        assert_eq!(watcher.attempts.load(Ordering::SeqCst), 1);

        listener.stop();
        listener.stop();
        settle().await;
        assert_eq!(watcher.unwatched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn callback_sees_every_transfer() {
        let watcher = Arc::new(FlakyWatcher::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let callback: TransferCallback = {
            let seen = seen.clone();
            Arc::new(move |event: &TransferEvent| {
                seen.lock().unwrap().push(event.token_id.clone());
            })
        };
        let listener = TransferListener::new(
            watcher.clone(),
            OwnershipCache::default(),
            ListenerConfig::default(),
            Some(callback),
        );
        listener.start();
        settle().await;

        let sender = watcher.sender.lock().unwrap().clone().unwrap();
        sender
            .send(vec![transfer("1"), transfer("2")])
            .await
            .unwrap();
        settle().await;
        assert_eq!(*seen.lock().unwrap(), vec!["1".to_string(), "2".to_string()]);
        listener.stop();
    }
}
