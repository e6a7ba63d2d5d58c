use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::connection_manager::{ConnectionHandle, ConnectionManager};
use crate::metrics::ChannelMetrics;
use crate::websocket::ServerMessage;

use super::equality::values_equal;
use super::source::ChannelSource;
use super::{Channel, ChannelError, ChannelInfo};

/// Periodic broadcast channel.
///
/// Stopped (no timer) while nobody is subscribed, running while at least one
/// connection is. Each tick fetches a value from the source and sends it to
/// every subscriber if it changed, or only to subscribers that have not seen
/// the current value yet if it did not.
pub struct BroadcastChannel<S: ChannelSource> {
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    name: String,
    interval_ms: i64,
    source: S,
    connections: Arc<ConnectionManager>,
    state: Mutex<ChannelState>,
    /// Held for the duration of one tick so ticks never overlap
    tick_guard: Mutex<()>,
}

#[derive(Default)]
struct ChannelState {
    subscribers: HashSet<u64>,
    /// Subscribers that have received the cached value
    received: HashSet<u64>,
    cached: Option<Value>,
    timer: Option<JoinHandle<()>>,
}

impl<S: ChannelSource> Clone for BroadcastChannel<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: ChannelSource> BroadcastChannel<S> {
    /// An `interval_ms` below 1 disables subscriptions entirely
    pub fn new(
        name: impl Into<String>,
        interval_ms: i64,
        source: S,
        connections: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                interval_ms,
                source,
                connections,
                state: Mutex::new(ChannelState::default()),
                tick_guard: Mutex::new(()),
            }),
        }
    }

    pub fn source(&self) -> &S {
        &self.inner.source
    }

    pub fn subscriptions_enabled(&self) -> bool {
        self.inner.interval_ms >= 1
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.timer.is_some()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.state.lock().await.subscribers.len()
    }

    pub async fn is_subscribed(&self, user_id: u64) -> bool {
        self.inner.state.lock().await.subscribers.contains(&user_id)
    }

    fn frame(&self, data: &Value) -> Result<Arc<str>, serde_json::Error> {
        let text = serde_json::to_string(&ServerMessage::channel(&self.inner.name, data))?;
        Ok(Arc::from(text))
    }

    /// Start the timer and fire the first tick.
    ///
    /// Returns false if already running, if nobody is subscribed, or if the
    /// start hook refused.
    async fn start(&self) -> bool {
        {
            let mut state = self.inner.state.lock().await;
            if state.timer.is_some() || state.subscribers.is_empty() {
                return false;
            }
            if !self.inner.source.start_hook().await {
                tracing::debug!(channel = %self.inner.name, "Start hook refused");
                return false;
            }

            let period = Duration::from_millis(self.inner.interval_ms.max(1) as u64);
            let channel = self.clone();
            state.timer = Some(tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    channel.broadcast().await;
                }
            }));
        }

        ChannelMetrics::record_started();
        tracing::info!(
            channel = %self.inner.name,
            interval_ms = self.inner.interval_ms,
            "Channel started"
        );

        self.broadcast().await;
        true
    }

    /// Stop the timer, but only once nobody is subscribed
    async fn stop(&self) {
        let mut state = self.inner.state.lock().await;
        if state.timer.is_none() || !state.subscribers.is_empty() {
            return;
        }

        self.inner.source.stop_hook().await;

        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        drop(state);

        ChannelMetrics::record_stopped();
        tracing::info!(channel = %self.inner.name, "Channel stopped");
    }

    /// One broadcast tick
    pub async fn broadcast(&self) {
        let Ok(_tick) = self.inner.tick_guard.try_lock() else {
            tracing::debug!(channel = %self.inner.name, "Previous tick still running, skipping");
            return;
        };

        if self.subscriber_count().await == 0 {
            self.stop().await;
            return;
        }

        let data = match self.inner.source.get_data().await {
            Ok(Some(data)) => data,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(channel = %self.inner.name, error = %e, "Failed to produce channel data");
                return;
            }
        };

        let frame = match self.frame(&data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(channel = %self.inner.name, error = %e, "Failed to serialize channel data");
                return;
            }
        };

        let recipients: HashSet<u64> = {
            let mut state = self.inner.state.lock().await;
            let changed = !state
                .cached
                .as_ref()
                .is_some_and(|cached| values_equal(cached, &data));
            state.cached = Some(data);

            let ChannelState {
                subscribers,
                received,
                ..
            } = &mut *state;
            let recipients = subscribers
                .iter()
                .copied()
                .filter(|user_id| {
                    let first_view = received.insert(*user_id);
                    changed || first_view
                })
                .collect();
            recipients
        };

        if recipients.is_empty() {
            return;
        }

        let mut delivered = 0u64;
        for conn in self.inner.connections.get_all_connections() {
            if !recipients.contains(&conn.user_id) {
                continue;
            }
            match conn.send_preserialized(frame.clone()).await {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::debug!(
                        channel = %self.inner.name,
                        connection_id = %conn.identity,
                        "Subscriber gone before delivery"
                    );
                }
            }
        }

        ChannelMetrics::record_delivered(&self.inner.name, delivered);
        tracing::debug!(
            channel = %self.inner.name,
            recipients = recipients.len(),
            delivered = delivered,
            "Broadcast tick delivered"
        );
    }

    /// Send the cached snapshot to one subscriber and mark it as received
    async fn send_cached(&self, conn: &ConnectionHandle) -> Result<(), ChannelError> {
        let frame = {
            let mut state = self.inner.state.lock().await;
            if !state.subscribers.contains(&conn.user_id) {
                return Ok(());
            }
            let Some(snapshot) = self
                .inner
                .source
                .get_cached_data(state.cached.as_ref())
                .await
            else {
                return Ok(());
            };
            state.received.insert(conn.user_id);
            self.frame(&snapshot)?
        };

        if conn.send_preserialized(frame).await.is_err() {
            tracing::debug!(
                channel = %self.inner.name,
                connection_id = %conn.identity,
                "Subscriber gone before cached delivery"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl<S: ChannelSource> Channel for BroadcastChannel<S> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn subscribe(&self, conn: &Arc<ConnectionHandle>) -> Result<(), ChannelError> {
        if !self.subscriptions_enabled() {
            return Ok(());
        }
        if !self.inner.source.pre_subscribe_hook(conn) {
            tracing::debug!(
                channel = %self.inner.name,
                connection_id = %conn.identity,
                "Subscription refused by hook"
            );
            return Ok(());
        }

        {
            let mut state = self.inner.state.lock().await;
            if !state.subscribers.insert(conn.user_id) {
                return Ok(());
            }
            state.received.remove(&conn.user_id);
        }

        tracing::debug!(
            channel = %self.inner.name,
            connection_id = %conn.identity,
            user_id = conn.user_id,
            "Subscribed"
        );

        // Already running: hand the newcomer the current value right away
        if !self.start().await {
            self.send_cached(conn).await?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, conn: &Arc<ConnectionHandle>) -> Result<(), ChannelError> {
        self.inner.source.pre_unsubscribe_hook(conn);

        let removed = {
            let mut state = self.inner.state.lock().await;
            state.received.remove(&conn.user_id);
            state.subscribers.remove(&conn.user_id)
        };

        if removed {
            tracing::debug!(
                channel = %self.inner.name,
                connection_id = %conn.identity,
                user_id = conn.user_id,
                "Unsubscribed"
            );
            self.stop().await;
        }
        Ok(())
    }

    /// Fresh value for one connection; the broadcast cache is left untouched
    async fn current(&self, conn: &Arc<ConnectionHandle>) -> Result<(), ChannelError> {
        if !self.inner.source.pre_current_hook(conn) {
            return Ok(());
        }

        let data = match self.inner.source.get_data().await {
            Ok(Some(data)) => data,
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::warn!(channel = %self.inner.name, error = %e, "Failed to produce current value");
                return Ok(());
            }
        };

        if conn.send_preserialized(self.frame(&data)?).await.is_err() {
            tracing::debug!(
                channel = %self.inner.name,
                connection_id = %conn.identity,
                "Connection gone before current value was delivered"
            );
        }
        Ok(())
    }

    async fn info(&self) -> ChannelInfo {
        let state = self.inner.state.lock().await;
        ChannelInfo {
            name: self.inner.name.clone(),
            subscriber_count: state.subscribers.len(),
            running: state.timer.is_some(),
        }
    }

    async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        state.subscribers.clear();
        state.received.clear();
        if let Some(timer) = state.timer.take() {
            timer.abort();
            ChannelMetrics::record_stopped();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::ConnectionOrigin;
    use crate::websocket::OutboundMessage;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// Serves whatever value is currently stored
    struct FixedSource {
        value: std::sync::Mutex<Option<Value>>,
        calls: AtomicUsize,
        allow_start: AtomicBool,
    }

    impl FixedSource {
        fn new(value: Value) -> Self {
            Self {
                value: std::sync::Mutex::new(Some(value)),
                calls: AtomicUsize::new(0),
                allow_start: AtomicBool::new(true),
            }
        }

        fn set(&self, value: Option<Value>) {
            *self.value.lock().unwrap() = value;
        }
    }

    #[async_trait]
    impl ChannelSource for FixedSource {
        async fn get_data(&self) -> Result<Option<Value>, ChannelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.value.lock().unwrap().clone())
        }

        async fn start_hook(&self) -> bool {
            self.allow_start.load(Ordering::SeqCst)
        }
    }

    /// Takes its time answering and records overlapping calls
    struct SlowSource {
        delay: Duration,
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[async_trait]
    impl ChannelSource for SlowSource {
        async fn get_data(&self) -> Result<Option<Value>, ChannelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Some(json!({"v": 1})))
        }
    }

    fn connect(
        manager: &ConnectionManager,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = manager
            .register(None, ConnectionOrigin::default(), tx)
            .unwrap();
        (handle, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<OutboundMessage>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Ok(Some(text)) = msg.to_json() {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    fn channel(
        interval_ms: i64,
        value: Value,
    ) -> (BroadcastChannel<FixedSource>, Arc<ConnectionManager>) {
        let manager = Arc::new(ConnectionManager::new());
        let channel = BroadcastChannel::new("prices", interval_ms, FixedSource::new(value), manager.clone());
        (channel, manager)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_value_delivered_once() {
        let (channel, manager) = channel(60_000, json!({"btc": 100}));
        let (a, mut rx_a) = connect(&manager);
        let (b, mut rx_b) = connect(&manager);

        channel.subscribe(&a).await.unwrap();
        channel.subscribe(&b).await.unwrap();
        assert_eq!(drain(&mut rx_a), vec![json!({"channel": "prices", "btc": 100})]);
        assert_eq!(drain(&mut rx_b), vec![json!({"channel": "prices", "btc": 100})]);

        channel.broadcast().await;
        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_b).is_empty());

        let (c, mut rx_c) = connect(&manager);
        channel.subscribe(&c).await.unwrap();
        assert_eq!(drain(&mut rx_c).len(), 1);

        channel.broadcast().await;
        assert!(drain(&mut rx_c).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_value_reaches_everyone() {
        let (channel, manager) = channel(60_000, json!({"v": 1}));
        let (a, mut rx_a) = connect(&manager);
        let (b, mut rx_b) = connect(&manager);
        channel.subscribe(&a).await.unwrap();
        channel.subscribe(&b).await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        channel.source().set(Some(json!({"v": 2})));
        channel.broadcast().await;
        assert_eq!(drain(&mut rx_a), vec![json!({"channel": "prices", "v": 2})]);
        assert_eq!(drain(&mut rx_b), vec![json!({"channel": "prices", "v": 2})]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_value_sends_nothing() {
        let (channel, manager) = channel(60_000, json!(null));
        channel.source().set(None);
        let (a, mut rx_a) = connect(&manager);
        channel.subscribe(&a).await.unwrap();
        assert!(drain(&mut rx_a).is_empty());

        // Nothing cached yet, so the first real value still reaches the subscriber
        channel.source().set(Some(json!({"v": 1})));
        channel.broadcast().await;
        assert_eq!(drain(&mut rx_a).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_iff_subscribed() {
        let (channel, manager) = channel(60_000, json!({"v": 1}));
        let (a, _rx_a) = connect(&manager);
        let (b, _rx_b) = connect(&manager);
        assert!(!channel.is_running().await);

        channel.subscribe(&a).await.unwrap();
        channel.subscribe(&b).await.unwrap();
        assert!(channel.is_running().await);

        channel.unsubscribe(&a).await.unwrap();
        assert!(channel.is_running().await);
        channel.unsubscribe(&b).await.unwrap();
        assert!(!channel.is_running().await);

        // Unsubscribing twice is harmless
        channel.unsubscribe(&b).await.unwrap();
        assert!(!channel.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_restarts_with_immediate_tick() {
        let (channel, manager) = channel(60_000, json!({"v": 1}));
        let (a, mut rx_a) = connect(&manager);
        channel.subscribe(&a).await.unwrap();
        channel.unsubscribe(&a).await.unwrap();
        drain(&mut rx_a);
        let calls = channel.source().calls.load(Ordering::SeqCst);

        channel.subscribe(&a).await.unwrap();
        assert!(channel.is_running().await);
        assert_eq!(channel.source().calls.load(Ordering::SeqCst), calls + 1);
        assert_eq!(drain(&mut rx_a).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_ticks_on_interval() {
        let (channel, manager) = channel(1_000, json!({"v": 1}));
        let (a, mut rx_a) = connect(&manager);
        channel.subscribe(&a).await.unwrap();
        drain(&mut rx_a);

        channel.source().set(Some(json!({"v": 2})));
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(drain(&mut rx_a), vec![json!({"channel": "prices", "v": 2})]);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(drain(&mut rx_a).is_empty());
        assert!(channel.source().calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_is_idempotent() {
        let (channel, manager) = channel(60_000, json!({"v": 1}));
        let (a, mut rx_a) = connect(&manager);
        channel.subscribe(&a).await.unwrap();
        channel.subscribe(&a).await.unwrap();
        assert_eq!(drain(&mut rx_a).len(), 1);
        assert_eq!(channel.subscriber_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_channel_ignores_subscribe() {
        let (channel, manager) = channel(-1, json!({"v": 1}));
        let (a, mut rx_a) = connect(&manager);
        channel.subscribe(&a).await.unwrap();
        assert!(!channel.is_running().await);
        assert_eq!(channel.subscriber_count().await, 0);
        assert!(drain(&mut rx_a).is_empty());

        // current still answers
        channel.current(&a).await.unwrap();
        assert_eq!(drain(&mut rx_a).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_hook_can_refuse() {
        let (channel, manager) = channel(60_000, json!({"v": 1}));
        channel.source().allow_start.store(false, Ordering::SeqCst);
        let (a, mut rx_a) = connect(&manager);
        channel.subscribe(&a).await.unwrap();
        assert!(!channel.is_running().await);
        assert!(channel.is_subscribed(a.user_id).await);
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_bypasses_cache_and_subscription() {
        let (channel, manager) = channel(60_000, json!({"v": 1}));
        let (a, mut rx_a) = connect(&manager);
        let (b, mut rx_b) = connect(&manager);
        channel.subscribe(&a).await.unwrap();
        drain(&mut rx_a);

        channel.source().set(Some(json!({"v": 2})));
        channel.current(&b).await.unwrap();
        assert_eq!(drain(&mut rx_b), vec![json!({"channel": "prices", "v": 2})]);

        // The subscriber still learns about the change on the next tick
        channel.broadcast().await;
        assert_eq!(drain(&mut rx_a), vec![json!({"channel": "prices", "v": 2})]);
    }

    fn slow_channel(interval_ms: i64) -> (BroadcastChannel<SlowSource>, Arc<ConnectionManager>) {
        let manager = Arc::new(ConnectionManager::new());
        let source = SlowSource {
            delay: Duration::from_millis(5_000),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        };
        let channel = BroadcastChannel::new("slow", interval_ms, source, manager.clone());
        (channel, manager)
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_source_ticks_never_overlap() {
        let (channel, manager) = slow_channel(1_000);
        let (a, _rx_a) = connect(&manager);

        // The first tick runs inline and outlasts several timer periods
        channel.subscribe(&a).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20_000)).await;

        assert!(channel.source().calls.load(Ordering::SeqCst) >= 3);
        assert_eq!(channel.source().max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_broadcast_is_skipped() {
        let (channel, manager) = slow_channel(60_000);
        let (a, _rx_a) = connect(&manager);
        channel.subscribe(&a).await.unwrap();
        assert_eq!(channel.source().calls.load(Ordering::SeqCst), 1);

        tokio::join!(channel.broadcast(), channel.broadcast());
        assert_eq!(channel.source().calls.load(Ordering::SeqCst), 2);
        assert_eq!(channel.source().max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_to_closed_connection_is_not_an_error() {
        let (channel, manager) = channel(60_000, json!({"v": 1}));
        let (a, rx_a) = connect(&manager);
        drop(rx_a);

        assert!(channel.current(&a).await.is_ok());
        assert_eq!(channel.source().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_anonymous_connection_cannot_subscribe() {
        let (channel, _manager) = channel(60_000, json!({"v": 1}));
        let (tx, mut rx) = mpsc::channel(4);
        let anonymous = Arc::new(ConnectionHandle::new(String::new(), 0, ConnectionOrigin::default(), tx));
        channel.subscribe(&anonymous).await.unwrap();
        channel.current(&anonymous).await.unwrap();
        assert!(!channel.is_running().await);
        assert!(rx.try_recv().is_err());
    }
}
