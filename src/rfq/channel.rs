use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::channel::{ActionCommand, BroadcastChannel, Channel, ChannelError, ChannelInfo, ChannelSource};
use crate::connection_manager::{ConnectionHandle, ConnectionManager};
use crate::metrics::QuoteMetrics;

use super::price::PriceProvider;
use super::quote::QuoteRequest;
use super::session::{QuoteSession, SessionConfig, SessionKey, SessionTable};
use super::RFQ_CHANNEL;

/// The RFQ channel never broadcasts on its own
struct CommandSurface;

#[async_trait]
impl ChannelSource for CommandSurface {
    async fn get_data(&self) -> Result<Option<Value>, ChannelError> {
        Ok(None)
    }
}

/// `startSession` / `updateSession` payload
#[derive(Debug, Deserialize)]
struct SessionParams {
    key: String,
    #[serde(flatten)]
    request: QuoteRequest,
}

/// `stopSession` / `placeOrder` payload
#[derive(Debug, Deserialize)]
struct SessionRef {
    key: String,
}

/// Command surface for quote sessions.
///
/// Subscriptions are disabled; the channel only routes session actions to the
/// `QuoteSession` owned by the calling connection. Unsubscribing (explicitly
/// or on disconnect) tears down every session the connection owns.
pub struct RfqChannel {
    base: BroadcastChannel<CommandSurface>,
    sessions: Arc<SessionTable>,
    provider: Arc<dyn PriceProvider>,
    config: SessionConfig,
}

impl RfqChannel {
    pub fn new(
        connections: Arc<ConnectionManager>,
        provider: Arc<dyn PriceProvider>,
        config: SessionConfig,
    ) -> Self {
        Self {
            base: BroadcastChannel::new(RFQ_CHANNEL, -1, CommandSurface, connections),
            sessions: Arc::new(SessionTable::new()),
            provider,
            config,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn get_session(&self, owner: &str, key: &str) -> Option<Arc<QuoteSession>> {
        self.sessions
            .get(&SessionKey::new(owner, key))
            .map(|entry| entry.value().clone())
    }

    async fn start_session(
        &self,
        conn: &Arc<ConnectionHandle>,
        params: SessionParams,
    ) -> Result<(), ChannelError> {
        let key = SessionKey::new(conn.identity.clone(), params.key);
        let session = QuoteSession::new(
            key.clone(),
            conn,
            params.request,
            self.provider.clone(),
            self.config.clone(),
            Arc::downgrade(&self.sessions),
        );

        if let Some(previous) = self.sessions.insert(key.clone(), session.clone()) {
            tracing::debug!(
                session_key = %key.key,
                connection_id = %conn.identity,
                "Replacing existing quote session"
            );
            previous.stop().await;
        }
        QuoteMetrics::set_active_sessions(self.sessions.len());

        tracing::info!(
            session_key = %key.key,
            connection_id = %conn.identity,
            user_id = conn.user_id,
            "Quote session started"
        );
        session.start().await;
        Ok(())
    }

    async fn update_session(
        &self,
        conn: &Arc<ConnectionHandle>,
        params: SessionParams,
    ) -> Result<(), ChannelError> {
        let Some(session) = self.get_session(&conn.identity, &params.key) else {
            tracing::debug!(session_key = %params.key, connection_id = %conn.identity, "No session to update");
            return Ok(());
        };
        session.update(params.request).await;
        Ok(())
    }

    async fn stop_session(
        &self,
        conn: &Arc<ConnectionHandle>,
        params: SessionRef,
    ) -> Result<(), ChannelError> {
        let key = SessionKey::new(conn.identity.clone(), params.key);
        let Some((_, session)) = self.sessions.remove(&key) else {
            return Ok(());
        };
        session.stop().await;
        QuoteMetrics::set_active_sessions(self.sessions.len());

        tracing::info!(
            session_key = %key.key,
            connection_id = %conn.identity,
            user_id = conn.user_id,
            "Quote session stopped"
        );
        Ok(())
    }

    async fn place_order(
        &self,
        conn: &Arc<ConnectionHandle>,
        params: SessionRef,
    ) -> Result<(), ChannelError> {
        if let Some(session) = self.get_session(&conn.identity, &params.key) {
            session.place_order().await;
        }
        Ok(())
    }

    /// Stop and forget every session owned by `owner`
    async fn stop_owned(&self, owner: &str) -> usize {
        let owned: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|entry| entry.key().owner == owner)
            .map(|entry| entry.key().clone())
            .collect();

        let mut stopped = 0;
        for key in owned {
            if let Some((_, session)) = self.sessions.remove(&key) {
                session.stop().await;
                stopped += 1;
            }
        }
        if stopped > 0 {
            QuoteMetrics::set_active_sessions(self.sessions.len());
        }
        stopped
    }
}

fn params<T: DeserializeOwned>(action: &str, params: Map<String, Value>) -> Result<T, ChannelError> {
    serde_json::from_value(Value::Object(params)).map_err(|e| ChannelError::InvalidParams {
        action: action.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl Channel for RfqChannel {
    fn name(&self) -> &str {
        RFQ_CHANNEL
    }

    async fn subscribe(&self, conn: &Arc<ConnectionHandle>) -> Result<(), ChannelError> {
        self.base.subscribe(conn).await
    }

    async fn unsubscribe(&self, conn: &Arc<ConnectionHandle>) -> Result<(), ChannelError> {
        let stopped = self.stop_owned(&conn.identity).await;
        if stopped > 0 {
            tracing::info!(
                connection_id = %conn.identity,
                user_id = conn.user_id,
                sessions = stopped,
                "Quote sessions torn down"
            );
        }
        Ok(())
    }

    async fn current(&self, conn: &Arc<ConnectionHandle>) -> Result<(), ChannelError> {
        self.base.current(conn).await
    }

    async fn action(
        &self,
        conn: &Arc<ConnectionHandle>,
        command: ActionCommand,
    ) -> Result<(), ChannelError> {
        let ActionCommand { action, params: raw, .. } = command;
        match action.as_str() {
            "startSession" => self.start_session(conn, params(&action, raw)?).await,
            "updateSession" => self.update_session(conn, params(&action, raw)?).await,
            "stopSession" => self.stop_session(conn, params(&action, raw)?).await,
            "placeOrder" => self.place_order(conn, params(&action, raw)?).await,
            _ => {
                tracing::debug!(
                    channel = RFQ_CHANNEL,
                    connection_id = %conn.identity,
                    action = %action,
                    "Ignoring unknown action"
                );
                Ok(())
            }
        }
    }

    async fn info(&self) -> ChannelInfo {
        self.base.info().await
    }

    async fn shutdown(&self) {
        let sessions: Vec<Arc<QuoteSession>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.sessions.clear();
        for session in sessions {
            session.stop().await;
        }
        QuoteMetrics::set_active_sessions(0);
        self.base.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::ConnectionOrigin;
    use crate::rfq::PriceError;
    use crate::websocket::OutboundMessage;
    use rust_decimal::Decimal;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct FlatPrice;

    #[async_trait]
    impl PriceProvider for FlatPrice {
        async fn get_price(&self, _from: &str, _to: &str) -> Result<Decimal, PriceError> {
            Ok(Decimal::new(6, 2))
        }
    }

    fn setup() -> (RfqChannel, Arc<ConnectionManager>) {
        let manager = Arc::new(ConnectionManager::new());
        let channel = RfqChannel::new(manager.clone(), Arc::new(FlatPrice), SessionConfig::default());
        (channel, manager)
    }

    fn connect(manager: &ConnectionManager) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(64);
        (manager.register(None, ConnectionOrigin::default(), tx).unwrap(), rx)
    }

    fn command(conn: &ConnectionHandle, action: &str, params: Value) -> ActionCommand {
        let Value::Object(params) = params else {
            panic!("params must be an object");
        };
        ActionCommand {
            uuid: conn.identity.clone(),
            action: action.into(),
            params,
        }
    }

    fn start(conn: &ConnectionHandle, key: &str) -> ActionCommand {
        command(
            conn,
            "startSession",
            json!({"key": key, "currFrom": "BTC", "currTo": "ETH", "amountFrom": "100"}),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_scoped_per_connection() {
        let (channel, manager) = setup();
        let (a, _rx_a) = connect(&manager);
        let (b, _rx_b) = connect(&manager);

        channel.action(&a, start(&a, "k1")).await.unwrap();
        channel.action(&b, start(&b, "k1")).await.unwrap();
        assert_eq!(channel.session_count(), 2);

        channel
            .action(&a, command(&a, "stopSession", json!({"key": "k1"})))
            .await
            .unwrap();
        assert_eq!(channel.session_count(), 1);
        assert!(channel.get_session(&b.identity, "k1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_same_key_replaces_session() {
        let (channel, manager) = setup();
        let (a, _rx) = connect(&manager);

        channel.action(&a, start(&a, "k1")).await.unwrap();
        let first = channel.get_session(&a.identity, "k1").unwrap();
        channel.action(&a, start(&a, "k1")).await.unwrap();

        assert_eq!(channel.session_count(), 1);
        assert!(!first.is_quoting().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_tears_down_owned_sessions() {
        let (channel, manager) = setup();
        let (a, mut rx_a) = connect(&manager);
        let (b, _rx_b) = connect(&manager);

        channel.action(&a, start(&a, "k1")).await.unwrap();
        channel.action(&a, start(&a, "k2")).await.unwrap();
        channel.action(&b, start(&b, "k1")).await.unwrap();

        channel.unsubscribe(&a).await.unwrap();
        assert_eq!(channel.session_count(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        while rx_a.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(10_000)).await;
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_is_disabled() {
        let (channel, manager) = setup();
        let (a, mut rx) = connect(&manager);
        channel.subscribe(&a).await.unwrap();
        let info = channel.info().await;
        assert_eq!(info.name, "rfq");
        assert_eq!(info.subscriber_count, 0);
        assert!(!info.running);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_params_and_unknown_actions() {
        let (channel, manager) = setup();
        let (a, _rx) = connect(&manager);

        let err = channel
            .action(&a, command(&a, "startSession", json!({"currFrom": "BTC"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::InvalidParams { .. }));

        channel
            .action(&a, command(&a, "dance", json!({})))
            .await
            .unwrap();
        channel
            .action(&a, command(&a, "updateSession", json!({"key": "missing", "currFrom": "BTC", "currTo": "ETH", "amountFrom": "1"})))
            .await
            .unwrap();
        assert_eq!(channel.session_count(), 0);
    }
}
