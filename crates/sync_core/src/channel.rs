use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use shared::protocol::{ChannelFilter, ChannelStatus, ClientFrame, RowChange, ServerFrame};
use tokio::{
    net::TcpStream,
    sync::{broadcast, watch, Mutex},
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};
use url::Url;

const DELIVERY_BUFFER: usize = 256;

/// One live subscription on the push channel. Deliveries are at-least-once
/// and possibly out of order; consumers must deduplicate.
#[async_trait]
pub trait ChannelSubscription: Send + Sync + std::fmt::Debug {
    fn deliveries(&self) -> broadcast::Receiver<RowChange>;
    fn status(&self) -> watch::Receiver<ChannelStatus>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn open(&self, filter: ChannelFilter) -> Result<Arc<dyn ChannelSubscription>>;
}

pub struct MissingChannelFactory;

#[async_trait]
impl ChannelFactory for MissingChannelFactory {
    async fn open(&self, filter: ChannelFilter) -> Result<Arc<dyn ChannelSubscription>> {
        Err(anyhow!(
            "live channel unavailable for {:?} scope {}",
            filter.entity,
            filter.scope_id.0
        ))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, WsMessage>;

struct WsRoute {
    deliveries: broadcast::Sender<RowChange>,
    status: watch::Sender<ChannelStatus>,
}

struct WsShared {
    writer: Mutex<Option<WsWriter>>,
    routes: Mutex<HashMap<u64, WsRoute>>,
}

impl WsShared {
    /// Socket death invalidates every live subscription at once. The factory
    /// reports the transition and reconnects on the next `open`; it never
    /// refetches data itself.
    async fn mark_disconnected(&self, terminal: ChannelStatus) {
        self.writer.lock().await.take();
        let routes = self.routes.lock().await;
        for route in routes.values() {
            let _ = route.status.send(terminal);
        }
    }
}

/// Websocket-backed [`ChannelFactory`]: one connection per factory, one
/// subscribe-by-filter frame per opened subscription, deliveries routed by
/// subscription id and decoded into typed rows at this boundary.
pub struct WsChannelFactory {
    server_url: String,
    identity_token: String,
    next_subscription_id: AtomicU64,
    shared: Arc<WsShared>,
}

impl WsChannelFactory {
    pub fn new(server_url: impl Into<String>, identity_token: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            identity_token: identity_token.into(),
            next_subscription_id: AtomicU64::new(1),
            shared: Arc::new(WsShared {
                writer: Mutex::new(None),
                routes: Mutex::new(HashMap::new()),
            }),
        }
    }

    async fn ensure_connected(&self) -> Result<()> {
        let mut writer = self.shared.writer.lock().await;
        if writer.is_some() {
            return Ok(());
        }

        let endpoint = channel_endpoint(&self.server_url, &self.identity_token)?;
        let (ws_stream, _) = connect_async(&endpoint)
            .await
            .with_context(|| format!("failed to connect channel websocket: {endpoint}"))?;
        let (ws_writer, ws_reader) = ws_stream.split();
        *writer = Some(ws_writer);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(run_reader(shared, ws_reader));
        info!("channel websocket connected");
        Ok(())
    }
}

#[async_trait]
impl ChannelFactory for WsChannelFactory {
    async fn open(&self, filter: ChannelFilter) -> Result<Arc<dyn ChannelSubscription>> {
        self.ensure_connected().await?;

        let subscription_id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let (deliveries, _) = broadcast::channel(DELIVERY_BUFFER);
        // Receiver created before the subscribe frame goes out, so a delivery
        // racing the open cannot be dropped.
        let initial_receiver = deliveries.subscribe();
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Subscribed);
        self.shared.routes.lock().await.insert(
            subscription_id,
            WsRoute {
                deliveries: deliveries.clone(),
                status: status_tx,
            },
        );

        let frame = serde_json::to_string(&ClientFrame::Subscribe {
            subscription_id,
            filter,
        })?;
        let send_result = match self.shared.writer.lock().await.as_mut() {
            Some(writer) => writer.send(WsMessage::Text(frame)).await,
            None => {
                self.shared.routes.lock().await.remove(&subscription_id);
                return Err(anyhow!("channel websocket lost before subscribe"));
            }
        };
        if let Err(err) = send_result {
            self.shared.routes.lock().await.remove(&subscription_id);
            self.shared
                .mark_disconnected(ChannelStatus::ChannelError)
                .await;
            return Err(anyhow!("failed to send subscribe frame: {err}"));
        }

        info!(
            subscription_id,
            entity = ?filter.entity,
            scope_id = filter.scope_id.0,
            "channel subscription opened"
        );
        Ok(Arc::new(WsSubscription {
            subscription_id,
            shared: Arc::clone(&self.shared),
            deliveries,
            initial_receiver: StdMutex::new(Some(initial_receiver)),
            status: status_rx,
        }))
    }
}

struct WsSubscription {
    subscription_id: u64,
    shared: Arc<WsShared>,
    deliveries: broadcast::Sender<RowChange>,
    initial_receiver: StdMutex<Option<broadcast::Receiver<RowChange>>>,
    status: watch::Receiver<ChannelStatus>,
}

impl std::fmt::Debug for WsSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsSubscription")
            .field("subscription_id", &self.subscription_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ChannelSubscription for WsSubscription {
    fn deliveries(&self) -> broadcast::Receiver<RowChange> {
        if let Some(receiver) = self
            .initial_receiver
            .lock()
            .ok()
            .and_then(|mut receiver| receiver.take())
        {
            return receiver;
        }
        self.deliveries.subscribe()
    }

    fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    async fn close(&self) -> Result<()> {
        self.shared
            .routes
            .lock()
            .await
            .remove(&self.subscription_id);
        // Best effort: the socket may already be gone, and close must still
        // release the route.
        if let Some(writer) = self.shared.writer.lock().await.as_mut() {
            let frame = serde_json::to_string(&ClientFrame::Unsubscribe {
                subscription_id: self.subscription_id,
            })?;
            let _ = writer.send(WsMessage::Text(frame)).await;
        }
        Ok(())
    }
}

async fn run_reader(shared: Arc<WsShared>, mut reader: SplitStream<WsStream>) {
    let terminal = loop {
        let Some(frame) = reader.next().await else {
            break ChannelStatus::Closed;
        };
        match frame {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                Ok(ServerFrame::Delivery {
                    subscription_id,
                    change,
                }) => {
                    let routes = shared.routes.lock().await;
                    match routes.get(&subscription_id) {
                        Some(route) => {
                            let _ = route.deliveries.send(change);
                        }
                        None => warn!(subscription_id, "delivery for unknown subscription"),
                    }
                }
                Ok(ServerFrame::SubscriptionStatus {
                    subscription_id,
                    status,
                }) => {
                    let routes = shared.routes.lock().await;
                    if let Some(route) = routes.get(&subscription_id) {
                        let _ = route.status.send(status);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "undecodable channel frame");
                }
            },
            Ok(WsMessage::Close(_)) => break ChannelStatus::Closed,
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "channel websocket receive failed");
                break ChannelStatus::ChannelError;
            }
        }
    };
    shared.mark_disconnected(terminal).await;
}

fn channel_endpoint(server_url: &str, identity_token: &str) -> Result<String> {
    let mut url =
        Url::parse(server_url).with_context(|| format!("invalid server url: {server_url}"))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(anyhow!("server url must be http:// or https://, got {other}://")),
    };
    url.set_scheme(scheme)
        .map_err(|()| anyhow!("cannot rewrite scheme for {server_url}"))?;
    url.set_path("/channel");
    url.query_pairs_mut()
        .clear()
        .append_pair("token", identity_token);
    Ok(url.to_string())
}
