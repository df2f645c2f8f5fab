//! Client end of the realtime channel. One WebSocket session to the hub, a
//! fixed room, typed subscriptions and bounded reconnects.

use fleet_core::model::Room;
use fleet_core::wire::{
    decode_text, encode_text, EventKind, FrameError, HelloPayload, WireEnvelope, WireMsg,
    DEFAULT_MAX_FRAME_BYTES,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut delay = self.base;
        for _ in 1..attempt {
            delay = next_backoff(delay, self.cap);
            if delay == self.cap {
                break;
            }
        }
        delay.min(self.cap)
    }
}

fn next_backoff(current: Duration, cap: Duration) -> Duration {
    let next = current + current;
    if next > cap {
        cap
    } else {
        next
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub endpoint: Url,
    pub client_id: String,
    pub room: Room,
    pub backoff: BackoffPolicy,
    pub max_frame_bytes: usize,
    pub outbox_capacity: usize,
}

impl ChannelConfig {
    pub fn new(endpoint: Url, client_id: impl Into<String>, room: Room) -> Self {
        Self {
            endpoint,
            client_id: client_id.into(),
            room,
            backoff: BackoffPolicy::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            outbox_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connected,
    Reconnecting,
    Closed,
    Lost,
}

/// What a subscriber receives. Lifecycle events reach every subscriber;
/// messages only reach subscribers of their kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(WireEnvelope),
    Reconnecting {
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Reconnected {
        attempt: u32,
    },
    Lost {
        attempts: u32,
        error: String,
    },
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("channel lost after {attempts} attempts: {reason}")]
    Lost { attempts: u32, reason: String },
    #[error("channel closed")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

struct Subscription {
    kind: Option<EventKind>,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

#[derive(Default)]
struct Subscribers {
    entries: Vec<Subscription>,
    lost: Option<ChannelEvent>,
}

impl Subscribers {
    /// A subscriber added after the channel was lost still gets the `Lost`
    /// event.
    fn add(&mut self, kind: Option<EventKind>) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(lost) = &self.lost {
            let _ = tx.send(lost.clone());
        }
        self.entries.push(Subscription { kind, tx });
        rx
    }

    fn dispatch(&mut self, event: &ChannelEvent) {
        if let ChannelEvent::Lost { .. } = event {
            self.lost = Some(event.clone());
        }
        self.entries.retain(|subscription| {
            let wanted = match (event, subscription.kind) {
                (ChannelEvent::Message(envelope), Some(kind)) => envelope.msg.kind() == kind,
                _ => true,
            };
            if !wanted {
                return !subscription.tx.is_closed();
            }
            subscription.tx.send(event.clone()).is_ok()
        });
    }
}

type SharedSubscribers = Arc<Mutex<Subscribers>>;

fn lock_subscribers(shared: &SharedSubscribers) -> MutexGuard<'_, Subscribers> {
    shared
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct RealtimeChannel {
    client_id: String,
    room: Room,
    outbox: mpsc::Sender<WireEnvelope>,
    subscribers: SharedSubscribers,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<ChannelState>,
    driver: JoinHandle<()>,
}

impl RealtimeChannel {
    /// Opens the session, retrying per the backoff policy, and starts the
    /// driver task. The room is fixed for the life of the channel.
    pub async fn connect(config: ChannelConfig) -> Result<Self, ChannelError> {
        let mut attempt = 0;
        let ws = loop {
            match open_session(&config).await {
                Ok(ws) => break ws,
                Err(err) => {
                    attempt += 1;
                    if attempt >= config.backoff.max_attempts {
                        return Err(ChannelError::Lost {
                            attempts: attempt,
                            reason: err.to_string(),
                        });
                    }
                    let delay = config.backoff.delay(attempt);
                    warn!(event = "channel_connect_retry", attempt, delay_ms = delay.as_millis() as u64, error = %err);
                    tokio::time::sleep(delay).await;
                }
            }
        };
        info!(event = "channel_connected", endpoint = %config.endpoint, room = %config.room);

        let (outbox, outbox_rx) = mpsc::channel(config.outbox_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (state_tx, state) = watch::channel(ChannelState::Connected);
        let subscribers: SharedSubscribers = Arc::default();
        let driver = tokio::spawn(drive(
            config.clone(),
            ws,
            outbox_rx,
            subscribers.clone(),
            shutdown_rx,
            state_tx,
        ));

        Ok(Self {
            client_id: config.client_id,
            room: config.room,
            outbox,
            subscribers,
            shutdown,
            state,
            driver,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn room(&self) -> Room {
        self.room
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Receiver of every `kind` message plus lifecycle events.
    pub fn subscribe(&self, kind: EventKind) -> mpsc::UnboundedReceiver<ChannelEvent> {
        lock_subscribers(&self.subscribers).add(Some(kind))
    }

    pub fn subscribe_all(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        lock_subscribers(&self.subscribers).add(None)
    }

    /// Queues a message. Order is preserved per channel; messages published
    /// while reconnecting go out once the session is back, and a message whose
    /// write failed is resent first on the next session.
    pub async fn publish(&self, msg: WireMsg) -> Result<(), ChannelError> {
        self.publish_request(msg, None).await
    }

    pub async fn publish_request(
        &self,
        msg: WireMsg,
        request_id: Option<String>,
    ) -> Result<(), ChannelError> {
        let envelope = WireEnvelope::new(self.client_id.clone(), msg).with_request_id(request_id);
        self.outbox
            .send(envelope)
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Closes the session and waits for the driver to stop.
    pub async fn disconnect(self) {
        let _ = self.shutdown.send(true);
        let _ = self.driver.await;
    }
}

async fn open_session(config: &ChannelConfig) -> Result<WsStream, ChannelError> {
    let (mut ws, _) = connect_async(config.endpoint.as_str())
        .await
        .map_err(|err| ChannelError::Connect(err.to_string()))?;
    let hello = WireEnvelope::new(
        config.client_id.clone(),
        WireMsg::Hello(HelloPayload {
            client_id: config.client_id.clone(),
            room: config.room,
        }),
    );
    let text = encode_text(&hello, config.max_frame_bytes)?;
    ws.send(Message::Text(text))
        .await
        .map_err(|err| ChannelError::Connect(err.to_string()))?;
    Ok(ws)
}

enum SessionEnd {
    Shutdown,
    Rejected(String),
    Dropped(String),
}

async fn drive(
    config: ChannelConfig,
    mut ws: WsStream,
    mut outbox: mpsc::Receiver<WireEnvelope>,
    subscribers: SharedSubscribers,
    mut shutdown: watch::Receiver<bool>,
    state: watch::Sender<ChannelState>,
) {
    let mut pending = None;
    loop {
        let end = run_session(
            &config,
            &mut ws,
            &mut outbox,
            &mut pending,
            &subscribers,
            &mut shutdown,
        )
        .await;
        let mut error = match end {
            SessionEnd::Shutdown => {
                let _ = ws.close(None).await;
                let _ = state.send(ChannelState::Closed);
                info!(event = "channel_closed", room = %config.room);
                return;
            }
            SessionEnd::Rejected(reason) => {
                warn!(event = "channel_rejected", room = %config.room, reason = %reason);
                let _ = state.send(ChannelState::Lost);
                dispatch_lost(&subscribers, 0, reason);
                return;
            }
            SessionEnd::Dropped(error) => error,
        };

        let _ = state.send(ChannelState::Reconnecting);
        let mut attempt = 0;
        ws = loop {
            attempt += 1;
            if attempt > config.backoff.max_attempts {
                warn!(event = "channel_lost", attempts = attempt - 1, error = %error);
                let _ = state.send(ChannelState::Lost);
                dispatch_lost(&subscribers, attempt - 1, error);
                return;
            }
            let delay = config.backoff.delay(attempt);
            warn!(event = "channel_reconnecting", attempt, delay_ms = delay.as_millis() as u64, error = %error);
            lock_subscribers(&subscribers).dispatch(&ChannelEvent::Reconnecting {
                attempt,
                delay,
                error: error.clone(),
            });
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    let _ = state.send(ChannelState::Closed);
                    return;
                }
            }
            match open_session(&config).await {
                Ok(ws) => break ws,
                Err(err) => error = err.to_string(),
            }
        };
        info!(event = "channel_reconnected", attempt, room = %config.room);
        let _ = state.send(ChannelState::Connected);
        lock_subscribers(&subscribers).dispatch(&ChannelEvent::Reconnected { attempt });
    }
}

fn dispatch_lost(shared: &SharedSubscribers, attempts: u32, error: String) {
    lock_subscribers(shared).dispatch(&ChannelEvent::Lost { attempts, error });
}

/// `pending` holds an envelope whose write failed; it goes out before
/// anything else in the outbox.
async fn run_session(
    config: &ChannelConfig,
    ws: &mut WsStream,
    outbox: &mut mpsc::Receiver<WireEnvelope>,
    pending: &mut Option<WireEnvelope>,
    shared: &SharedSubscribers,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    if let Some(envelope) = pending.take() {
        if let Err(end) = send_envelope(config, ws, envelope, pending).await {
            return end;
        }
    }
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return SessionEnd::Shutdown;
                }
            }
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match decode_text::<WireEnvelope>(&text, config.max_frame_bytes) {
                        Ok(envelope) => lock_subscribers(shared).dispatch(&ChannelEvent::Message(envelope)),
                        Err(err) => warn!(event = "frame_invalid", error = %err),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(frame) if frame.code == CloseCode::Policy => {
                            SessionEnd::Rejected(frame.reason.to_string())
                        }
                        _ => SessionEnd::Dropped("closed by hub".to_string()),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return SessionEnd::Dropped(err.to_string()),
                None => return SessionEnd::Dropped("stream ended".to_string()),
            },
            outgoing = outbox.recv() => match outgoing {
                Some(envelope) => {
                    if let Err(end) = send_envelope(config, ws, envelope, pending).await {
                        return end;
                    }
                }
                None => return SessionEnd::Shutdown,
            },
        }
    }
}

async fn send_envelope(
    config: &ChannelConfig,
    ws: &mut WsStream,
    envelope: WireEnvelope,
    pending: &mut Option<WireEnvelope>,
) -> Result<(), SessionEnd> {
    let kind = envelope.msg.kind();
    let text = match encode_text(&envelope, config.max_frame_bytes) {
        Ok(text) => text,
        Err(err) => {
            warn!(event = "frame_dropped", kind = %kind, error = %err);
            return Ok(());
        }
    };
    if let Err(err) = ws.send(Message::Text(text)).await {
        debug!(event = "frame_retained", kind = %kind);
        *pending = Some(envelope);
        return Err(SessionEnd::Dropped(err.to_string()));
    }
    debug!(event = "frame_sent", kind = %kind);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::model::Availability;
    use fleet_core::wire::PresencePayload;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::{accept_async, WebSocketStream};

    type ServerStream = WebSocketStream<TcpStream>;

    fn fast_backoff(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(10),
            cap: Duration::from_millis(40),
            max_attempts,
        }
    }

    async fn listener() -> (TcpListener, Url) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let url = Url::parse(&format!("ws://{addr}/ws")).expect("url");
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> (ServerStream, WireEnvelope) {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("handshake");
        let hello = next_envelope(&mut ws).await;
        (ws, hello)
    }

    async fn next_envelope(ws: &mut ServerStream) -> WireEnvelope {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("frame in time")
                .expect("open stream")
                .expect("frame");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).expect("envelope");
            }
        }
    }

    async fn send(ws: &mut ServerStream, msg: WireMsg) {
        let envelope = WireEnvelope::new("fleet-hub", msg);
        let text = serde_json::to_string(&envelope).expect("encode");
        ws.send(Message::Text(text)).await.expect("send");
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    fn config(url: Url, room: Room, max_attempts: u32) -> ChannelConfig {
        ChannelConfig {
            backoff: fast_backoff(max_attempts),
            ..ChannelConfig::new(url, "device-7", room)
        }
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (1..=6).map(|attempt| policy.delay(attempt).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn hello_first_then_ordered_publish_and_typed_delivery() {
        let (listener, url) = listener().await;
        let server = tokio::spawn(async move {
            let (mut ws, hello) = accept(&listener).await;
            let first = next_envelope(&mut ws).await;
            let second = next_envelope(&mut ws).await;
            send(
                &mut ws,
                WireMsg::PresenceChanged(PresencePayload {
                    agent_id: 7,
                    state: Availability::Available,
                }),
            )
            .await;
            (hello, first, second, ws)
        });

        let channel = RealtimeChannel::connect(config(url, Room::Agent(7), 3))
            .await
            .expect("connect");
        let mut presence = channel.subscribe(EventKind::PresenceChanged);
        let mut diffs = channel.subscribe(EventKind::FleetDiff);
        channel
            .publish(WireMsg::SnapshotRequest(Default::default()))
            .await
            .expect("publish");
        channel
            .publish_request(
                WireMsg::Command(fleet_core::wire::Command::Deliver { package_id: 101 }),
                Some("req-1".to_string()),
            )
            .await
            .expect("publish");

        let (hello, first, second, _ws) = server.await.expect("server");
        assert_eq!(
            hello.msg,
            WireMsg::Hello(HelloPayload {
                client_id: "device-7".to_string(),
                room: Room::Agent(7),
            })
        );
        assert_eq!(first.msg.kind(), EventKind::SnapshotRequest);
        assert_eq!(second.request_id.as_deref(), Some("req-1"));

        let ChannelEvent::Message(envelope) = recv(&mut presence).await else {
            panic!("expected presence message");
        };
        assert_eq!(envelope.msg.kind(), EventKind::PresenceChanged);
        assert!(diffs.try_recv().is_err(), "other kinds are filtered out");

        channel.disconnect().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_session_reconnects_and_resends_hello() {
        let (listener, url) = listener().await;
        let (go_tx, go_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let (ws, _) = accept(&listener).await;
            let _ = go_rx.await;
            drop(ws);
            let (mut ws, hello) = accept(&listener).await;
            let after = next_envelope(&mut ws).await;
            (hello, after, ws)
        });

        let channel = RealtimeChannel::connect(config(url, Room::Admin, 5))
            .await
            .expect("connect");
        let mut events = channel.subscribe_all();
        let _ = go_tx.send(());

        let reconnecting = recv(&mut events).await;
        assert!(matches!(reconnecting, ChannelEvent::Reconnecting { attempt: 1, .. }));
        loop {
            if let ChannelEvent::Reconnected { .. } = recv(&mut events).await {
                break;
            }
        }
        assert_eq!(channel.state(), ChannelState::Connected);
        channel
            .publish(WireMsg::SnapshotRequest(Default::default()))
            .await
            .expect("publish after reconnect");

        let (hello, after, _ws) = server.await.expect("server");
        assert_eq!(hello.msg.kind(), EventKind::Hello);
        assert_eq!(after.msg.kind(), EventKind::SnapshotRequest);
        channel.disconnect().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_write_is_resent_first_on_the_next_session() {
        let (listener, url) = listener().await;
        let server = tokio::spawn(async move {
            let (first, _) = accept(&listener).await;
            let (mut ws, hello) = accept(&listener).await;
            let resent = next_envelope(&mut ws).await;
            let queued = next_envelope(&mut ws).await;
            drop(first);
            (hello, resent, queued)
        });

        let cfg = config(url, Room::Agent(7), 3);
        let subscribers: SharedSubscribers = Arc::default();
        let (shutdown_tx, mut shutdown) = watch::channel(false);
        let (outbox_tx, mut outbox) = mpsc::channel(4);
        let mut pending = None;

        // A locally closed stream refuses further writes.
        let mut ws = open_session(&cfg).await.expect("first session");
        ws.close(None).await.expect("close");
        let deliver = WireEnvelope::new(
            "device-7",
            WireMsg::Command(fleet_core::wire::Command::Deliver { package_id: 101 }),
        )
        .with_request_id(Some("req-2".to_string()));
        outbox_tx.send(deliver.clone()).await.expect("queue");
        let end = run_session(&cfg, &mut ws, &mut outbox, &mut pending, &subscribers, &mut shutdown).await;
        assert!(matches!(end, SessionEnd::Dropped(_)));
        assert_eq!(pending.as_ref(), Some(&deliver));

        let mut ws = open_session(&cfg).await.expect("second session");
        outbox_tx
            .send(WireEnvelope::new("device-7", WireMsg::SnapshotRequest(Default::default())))
            .await
            .expect("queue");
        let session = tokio::spawn(async move {
            let end = run_session(&cfg, &mut ws, &mut outbox, &mut pending, &subscribers, &mut shutdown).await;
            (end, pending)
        });

        let (hello, resent, queued) = server.await.expect("server");
        assert_eq!(hello.msg.kind(), EventKind::Hello);
        assert_eq!(resent, deliver);
        assert_eq!(queued.msg.kind(), EventKind::SnapshotRequest);

        let _ = shutdown_tx.send(true);
        let (end, pending) = session.await.expect("session");
        assert!(matches!(end, SessionEnd::Shutdown));
        assert!(pending.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn gives_up_after_max_attempts() {
        let (listener, url) = listener().await;
        let (go_tx, go_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let (ws, _) = accept(&listener).await;
            let _ = go_rx.await;
            drop(listener);
            drop(ws);
        });

        let channel = RealtimeChannel::connect(config(url, Room::Admin, 3))
            .await
            .expect("connect");
        let mut events = channel.subscribe(EventKind::FleetDiff);
        let _ = go_tx.send(());
        server.await.expect("server");

        let mut attempts_seen = Vec::new();
        let lost = loop {
            match recv(&mut events).await {
                ChannelEvent::Reconnecting { attempt, .. } => attempts_seen.push(attempt),
                ChannelEvent::Lost { attempts, .. } => break attempts,
                other => panic!("unexpected event {other:?}"),
            }
        };
        assert_eq!(attempts_seen, vec![1, 2, 3]);
        assert_eq!(lost, 3);
        assert_eq!(channel.state(), ChannelState::Lost);
        assert!(channel
            .publish(WireMsg::SnapshotRequest(Default::default()))
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn policy_close_is_terminal() {
        let (listener, url) = listener().await;
        let (go_tx, go_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let (mut ws, _) = accept(&listener).await;
            let _ = go_rx.await;
            ws.close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "superseded".into(),
            }))
            .await
            .expect("close");
            listener
        });

        let channel = RealtimeChannel::connect(config(url, Room::Agent(7), 3))
            .await
            .expect("connect");
        let mut events = channel.subscribe_all();
        let _ = go_tx.send(());
        let event = recv(&mut events).await;
        assert_eq!(
            event,
            ChannelEvent::Lost {
                attempts: 0,
                error: "superseded".to_string()
            }
        );
        let _listener = server.await.expect("server");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connect_to_dead_endpoint_fails() {
        let (listener, url) = listener().await;
        drop(listener);
        let result = RealtimeChannel::connect(config(url, Room::Admin, 2)).await;
        assert!(matches!(result, Err(ChannelError::Lost { attempts: 2, .. })));
    }
}
