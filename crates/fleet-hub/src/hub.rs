use axum::{
    extract::{ws::CloseFrame, ws::Message, ws::WebSocket, ws::WebSocketUpgrade, ConnectInfo, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use fleet_coord::{CommandOutcome, FleetCoordinator, Outbound, SessionId};
use fleet_core::model::{FleetSnapshot, Room};
use fleet_core::wire::{
    decode_text, encode_text, Command, CommandResultPayload, ErrorPayload, HelloPayload,
    WireEnvelope, WireMsg, DEFAULT_MAX_FRAME_BYTES, HUB_SENDER_ID,
};
use fleet_core::{now_ms, CoordError};
use futures_util::{SinkExt, StreamExt};
use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex, RwLock};
use tracing::{debug, error, info, warn};

const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_POLICY: u16 = 1008;

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub debug: bool,
    pub allow_remote: bool,
    pub stale_after: Option<Duration>,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub max_frame_bytes: usize,
    pub queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            debug: false,
            allow_remote: false,
            stale_after: Some(Duration::from_secs(30)),
            ping_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            queue_capacity: 256,
        }
    }
}

struct Session {
    id: SessionId,
    client_id: String,
    room: Room,
    sender: mpsc::Sender<Message>,
    last_seen: AsyncMutex<Instant>,
}

impl Session {
    async fn touch(&self) {
        *self.last_seen.lock().await = Instant::now();
    }

    async fn last_seen(&self) -> Instant {
        *self.last_seen.lock().await
    }

    async fn send_text(&self, text: &str) -> bool {
        self.sender.send(Message::Text(text.to_string())).await.is_ok()
    }

    async fn close(&self, code: u16, reason: &str) {
        let _ = self
            .sender
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.to_string().into(),
            })))
            .await;
    }
}

pub struct HubState {
    config: HubConfig,
    coordinator: Arc<FleetCoordinator>,
    session_counter: AtomicU64,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl HubState {
    pub fn new(config: HubConfig, coordinator: Arc<FleetCoordinator>) -> Self {
        Self {
            config,
            coordinator,
            session_counter: AtomicU64::new(0),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn next_session_id(&self) -> SessionId {
        self.session_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Runs a coordinator call on the blocking pool; store writes may sleep
    /// between retries.
    async fn blocking<T, F>(&self, call: F) -> Result<T, CoordError>
    where
        T: Send + 'static,
        F: FnOnce(&FleetCoordinator) -> Result<T, CoordError> + Send + 'static,
    {
        let coordinator = self.coordinator.clone();
        match tokio::task::spawn_blocking(move || call(&coordinator)).await {
            Ok(result) => result,
            Err(err) => {
                error!(event = "coordinator_task_failed", error = %err);
                Err(CoordError::Fatal(err.to_string()))
            }
        }
    }

    async fn register_session(&self, session: Arc<Session>) -> Result<(), CoordError> {
        let mut outbound = Vec::new();
        let mut superseded = None;
        if let Room::Agent(agent_id) = session.room {
            let session_id = session.id;
            let outcome = self
                .blocking(move |coordinator| coordinator.connect(agent_id, session_id, now_ms()))
                .await?;
            superseded = outcome.superseded;
            outbound = outcome.outbound;
        }

        self.sessions
            .write()
            .await
            .insert(session.id, session.clone());
        info!(
            event = "client_connected",
            conn_id = session.id,
            client_id = %session.client_id,
            room = %session.room
        );

        if let Some(old_id) = superseded {
            let old = self.sessions.read().await.get(&old_id).cloned();
            if let Some(old) = old {
                info!(event = "session_superseded", conn_id = old_id, by = session.id);
                self.remove_session(&old, CLOSE_POLICY, "superseded").await;
            }
        }
        self.send_snapshot(&session, None).await;
        self.deliver(outbound).await;
        Ok(())
    }

    /// Idempotent: only the first call for a session tears down presence.
    async fn remove_session(&self, session: &Session, code: u16, reason: &str) {
        session.close(code, reason).await;
        let removed = self.sessions.write().await.remove(&session.id).is_some();
        if !removed {
            return;
        }
        info!(
            event = "client_disconnected",
            conn_id = session.id,
            client_id = %session.client_id,
            room = %session.room,
            reason = reason
        );
        if let Room::Agent(agent_id) = session.room {
            let session_id = session.id;
            match self
                .blocking(move |coordinator| coordinator.disconnect(agent_id, session_id, now_ms()))
                .await
            {
                Ok(outbound) => self.deliver(outbound).await,
                Err(err) => warn!(event = "disconnect_failed", agent_id, error = %err),
            }
        }
    }

    async fn close_all(&self, reason: &str) {
        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        for session in sessions {
            self.remove_session(&session, CLOSE_GOING_AWAY, reason).await;
        }
    }

    async fn members(&self, rooms: &[Room]) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|session| rooms.contains(&session.room))
            .cloned()
            .collect()
    }

    async fn send_to(&self, session: &Session, envelope: &WireEnvelope) -> bool {
        match encode_text(envelope, self.config.max_frame_bytes) {
            Ok(text) => session.send_text(&text).await,
            Err(err) => {
                warn!(event = "encode_failed", kind = %envelope.msg.kind(), error = %err);
                true
            }
        }
    }

    async fn deliver(&self, outbound: Vec<Outbound>) {
        for Outbound { rooms, msg } in outbound {
            let envelope = WireEnvelope::new(HUB_SENDER_ID, msg);
            let text = match encode_text(&envelope, self.config.max_frame_bytes) {
                Ok(text) => text,
                Err(err) => {
                    warn!(event = "encode_failed", kind = %envelope.msg.kind(), error = %err);
                    continue;
                }
            };
            for session in self.members(&rooms).await {
                if !session.send_text(&text).await {
                    warn!(event = "send_error", conn_id = session.id);
                }
            }
        }
    }

    async fn send_to_room(&self, room: Room, msg: WireMsg) {
        self.deliver(vec![Outbound {
            rooms: vec![room],
            msg,
        }])
        .await;
    }

    /// The console sees the whole fleet; an agent sees itself and the
    /// packages it owns.
    fn snapshot_for(&self, room: Room) -> FleetSnapshot {
        let mut snapshot = self.coordinator.snapshot();
        if let Room::Agent(agent_id) = room {
            snapshot.agents.retain(|id, _| *id == agent_id);
            snapshot
                .packages
                .retain(|_, package| package.agent_id == Some(agent_id));
        }
        snapshot
    }

    async fn send_snapshot(&self, session: &Session, request_id: Option<&str>) {
        let request_id = request_id.map(str::to_string);
        let mut messages = vec![WireMsg::FleetSnapshot(self.snapshot_for(session.room))];
        if session.room == Room::Admin {
            messages.push(WireMsg::LocationSnapshot(self.coordinator.location_snapshot()));
        }
        let count = messages.len();
        for msg in messages {
            let envelope = WireEnvelope::new(HUB_SENDER_ID, msg).with_request_id(request_id.clone());
            if !self.send_to(session, &envelope).await {
                warn!(event = "snapshot_error", conn_id = session.id);
                self.remove_session(session, CLOSE_POLICY, "snapshot_error").await;
                return;
            }
        }
        info!(event = "snapshot_sent", conn_id = session.id, count);
    }

    async fn send_error(
        &self,
        session: &Session,
        code: &str,
        message: &str,
        request_id: Option<&str>,
    ) {
        let envelope = WireEnvelope::new(
            HUB_SENDER_ID,
            WireMsg::Error(ErrorPayload::new(code, message)),
        )
        .with_request_id(request_id.map(str::to_string));
        let _ = self.send_to(session, &envelope).await;
    }

    /// Agent rooms may only act on themselves and on packages they carry.
    fn authorize(&self, room: Room, command: &Command) -> Result<(), ErrorPayload> {
        let Room::Agent(own_id) = room else {
            return Ok(());
        };
        match command {
            Command::ToggleAvailability { agent_id, .. } if *agent_id == own_id => Ok(()),
            Command::ToggleAvailability { .. } => Err(ErrorPayload::new(
                "agent_id_mismatch",
                "agent id mismatch",
            )),
            Command::Deliver { package_id } | Command::Cancel { package_id } => {
                match self.coordinator.package(*package_id) {
                    Some(package) if package.agent_id != Some(own_id) => Err(ErrorPayload::new(
                        "agent_id_mismatch",
                        "package is not assigned to this agent",
                    )),
                    _ => Ok(()),
                }
            }
            Command::Assign { .. } | Command::AddPackage { .. } => Err(ErrorPayload::new(
                "forbidden",
                "command is reserved for the console",
            )),
        }
    }

    async fn handle_message(&self, session: &Session, envelope: WireEnvelope) {
        let request_id = envelope.request_id;
        match envelope.msg {
            WireMsg::LocationUpdate(payload) => {
                if session.room != Room::Agent(payload.agent_id) {
                    self.send_error(
                        session,
                        "agent_id_mismatch",
                        "agent id mismatch",
                        request_id.as_deref(),
                    )
                    .await;
                    warn!(event = "agent_id_mismatch", conn_id = session.id, agent_id = payload.agent_id);
                    return;
                }
                let session_id = session.id;
                let received_at = now_ms();
                match self
                    .blocking(move |coordinator| {
                        coordinator.handle_location(session_id, &payload, received_at)
                    })
                    .await
                {
                    Ok(outbound) => self.deliver(outbound).await,
                    Err(CoordError::MalformedInput(reason)) => {
                        warn!(event = "location_malformed", conn_id = session.id, reason = %reason);
                    }
                    Err(err) => {
                        self.send_error(session, err.code(), &err.to_string(), request_id.as_deref())
                            .await;
                        warn!(event = "location_rejected", conn_id = session.id, error = %err);
                    }
                }
            }
            WireMsg::SnapshotRequest(_) => {
                self.send_snapshot(session, request_id.as_deref()).await;
            }
            WireMsg::Command(command) => {
                let outcome = match self.authorize(session.room, &command) {
                    Err(refusal) => {
                        warn!(
                            event = "command_refused",
                            conn_id = session.id,
                            action = command.action(),
                            code = %refusal.code
                        );
                        CommandOutcome {
                            result: CommandResultPayload::refused(&command, refusal),
                            outbound: Vec::new(),
                        }
                    }
                    Ok(()) => {
                        let pending = command.clone();
                        match self
                            .blocking(move |coordinator| Ok(coordinator.execute(&pending, now_ms())))
                            .await
                        {
                            Ok(outcome) => outcome,
                            Err(err) => CommandOutcome {
                                result: CommandResultPayload::rejected(&command, &err),
                                outbound: Vec::new(),
                            },
                        }
                    }
                };
                let reply = WireEnvelope::new(HUB_SENDER_ID, WireMsg::CommandResult(outcome.result))
                    .with_request_id(request_id);
                let _ = self.send_to(session, &reply).await;
                self.deliver(outcome.outbound).await;
            }
            WireMsg::Hello(_) => {
                self.send_error(
                    session,
                    "unexpected_hello",
                    "unexpected hello",
                    request_id.as_deref(),
                )
                .await;
                warn!(event = "unexpected_hello", conn_id = session.id);
            }
            other => {
                self.send_error(
                    session,
                    "unknown_message",
                    "unknown message type",
                    request_id.as_deref(),
                )
                .await;
                warn!(event = "unknown_message", conn_id = session.id, kind = %other.kind());
            }
        }
    }

    fn parse_hello(&self, raw: &str) -> Result<HelloPayload, &'static str> {
        let envelope: WireEnvelope =
            decode_text(raw, self.config.max_frame_bytes).map_err(|_| "invalid_envelope")?;
        envelope.validate()?;
        let WireMsg::Hello(payload) = envelope.msg else {
            return Err("expected_hello");
        };
        if payload.client_id != envelope.sender_id {
            return Err("client_id_mismatch");
        }
        Ok(payload)
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(self.config.queue_capacity.max(1));
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                let send = ws_sender.send(msg);
                match tokio::time::timeout(write_timeout, send).await {
                    Ok(Ok(())) if !closing => {}
                    _ => return,
                }
            }
        });

        let first = match ws_receiver.next().await {
            Some(Ok(msg)) => msg,
            _ => return,
        };
        let hello = match message_text(first)
            .ok_or("expected_hello")
            .and_then(|text| self.parse_hello(&text))
        {
            Ok(payload) => payload,
            Err(code) => {
                warn!(event = "hello_rejected", remote = %remote, code);
                reject(&tx, code).await;
                drop(tx);
                let _ = write_task.await;
                return;
            }
        };

        let session = Arc::new(Session {
            id: self.next_session_id(),
            client_id: hello.client_id,
            room: hello.room,
            sender: tx.clone(),
            last_seen: AsyncMutex::new(Instant::now()),
        });
        info!(
            event = "handshake_ok",
            conn_id = session.id,
            client_id = %session.client_id,
            room = %session.room
        );

        if let Err(err) = self.register_session(session.clone()).await {
            warn!(event = "join_rejected", conn_id = session.id, room = %session.room, error = %err);
            self.send_error(&session, err.code(), &err.to_string(), None).await;
            session.close(CLOSE_POLICY, err.code()).await;
            drop(session);
            drop(tx);
            let _ = write_task.await;
            return;
        }
        self.clone().start_ping(session.clone());

        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", conn_id = session.id, error = %err);
                    break;
                }
            };
            let text = match msg {
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = session.id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {
                    session.touch().await;
                    continue;
                }
                other => match message_text(other) {
                    Some(text) => text,
                    None => continue,
                },
            };
            session.touch().await;
            if self.config.debug {
                debug!(event = "message_received", conn_id = session.id, raw = %text);
            }
            let envelope: WireEnvelope = match decode_text(&text, self.config.max_frame_bytes) {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "message_invalid", conn_id = session.id, error = %err);
                    self.send_error(&session, "invalid_envelope", &err.to_string(), None)
                        .await;
                    continue;
                }
            };
            if let Err(code) = envelope.validate() {
                warn!(event = "message_invalid", conn_id = session.id, error = code);
                self.send_error(&session, code, "invalid envelope", envelope.request_id.as_deref())
                    .await;
                continue;
            }
            self.handle_message(&session, envelope).await;
        }

        self.remove_session(&session, CLOSE_POLICY, "disconnect").await;
        drop(session);
        drop(tx);
        let _ = write_task.await;
    }

    fn start_stale_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(stale_after) = self.config.stale_after else {
            return;
        };
        let interval = (stale_after / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = wait_for_shutdown(&mut shutdown) => return,
                }
                let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
                for session in sessions {
                    if session.last_seen().await.elapsed() > stale_after {
                        warn!(event = "stale_close", conn_id = session.id, room = %session.room);
                        self.remove_session(&session, CLOSE_GOING_AWAY, "stale").await;
                    }
                }
            }
        });
    }

    fn start_ping(self: Arc<Self>, session: Arc<Session>) {
        if self.config.ping_interval.is_zero() {
            return;
        }
        let interval = self.config.ping_interval;
        let keepalive_touch = session.room == Room::Admin;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !self.sessions.read().await.contains_key(&session.id) {
                    return;
                }
                if session.sender.send(Message::Ping(Vec::new())).await.is_err() {
                    warn!(event = "ping_failed", conn_id = session.id);
                    self.remove_session(&session, CLOSE_GOING_AWAY, "ping_failed").await;
                    return;
                }
                if keepalive_touch {
                    session.touch().await;
                }
            }
        });
    }

    /// Forwards projection diffs to the console room. A lagging receiver
    /// resynchronizes the console with a full snapshot.
    fn start_diff_forwarder(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut diffs = self.coordinator.subscribe();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    received = diffs.recv() => received,
                    _ = wait_for_shutdown(&mut shutdown) => return,
                };
                match received {
                    Ok(diff) => self.send_to_room(Room::Admin, WireMsg::FleetDiff(diff)).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(event = "diff_lagged", skipped);
                        let snapshot = self.coordinator.snapshot();
                        self.send_to_room(Room::Admin, WireMsg::FleetSnapshot(snapshot))
                            .await;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    fn start_poller(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.coordinator.config().poll_interval;
        if interval.is_zero() {
            return;
        }
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = wait_for_shutdown(&mut shutdown) => return,
                }
                match self.coordinator.poll_store().await {
                    Ok(replaced) => debug!(event = "poll_complete", replaced),
                    Err(err) => debug!(event = "poll_skipped", error = %err),
                }
            }
        });
    }
}

/// Serves the hub on `listener` until `shutdown` flips to true, then closes
/// every session so agents are marked inactive.
pub async fn run(
    config: HubConfig,
    coordinator: Arc<FleetCoordinator>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let hub = Arc::new(HubState::new(config, coordinator));
    hub.clone().start_stale_reaper(shutdown.clone());
    hub.clone().start_diff_forwarder(shutdown.clone());
    hub.clone().start_poller(shutdown.clone());

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(hub.clone());

    info!(event = "hub_start", addr = %listener.local_addr()?);
    let closing = hub.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        wait_for_shutdown(&mut shutdown).await;
        closing.close_all("shutdown").await;
        info!(event = "hub_stop");
    })
    .await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<HubState>>,
) -> impl IntoResponse {
    if !hub.config.allow_remote && !addr.ip().is_loopback() {
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        hub.handle_socket(socket, addr).await;
    })
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn reject(tx: &mpsc::Sender<Message>, code: &'static str) {
    let envelope = WireEnvelope::new(
        HUB_SENDER_ID,
        WireMsg::Error(ErrorPayload::new(code, "a session must start with hello")),
    );
    if let Ok(text) = encode_text(&envelope, DEFAULT_MAX_FRAME_BYTES) {
        let _ = tx.send(Message::Text(text)).await;
    }
    let _ = tx
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY,
            reason: code.into(),
        })))
        .await;
}

fn message_text(msg: Message) -> Option<String> {
    match msg {
        Message::Text(text) => Some(text),
        Message::Binary(bytes) => String::from_utf8(bytes).ok(),
        Message::Close(_) | Message::Ping(_) | Message::Pong(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_channel::{BackoffPolicy, ChannelConfig, ChannelEvent, RealtimeChannel};
    use fleet_coord::{CoordinatorConfig, MemoryStore};
    use fleet_core::model::{Availability, Package, PackageState};
    use fleet_core::wire::{EventKind, LocationUpdatePayload, SnapshotRequestPayload};
    use serde_json::json;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;
    use url::Url;

    struct TestHub {
        url: Url,
        coordinator: Arc<FleetCoordinator>,
        shutdown: watch::Sender<bool>,
        handle: JoinHandle<io::Result<()>>,
    }

    impl TestHub {
        async fn stop(self) {
            let _ = self.shutdown.send(true);
            let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
        }
    }

    async fn start_hub() -> TestHub {
        let store = MemoryStore::with_agents([(7, "Ana"), (8, "Beto")]);
        store.insert_package(Package::pending(101, "Calle 5 #12"));
        let coordinator = Arc::new(FleetCoordinator::new(
            Arc::new(store),
            CoordinatorConfig {
                poll_interval: Duration::ZERO,
                persist_backoff: Duration::from_millis(1),
                ..CoordinatorConfig::default()
            },
        ));
        coordinator.bootstrap().expect("bootstrap");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown, shutdown_rx) = watch::channel(false);
        let config = HubConfig {
            stale_after: None,
            ping_interval: Duration::ZERO,
            ..HubConfig::default()
        };
        let handle = tokio::spawn(run(config, coordinator.clone(), listener, shutdown_rx));
        TestHub {
            url: Url::parse(&format!("ws://{addr}/ws")).expect("url"),
            coordinator,
            shutdown,
            handle,
        }
    }

    async fn join(hub: &TestHub, client_id: &str, room: Room) -> RealtimeChannel {
        let config = ChannelConfig {
            backoff: BackoffPolicy {
                base: Duration::from_millis(10),
                cap: Duration::from_millis(20),
                max_attempts: 2,
            },
            ..ChannelConfig::new(hub.url.clone(), client_id, room)
        };
        RealtimeChannel::connect(config).await.expect("join")
    }

    async fn next_msg(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> WireEnvelope {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("event in time")
                .expect("channel open");
            if let ChannelEvent::Message(envelope) = event {
                return envelope;
            }
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..250 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    type RawClient = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn raw_send(ws: &mut RawClient, envelope: &WireEnvelope) {
        let text = serde_json::to_string(envelope).expect("encode");
        ws.send(ClientMessage::Text(text)).await.expect("send");
    }

    async fn raw_next(ws: &mut RawClient) -> WireEnvelope {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("frame in time")
                .expect("open stream")
                .expect("frame");
            if let ClientMessage::Text(text) = msg {
                return serde_json::from_str(&text).expect("envelope");
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn console_join_receives_full_snapshot() {
        let hub = start_hub().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(hub.url.as_str())
            .await
            .expect("connect");
        let hello = WireMsg::Hello(HelloPayload {
            client_id: "console-1".to_string(),
            room: Room::Admin,
        });
        raw_send(&mut ws, &WireEnvelope::new("console-1", hello)).await;

        let WireMsg::FleetSnapshot(snapshot) = raw_next(&mut ws).await.msg else {
            panic!("expected fleet.snapshot first");
        };
        assert_eq!(snapshot.agents.len(), 2);
        assert_eq!(snapshot.agents[&7].availability, Availability::Inactive);
        assert_eq!(snapshot.pending().len(), 1);
        assert_eq!(
            raw_next(&mut ws).await.msg.kind(),
            EventKind::LocationSnapshot
        );

        let request = WireEnvelope::new(
            "console-1",
            WireMsg::SnapshotRequest(SnapshotRequestPayload::default()),
        )
        .with_request_id(Some("snap-2".to_string()));
        raw_send(&mut ws, &request).await;
        let again = raw_next(&mut ws).await;
        assert_eq!(again.msg.kind(), EventKind::FleetSnapshot);
        assert_eq!(again.request_id.as_deref(), Some("snap-2"));

        let _ = ws.close(None).await;
        hub.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn agent_join_sees_only_its_own_packages() {
        let hub = start_hub().await;
        let added = hub.coordinator.execute(
            &Command::AddPackage {
                destination: "Av. Juarez 10".to_string(),
            },
            now_ms(),
        );
        assert!(added.result.is_ok());
        hub.coordinator
            .transition(101, fleet_coord::Transition::Assign { agent_id: 7 })
            .expect("assign");

        let (mut ws, _) = tokio_tungstenite::connect_async(hub.url.as_str())
            .await
            .expect("connect");
        let hello = WireMsg::Hello(HelloPayload {
            client_id: "device-7".to_string(),
            room: Room::Agent(7),
        });
        raw_send(&mut ws, &WireEnvelope::new("device-7", hello)).await;

        let WireMsg::FleetSnapshot(snapshot) = raw_next(&mut ws).await.msg else {
            panic!("expected fleet.snapshot first");
        };
        assert_eq!(snapshot.agents.keys().copied().collect::<Vec<_>>(), vec![7]);
        assert_eq!(snapshot.packages.keys().copied().collect::<Vec<_>>(), vec![101]);

        let _ = ws.close(None).await;
        hub.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn agent_lifecycle_reaches_console_and_agent_room() {
        let hub = start_hub().await;
        let console = join(&hub, "console-1", Room::Admin).await;
        let mut presence = console.subscribe(EventKind::PresenceChanged);
        let mut locations = console.subscribe(EventKind::LocationUpdate);
        let mut results = console.subscribe(EventKind::CommandResult);
        let mut diffs = console.subscribe(EventKind::FleetDiff);

        let device = join(&hub, "device-7", Room::Agent(7)).await;
        let mut assigned = device.subscribe(EventKind::PackageAssigned);

        let online = next_msg(&mut presence).await;
        assert_eq!(
            online.msg,
            WireMsg::PresenceChanged(fleet_core::wire::PresencePayload {
                agent_id: 7,
                state: Availability::Available,
            })
        );

        device
            .publish(WireMsg::LocationUpdate(LocationUpdatePayload {
                agent_id: 7,
                lat: json!(19.43),
                lng: json!(-99.13),
                ts: Some(now_ms()),
            }))
            .await
            .expect("push");
        let forwarded = next_msg(&mut locations).await;
        let WireMsg::LocationUpdate(update) = forwarded.msg else {
            panic!("expected location.update");
        };
        assert_eq!(update.agent_id, 7);

        console
            .publish_request(
                WireMsg::Command(Command::Assign {
                    package_id: 101,
                    agent_id: 7,
                }),
                Some("req-assign".to_string()),
            )
            .await
            .expect("assign");
        let reply = next_msg(&mut results).await;
        assert_eq!(reply.request_id.as_deref(), Some("req-assign"));
        let WireMsg::CommandResult(result) = reply.msg else {
            panic!("expected command.result");
        };
        assert!(result.is_ok(), "{result:?}");

        let notice = next_msg(&mut assigned).await;
        assert_eq!(
            notice.msg,
            WireMsg::PackageAssigned(fleet_core::wire::PackageAssignedPayload {
                package_id: 101,
                agent_id: 7,
            })
        );
        let diff = next_msg(&mut diffs).await;
        assert_eq!(diff.msg.kind(), EventKind::FleetDiff);

        device.disconnect().await;
        loop {
            let WireMsg::PresenceChanged(change) = next_msg(&mut presence).await.msg else {
                continue;
            };
            if change.state == Availability::Inactive {
                break;
            }
        }
        assert_eq!(
            hub.coordinator.package(101).map(|package| package.state),
            Some(PackageState::InTransit)
        );

        console.disconnect().await;
        hub.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn agent_cannot_speak_for_another_agent() {
        let hub = start_hub().await;
        let device = join(&hub, "device-7", Room::Agent(7)).await;
        let mut errors = device.subscribe(EventKind::Error);
        let mut results = device.subscribe(EventKind::CommandResult);

        device
            .publish(WireMsg::LocationUpdate(LocationUpdatePayload {
                agent_id: 8,
                lat: json!(19.0),
                lng: json!(-99.0),
                ts: None,
            }))
            .await
            .expect("push");
        let WireMsg::Error(error) = next_msg(&mut errors).await.msg else {
            panic!("expected error");
        };
        assert_eq!(error.code, "agent_id_mismatch");

        device
            .publish(WireMsg::Command(Command::Assign {
                package_id: 101,
                agent_id: 7,
            }))
            .await
            .expect("command");
        let WireMsg::CommandResult(result) = next_msg(&mut results).await.msg else {
            panic!("expected command.result");
        };
        assert_eq!(result.error.map(|error| error.code), Some("forbidden".to_string()));
        assert_eq!(
            hub.coordinator.package(101).map(|package| package.state),
            Some(PackageState::Pending)
        );

        device.disconnect().await;
        hub.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn newer_session_supersedes_older_one() {
        let hub = start_hub().await;
        let first = join(&hub, "phone-a", Room::Agent(7)).await;
        let mut first_events = first.subscribe_all();
        wait_until(|| hub.coordinator.availability(7) == Some(Availability::Available)).await;

        let second = join(&hub, "phone-b", Room::Agent(7)).await;
        let lost = loop {
            let event = tokio::time::timeout(Duration::from_secs(5), first_events.recv())
                .await
                .expect("event in time")
                .expect("channel open");
            if let ChannelEvent::Lost { error, .. } = event {
                break error;
            }
        };
        assert_eq!(lost, "superseded");
        assert_eq!(hub.coordinator.availability(7), Some(Availability::Available));

        second.disconnect().await;
        wait_until(|| hub.coordinator.availability(7) == Some(Availability::Inactive)).await;
        hub.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn session_without_hello_is_rejected() {
        let hub = start_hub().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(hub.url.as_str())
            .await
            .expect("connect");
        let envelope = WireEnvelope::new(
            "stranger",
            WireMsg::SnapshotRequest(SnapshotRequestPayload::default()),
        );
        ws.send(ClientMessage::Text(
            serde_json::to_string(&envelope).expect("encode"),
        ))
        .await
        .expect("send");

        let mut saw_error = false;
        let mut saw_close = false;
        while let Ok(Some(Ok(msg))) = tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            match msg {
                ClientMessage::Text(text) => {
                    let envelope: WireEnvelope = serde_json::from_str(&text).expect("envelope");
                    if let WireMsg::Error(error) = envelope.msg {
                        assert_eq!(error.code, "expected_hello");
                        saw_error = true;
                    }
                }
                ClientMessage::Close(frame) => {
                    saw_close = frame.map(|frame| u16::from(frame.code)) == Some(CLOSE_POLICY);
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_error && saw_close);
        hub.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_agent_room_is_refused() {
        let hub = start_hub().await;
        let device = join(&hub, "device-99", Room::Agent(99)).await;
        let mut events = device.subscribe_all();
        let lost = loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event in time")
                .expect("channel open");
            if let ChannelEvent::Lost { error, .. } = event {
                break error;
            }
        };
        assert_eq!(lost, "not_found");
        hub.stop().await;
    }
}
