//! Realtime sync channel for one document room.
//!
//! ```text
//!  SyncTransport (handle)                       actor task
//!  ──────────────────────                       ──────────
//!  connect / disconnect / refresh_token ─┐
//!  subscribe / set_local_awareness ──────┼─► commands ─►┌──────────────────────┐
//!  Document update hook (non-remote) ────┘              │ ConnectionStateMachine│
//!                                                       │ Socket ◄──► relay     │
//!  watch: connection_state, synced ◄────────────────────┤ LocalHub group        │
//!  mpsc:  TransportEvent ◄──────────────────────────────┤ watchdog / timers     │
//!                                                       └──────────────────────┘
//! ```
//!
//! The actor owns the socket, the timers and the local hub subscription,
//! so every protocol step runs in one place. Remote diffs are applied to
//! the Document with [`OriginTag::Remote`] and are never sent back out.
//! Protocol and socket faults never reach the caller; they show up as
//! state transitions, log lines and [`TransportEvent`]s.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

use tandem_core::doc::{Subscription, SyncDocument};
use tandem_core::origin::OriginTag;
use tandem_core::registry::{ObservableRegistry, RegistryGuard};

use crate::awareness::{Awareness, AwarenessChange, ClientId};
use crate::broadcast::{BroadcastGroup, LocalFrame, LocalHub};
use crate::config::TransportConfig;
use crate::event::EventMessage;
use crate::protocol::{Message, SyncMessage};
use crate::socket::{Connector, Socket, TransportError, WebSocketConnector};
use crate::state::{ConnectionState, ConnectionStateMachine, ConnectionStatus, Intent};
use crate::subscription::{CallbackId, EventSubscriptionRegistry};

/// Notifications from the transport, read through
/// [`SyncTransport::take_event_rx`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Status(ConnectionStatus),
    /// The first step 2 from the relay was applied (true), or the
    /// connection that produced it was lost (false).
    Synced(bool),
    PermissionDenied(String),
    AwarenessChanged(AwarenessChange),
    ConnectionError(String),
    /// An event of a subscribed type.
    Event(EventMessage),
}

enum Command {
    Connect,
    Disconnect,
    RefreshToken {
        server_url: String,
        room: String,
        token: String,
    },
    SetLocalAwareness(Option<Value>),
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    LocalUpdate(Vec<u8>),
    Destroy(oneshot::Sender<()>),
}

type AttemptResult = (u64, Result<Socket, TransportError>);

// ───────────────────────────────────────────────────────────────────
// Handle
// ───────────────────────────────────────────────────────────────────

pub struct SyncTransportBuilder {
    doc: Arc<dyn SyncDocument>,
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    hub: Option<LocalHub>,
    registry: Option<ObservableRegistry>,
    client_id: Option<ClientId>,
}

impl SyncTransportBuilder {
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Share a hub other than the process-wide one.
    pub fn with_local_hub(mut self, hub: &LocalHub) -> Self {
        self.hub = Some(hub.clone());
        self
    }

    pub fn with_registry(mut self, registry: &ObservableRegistry) -> Self {
        self.registry = Some(registry.clone());
        self
    }

    /// Awareness client id; random when not set.
    pub fn with_client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Start the actor on the current tokio runtime.
    pub fn spawn(self) -> Result<SyncTransport, TransportError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;

        let client_id = self
            .client_id
            .unwrap_or_else(|| (Uuid::new_v4().as_u128() & u128::from(u32::MAX)) as u64);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());
        let (synced_tx, synced_rx) = watch::channel(false);
        let (event_tx, event_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let awareness = Arc::new(Mutex::new(Awareness::new(client_id)));
        let subscriptions = Arc::new(Mutex::new(EventSubscriptionRegistry::new()));
        let url = Arc::new(Mutex::new(self.config.url()));

        let hook_tx = commands_tx.clone();
        let update_hook = self.doc.on_update(Arc::new(move |update: &[u8], origin: &OriginTag| {
            if *origin == OriginTag::Remote {
                return;
            }
            let _ = hook_tx.send(Command::LocalUpdate(update.to_vec()));
        }));

        let registration = self
            .registry
            .map(|r| r.register(format!("sync-transport:{}", self.config.room)));

        let actor = Actor {
            doc: self.doc,
            machine: ConnectionStateMachine::new(
                self.config.max_backoff,
                self.config.max_connection_errors,
            ),
            config: self.config,
            connector: self.connector,
            hub: self.hub.unwrap_or_else(LocalHub::process),
            hub_id: Uuid::new_v4(),
            group: None,
            socket: None,
            attempt: 0,
            connecting: false,
            reconnect_at: None,
            last_message: Instant::now(),
            synced: false,
            awareness: awareness.clone(),
            subscriptions: subscriptions.clone(),
            url: url.clone(),
            state_tx,
            synced_tx,
            events: event_tx,
            opened_tx,
        };
        runtime.spawn(actor.run(commands_rx, opened_rx));

        Ok(SyncTransport {
            commands: commands_tx,
            state_rx,
            synced_rx,
            event_rx: Some(event_rx),
            awareness,
            subscriptions,
            url,
            client_id,
            destroyed: AtomicBool::new(false),
            update_hook: Mutex::new(Some(update_hook)),
            registration: Mutex::new(registration),
        })
    }
}

/// Handle to a running transport. Dropping it tears the transport down.
pub struct SyncTransport {
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    synced_rx: watch::Receiver<bool>,
    event_rx: Option<mpsc::Receiver<TransportEvent>>,
    awareness: Arc<Mutex<Awareness>>,
    subscriptions: Arc<Mutex<EventSubscriptionRegistry>>,
    url: Arc<Mutex<String>>,
    client_id: ClientId,
    destroyed: AtomicBool,
    update_hook: Mutex<Option<Subscription>>,
    registration: Mutex<Option<RegistryGuard>>,
}

impl SyncTransport {
    /// Start a transport over WebSockets with default options.
    pub fn new<D: SyncDocument>(doc: Arc<D>, config: TransportConfig) -> Result<Self, TransportError> {
        Self::builder(doc, config).spawn()
    }

    pub fn builder<D: SyncDocument>(doc: Arc<D>, config: TransportConfig) -> SyncTransportBuilder {
        let doc: Arc<dyn SyncDocument> = doc;
        SyncTransportBuilder {
            doc,
            config,
            connector: Arc::new(WebSocketConnector),
            hub: None,
            registry: None,
            client_id: None,
        }
    }

    fn send(&self, command: Command) -> Result<(), TransportError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(TransportError::Destroyed);
        }
        self.commands.send(command).map_err(|_| TransportError::Closed)
    }

    /// Stay connected: open a socket now if there is none and keep
    /// reconnecting after losses. Resets the retry budget.
    pub fn connect(&self) -> Result<(), TransportError> {
        self.send(Command::Connect)
    }

    /// Close the socket, leave the local hub and stop reconnecting.
    pub fn disconnect(&self) -> Result<(), TransportError> {
        self.send(Command::Disconnect)
    }

    /// Point the transport at a new base URL, room and token. A changed
    /// URL closes the current socket and reconnects through the usual path.
    pub fn refresh_token(
        &self,
        server_url: impl Into<String>,
        room: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<(), TransportError> {
        self.send(Command::RefreshToken {
            server_url: server_url.into(),
            room: room.into(),
            token: token.into(),
        })
    }

    /// Deliver events of `types` to `callback` (and to the event channel).
    pub fn subscribe_to_events<I, S, F>(&self, types: I, callback: F) -> Result<CallbackId, TransportError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&EventMessage) + Send + Sync + 'static,
    {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(TransportError::Destroyed);
        }
        let (id, fresh) = self.subscriptions.lock().subscribe(types, Arc::new(callback));
        if !fresh.is_empty() {
            self.send(Command::Subscribe(fresh))?;
        }
        Ok(id)
    }

    /// Remove `callback` (every callback when `None`) from `types`.
    pub fn unsubscribe_from_events<I, S>(&self, types: I, callback: Option<CallbackId>) -> Result<(), TransportError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(TransportError::Destroyed);
        }
        let emptied = self.subscriptions.lock().unsubscribe(types, callback);
        if !emptied.is_empty() {
            self.send(Command::Unsubscribe(emptied))?;
        }
        Ok(())
    }

    /// Replace the local presence state and broadcast it.
    pub fn set_local_awareness(&self, state: Option<Value>) -> Result<(), TransportError> {
        self.send(Command::SetLocalAwareness(state))
    }

    /// Every known presence state, the local one included.
    pub fn awareness_states(&self) -> HashMap<ClientId, Value> {
        self.awareness.lock().states().clone()
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// URL the next connection attempt will use.
    pub fn url(&self) -> String {
        self.url.lock().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn synced(&self) -> bool {
        *self.synced_rx.borrow()
    }

    pub fn watch_synced(&self) -> watch::Receiver<bool> {
        self.synced_rx.clone()
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.take()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Disconnect, drop the Document hook and stop the actor. Fails when
    /// called twice.
    pub async fn destroy(&self) -> Result<(), TransportError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Destroyed);
        }
        let hook = self.update_hook.lock().take();
        drop(hook);
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Destroy(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        let registration = self.registration.lock().take();
        drop(registration);
        Ok(())
    }
}

impl Drop for SyncTransport {
    fn drop(&mut self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            let (ack_tx, _) = oneshot::channel();
            let _ = self.commands.send(Command::Destroy(ack_tx));
        }
    }
}

impl std::fmt::Debug for SyncTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncTransport")
            .field("client_id", &self.client_id)
            .field("state", &*self.state_rx.borrow())
            .field("synced", &*self.synced_rx.borrow())
            .finish()
    }
}

// ───────────────────────────────────────────────────────────────────
// Actor
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Relay,
    Local,
}

struct Actor {
    doc: Arc<dyn SyncDocument>,
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    hub: LocalHub,
    hub_id: Uuid,
    group: Option<Arc<BroadcastGroup>>,
    machine: ConnectionStateMachine,
    socket: Option<Socket>,
    /// Id of the newest connection attempt; older results are discarded.
    attempt: u64,
    connecting: bool,
    reconnect_at: Option<Instant>,
    last_message: Instant,
    synced: bool,
    awareness: Arc<Mutex<Awareness>>,
    subscriptions: Arc<Mutex<EventSubscriptionRegistry>>,
    url: Arc<Mutex<String>>,
    state_tx: watch::Sender<ConnectionState>,
    synced_tx: watch::Sender<bool>,
    events: mpsc::Sender<TransportEvent>,
    opened_tx: mpsc::UnboundedSender<AttemptResult>,
}

fn timer(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_frame(socket: &mut Option<Socket>) -> Option<Vec<u8>> {
    match socket {
        Some(socket) => socket.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_local(rx: &mut Option<broadcast::Receiver<LocalFrame>>) -> Option<LocalFrame> {
    let Some(receiver) = rx else {
        return std::future::pending().await;
    };
    loop {
        match receiver.recv().await {
            Ok(frame) => return Some(frame),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Local hub receiver lagged, {n} frames lost");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut opened: mpsc::UnboundedReceiver<AttemptResult>,
    ) {
        let mut watchdog = timer(self.config.reconnect_timeout / 10);
        let mut awareness_timer = timer(self.config.awareness_outdated_timeout / 10);
        let mut resync = self.config.resync_interval.map(timer);
        let mut hub_rx: Option<broadcast::Receiver<LocalFrame>> = None;

        if self.config.connect {
            self.connect(&mut hub_rx);
        }

        loop {
            let reconnect_at = self.reconnect_at;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Destroy(ack)) => {
                        self.shutdown(&mut hub_rx);
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command, &mut hub_rx),
                    None => {
                        self.shutdown(&mut hub_rx);
                        break;
                    }
                },
                Some((attempt, result)) = opened.recv() => self.on_attempt_finished(attempt, result),
                frame = next_frame(&mut self.socket) => match frame {
                    Some(frame) => self.on_relay_frame(&frame),
                    None => {
                        log::info!("Connection to {} closed", self.config.url());
                        self.on_closed(false);
                    }
                },
                frame = next_local(&mut hub_rx) => match frame {
                    Some(frame) => self.on_local_frame(frame),
                    None => hub_rx = None,
                },
                _ = sleep_until_opt(reconnect_at) => {
                    self.reconnect_at = None;
                    self.open_socket();
                }
                _ = watchdog.tick() => self.check_staleness(),
                _ = awareness_timer.tick() => self.tick_awareness(),
                _ = tick_opt(&mut resync) => self.resync(),
            }
        }
        log::debug!("Transport actor for {} stopped", self.config.room);
    }

    fn handle_command(&mut self, command: Command, hub_rx: &mut Option<broadcast::Receiver<LocalFrame>>) {
        match command {
            Command::Connect => self.connect(hub_rx),
            Command::Disconnect => self.disconnect(hub_rx),
            Command::RefreshToken {
                server_url,
                room,
                token,
            } => self.refresh_token(&server_url, &room, &token, hub_rx),
            Command::SetLocalAwareness(state) => {
                let (change, update) = {
                    let mut awareness = self.awareness.lock();
                    let change = awareness.set_local_state(state, Instant::now());
                    let client = awareness.client_id();
                    (change, awareness.encode_update(&[client]))
                };
                self.broadcast(Message::Awareness(update).encode());
                if !change.is_empty() {
                    self.emit(TransportEvent::AwarenessChanged(change));
                }
            }
            Command::Subscribe(types) => self.send_to_relay(Message::EventSubscribe(types).encode()),
            Command::Unsubscribe(types) => {
                self.send_to_relay(Message::EventUnsubscribe(types).encode())
            }
            Command::LocalUpdate(update) => {
                log::trace!("Broadcasting local update ({} bytes)", update.len());
                self.broadcast(Message::Sync(SyncMessage::Update(update)).encode());
            }
            // Handled by the run loop.
            Command::Destroy(_) => {}
        }
    }

    // ── lifecycle ────────────────────────────────────────────────

    fn connect(&mut self, hub_rx: &mut Option<broadcast::Receiver<LocalFrame>>) {
        self.machine.connect();
        self.join_hub(hub_rx);
        if self.socket.is_none() && !self.connecting {
            self.reconnect_at = None;
            self.open_socket();
        }
        self.publish_state();
    }

    fn disconnect(&mut self, hub_rx: &mut Option<broadcast::Receiver<LocalFrame>>) {
        self.machine.disconnect();
        self.reconnect_at = None;
        // Local-only peers learn first that this peer is gone.
        let farewell = Message::Awareness(self.awareness.lock().encode_local_removal()).encode();
        self.leave_hub(hub_rx, Some(farewell.clone()));

        if let Some(socket) = self.socket.take() {
            socket.send(farewell);
            drop(socket);
            log::info!("Disconnected from {}", self.config.url());
            self.on_closed(true);
        } else if self.connecting {
            self.connecting = false;
            self.on_closed(true);
        }
        self.publish_state();
    }

    fn shutdown(&mut self, hub_rx: &mut Option<broadcast::Receiver<LocalFrame>>) {
        self.disconnect(hub_rx);
        self.machine.destroy();
        self.publish_state();
        log::info!("Transport for room {} destroyed", self.config.room);
    }

    fn refresh_token(
        &mut self,
        server_url: &str,
        room: &str,
        token: &str,
        hub_rx: &mut Option<broadcast::Receiver<LocalFrame>>,
    ) {
        let old_key = self.config.hub_key();
        if !self.config.rotate(server_url, room, token) {
            log::debug!("Token refresh left the URL unchanged");
            return;
        }
        *self.url.lock() = self.config.url();
        self.machine.reset_failures();

        if self.group.is_some() && self.config.hub_key() != old_key {
            let farewell = Message::Awareness(self.awareness.lock().encode_local_removal()).encode();
            self.leave_hub(hub_rx, Some(farewell));
            self.join_hub(hub_rx);
        }

        log::info!("Relay URL changed, reconnecting");
        if self.socket.take().is_some() {
            self.on_closed(true);
        } else if self.connecting {
            self.connecting = false;
            self.on_closed(true);
        }
    }

    fn open_socket(&mut self) {
        if !self.machine.begin_attempt() {
            return;
        }
        self.attempt += 1;
        self.connecting = true;
        let attempt = self.attempt;
        let url = self.config.url();
        log::debug!("Connecting to {url} (attempt {attempt})");

        let pending = self.connector.connect(&url);
        let opened = self.opened_tx.clone();
        tokio::spawn(async move {
            let _ = opened.send((attempt, pending.await));
        });
        self.publish_state();
    }

    fn on_attempt_finished(&mut self, attempt: u64, result: Result<Socket, TransportError>) {
        if attempt != self.attempt || !self.connecting {
            // Superseded; dropping the socket closes it.
            return;
        }
        self.connecting = false;
        match result {
            Ok(socket) => self.on_open(socket),
            Err(e) => {
                log::warn!("{e}");
                self.emit(TransportEvent::ConnectionError(e.to_string()));
                self.on_closed(false);
            }
        }
    }

    fn on_open(&mut self, socket: Socket) {
        self.last_message = Instant::now();
        socket.send(Message::Sync(SyncMessage::Step1(self.doc.state_vector())).encode());

        let types = self.subscriptions.lock().active_types();
        if !types.is_empty() {
            socket.send(Message::EventSubscribe(types).encode());
        }
        let renewal = self.awareness.lock().renew_local(Instant::now());
        if let Some(update) = renewal {
            socket.send(Message::Awareness(update).encode());
        }

        self.socket = Some(socket);
        self.machine.opened();
        log::info!("Connected to {}", self.config.url());
        self.publish_state();
    }

    /// `requested` marks a teardown the caller asked for, which never
    /// counts as a failed attempt.
    fn on_closed(&mut self, requested: bool) {
        self.socket = None;
        let outcome = if requested {
            self.machine.abandoned()
        } else {
            self.machine.closed()
        };
        if outcome.was_connected {
            self.set_synced(false);
            // Nobody vouches for the remote peers any more.
            let change = self.awareness.lock().remove_remote();
            if !change.is_empty() {
                self.emit(TransportEvent::AwarenessChanged(change));
            }
        }
        match outcome.retry_in {
            Some(delay) => {
                log::debug!("Reconnecting in {delay:?}");
                self.reconnect_at = Some(Instant::now() + delay);
            }
            None if self.machine.intent() == Intent::Connected && !self.machine.is_destroyed() => {
                log::warn!(
                    "Giving up on {} after {} failed attempts",
                    self.config.url(),
                    self.machine.failures()
                );
            }
            None => {}
        }
        self.publish_state();
    }

    // ── local hub ────────────────────────────────────────────────

    fn join_hub(&mut self, hub_rx: &mut Option<broadcast::Receiver<LocalFrame>>) {
        if self.config.disable_bc || self.group.is_some() {
            return;
        }
        let group = self.hub.group(&self.config.hub_key());
        *hub_rx = Some(group.subscribe());

        group.publish(
            self.hub_id,
            Message::Sync(SyncMessage::Step1(self.doc.state_vector())).encode(),
        );
        match self.doc.encode_state() {
            Ok(state) => {
                group.publish(self.hub_id, Message::Sync(SyncMessage::Step2(state)).encode());
            }
            Err(e) => log::warn!("Could not encode document state for the local hub: {e}"),
        }
        group.publish(self.hub_id, Message::QueryAwareness.encode());
        let renewal = self.awareness.lock().renew_local(Instant::now());
        if let Some(update) = renewal {
            group.publish(self.hub_id, Message::Awareness(update).encode());
        }
        log::debug!("Joined local hub group {}", group.key());
        self.group = Some(group);
    }

    fn leave_hub(&mut self, hub_rx: &mut Option<broadcast::Receiver<LocalFrame>>, farewell: Option<Vec<u8>>) {
        if let Some(group) = self.group.take() {
            if let Some(frame) = farewell {
                group.publish(self.hub_id, frame);
            }
            log::debug!("Left local hub group {}", group.key());
        }
        *hub_rx = None;
        let pruned = self.hub.prune();
        if pruned > 0 {
            log::debug!("Pruned {pruned} idle hub groups");
        }
    }

    // ── frames ───────────────────────────────────────────────────

    fn on_relay_frame(&mut self, frame: &[u8]) {
        self.last_message = Instant::now();
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping malformed frame ({} bytes): {e}", frame.len());
                return;
            }
        };
        if let Some(reply) = self.handle_message(message, Channel::Relay) {
            self.send_to_relay(reply.encode());
        }
    }

    fn on_local_frame(&mut self, frame: LocalFrame) {
        if frame.sender == self.hub_id {
            return;
        }
        let message = match Message::decode(&frame.bytes) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping malformed local hub frame: {e}");
                return;
            }
        };
        if let Some(reply) = self.handle_message(message, Channel::Local) {
            if let Some(group) = &self.group {
                group.publish(self.hub_id, reply.encode());
            }
        }
    }

    /// Process one message; returns the reply for the channel it came from.
    fn handle_message(&mut self, message: Message, channel: Channel) -> Option<Message> {
        log::trace!("{channel:?} <- {:?}", message.message_type());
        match message {
            Message::Sync(SyncMessage::Step1(state_vector)) => {
                match self.doc.diff_since(&state_vector) {
                    Ok(diff) => Some(Message::Sync(SyncMessage::Step2(diff))),
                    Err(e) => {
                        log::warn!("Cannot answer sync step 1: {e}");
                        None
                    }
                }
            }
            Message::Sync(SyncMessage::Step2(diff)) => {
                if self.apply_remote(&diff) && channel == Channel::Relay {
                    self.set_synced(true);
                }
                None
            }
            Message::Sync(SyncMessage::Update(diff)) => {
                self.apply_remote(&diff);
                None
            }
            Message::Awareness(update) => {
                let result = self.awareness.lock().apply_update(&update, Instant::now());
                match result {
                    Ok(change) => {
                        if change.reclaimed {
                            self.broadcast_local_awareness();
                        }
                        if !change.is_empty() {
                            self.emit(TransportEvent::AwarenessChanged(change));
                        }
                    }
                    Err(e) => log::warn!("Dropping awareness update: {e}"),
                }
                None
            }
            Message::QueryAwareness => Some(Message::Awareness(self.awareness.lock().encode_all())),
            Message::PermissionDenied { reason } => {
                log::warn!("Permission denied for room {}: {reason}", self.config.room);
                self.emit(TransportEvent::PermissionDenied(reason));
                None
            }
            Message::Event(bytes) => {
                self.dispatch_event(&bytes);
                None
            }
            Message::EventSubscribe(_) | Message::EventUnsubscribe(_) => None,
        }
    }

    fn apply_remote(&mut self, diff: &[u8]) -> bool {
        match self.doc.apply_diff(diff, OriginTag::Remote) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Dropping remote diff ({} bytes): {e}", diff.len());
                false
            }
        }
    }

    fn dispatch_event(&mut self, bytes: &[u8]) {
        let event = match EventMessage::decode(bytes) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Dropping undecodable event: {e}");
                return;
            }
        };
        let callbacks = self.subscriptions.lock().callbacks_for(&event.event_type);
        if callbacks.is_empty() {
            log::trace!("Ignoring event of unsubscribed type {}", event.event_type);
            return;
        }
        for callback in &callbacks {
            callback(&event);
        }
        self.emit(TransportEvent::Event(event));
    }

    // ── timers ───────────────────────────────────────────────────

    fn check_staleness(&mut self) {
        if self.socket.is_none() || self.machine.status() != ConnectionStatus::Connected {
            return;
        }
        let silent = self.last_message.elapsed();
        if silent >= self.config.reconnect_timeout {
            log::warn!("No message from the relay for {silent:?}, closing the socket");
            self.on_closed(false);
        }
    }

    fn tick_awareness(&mut self) {
        let now = Instant::now();
        let timeout = self.config.awareness_outdated_timeout;
        let (renewal, change) = {
            let mut awareness = self.awareness.lock();
            let renewal = if awareness.needs_renewal(now, timeout) {
                awareness.renew_local(now)
            } else {
                None
            };
            (renewal, awareness.expire(now, timeout))
        };
        if let Some(update) = renewal {
            self.broadcast(Message::Awareness(update).encode());
        }
        if !change.is_empty() {
            log::debug!("Expired awareness of {:?}", change.removed);
            self.emit(TransportEvent::AwarenessChanged(change));
        }
    }

    fn resync(&mut self) {
        if self.machine.status() == ConnectionStatus::Connected {
            log::trace!("Periodic resync");
            self.send_to_relay(Message::Sync(SyncMessage::Step1(self.doc.state_vector())).encode());
        }
    }

    // ── output ───────────────────────────────────────────────────

    fn send_to_relay(&self, frame: Vec<u8>) {
        if self.machine.status() != ConnectionStatus::Connected {
            return;
        }
        if let Some(socket) = &self.socket {
            if !socket.send(frame) {
                log::debug!("Socket already closed, frame dropped");
            }
        }
    }

    /// Send to the relay (when connected) and to the local hub group.
    fn broadcast(&self, frame: Vec<u8>) {
        if let Some(group) = &self.group {
            group.publish(self.hub_id, frame.clone());
        }
        self.send_to_relay(frame);
    }

    fn broadcast_local_awareness(&self) {
        let update = {
            let awareness = self.awareness.lock();
            awareness.encode_update(&[awareness.client_id()])
        };
        self.broadcast(Message::Awareness(update).encode());
    }

    fn emit(&self, event: TransportEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.events.try_send(event) {
            log::debug!("Transport event channel full, event dropped");
        }
    }

    fn set_synced(&mut self, synced: bool) {
        if self.synced == synced {
            return;
        }
        self.synced = synced;
        self.synced_tx.send_replace(synced);
        log::debug!("Synced: {synced}");
        self.emit(TransportEvent::Synced(synced));
    }

    fn publish_state(&self) {
        let state = self.machine.state();
        let mut status_changed = false;
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            status_changed = current.status != state.status;
            *current = state;
            true
        });
        if status_changed {
            log::debug!("Connection status: {}", state.status);
            self.emit(TransportEvent::Status(state.status));
        }
    }
}
