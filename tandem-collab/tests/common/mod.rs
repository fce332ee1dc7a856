//! In-memory relay used by the integration tests.
//!
//! Speaks the relay side of the protocol: sends step 1 on connect,
//! answers step 1, applies and forwards document updates, and echoes
//! awareness to every socket of the room.

#![allow(dead_code)]

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tandem_collab::protocol::{Message, SyncMessage};
use tandem_collab::socket::{Connector, Socket, TransportError};
use tandem_collab::state::ConnectionStatus;
use tandem_collab::transport::SyncTransport;
use tandem_core::doc::{MemoryDoc, SyncDocument};
use tandem_core::origin::OriginTag;
use tokio::sync::mpsc;

struct RelayClient {
    id: u64,
    room: String,
    to_client: mpsc::Sender<Vec<u8>>,
}

#[derive(Default)]
struct RelayState {
    online: bool,
    /// Answer sync step 1 and send our own on connect.
    sync_enabled: bool,
    next_id: u64,
    rooms: HashMap<String, Arc<MemoryDoc>>,
    clients: Vec<RelayClient>,
    urls: Vec<String>,
    subscriptions: HashMap<u64, BTreeSet<String>>,
    received: Vec<Message>,
}

#[derive(Clone)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

/// Room name from `ws://host/base/room?query`.
pub fn room_of(url: &str) -> String {
    let path = url.split('?').next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path).to_owned()
}

impl MemoryRelay {
    pub fn new() -> Self {
        let state = RelayState {
            online: true,
            sync_enabled: true,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    pub fn set_online(&self, online: bool) {
        self.state.lock().online = online;
    }

    /// Stop talking sync: no step 1 on connect, no step 2 replies.
    pub fn set_sync_enabled(&self, enabled: bool) {
        self.state.lock().sync_enabled = enabled;
    }

    /// Close every open socket from the relay side.
    pub fn kick_all(&self) {
        self.state.lock().clients.clear();
    }

    pub fn room_doc(&self, room: &str) -> Arc<MemoryDoc> {
        self.state
            .lock()
            .rooms
            .entry(room.to_owned())
            .or_insert_with(|| Arc::new(MemoryDoc::new(u64::MAX / 2)))
            .clone()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.state.lock().urls.clone()
    }

    /// Union of the event types the open sockets subscribed to.
    pub fn subscribed_types(&self) -> BTreeSet<String> {
        let state = self.state.lock();
        state
            .clients
            .iter()
            .filter_map(|c| state.subscriptions.get(&c.id))
            .flatten()
            .cloned()
            .collect()
    }

    /// Every message clients sent, in arrival order.
    pub fn received(&self) -> Vec<Message> {
        self.state.lock().received.clone()
    }

    /// Push a raw frame to every open socket.
    pub fn inject(&self, frame: Vec<u8>) {
        let senders: Vec<_> = self
            .state
            .lock()
            .clients
            .iter()
            .map(|c| c.to_client.clone())
            .collect();
        for sender in senders {
            let _ = sender.try_send(frame.clone());
        }
    }

    fn send_to_room(&self, room: &str, except: Option<u64>, frame: &[u8]) {
        let senders: Vec<_> = self
            .state
            .lock()
            .clients
            .iter()
            .filter(|c| c.room == room && Some(c.id) != except)
            .map(|c| c.to_client.clone())
            .collect();
        for sender in senders {
            let _ = sender.try_send(frame.to_vec());
        }
    }

    fn handle(&self, client_id: u64, room: &str, frame: &[u8]) {
        let Ok(message) = Message::decode(frame) else {
            return;
        };
        let doc = self.room_doc(room);
        let sync_enabled = {
            let mut state = self.state.lock();
            state.received.push(message.clone());
            state.sync_enabled
        };
        match message {
            Message::Sync(SyncMessage::Step1(sv)) => {
                if sync_enabled {
                    if let Ok(diff) = doc.diff_since(&sv) {
                        self.send_to_client(client_id, Message::Sync(SyncMessage::Step2(diff)).encode());
                    }
                }
            }
            Message::Sync(SyncMessage::Step2(diff)) | Message::Sync(SyncMessage::Update(diff)) => {
                if doc.apply_diff(&diff, OriginTag::Remote).is_ok() {
                    let update = Message::Sync(SyncMessage::Update(diff)).encode();
                    self.send_to_room(room, Some(client_id), &update);
                }
            }
            Message::Awareness(_) => self.send_to_room(room, None, frame),
            Message::EventSubscribe(types) => {
                self.state
                    .lock()
                    .subscriptions
                    .entry(client_id)
                    .or_default()
                    .extend(types);
            }
            Message::EventUnsubscribe(types) => {
                if let Some(set) = self.state.lock().subscriptions.get_mut(&client_id) {
                    for t in types {
                        set.remove(&t);
                    }
                }
            }
            _ => {}
        }
    }

    fn send_to_client(&self, client_id: u64, frame: Vec<u8>) {
        let sender = self
            .state
            .lock()
            .clients
            .iter()
            .find(|c| c.id == client_id)
            .map(|c| c.to_client.clone());
        if let Some(sender) = sender {
            let _ = sender.try_send(frame);
        }
    }

    fn forget(&self, client_id: u64) {
        let mut state = self.state.lock();
        state.clients.retain(|c| c.id != client_id);
        state.subscriptions.remove(&client_id);
    }
}

impl Connector for MemoryRelay {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Socket, TransportError>> {
        let relay = self.clone();
        let url = url.to_owned();
        async move {
            let room = room_of(&url);
            let (client_id, sync_enabled) = {
                let mut state = relay.state.lock();
                state.urls.push(url.clone());
                if !state.online {
                    return Err(TransportError::Connect {
                        url,
                        message: "relay offline".into(),
                    });
                }
                state.next_id += 1;
                (state.next_id, state.sync_enabled)
            };

            let (socket, mut peer) = Socket::pair();
            if sync_enabled {
                let sv = relay.room_doc(&room).state_vector();
                let _ = peer.to_client.try_send(Message::Sync(SyncMessage::Step1(sv)).encode());
            }
            relay.state.lock().clients.push(RelayClient {
                id: client_id,
                room: room.clone(),
                to_client: peer.to_client,
            });

            let reader = relay.clone();
            tokio::spawn(async move {
                while let Some(frame) = peer.from_client.recv().await {
                    reader.handle(client_id, &room, &frame);
                }
                reader.forget(client_id);
            });
            Ok(socket)
        }
        .boxed()
    }
}

/// Connector to a shared relay with its own on/off switch, for a peer
/// that is offline while others are not.
pub struct GatedConnector {
    relay: MemoryRelay,
    online: Arc<AtomicBool>,
}

impl GatedConnector {
    pub fn new(relay: &MemoryRelay, online: bool) -> (Arc<Self>, Arc<AtomicBool>) {
        let switch = Arc::new(AtomicBool::new(online));
        let connector = Arc::new(Self {
            relay: relay.clone(),
            online: switch.clone(),
        });
        (connector, switch)
    }
}

impl Connector for GatedConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Socket, TransportError>> {
        if self.online.load(Ordering::SeqCst) {
            return self.relay.connect(url);
        }
        let url = url.to_owned();
        async move {
            Err(TransportError::Connect {
                url,
                message: "peer offline".into(),
            })
        }
        .boxed()
    }
}

/// Poll `check` until it holds, failing the test after `limit`.
pub async fn eventually<F>(limit: Duration, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within {limit:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait for the transport to reach `status`.
pub async fn wait_for_status(transport: &SyncTransport, status: ConnectionStatus) {
    let mut rx = transport.watch_connection_state();
    with_timeout(async move {
        rx.wait_for(|s| s.status == status).await.map(|_| ()).ok();
    })
    .await;
    assert_eq!(transport.connection_state().status, status);
}

pub async fn with_timeout<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}
