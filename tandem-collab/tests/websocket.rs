//! SyncTransport over a real WebSocket, against a minimal loopback relay.

mod common;

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use yrs::{Text, WriteTxn};

use common::{eventually, wait_for_status, with_timeout};
use tandem_collab::broadcast::LocalHub;
use tandem_collab::config::TransportConfig;
use tandem_collab::protocol::{Message, SyncMessage};
use tandem_collab::state::ConnectionStatus;
use tandem_collab::transport::SyncTransport;
use tandem_core::doc::{SyncDocument, YrsDoc};
use tandem_core::origin::OriginTag;

/// Accept one connection and run the relay side of the sync handshake.
async fn serve_one(listener: TcpListener, doc: Arc<YrsDoc>) {
    let (stream, addr) = listener.accept().await.unwrap();
    let ws_stream = tokio_tungstenite::accept_async(stream).await.unwrap();
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("Loopback relay accepted {addr}");

    let hello = Message::Sync(SyncMessage::Step1(doc.state_vector())).encode();
    ws_sender.send(WsMessage::Binary(hello.into())).await.unwrap();

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let WsMessage::Binary(data) = msg else {
            continue;
        };
        match Message::decode(&data) {
            Ok(Message::Sync(SyncMessage::Step1(sv))) => {
                let reply = Message::Sync(SyncMessage::Step2(doc.diff_since(&sv).unwrap())).encode();
                ws_sender.send(WsMessage::Binary(reply.into())).await.unwrap();
            }
            Ok(Message::Sync(SyncMessage::Step2(diff))) | Ok(Message::Sync(SyncMessage::Update(diff))) => {
                doc.apply_diff(&diff, OriginTag::Remote).unwrap();
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_sync_over_websocket() {
    let _ = env_logger::builder().is_test(true).try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_doc = Arc::new(YrsDoc::with_client_id(100));
    server_doc.transact_local(OriginTag::System, |_, txn| {
        let title = txn.get_or_insert_text("title");
        title.insert(txn, 0, "from relay");
    });
    tokio::spawn(serve_one(listener, server_doc.clone()));

    let client_doc = Arc::new(YrsDoc::with_client_id(1));
    client_doc.transact_local(OriginTag::Local, |_, txn| {
        let body = txn.get_or_insert_text("body");
        body.insert(txn, 0, "offline draft");
    });

    let config = TransportConfig::new(format!("ws://{addr}"), "loopback").with_broadcast_fallback(false);
    let transport = SyncTransport::builder(client_doc.clone(), config)
        .with_local_hub(&LocalHub::new(8))
        .spawn()
        .unwrap();

    wait_for_status(&transport, ConnectionStatus::Connected).await;
    let mut synced = transport.watch_synced();
    with_timeout(synced.wait_for(|s| *s)).await.unwrap();

    let limit = Duration::from_secs(5);
    eventually(limit, || client_doc.text("title") == "from relay").await;
    eventually(limit, || server_doc.text("body") == "offline draft").await;

    // Live edits follow the handshake.
    client_doc.transact_local(OriginTag::Local, |_, txn| {
        let body = txn.get_or_insert_text("body");
        body.push(txn, "!");
    });
    eventually(limit, || server_doc.text("body") == "offline draft!").await;

    transport.destroy().await.unwrap();
}
