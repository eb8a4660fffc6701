//! End-to-end reconnect/resubscribe scenario: a subscription stays
//! logically alive across a transport drop and reconnect, receiving
//! notifications under a fresh server-assigned id.
//!
//! The mock node is a bare loopback WebSocket server speaking just
//! enough `eth_subscribe`/`eth_subscription` to drive the multiplexer,
//! in the same accept-and-echo style as
//! `snakeway::integration_tests::harness::upstream::start_ws_upstream`.

use std::time::Duration;

use chainstream_engine::subscription::{SubscriptionKind, SubscriptionMultiplexer, SubscriptionPayload};
use chainstream_engine::transport::ws::{WsTransport, WsTransportConfig};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

async fn respond_to_subscribe(ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>, server_sub_id: &str) {
    let request_text = loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(_)) => continue,
            _ => return,
        }
    };
    let request: Value = serde_json::from_str(&request_text).expect("valid jsonrpc request");
    let response = json!({
        "jsonrpc": "2.0",
        "id": request["id"],
        "result": server_sub_id,
    });
    ws.send(Message::Text(response.to_string())).await.unwrap();
}

async fn push_header(ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>, server_sub_id: &str, number: u64, hash: &str, parent_hash: &str) {
    let notification = json!({
        "jsonrpc": "2.0",
        "method": "eth_subscription",
        "params": {
            "subscription": server_sub_id,
            "result": {
                "number": format!("0x{:x}", number),
                "hash": hash,
                "parentHash": parent_hash,
                "timestamp": "0x1",
            }
        }
    });
    ws.send(Message::Text(notification.to_string())).await.unwrap();
}

#[tokio::test]
async fn resubscribes_after_transport_drop_and_keeps_delivering() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        // First connection: confirm the subscription, push one block,
        // then drop the socket to force a reconnect.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        respond_to_subscribe(&mut ws, "0xserver1").await;
        push_header(&mut ws, "0xserver1", 10, "0xaaa", "0xaa0").await;
        drop(ws);

        // Second connection: the multiplexer resubscribes with a fresh
        // local request; confirm under a new server id and push a
        // second block.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        respond_to_subscribe(&mut ws, "0xserver2").await;
        push_header(&mut ws, "0xserver2", 11, "0xbbb", "0xaaa").await;

        // keep the connection open for the remainder of the test
        while ws.next().await.is_some() {}
    });

    let transport = WsTransport::new(WsTransportConfig {
        url: format!("ws://{addr}"),
        reconnect_interval: Duration::from_millis(50),
        handshake_timeout: Duration::from_secs(2),
        ..Default::default()
    });
    transport.connect().await.unwrap();

    let multiplexer = SubscriptionMultiplexer::new(transport);
    let (local_id, mut data_rx, _error_rx) = multiplexer
        .subscribe(SubscriptionKind::NewHeads, true, 16)
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), data_rx.recv())
        .await
        .expect("first header did not arrive in time")
        .expect("channel open");
    let SubscriptionPayload::Header(header) = first else {
        panic!("expected a header payload");
    };
    assert_eq!(header.number, 10);

    let second = tokio::time::timeout(Duration::from_secs(5), data_rx.recv())
        .await
        .expect("second header did not arrive after reconnect")
        .expect("channel open");
    let SubscriptionPayload::Header(header) = second else {
        panic!("expected a header payload");
    };
    assert_eq!(header.number, 11);
    assert_eq!(header.parent_hash, "0xaaa");

    assert_eq!(multiplexer.active_count(), 1);
    let snapshot = multiplexer.snapshot(local_id).unwrap();
    assert_eq!(snapshot.message_count, 2);
}
