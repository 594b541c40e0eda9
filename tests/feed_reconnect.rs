/*
=============================================================================
Project : kis_scalper — real-time scalping engine for KRX equities in Rust
Module  : feed_reconnect.rs
Version : 0.6.0
License : MIT (see LICENSE)

Summary : Streams KIS real-time executions/order books over WebSocket,
          builds tick candles, fuses order-book imbalance, strength momentum
          and MA support into buy signals, and manages rate-limited entries
          and exits (stop-loss, take-profit, trailing stop, time stop).
=============================================================================
*/
// Loopback WebSocket server + mockito approval endpoint.

use std::collections::BTreeSet;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use kis_scalper::config::FeedCfg;
use kis_scalper::domain::FeedEvent;
use kis_scalper::feed::{FeedError, WireProtocolClient};

type Sub = (String, String, String); // (tr_type, tr_id, tr_key)

fn feed_cfg(ws_port: u16, rest_url: &str, max_reconnect_attempts: u32) -> FeedCfg {
    FeedCfg {
        ws_url: format!("ws://127.0.0.1:{ws_port}"),
        rest_url: rest_url.to_string(),
        app_key: "key".into(),
        app_secret: "secret".into(),
        cust_type: "P".into(),
        execution_tr_id: "H0STCNT0".into(),
        orderbook_tr_id: "H0STASP0".into(),
        max_reconnect_attempts,
        reconnect_delay_ms: 20,
        http_timeout_ms: 2_000,
    }
}

async fn approval_server() -> mockito::ServerGuard {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/oauth2/Approval")
        .with_body(r#"{"approval_key":"approval-xyz"}"#)
        .create_async()
        .await;
    server
}

async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> Option<String> {
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Text(t)) => return Some(t),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
    None
}

async fn read_subs(ws: &mut WebSocketStream<TcpStream>, n: usize) -> BTreeSet<Sub> {
    let mut out = BTreeSet::new();
    for _ in 0..n {
        let Some(text) = next_text(ws).await else { break };
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["header"]["approval_key"], "approval-xyz");
        out.insert((
            v["header"]["tr_type"].as_str().unwrap().to_string(),
            v["body"]["input"]["tr_id"].as_str().unwrap().to_string(),
            v["body"]["input"]["tr_key"].as_str().unwrap().to_string(),
        ));
    }
    out
}

async fn wait_connected(rx: &mut mpsc::Receiver<FeedEvent>, want: u32) {
    let fut = async {
        loop {
            match rx.recv().await {
                Some(FeedEvent::Connected { attempt }) if attempt == want => return,
                Some(_) => continue,
                None => panic!("feed channel closed"),
            }
        }
    };
    timeout(Duration::from_secs(5), fut).await.expect("Connected event");
}

#[tokio::test]
async fn test_reconnect_replays_exact_subscription_set() {
    let approval = approval_server().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (seen_tx, mut seen_rx) = mpsc::channel::<(BTreeSet<Sub>, Option<String>)>(4);
    tokio::spawn(async move {
        // koneksi pertama: terima subscribe, kirim PINGPONG, lalu putus
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(tcp).await.unwrap();
        let first = read_subs(&mut ws, 4).await;
        let ping = r#"{"header":{"tr_id":"PINGPONG","datetime":"20240105093000"}}"#;
        ws.send(Message::Text(ping.to_string())).await.unwrap();
        let echo = next_text(&mut ws).await;
        seen_tx.send((first, echo)).await.unwrap();
        drop(ws);

        // koneksi kedua: hanya replay
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(tcp).await.unwrap();
        let second = read_subs(&mut ws, 4).await;
        seen_tx.send((second, None)).await.unwrap();
        while next_text(&mut ws).await.is_some() {}
    });

    let (ev_tx, mut ev_rx) = mpsc::channel(64);
    let mut client = WireProtocolClient::new(feed_cfg(port, &approval.url(), 3), ev_tx);
    client.connect().await.unwrap();
    let symbols = vec!["005930".to_string(), "000660".to_string()];
    assert_eq!(client.subscribe(&symbols, true).await.unwrap(), 4);
    // sudah terdaftar -> tidak dikirim ulang
    assert_eq!(client.subscribe(&symbols, true).await.unwrap(), 0);
    wait_connected(&mut ev_rx, 0).await;

    let (stop_tx, stop_rx) = watch::channel(false);
    let feed = tokio::spawn(async move {
        let res = client.run_forever(stop_rx).await;
        (res, client.stats())
    });

    let (first, echo) = timeout(Duration::from_secs(5), seen_rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.len(), 4);
    assert!(first.iter().all(|(tr_type, _, _)| tr_type == "1"));
    assert!(first.contains(&("1".into(), "H0STCNT0".into(), "005930".into())));
    assert!(first.contains(&("1".into(), "H0STASP0".into(), "000660".into())));
    assert_eq!(echo.as_deref(), Some(r#"{"header":{"tr_id":"PINGPONG","datetime":"20240105093000"}}"#));

    let (second, _) = timeout(Duration::from_secs(5), seen_rx.recv()).await.unwrap().unwrap();
    assert_eq!(second, first);
    wait_connected(&mut ev_rx, 1).await;

    stop_tx.send(true).unwrap();
    let (res, stats) = timeout(Duration::from_secs(5), feed).await.unwrap().unwrap();
    assert!(res.is_ok());
    assert_eq!(stats.pings, 1);
    assert_eq!(stats.reconnects, 1);
}

#[tokio::test]
async fn test_reconnect_exhaustion_reports_disconnected() {
    let approval = approval_server().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let ws = accept_async(tcp).await.unwrap();
        // listener ikut di-drop -> reconnect ditolak
        drop(ws);
        drop(listener);
    });

    let (ev_tx, mut ev_rx) = mpsc::channel(64);
    let mut client = WireProtocolClient::new(feed_cfg(port, &approval.url(), 2), ev_tx);
    client.connect().await.unwrap();

    let (_stop_tx, stop_rx) = watch::channel(false);
    let res = timeout(Duration::from_secs(5), client.run_forever(stop_rx)).await.unwrap();
    assert!(matches!(res, Err(FeedError::ReconnectExhausted(2))));
    assert!(!client.is_connected());

    let mut disconnected = false;
    while let Ok(ev) = ev_rx.try_recv() {
        if let FeedEvent::Disconnected { reason } = ev {
            assert!(reason.contains("2 reconnect attempts failed"));
            disconnected = true;
        }
    }
    assert!(disconnected);
}
