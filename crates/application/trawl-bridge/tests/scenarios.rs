//! End-to-end runs through the command surface.

use serde_json::json;
use std::net::SocketAddr;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use trawl_analysis::ProtocolStat;
use trawl_bridge::{BridgeHandle, Command, Engine};
use trawl_capture::synth::Synth;
use trawl_capture::{CaptureOptions, ReplaySource};
use trawl_config::TrawlConfig;
use trawl_core::{
    CaptureStats, Disposition, ErrorCode, Event, InterceptedItem, Packet, ProxyTransaction, RawFrame, TransactionState,
};

fn config(dir: &Path) -> TrawlConfig {
    let mut config = TrawlConfig::default();
    config.proxy.ca_dir = Some(dir.join("ca"));
    config
}

/// 600 TCP and 400 UDP frames from twenty rotating sources.
fn traffic() -> Vec<RawFrame> {
    let mut synth = Synth::default();
    (0..1000u16)
        .map(|i| {
            let src = format!("10.0.0.{}", i % 20 + 1);
            if i % 5 < 3 {
                synth.syn(&src, "192.168.1.10", 40000 + i, 443)
            } else {
                synth.udp(&src, "192.168.1.20", 50000 + i, 9999, b"payload")
            }
        })
        .collect()
}

async fn call(handle: &BridgeHandle, request: serde_json::Value) -> trawl_bridge::Response {
    handle.call(Command::from_value(request).unwrap()).await
}

async fn capture_stopped(events: &mut broadcast::Receiver<Event>) -> CaptureStats {
    loop {
        match events.recv().await {
            Ok(Event::CaptureStopped(stats)) => return stats,
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => panic!("bus closed"),
        }
    }
}

/// Replay `frames` as a capture session and let it run out.
async fn replay(dir: &Path, frames: Vec<RawFrame>) -> (BridgeHandle, CaptureStats) {
    replay_with(config(dir), frames).await
}

async fn replay_with(config: TrawlConfig, frames: Vec<RawFrame>) -> (BridgeHandle, CaptureStats) {
    let mut engine = Engine::new(config);
    let mut events = engine.subscribe();
    engine.start_source(ReplaySource::new(frames), CaptureOptions::default()).unwrap();
    let stats = capture_stopped(&mut events).await;
    engine.stop_capture().await;
    (engine.spawn(), stats)
}

#[tokio::test]
async fn test_statistics_over_a_replayed_session() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, stats) = replay(dir.path(), traffic()).await;
    assert_eq!(stats.packet_count, 1000);

    let response = call(&handle, json!({"method": "getProtocolHierarchy"})).await;
    let hierarchy: Vec<ProtocolStat> = response.field("data").unwrap();
    assert_eq!(hierarchy.len(), 2);
    assert_eq!((hierarchy[0].protocol.as_str(), hierarchy[0].percentage.as_str()), ("TCP", "60.00"));
    assert_eq!((hierarchy[1].protocol.as_str(), hierarchy[1].percentage.as_str()), ("UDP", "40.00"));

    let response = call(&handle, json!({"method": "getPackets", "params": {"filter": "ip.src==10.0.0.1"}})).await;
    assert_eq!(response.field::<Vec<Packet>>("packets").unwrap().len(), 50);
    assert_eq!(response.field::<usize>("total"), Some(1000));

    let response = call(&handle, json!({"method": "getEndpoints", "params": {"type": "ip"}})).await;
    assert_eq!(response.get("data").unwrap().as_array().unwrap().len(), 22);

    assert!(call(&handle, json!({"method": "clearPackets"})).await.is_success());
    let response = call(&handle, json!({"method": "getProtocolHierarchy"})).await;
    assert_eq!(response.get("data"), Some(&json!([])));
    let response = call(&handle, json!({"method": "getPacket", "params": {"no": 1}})).await;
    assert_eq!(response.error_code(), Some(ErrorCode::NotFound));
}

#[tokio::test]
async fn test_packet_numbering() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, _) = replay(dir.path(), traffic()).await;

    let response = call(&handle, json!({"method": "getPackets"})).await;
    let packets: Vec<Packet> = response.field("packets").unwrap();
    let numbers: Vec<u64> = packets.iter().map(|p| p.no).collect();
    assert_eq!(numbers, (1..=1000).collect::<Vec<u64>>());
    assert!(packets.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let response = call(&handle, json!({"method": "getPackets", "params": {"start": 10, "end": 20}})).await;
    let packets: Vec<Packet> = response.field("packets").unwrap();
    assert_eq!(packets.len(), 11);
    assert_eq!((packets[0].no, packets[10].no), (10, 20));

    let response = call(&handle, json!({"method": "getPacket", "params": {"no": 1000}})).await;
    assert_eq!(response.field::<Packet>("packet").unwrap().no, 1000);
}

#[tokio::test]
async fn test_json_export_then_import() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, _) = replay(dir.path(), traffic()[..40].to_vec()).await;
    let path = dir.path().join("session.json");

    let response = call(&handle, json!({"method": "exportPackets", "params": {"format": "json", "path": path, "filter": "udp"}})).await;
    assert_eq!(response.field::<usize>("count"), Some(16));

    let before: Vec<Packet> = call(&handle, json!({"method": "getPackets", "params": {"filter": "udp"}}))
        .await
        .field("packets")
        .unwrap();

    let response = call(&handle, json!({"method": "importPackets", "params": {"path": path}})).await;
    assert_eq!(response.field::<usize>("count"), Some(16));

    let after: Vec<Packet> = call(&handle, json!({"method": "getPackets"})).await.field("packets").unwrap();
    assert_eq!(after.len(), 16);
    assert_eq!(after.iter().map(|p| p.no).collect::<Vec<_>>(), (1..=16).collect::<Vec<u64>>());
    for (old, new) in before.iter().zip(&after) {
        assert_eq!(
            (&old.source, &old.destination, &old.protocol, old.length),
            (&new.source, &new.destination, &new.protocol, new.length)
        );
    }

    let response = call(&handle, json!({"method": "importPackets", "params": {"path": dir.path().join("missing.json")}})).await;
    assert_eq!(response.error_code(), Some(ErrorCode::NotFound));
    assert_eq!(call(&handle, json!({"method": "getPackets"})).await.field::<usize>("total"), Some(16));
}

fn columns(packets: &[Packet]) -> Vec<(u64, String, String, String, usize)> {
    packets
        .iter()
        .map(|p| (p.no, p.source.clone(), p.destination.clone(), p.protocol.clone(), p.length))
        .collect()
}

#[tokio::test]
async fn test_full_export_keeps_numbers_after_eviction() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.store.max_packets = 10;
    let (handle, stats) = replay_with(config, traffic()[..20].to_vec()).await;
    assert_eq!(stats.packet_count, 20);
    let path = dir.path().join("all.json");

    let before: Vec<Packet> = call(&handle, json!({"method": "getPackets"})).await.field("packets").unwrap();
    assert_eq!(before.iter().map(|p| p.no).collect::<Vec<_>>(), (11..=20).collect::<Vec<u64>>());

    let response = call(&handle, json!({"method": "exportPackets", "params": {"format": "json", "path": path}})).await;
    assert_eq!(response.field::<usize>("count"), Some(10));
    assert!(call(&handle, json!({"method": "clearPackets"})).await.is_success());

    let response = call(&handle, json!({"method": "importPackets", "params": {"path": path}})).await;
    assert_eq!(response.field::<usize>("count"), Some(10));
    let after: Vec<Packet> = call(&handle, json!({"method": "getPackets"})).await.field("packets").unwrap();
    assert_eq!(columns(&after), columns(&before));

    let response = call(&handle, json!({"method": "getPacket", "params": {"no": 15}})).await;
    assert_eq!(response.field::<Packet>("packet").unwrap().source, before[4].source);
    handle.shutdown().await;
}

/// Answers every request with a fixed 200.
async fn origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    if stream.read(&mut byte).await.unwrap_or(0) == 0 {
                        return;
                    }
                    head.push(byte[0]);
                }
                let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok").await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_intercept_and_drop() {
    let dir = tempfile::tempdir().unwrap();
    let origin = origin().await;
    let handle = Engine::new(config(dir.path())).spawn();
    let mut events = handle.subscribe();

    let response = call(
        &handle,
        json!({"method": "startProxy", "params": {"settings": {"listenAddr": "127.0.0.1", "port": 0, "intercept": true}}}),
    )
    .await;
    let port: u16 = response.field("port").unwrap();
    assert_ne!(port, 0);

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client
        .write_all(format!("GET http://{origin}/secret HTTP/1.1\r\nHost: {origin}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let item = loop {
        if let Event::ProxyIntercept(item) = events.recv().await.unwrap() {
            break item;
        }
    };
    assert_eq!(item.disposition, Disposition::Pending);
    assert!(item.request.url.ends_with("/secret"));

    let pending: Vec<InterceptedItem> = call(&handle, json!({"method": "getPendingIntercepts"})).await.field("intercepts").unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, item.id);

    let response = call(&handle, json!({"method": "dropIntercept", "params": {"id": item.id}})).await;
    assert_eq!(response.field::<InterceptedItem>("item").unwrap().disposition, Disposition::Dropped);

    let mut rest = Vec::new();
    let _ = client.read_to_end(&mut rest).await;
    assert!(rest.is_empty());

    let response = call(&handle, json!({"method": "forwardIntercept", "params": {"id": item.id}})).await;
    assert!(!response.is_success());

    let history: Vec<ProxyTransaction> = call(&handle, json!({"method": "getProxyHistory"})).await.field("history").unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].intercepted);
    assert!(matches!(history[0].state, TransactionState::Aborted { .. }));
    assert!(history[0].response.is_none());

    let mut held = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, Event::ProxyIntercept(_)) {
            held += 1;
        }
    }
    assert_eq!(held, 0);

    assert!(call(&handle, json!({"method": "stopProxy"})).await.is_success());
    handle.shutdown().await;
}

#[tokio::test]
async fn test_second_proxy_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let handle = Engine::new(config(dir.path())).spawn();
    let start = json!({"method": "startProxy", "params": {"settings": {"listenAddr": "127.0.0.1", "port": 0}}});

    assert!(call(&handle, start.clone()).await.is_success());
    let response = call(&handle, start.clone()).await;
    assert_eq!(response.error_code(), Some(ErrorCode::ResourceBusy));

    assert!(call(&handle, json!({"method": "stopProxy"})).await.is_success());
    assert!(call(&handle, start).await.is_success());
    handle.shutdown().await;
}
