use watt_bridge::config;
use watt_bridge::prelude::*;
use watt_bridge::seplos::frame::{Frame, ResponseCode, BATTERY_CID1, PROTOCOL_VERSION};
use watt_bridge::seplos::Seplos;

use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

// telemetry payload: two cells, one sensor, soc 95.5%
fn telemetry_info() -> Vec<u8> {
    let mut info = vec![0x00, 0x00];
    info.push(2);
    info.extend_from_slice(&3312u16.to_be_bytes());
    info.extend_from_slice(&3308u16.to_be_bytes());
    info.push(1);
    info.extend_from_slice(&3000u16.to_be_bytes());
    info.extend_from_slice(&(-250i16).to_be_bytes());
    info.extend_from_slice(&5230u16.to_be_bytes());
    info.extend_from_slice(&4750u16.to_be_bytes());
    info.push(10);
    info.extend_from_slice(&5000u16.to_be_bytes());
    info.extend_from_slice(&955u16.to_be_bytes());
    info.extend_from_slice(&5000u16.to_be_bytes());
    info.extend_from_slice(&42u16.to_be_bytes());
    info.extend_from_slice(&1000u16.to_be_bytes());
    info.extend_from_slice(&5241u16.to_be_bytes());
    info
}

fn telemetry_response() -> Vec<u8> {
    Frame {
        version: PROTOCOL_VERSION,
        address: 0x00,
        cid1: BATTERY_CID1,
        cid2: ResponseCode::Normal.into(),
        info: telemetry_info(),
    }
    .wire()
    .unwrap()
}

fn client_config(port: u16) -> config::Seplos {
    config::Seplos {
        name: "bms0".to_string(),
        host: "127.0.0.1".to_string(),
        port,
        address: Some(0),
        interval_ms: None,
    }
}

async fn wait_for_metric(registry: &Registry, fingerprint: &str) -> Metric {
    let deadline = Instant::now() + Duration::from_secs(8);
    loop {
        if let Some(metric) = registry.get(fingerprint) {
            return metric;
        }
        assert!(
            Instant::now() < deadline,
            "metric {fingerprint} never appeared"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn telemetry_flows_from_socket_to_registry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // mock BMS: every request, whatever its kind, gets the telemetry frame.
    // wrong-kind decodes fail inside their request handlers without touching
    // the connection
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut request = Vec::new();
            loop {
                request.clear();
                match reader.read_until(b'\r', &mut request).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if write_half.write_all(&telemetry_response()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });

    let registry = Arc::new(Registry::new());
    let client = Seplos::new(registry.clone(), &client_config(port));
    let handle = tokio::spawn(client.start());

    let soc = wait_for_metric(&registry, "seplos_telemetry_soc{bms=\"bms0\"}").await;
    assert_eq!(soc.value(), 95.5);

    let cell = wait_for_metric(
        &registry,
        "seplos_telemetry_cell_voltage{bms=\"bms0\",cell=\"1\"}",
    )
    .await;
    assert_eq!(cell.value(), 3.312);

    let requests = wait_for_metric(
        &registry,
        "seplos_request_count_total{bms=\"bms0\",request=\"telemetry_request\"}",
    )
    .await;
    assert!(requests.value() >= 1.0);

    handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_device_forces_a_client_reset() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // accepts connections but never answers; the response timeout must tear
    // the connection down
    tokio::spawn(async move {
        let mut sockets = Vec::new();
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            sockets.push(stream);
        }
    });

    let registry = Arc::new(Registry::new());
    let client = Seplos::new(registry.clone(), &client_config(port));
    let handle = tokio::spawn(client.start());

    let resets = wait_for_metric(&registry, "seplos_client_reset_count_total{bms=\"bms0\"}").await;
    assert!(resets.value() >= 1.0);

    handle.abort();
}
