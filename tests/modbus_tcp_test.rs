// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

//! Wire-level tests for the Modbus TCP slave.
//!
//! Talks to a real listener over loopback with hand-built ADUs: framing,
//! transaction-id echo, exception frames, concurrent clients, and the idle
//! timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use heatbridge::command::{command_channel, CommandSender};
use heatbridge::config::{BrokerConfig, Config, DeviceConfig, DeviceTopics};
use heatbridge::modbus::server::sweep_all;
use heatbridge::modbus::{ModbusHandler, ModbusServer, RegisterPlane};
use heatbridge::registry::DeviceRegistry;
use heatbridge::state::StateStore;

struct Server {
    addr: std::net::SocketAddr,
    store: Arc<StateStore>,
    plane: Arc<RegisterPlane>,
    registry: Arc<DeviceRegistry>,
    running: Arc<AtomicBool>,
    _commands: CommandSender,
}

async fn start_server(units: &[u8], idle_timeout: Duration) -> Server {
    let mut config = Config::default();
    config
        .brokers
        .insert("plant".to_string(), BrokerConfig::default());
    for &unit in units {
        config.devices.push(DeviceConfig {
            device_id: format!("dev{unit}"),
            name: format!("DEV{unit}"),
            unit_id: unit,
            broker: "plant".to_string(),
            topics: DeviceTopics {
                temperature_in: format!("t/{unit}"),
                valve_relay_out: format!("v/{unit}"),
                fan_dimmer_out: format!("f/{unit}"),
                alarm_in: None,
            },
            gains: Default::default(),
            safety: Default::default(),
        });
    }

    let registry = Arc::new(DeviceRegistry::from_config(&config).unwrap());
    let store = Arc::new(StateStore::new(&registry));
    let plane = Arc::new(RegisterPlane::new(&registry));
    sweep_all(&plane, &store, &registry);

    // Commands are enqueued but nothing drains them here; these tests are
    // about the wire behavior.
    let (commands, _command_rx) = command_channel();
    let handler = Arc::new(ModbusHandler::new(
        Arc::clone(&plane),
        Arc::clone(&registry),
        commands.clone(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let running = Arc::new(AtomicBool::new(true));
    let server = ModbusServer::new(handler, idle_timeout);
    let server_running = running.clone();
    tokio::spawn(async move { server.serve(listener, server_running).await });

    Server {
        addr,
        store,
        plane,
        registry,
        running,
        _commands: commands,
    }
}

/// Build an ADU from transaction id, unit id, and PDU bytes.
fn adu(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(7 + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&((pdu.len() as u16 + 1).to_be_bytes()));
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    frame
}

async fn transact(stream: &mut TcpStream, request: &[u8]) -> Vec<u8> {
    stream.write_all(request).await.unwrap();
    let mut header = [0u8; 7];
    stream.read_exact(&mut header).await.unwrap();
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    let mut rest = vec![0u8; length - 1];
    stream.read_exact(&mut rest).await.unwrap();
    let mut response = header.to_vec();
    response.extend_from_slice(&rest);
    response
}

#[tokio::test]
async fn read_input_registers_over_tcp() {
    let server = start_server(&[1, 2], Duration::from_secs(60)).await;
    server.store.record_temperature("dev2", 22.5, 1);
    sweep_all(&server.plane, &server.store, &server.registry);

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    // FC04, flat address 20 (unit 2, relative 0), quantity 1.
    let response = transact(
        &mut stream,
        &adu(0x0A0B, 2, &[0x04, 0x00, 0x14, 0x00, 0x01]),
    )
    .await;

    assert_eq!(&response[0..2], &[0x0A, 0x0B], "transaction id echoed");
    assert_eq!(response[6], 2, "unit id echoed");
    assert_eq!(&response[7..], &[0x04, 0x02, 0x00, 0xE1]);

    server.running.store(false, Ordering::SeqCst);
}

#[tokio::test]
async fn write_and_read_back_holding_register() {
    let server = start_server(&[1], Duration::from_secs(60)).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    // FC06 write 0x1234 to reserved holding register 12.
    let response = transact(
        &mut stream,
        &adu(1, 1, &[0x06, 0x00, 0x0C, 0x12, 0x34]),
    )
    .await;
    assert_eq!(&response[7..], &[0x06, 0x00, 0x0C, 0x12, 0x34]);

    // FC03 reads the same value back on the same connection.
    let response = transact(
        &mut stream,
        &adu(2, 1, &[0x03, 0x00, 0x0C, 0x00, 0x01]),
    )
    .await;
    assert_eq!(&response[7..], &[0x03, 0x02, 0x12, 0x34]);

    server.running.store(false, Ordering::SeqCst);
}

#[tokio::test]
async fn unsupported_function_answers_exception_01() {
    let server = start_server(&[1], Duration::from_secs(60)).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    // FC 0x2B (Encapsulated Interface Transport) is not supported.
    let response = transact(&mut stream, &adu(7, 1, &[0x2B, 0x0E, 0x01, 0x00])).await;
    assert_eq!(&response[7..], &[0xAB, 0x01]);

    // The socket stays usable afterwards.
    let response = transact(
        &mut stream,
        &adu(8, 1, &[0x03, 0x00, 0x00, 0x00, 0x01]),
    )
    .await;
    assert_eq!(response[7], 0x03);

    server.running.store(false, Ordering::SeqCst);
}

#[tokio::test]
async fn concurrent_clients_are_served_independently() {
    let server = start_server(&[1], Duration::from_secs(60)).await;

    let mut streams = Vec::new();
    for _ in 0..10 {
        streams.push(TcpStream::connect(server.addr).await.unwrap());
    }

    for (index, stream) in streams.iter_mut().enumerate() {
        let response = transact(
            stream,
            &adu(index as u16, 1, &[0x04, 0x00, 0x00, 0x00, 0x05]),
        )
        .await;
        assert_eq!(
            u16::from_be_bytes([response[0], response[1]]),
            index as u16
        );
        assert_eq!(response[7], 0x04);
        assert_eq!(response[8], 10, "five registers = ten bytes");
    }

    server.running.store(false, Ordering::SeqCst);
}

#[tokio::test]
async fn idle_connection_is_closed() {
    let server = start_server(&[1], Duration::from_millis(200)).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    // Say nothing past the idle timeout; the server closes the socket.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(1), stream.read(&mut buf))
        .await
        .expect("server should have closed the socket");
    assert_eq!(read.unwrap(), 0, "clean EOF expected");

    server.running.store(false, Ordering::SeqCst);
}

#[tokio::test]
async fn garbled_header_closes_connection_but_not_server() {
    let server = start_server(&[1], Duration::from_secs(60)).await;

    let mut bad = TcpStream::connect(server.addr).await.unwrap();
    // Protocol id 0xFFFF: framing is untrustworthy, connection drops.
    bad.write_all(&[0x00, 0x01, 0xFF, 0xFF, 0x00, 0x06, 0x01])
        .await
        .unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(1), bad.read(&mut buf))
        .await
        .expect("server should close the garbled connection");
    assert_eq!(read.unwrap(), 0);

    // A fresh connection still works.
    let mut good = TcpStream::connect(server.addr).await.unwrap();
    let response = transact(
        &mut good,
        &adu(1, 1, &[0x03, 0x00, 0x00, 0x00, 0x01]),
    )
    .await;
    assert_eq!(response[7], 0x03);

    server.running.store(false, Ordering::SeqCst);
}
