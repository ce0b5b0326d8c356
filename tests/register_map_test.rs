// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

//! Integration tests for the Modbus register map and command pipeline.
//!
//! Drives the request handler the connection tasks use, with the real
//! command dispatcher running behind it, and checks the SCADA-visible
//! behavior: flat strided addressing, INT16 ×10 scaling, command-word
//! semantics, and the write-read round trips.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use heatbridge::clock::FixedClock;
use heatbridge::command::{self, command_channel, CommandContext, CommandSender};
use heatbridge::config::{BrokerConfig, Config, DeviceConfig, DeviceTopics};
use heatbridge::modbus::frame::{ExceptionCode, MbapHeader, Request, Response};
use heatbridge::modbus::plane::HR_COMMAND;
use heatbridge::modbus::server::sweep_all;
use heatbridge::modbus::{ModbusHandler, RegisterPlane};
use heatbridge::persistence::{MemorySettingsStore, SettingsStore, SETPOINT_KEY};
use heatbridge::registry::DeviceRegistry;
use heatbridge::regulator::Regulator;
use heatbridge::state::{EventKind, StateStore};
use heatbridge::telemetry::memory::MemoryBus;
use heatbridge::telemetry::{IngressRouter, TelemetryBus, TelemetryHub, TopicIndex};

struct Harness {
    ctx: Arc<CommandContext>,
    registry: Arc<DeviceRegistry>,
    store: Arc<StateStore>,
    plane: Arc<RegisterPlane>,
    handler: ModbusHandler,
    commands: CommandSender,
    bus: Arc<MemoryBus>,
}

fn device(unit: u8) -> DeviceConfig {
    DeviceConfig {
        device_id: format!("dev{unit}"),
        name: format!("DEV{unit}"),
        unit_id: unit,
        broker: "plant".to_string(),
        topics: DeviceTopics {
            temperature_in: format!("plant/dev{unit}/temp"),
            valve_relay_out: format!("plant/dev{unit}/valve"),
            fan_dimmer_out: format!("plant/dev{unit}/fan"),
            alarm_in: None,
        },
        gains: Default::default(),
        safety: Default::default(),
    }
}

/// Build the engine around the given unit ids and start the command
/// dispatcher.
fn harness(units: &[u8]) -> Harness {
    let mut config = Config::default();
    config
        .brokers
        .insert("plant".to_string(), BrokerConfig::default());
    for &unit in units {
        config.devices.push(device(unit));
    }

    let registry = Arc::new(DeviceRegistry::from_config(&config).unwrap());
    let store = Arc::new(StateStore::new(&registry));
    let bus = Arc::new(MemoryBus::new());
    let mut buses: HashMap<String, Arc<dyn TelemetryBus>> = HashMap::new();
    buses.insert("plant".to_string(), bus.clone());
    let hub = Arc::new(TelemetryHub::new(buses));
    let settings: Arc<dyn SettingsStore> = Arc::new(MemorySettingsStore::new());

    let ctx = Arc::new(CommandContext {
        store: Arc::clone(&store),
        registry: Arc::clone(&registry),
        hub,
        settings,
    });

    let (commands, command_rx) = command_channel();
    let running = Arc::new(AtomicBool::new(true));
    let _dispatcher = command::spawn_dispatcher(Arc::clone(&ctx), command_rx, running);

    let plane = Arc::new(RegisterPlane::new(&registry));
    sweep_all(&plane, &store, &registry);
    let handler = ModbusHandler::new(Arc::clone(&plane), Arc::clone(&registry), commands.clone());

    Harness {
        ctx,
        registry,
        store,
        plane,
        handler,
        commands,
        bus,
    }
}

fn header(unit: u8) -> MbapHeader {
    MbapHeader {
        transaction_id: 1,
        unit_id: unit,
        pdu_len: 0,
    }
}

async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {description}");
}

/// S1: writing 0x00E1 to holding address 30 sets device 2's setpoint to
/// 22.5 °C and reads back as 225.
#[tokio::test]
async fn setpoint_write_round_trip() {
    let h = harness(&[1, 2, 3]);

    let response = h
        .handler
        .handle(
            &header(2),
            Request::WriteSingleRegister {
                addr: 30,
                value: 0x00E1,
            },
        )
        .unwrap();
    assert_eq!(
        response,
        Response::Echo {
            function: 0x06,
            addr: 30,
            value: 0x00E1
        }
    );

    // The plane answers immediately...
    let read = h
        .handler
        .handle(
            &header(2),
            Request::ReadHoldingRegisters {
                addr: 30,
                quantity: 1,
            },
        )
        .unwrap();
    assert_eq!(
        read,
        Response::Registers {
            function: 0x03,
            values: vec![225]
        }
    );

    // ...and the canonical state catches up through the command pipeline.
    let store = Arc::clone(&h.store);
    wait_until("setpoint applied to device state", move || {
        store.read("dev2").unwrap().setpoint_temperature == 22.5
    })
    .await;

    // Persisted too.
    assert_eq!(
        h.ctx
            .settings
            .get("dev2", SETPOINT_KEY)
            .await
            .unwrap()
            .as_deref(),
        Some("22.5")
    );
}

/// Setpoint writes outside the raw range answer exception 03 and leave
/// state untouched.
#[tokio::test]
async fn setpoint_write_out_of_range_is_rejected() {
    let h = harness(&[1]);

    let fault = h
        .handler
        .handle(
            &header(1),
            Request::WriteSingleRegister {
                addr: 0,
                value: 400, // 40.0 °C
            },
        )
        .unwrap_err();
    assert_eq!(fault.code, ExceptionCode::IllegalDataValue);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.store.read("dev1").unwrap().setpoint_temperature, 20.0);
}

/// S2: a negative telemetry temperature appears as INT16 two's complement
/// in the input registers.
#[tokio::test]
async fn negative_temperature_reads_as_twos_complement() {
    let h = harness(&[1]);
    let clock = Arc::new(FixedClock::new(1, 1_000));
    let router = IngressRouter::new(
        TopicIndex::from_registry(&h.registry),
        Arc::clone(&h.store),
        clock,
    );

    router.route("plant/dev1/temp", b"-5.2");
    sweep_all(&h.plane, &h.store, &h.registry);

    let read = h
        .handler
        .handle(
            &header(1),
            Request::ReadInputRegisters {
                addr: 0,
                quantity: 1,
            },
        )
        .unwrap();
    assert_eq!(
        read,
        Response::Registers {
            function: 0x04,
            values: vec![0xFFCC]
        }
    );
}

/// S3: command word 2 at flat address 130 enables auto on unit 5, the
/// register reads back zero, and an AutoEnabled event fires.
#[tokio::test]
async fn command_word_enables_auto() {
    let h = harness(&[1, 2, 3, 5]);
    let mut events = h.store.subscribe();

    let addr = 10 + (5 - 1) * 30;
    h.handler
        .handle(
            &header(5),
            Request::WriteSingleRegister { addr, value: 2 },
        )
        .unwrap();

    let store = Arc::clone(&h.store);
    wait_until("auto enabled on device 5", move || {
        store.read("dev5").unwrap().auto_enabled
    })
    .await;

    assert_eq!(h.plane.get_holding(5, HR_COMMAND), Some(0));

    let mut saw_auto_enabled = false;
    while let Ok(event) = events.try_recv() {
        if event.device_id == "dev5" && event.kind == EventKind::AutoEnabled {
            saw_auto_enabled = true;
        }
    }
    assert!(saw_auto_enabled);
}

/// S4: command word 6 (both bits) resolves to DisableAuto and reads back
/// zero.
#[tokio::test]
async fn command_word_disable_wins_over_enable() {
    let h = harness(&[1]);
    h.store.enable_auto("dev1");

    h.handler
        .handle(
            &header(1),
            Request::WriteSingleRegister { addr: 10, value: 6 },
        )
        .unwrap();

    let store = Arc::clone(&h.store);
    wait_until("auto disabled on device 1", move || {
        !store.read("dev1").unwrap().auto_enabled
    })
    .await;

    let read = h
        .handler
        .handle(
            &header(1),
            Request::ReadHoldingRegisters {
                addr: 10,
                quantity: 1,
            },
        )
        .unwrap();
    assert_eq!(
        read,
        Response::Registers {
            function: 0x03,
            values: vec![0]
        }
    );
}

/// Any command-word pattern beyond the two defined bits answers exception
/// 03.
#[tokio::test]
async fn command_word_rejects_unknown_bits() {
    let h = harness(&[1]);
    let fault = h
        .handler
        .handle(
            &header(1),
            Request::WriteSingleRegister { addr: 10, value: 9 },
        )
        .unwrap_err();
    assert_eq!(fault.code, ExceptionCode::IllegalDataValue);
}

/// Coil 0 writes map to EnableAuto/DisableAuto.
#[tokio::test]
async fn auto_coil_write_drives_commands() {
    let h = harness(&[1, 2]);

    // Unit 2's coil slice starts at bit 16.
    h.handler
        .handle(
            &header(2),
            Request::WriteSingleCoil {
                addr: 16,
                value: true,
            },
        )
        .unwrap();

    let store = Arc::clone(&h.store);
    wait_until("auto enabled via coil", move || {
        store.read("dev2").unwrap().auto_enabled
    })
    .await;

    sweep_all(&h.plane, &h.store, &h.registry);
    let coils = h
        .handler
        .handle(
            &header(2),
            Request::ReadCoils {
                addr: 16,
                quantity: 1,
            },
        )
        .unwrap();
    assert_eq!(
        coils,
        Response::Bits {
            function: 0x01,
            bits: vec![true]
        }
    );

    h.handler
        .handle(
            &header(2),
            Request::WriteSingleCoil {
                addr: 16,
                value: false,
            },
        )
        .unwrap();
    let store = Arc::clone(&h.store);
    wait_until("auto disabled via coil", move || {
        !store.read("dev2").unwrap().auto_enabled
    })
    .await;
}

/// Property 4: values written to reserved holding registers read back
/// unchanged.
#[tokio::test]
async fn reserved_holding_registers_round_trip() {
    let h = harness(&[1]);

    h.handler
        .handle(
            &header(1),
            Request::WriteSingleRegister {
                addr: 13,
                value: 0xBEEF,
            },
        )
        .unwrap();

    let read = h
        .handler
        .handle(
            &header(1),
            Request::ReadHoldingRegisters {
                addr: 13,
                quantity: 1,
            },
        )
        .unwrap();
    assert_eq!(
        read,
        Response::Registers {
            function: 0x03,
            values: vec![0xBEEF]
        }
    );
}

/// S7: one contiguous input-register read spans several devices, slices
/// concatenated in unit order.
#[tokio::test]
async fn multi_device_contiguous_read() {
    let h = harness(&[1, 2, 3]);
    h.store.record_temperature("dev1", 18.0, 1);
    h.store.record_temperature("dev2", 21.5, 2);
    h.store.record_temperature("dev3", -2.0, 3);
    sweep_all(&h.plane, &h.store, &h.registry);

    let read = h
        .handler
        .handle(
            &header(1),
            Request::ReadInputRegisters {
                addr: 0,
                quantity: 60,
            },
        )
        .unwrap();
    let Response::Registers { values, .. } = read else {
        panic!("expected register response");
    };
    assert_eq!(values.len(), 60);
    assert_eq!(values[0], 180);
    assert_eq!(values[20], 215);
    assert_eq!(values[40], (-20i16) as u16);
}

/// Reads past the last configured device answer exception 02.
#[tokio::test]
async fn out_of_range_address_answers_exception_02() {
    let h = harness(&[1, 2]);
    let fault = h
        .handler
        .handle(
            &header(1),
            Request::ReadHoldingRegisters {
                addr: 0,
                quantity: 61, // spills into the unmapped unit 3
            },
        )
        .unwrap_err();
    assert_eq!(fault.code, ExceptionCode::IllegalDataAddress);

    let fault = h
        .handler
        .handle(
            &header(9),
            Request::ReadInputRegisters {
                addr: 200,
                quantity: 1,
            },
        )
        .unwrap_err();
    assert_eq!(fault.code, ExceptionCode::IllegalDataAddress);
}

/// FC16 spanning the setpoint register applies the same semantics as FC06,
/// register by register in ascending order.
#[tokio::test]
async fn write_multiple_registers_applies_per_register_semantics() {
    let h = harness(&[1]);

    let response = h
        .handler
        .handle(
            &header(1),
            Request::WriteMultipleRegisters {
                addr: 0,
                values: vec![250, 0x0007],
            },
        )
        .unwrap();
    assert_eq!(
        response,
        Response::WriteMultiple {
            function: 0x10,
            addr: 0,
            quantity: 2
        }
    );

    let store = Arc::clone(&h.store);
    wait_until("setpoint 25.0 applied", move || {
        store.read("dev1").unwrap().setpoint_temperature == 25.0
    })
    .await;
    // Register 1 is the advisory hysteresis readback, plain storage.
    assert_eq!(h.plane.get_holding(1, 1), Some(7));
}

/// End to end: telemetry ingress, one regulator tick, plane reflection,
/// SCADA read. Property 5's freshness bound holds trivially because the
/// sweep runs synchronously here.
#[tokio::test]
async fn telemetry_to_modbus_path() {
    let h = harness(&[1]);
    let clock = Arc::new(FixedClock::new(12, 10_000));
    let router = IngressRouter::new(
        TopicIndex::from_registry(&h.registry),
        Arc::clone(&h.store),
        clock.clone(),
    );

    router.route("plant/dev1/temp", b"16.0");
    h.store.set_setpoint("dev1", 22.0);
    h.store.enable_auto("dev1");

    let device = h.registry.get("dev1").unwrap().clone();
    let mut regulator = Regulator::new(device, Arc::clone(&h.ctx), clock);
    regulator.tick().await;

    sweep_all(&h.plane, &h.store, &h.registry);

    let read = h
        .handler
        .handle(
            &header(1),
            Request::ReadInputRegisters {
                addr: 0,
                quantity: 5,
            },
        )
        .unwrap();
    let Response::Registers { values, .. } = read else {
        panic!("expected register response");
    };
    assert_eq!(values[0], 160);
    assert!(values[1] > 0, "fan should be running");
    assert_eq!(values[2], 1, "December: valve open");
    // Status word: online, working, pid active, valve open.
    assert_eq!(values[4] & 0b1001_0011, 0b1001_0011);

    // The fan command went out on the bus as an integer.
    assert!(h.bus.last_published("plant/dev1/fan").is_some());
    assert_eq!(h.bus.last_published("plant/dev1/valve").as_deref(), Some("1"));
}

/// Emergency stop through the command queue forces the status word and
/// coil into their safe state.
#[tokio::test]
async fn emergency_via_command_queue_reflects_in_plane() {
    let h = harness(&[1]);
    h.store.enable_auto("dev1");

    h.commands.send(heatbridge::command::CommandEnvelope {
        device_id: "dev1".to_string(),
        command: heatbridge::command::Command::EmergencyStop,
        source: heatbridge::command::CommandSource::Http,
    });

    let store = Arc::clone(&h.store);
    wait_until("emergency latched", move || {
        store.read("dev1").unwrap().emergency_stop
    })
    .await;

    sweep_all(&h.plane, &h.store, &h.registry);
    let read = h
        .handler
        .handle(
            &header(1),
            Request::ReadInputRegisters {
                addr: 4,
                quantity: 1,
            },
        )
        .unwrap();
    let Response::Registers { values, .. } = read else {
        panic!("expected register response");
    };
    // Emergency bit set, working and pid-active clear.
    assert_ne!(values[0] & (1 << 2), 0);
    assert_eq!(values[0] & (1 << 1), 0);
    assert_eq!(values[0] & (1 << 4), 0);
}
