// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

//! Modbus TCP slave
//!
//! Accepts any number of concurrent SCADA connections, decodes ADUs with
//! the codec in [`super::frame`], and dispatches them against the register
//! plane. Writes are turned into commands on the command bus, so Modbus
//! mutations travel the same path as every other surface.
//!
//! The effective device is always derived from the register address (flat
//! strided addressing); the MBAP unit byte is validated and echoed, and a
//! mismatch with the derived unit is only logged. This is what the SCADA
//! integration relies on to read the whole plant in one request.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time;

use super::frame::{
    decode_request, encode_response, ExceptionCode, MbapHeader, Request, RequestFault, Response,
    MAX_UNIT_ID, MBAP_HEADER_LEN,
};
use super::plane::{
    BitArea, RegisterArea, RegisterPlane, COIL_AUTO_ENABLED, COIL_MANUAL_OVERRIDE,
    COMMAND_DISABLE_AUTO, COMMAND_ENABLE_AUTO, HR_COMMAND, HR_SETPOINT,
};
use crate::command::{Command, CommandEnvelope, CommandSender, CommandSource};
use crate::registry::DeviceRegistry;
use crate::state::{EventKind, StateStore};

/// Raw setpoint range accepted on the holding register (×10 scaling).
const SETPOINT_RAW_MIN: i16 = 50;
const SETPOINT_RAW_MAX: i16 = 350;

/// Dispatches decoded requests against the register plane and the command
/// bus. Shared by every connection task; request handling never suspends.
pub struct ModbusHandler {
    plane: Arc<RegisterPlane>,
    registry: Arc<DeviceRegistry>,
    commands: CommandSender,
}

impl ModbusHandler {
    pub fn new(
        plane: Arc<RegisterPlane>,
        registry: Arc<DeviceRegistry>,
        commands: CommandSender,
    ) -> Self {
        Self {
            plane,
            registry,
            commands,
        }
    }

    /// Handle one request, producing either a response or an exception.
    pub fn handle(&self, header: &MbapHeader, request: Request) -> Result<Response, RequestFault> {
        if header.unit_id > MAX_UNIT_ID {
            warn!(
                "MBAP unit id {} outside 0..={MAX_UNIT_ID}, resolving by address anyway",
                header.unit_id
            );
        }

        let function = request.function_code();
        let fault = |code| RequestFault::new(function, code);

        match request {
            Request::ReadCoils { addr, quantity } => {
                let bits = self
                    .plane
                    .read_bits(BitArea::Coils, addr, quantity)
                    .map_err(fault)?;
                Ok(Response::Bits { function, bits })
            }
            Request::ReadDiscreteInputs { addr, quantity } => {
                let bits = self
                    .plane
                    .read_bits(BitArea::Discrete, addr, quantity)
                    .map_err(fault)?;
                Ok(Response::Bits { function, bits })
            }
            Request::ReadHoldingRegisters { addr, quantity } => {
                let values = self
                    .plane
                    .read_registers(RegisterArea::Holding, addr, quantity)
                    .map_err(fault)?;
                Ok(Response::Registers { function, values })
            }
            Request::ReadInputRegisters { addr, quantity } => {
                let values = self
                    .plane
                    .read_registers(RegisterArea::Input, addr, quantity)
                    .map_err(fault)?;
                Ok(Response::Registers { function, values })
            }
            Request::WriteSingleCoil { addr, value } => {
                self.write_coil(function, header, addr, value)?;
                Ok(Response::Echo {
                    function,
                    addr,
                    value: if value { 0xFF00 } else { 0x0000 },
                })
            }
            Request::WriteSingleRegister { addr, value } => {
                self.write_holding(function, header, addr, value)?;
                Ok(Response::Echo {
                    function,
                    addr,
                    value,
                })
            }
            Request::WriteMultipleCoils { addr, values } => {
                let quantity = values.len() as u16;
                self.plane.check_bit_span(addr, quantity).map_err(fault)?;
                for (offset, &value) in values.iter().enumerate() {
                    self.write_coil(function, header, addr + offset as u16, value)?;
                }
                Ok(Response::WriteMultiple {
                    function,
                    addr,
                    quantity,
                })
            }
            Request::WriteMultipleRegisters { addr, values } => {
                let quantity = values.len() as u16;
                self.plane
                    .check_register_span(RegisterArea::Holding, addr, quantity)
                    .map_err(fault)?;
                for (offset, &value) in values.iter().enumerate() {
                    self.write_holding(function, header, addr + offset as u16, value)?;
                }
                Ok(Response::WriteMultiple {
                    function,
                    addr,
                    quantity,
                })
            }
        }
    }

    fn device_for_unit(&self, unit_id: u8) -> Option<&str> {
        self.registry
            .get_by_unit(unit_id)
            .map(|d| d.device_id.as_str())
    }

    fn note_unit_mismatch(&self, header: &MbapHeader, derived_unit: u8) {
        if header.unit_id != 0 && header.unit_id != derived_unit {
            debug!(
                "MBAP unit {} differs from address-derived unit {derived_unit}, using derived",
                header.unit_id
            );
        }
    }

    fn send_command(&self, unit_id: u8, command: Command) {
        let Some(device_id) = self.device_for_unit(unit_id) else {
            // The plane resolved the address, so the unit is mapped; a miss
            // here means the registry and plane disagree.
            error!("no device behind mapped unit {unit_id}");
            return;
        };
        self.commands.send(CommandEnvelope {
            device_id: device_id.to_string(),
            command,
            source: CommandSource::Modbus,
        });
    }

    fn write_coil(
        &self,
        function: u8,
        header: &MbapHeader,
        addr: u16,
        value: bool,
    ) -> Result<(), RequestFault> {
        let (unit_id, bit) = self
            .plane
            .resolve_bit(addr)
            .map_err(|code| RequestFault::new(function, code))?;
        self.note_unit_mismatch(header, unit_id);

        self.plane.set_coil(unit_id, bit, value);
        match bit {
            COIL_AUTO_ENABLED => {
                let command = if value {
                    Command::EnableAuto
                } else {
                    Command::DisableAuto
                };
                self.send_command(unit_id, command);
            }
            COIL_MANUAL_OVERRIDE => {
                info!("unit {unit_id}: manual override coil is reserved, write ignored");
            }
            _ => {}
        }
        Ok(())
    }

    fn write_holding(
        &self,
        function: u8,
        header: &MbapHeader,
        addr: u16,
        value: u16,
    ) -> Result<(), RequestFault> {
        let (unit_id, rel) = self
            .plane
            .resolve_register(RegisterArea::Holding, addr)
            .map_err(|code| RequestFault::new(function, code))?;
        self.note_unit_mismatch(header, unit_id);

        match rel {
            HR_SETPOINT => {
                let raw = value as i16;
                if !(SETPOINT_RAW_MIN..=SETPOINT_RAW_MAX).contains(&raw) {
                    warn!(
                        "unit {unit_id}: setpoint write {raw} outside {SETPOINT_RAW_MIN}..={SETPOINT_RAW_MAX}"
                    );
                    return Err(RequestFault::new(function, ExceptionCode::IllegalDataValue));
                }
                self.plane.set_holding(unit_id, rel, value);
                self.send_command(unit_id, Command::SetTemperature(raw as f32 / 10.0));
            }
            HR_COMMAND => {
                if value & !(COMMAND_ENABLE_AUTO | COMMAND_DISABLE_AUTO) != 0 {
                    warn!("unit {unit_id}: malformed command word 0x{value:04X}");
                    return Err(RequestFault::new(function, ExceptionCode::IllegalDataValue));
                }
                // Disable wins when both bits are set; zero is a no-op. The
                // register always reads back zero after dispatch.
                if value & COMMAND_DISABLE_AUTO != 0 {
                    self.send_command(unit_id, Command::DisableAuto);
                } else if value & COMMAND_ENABLE_AUTO != 0 {
                    self.send_command(unit_id, Command::EnableAuto);
                }
                self.plane.set_holding(unit_id, rel, 0);
            }
            _ => {
                self.plane.set_holding(unit_id, rel, value);
            }
        }
        Ok(())
    }
}

/// The Modbus TCP slave: accept loop plus one task per connection.
pub struct ModbusServer {
    handler: Arc<ModbusHandler>,
    idle_timeout: Duration,
}

impl ModbusServer {
    pub fn new(handler: Arc<ModbusHandler>, idle_timeout: Duration) -> Self {
        Self {
            handler,
            idle_timeout,
        }
    }

    /// Bind the listen socket. Failing to bind is fatal for the daemon.
    pub async fn bind(address: &str, port: u16) -> Result<TcpListener> {
        TcpListener::bind((address, port))
            .await
            .with_context(|| format!("failed to bind Modbus listener on {address}:{port}"))
    }

    /// Run the accept loop until the running flag drops.
    pub async fn serve(self, listener: TcpListener, running: Arc<AtomicBool>) -> Result<()> {
        info!(
            "Modbus slave listening on {}",
            listener.local_addr().map_or_else(
                |_| "<unknown>".to_string(),
                |addr| addr.to_string()
            )
        );

        while running.load(Ordering::Relaxed) {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Modbus client connected from {peer}");
                        let handler = Arc::clone(&self.handler);
                        let idle_timeout = self.idle_timeout;
                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_connection(stream, handler, idle_timeout).await
                            {
                                debug!("Modbus connection from {peer} ended: {e:#}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("Modbus accept failed: {e}");
                        time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = time::sleep(Duration::from_secs(1)) => {
                    // Wake up to observe the running flag.
                }
            }
        }

        info!("Modbus slave shutting down");
        Ok(())
    }
}

/// Serve one client connection: read ADUs, answer in request order.
///
/// The socket closes on idle timeout, on a clean remote close, and on a
/// header so damaged that the stream framing is lost. Request-level faults
/// are answered with exception frames and the socket stays open.
async fn handle_connection(
    mut stream: TcpStream,
    handler: Arc<ModbusHandler>,
    idle_timeout: Duration,
) -> Result<()> {
    let mut header_buf = [0u8; MBAP_HEADER_LEN];

    loop {
        match time::timeout(idle_timeout, stream.read_exact(&mut header_buf)).await {
            Err(_) => {
                debug!("Modbus connection idle for {idle_timeout:?}, closing");
                return Ok(());
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Ok(Err(e)) => return Err(e).context("MBAP header read failed"),
            Ok(Ok(_)) => {}
        }

        let header = match MbapHeader::parse(&header_buf) {
            Ok(header) => header,
            Err(e) => {
                warn!("unrecoverable ADU framing error: {e}");
                return Ok(());
            }
        };

        let mut pdu = vec![0u8; header.pdu_len];
        match time::timeout(idle_timeout, stream.read_exact(&mut pdu)).await {
            Err(_) => {
                debug!("Modbus connection idle mid-frame, closing");
                return Ok(());
            }
            Ok(result) => {
                result.context("PDU read failed")?;
            }
        }

        let outcome = decode_request(&pdu).and_then(|request| handler.handle(&header, request));
        if let Err(fault) = &outcome {
            debug!(
                "request tid={} answered with exception {:?}",
                header.transaction_id, fault.code
            );
        }

        let response = encode_response(header.transaction_id, header.unit_id, &outcome);
        stream
            .write_all(&response)
            .await
            .context("response write failed")?;
    }
}

/// Spawn the event-driven reflector keeping the plane in step with state.
///
/// Each state event rewrites the affected device's slices. A lagged
/// subscription falls back to a full sweep, and the companion 1 Hz sweep
/// task bounds divergence when events are lost entirely.
pub fn spawn_reflector(
    plane: Arc<RegisterPlane>,
    store: Arc<StateStore>,
    registry: Arc<DeviceRegistry>,
    running: Arc<AtomicBool>,
) -> JoinHandle<Result<()>> {
    let mut events = store.subscribe();
    tokio::spawn(async move {
        info!("Modbus reflector started");
        while running.load(Ordering::Relaxed) {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        // PidTick carries no register payload of its own;
                        // the tick's shadow changes arrive as separate
                        // events.
                        if event.kind == EventKind::PidTick {
                            continue;
                        }
                        reflect_device(&plane, &store, &registry, &event.device_id);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("reflector lagged {missed} events, resweeping all devices");
                        sweep_all(&plane, &store, &registry);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = time::sleep(Duration::from_secs(1)) => {
                    // Wake up to observe the running flag.
                }
            }
        }
        debug!("Modbus reflector stopping");
        Ok(())
    })
}

/// Spawn the 1 Hz sweep reasserting every device slice.
pub fn spawn_plane_sweep(
    plane: Arc<RegisterPlane>,
    store: Arc<StateStore>,
    registry: Arc<DeviceRegistry>,
    running: Arc<AtomicBool>,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(1));
        while running.load(Ordering::Relaxed) {
            interval.tick().await;
            sweep_all(&plane, &store, &registry);
        }
        Ok(())
    })
}

fn reflect_device(
    plane: &RegisterPlane,
    store: &StateStore,
    registry: &DeviceRegistry,
    device_id: &str,
) {
    let Some(device) = registry.get(device_id) else {
        return;
    };
    if let Some(snapshot) = store.read(device_id) {
        plane.apply_snapshot(device.unit_id, &snapshot);
    }
}

/// Rewrite every device slice from the current state.
pub fn sweep_all(plane: &RegisterPlane, store: &StateStore, registry: &DeviceRegistry) {
    for device in registry.iter() {
        if let Some(snapshot) = store.read(&device.device_id) {
            plane.apply_snapshot(device.unit_id, &snapshot);
        }
    }
}
