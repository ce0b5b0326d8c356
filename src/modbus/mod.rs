// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

//! Modbus TCP slave: frame codec, register plane, server, and reflector.
//!
//! For avoiding confusion with the Modbus master/slave terminology: the
//! daemon is the slave (it provides data), the SCADA client is the master.

pub mod frame;
pub mod plane;
pub mod server;

pub use frame::{ExceptionCode, MbapHeader, Request, Response};
pub use plane::RegisterPlane;
pub use server::{ModbusHandler, ModbusServer};
