// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

//! Modbus TCP framing
//!
//! MBAP header and PDU encoding/decoding for the slave. The decoder is
//! written directly against the wire format: request validation maps onto
//! the three exception codes the protocol defines, and responses are built
//! with the LSB-first bit packing the Modbus specification requires.
//!
//! Frame layout:
//!
//! ```text
//! | transaction_id u16 | protocol_id u16 = 0 | length u16 | unit_id u8 | fc u8 | data ... |
//! |<-------------------- MBAP (7 bytes) -------------------->|<-------- PDU ------------>|
//! ```
//!
//! All multi-byte integers are big-endian. The `length` field counts the
//! unit id plus the PDU.

use thiserror::Error;

/// MBAP header length including the unit id.
pub const MBAP_HEADER_LEN: usize = 7;

/// Maximum PDU size per the Modbus specification (inherited from the RS485
/// ADU limit of 256 bytes).
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum value of the MBAP length field (unit id + PDU).
pub const MAX_MBAP_LENGTH: u16 = 1 + MAX_PDU_SIZE as u16;

/// Protocol identifier for Modbus TCP.
pub const PROTOCOL_MODBUS_TCP: u16 = 0;

/// Maximum quantity for FC01/FC02.
pub const MAX_READ_BITS: u16 = 2000;

/// Maximum quantity for FC03/FC04.
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum quantity for FC15.
pub const MAX_WRITE_COILS: u16 = 1968;

/// Maximum quantity for FC16.
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Highest unit id the MBAP byte may carry (0 is broadcast).
pub const MAX_UNIT_ID: u8 = 247;

/// Modbus exception codes returned by the slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    /// Function code not supported (01).
    IllegalFunction = 0x01,
    /// Address or span outside the register plane (02).
    IllegalDataAddress = 0x02,
    /// Malformed body or out-of-range value (03).
    IllegalDataValue = 0x03,
}

/// Errors raised while reading an ADU off the stream.
///
/// These poison the framing itself, so the connection is closed rather than
/// answered.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unsupported protocol identifier {0}")]
    BadProtocol(u16),
    #[error("MBAP length {0} outside 2..={MAX_MBAP_LENGTH}")]
    BadLength(u16),
}

/// Parsed MBAP header.
#[derive(Debug, Clone, Copy)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub unit_id: u8,
    /// PDU length in bytes (MBAP length minus the unit id).
    pub pdu_len: usize,
}

impl MbapHeader {
    /// Parse the 7-byte MBAP header.
    pub fn parse(buf: &[u8; MBAP_HEADER_LEN]) -> Result<Self, FrameError> {
        let transaction_id = u16::from_be_bytes([buf[0], buf[1]]);
        let protocol_id = u16::from_be_bytes([buf[2], buf[3]]);
        let length = u16::from_be_bytes([buf[4], buf[5]]);
        let unit_id = buf[6];

        if protocol_id != PROTOCOL_MODBUS_TCP {
            return Err(FrameError::BadProtocol(protocol_id));
        }
        if length < 2 || length > MAX_MBAP_LENGTH {
            return Err(FrameError::BadLength(length));
        }

        Ok(Self {
            transaction_id,
            unit_id,
            pdu_len: (length - 1) as usize,
        })
    }
}

/// A decoded request PDU.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    ReadCoils { addr: u16, quantity: u16 },
    ReadDiscreteInputs { addr: u16, quantity: u16 },
    ReadHoldingRegisters { addr: u16, quantity: u16 },
    ReadInputRegisters { addr: u16, quantity: u16 },
    WriteSingleCoil { addr: u16, value: bool },
    WriteSingleRegister { addr: u16, value: u16 },
    WriteMultipleCoils { addr: u16, values: Vec<bool> },
    WriteMultipleRegisters { addr: u16, values: Vec<u16> },
}

impl Request {
    /// The function code of this request.
    pub fn function_code(&self) -> u8 {
        match self {
            Request::ReadCoils { .. } => 0x01,
            Request::ReadDiscreteInputs { .. } => 0x02,
            Request::ReadHoldingRegisters { .. } => 0x03,
            Request::ReadInputRegisters { .. } => 0x04,
            Request::WriteSingleCoil { .. } => 0x05,
            Request::WriteSingleRegister { .. } => 0x06,
            Request::WriteMultipleCoils { .. } => 0x0F,
            Request::WriteMultipleRegisters { .. } => 0x10,
        }
    }
}

/// A response PDU about to be encoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// FC01/FC02 reply: bits to be packed LSB-first.
    Bits { function: u8, bits: Vec<bool> },
    /// FC03/FC04 reply: register values.
    Registers { function: u8, values: Vec<u16> },
    /// FC05/FC06 reply: echo of address and raw value.
    Echo { function: u8, addr: u16, value: u16 },
    /// FC15/FC16 reply: start address and quantity written.
    WriteMultiple { function: u8, addr: u16, quantity: u16 },
}

/// Failure answered with an exception frame, carrying the function code it
/// belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFault {
    pub function: u8,
    pub code: ExceptionCode,
}

impl RequestFault {
    pub fn new(function: u8, code: ExceptionCode) -> Self {
        Self { function, code }
    }
}

/// Decode a request PDU.
///
/// Unknown function codes map to exception 01, malformed bodies and
/// quantities outside the protocol limits to exception 03.
pub fn decode_request(pdu: &[u8]) -> Result<Request, RequestFault> {
    let function = *pdu.first().unwrap_or(&0);
    let body = &pdu[1.min(pdu.len())..];
    let malformed = RequestFault::new(function, ExceptionCode::IllegalDataValue);

    match function {
        0x01 | 0x02 | 0x03 | 0x04 => {
            if body.len() != 4 {
                return Err(malformed);
            }
            let addr = u16::from_be_bytes([body[0], body[1]]);
            let quantity = u16::from_be_bytes([body[2], body[3]]);
            let limit = if function <= 0x02 {
                MAX_READ_BITS
            } else {
                MAX_READ_REGISTERS
            };
            if quantity == 0 || quantity > limit {
                return Err(malformed);
            }
            Ok(match function {
                0x01 => Request::ReadCoils { addr, quantity },
                0x02 => Request::ReadDiscreteInputs { addr, quantity },
                0x03 => Request::ReadHoldingRegisters { addr, quantity },
                _ => Request::ReadInputRegisters { addr, quantity },
            })
        }
        0x05 => {
            if body.len() != 4 {
                return Err(malformed);
            }
            let addr = u16::from_be_bytes([body[0], body[1]]);
            let raw = u16::from_be_bytes([body[2], body[3]]);
            let value = match raw {
                0xFF00 => true,
                0x0000 => false,
                _ => return Err(malformed),
            };
            Ok(Request::WriteSingleCoil { addr, value })
        }
        0x06 => {
            if body.len() != 4 {
                return Err(malformed);
            }
            let addr = u16::from_be_bytes([body[0], body[1]]);
            let value = u16::from_be_bytes([body[2], body[3]]);
            Ok(Request::WriteSingleRegister { addr, value })
        }
        0x0F => {
            if body.len() < 5 {
                return Err(malformed);
            }
            let addr = u16::from_be_bytes([body[0], body[1]]);
            let quantity = u16::from_be_bytes([body[2], body[3]]);
            let byte_count = body[4] as usize;
            if quantity == 0 || quantity > MAX_WRITE_COILS {
                return Err(malformed);
            }
            if byte_count != (quantity as usize).div_ceil(8) || body.len() != 5 + byte_count {
                return Err(malformed);
            }
            let values = unpack_bits(&body[5..], quantity);
            Ok(Request::WriteMultipleCoils { addr, values })
        }
        0x10 => {
            if body.len() < 5 {
                return Err(malformed);
            }
            let addr = u16::from_be_bytes([body[0], body[1]]);
            let quantity = u16::from_be_bytes([body[2], body[3]]);
            let byte_count = body[4] as usize;
            if quantity == 0 || quantity > MAX_WRITE_REGISTERS {
                return Err(malformed);
            }
            if byte_count != quantity as usize * 2 || body.len() != 5 + byte_count {
                return Err(malformed);
            }
            let values = body[5..]
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            Ok(Request::WriteMultipleRegisters { addr, values })
        }
        _ => Err(RequestFault::new(function, ExceptionCode::IllegalFunction)),
    }
}

/// Encode a complete response ADU.
pub fn encode_response(
    transaction_id: u16,
    unit_id: u8,
    outcome: &Result<Response, RequestFault>,
) -> Vec<u8> {
    let pdu = match outcome {
        Ok(response) => encode_response_pdu(response),
        Err(fault) => vec![fault.function | 0x80, fault.code as u8],
    };

    let mut adu = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    adu.extend_from_slice(&transaction_id.to_be_bytes());
    adu.extend_from_slice(&PROTOCOL_MODBUS_TCP.to_be_bytes());
    adu.extend_from_slice(&((pdu.len() as u16 + 1).to_be_bytes()));
    adu.push(unit_id);
    adu.extend_from_slice(&pdu);
    adu
}

fn encode_response_pdu(response: &Response) -> Vec<u8> {
    match response {
        Response::Bits { function, bits } => {
            let packed = pack_bits(bits);
            let mut pdu = Vec::with_capacity(2 + packed.len());
            pdu.push(*function);
            pdu.push(packed.len() as u8);
            pdu.extend_from_slice(&packed);
            pdu
        }
        Response::Registers { function, values } => {
            let mut pdu = Vec::with_capacity(2 + values.len() * 2);
            pdu.push(*function);
            pdu.push((values.len() * 2) as u8);
            for value in values {
                pdu.extend_from_slice(&value.to_be_bytes());
            }
            pdu
        }
        Response::Echo {
            function,
            addr,
            value,
        } => {
            let mut pdu = Vec::with_capacity(5);
            pdu.push(*function);
            pdu.extend_from_slice(&addr.to_be_bytes());
            pdu.extend_from_slice(&value.to_be_bytes());
            pdu
        }
        Response::WriteMultiple {
            function,
            addr,
            quantity,
        } => {
            let mut pdu = Vec::with_capacity(5);
            pdu.push(*function);
            pdu.extend_from_slice(&addr.to_be_bytes());
            pdu.extend_from_slice(&quantity.to_be_bytes());
            pdu
        }
    }
}

/// Pack bits LSB-first into bytes, as Modbus bit responses require.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; bits.len().div_ceil(8)];
    for (index, &bit) in bits.iter().enumerate() {
        if bit {
            packed[index / 8] |= 1 << (index % 8);
        }
    }
    packed
}

/// Unpack `quantity` LSB-first bits from bytes.
pub fn unpack_bits(bytes: &[u8], quantity: u16) -> Vec<bool> {
    (0..quantity as usize)
        .map(|index| {
            bytes
                .get(index / 8)
                .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mbap_header() {
        let header = MbapHeader::parse(&[0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x02]).unwrap();
        assert_eq!(header.transaction_id, 0x1234);
        assert_eq!(header.unit_id, 2);
        assert_eq!(header.pdu_len, 5);
    }

    #[test]
    fn rejects_bad_protocol_and_length() {
        assert!(matches!(
            MbapHeader::parse(&[0, 1, 0x00, 0x01, 0x00, 0x06, 0x01]),
            Err(FrameError::BadProtocol(1))
        ));
        assert!(matches!(
            MbapHeader::parse(&[0, 1, 0x00, 0x00, 0x00, 0x01, 0x01]),
            Err(FrameError::BadLength(1))
        ));
        assert!(matches!(
            MbapHeader::parse(&[0, 1, 0x00, 0x00, 0x01, 0x00, 0x01]),
            Err(FrameError::BadLength(_))
        ));
    }

    #[test]
    fn decodes_read_requests() {
        // FC03, address 60, quantity 30
        let request = decode_request(&[0x03, 0x00, 0x3C, 0x00, 0x1E]).unwrap();
        assert_eq!(
            request,
            Request::ReadHoldingRegisters {
                addr: 60,
                quantity: 30
            }
        );
        assert_eq!(request.function_code(), 0x03);
    }

    #[test]
    fn rejects_zero_and_oversized_quantity() {
        let fault = decode_request(&[0x04, 0x00, 0x00, 0x00, 0x00]).unwrap_err();
        assert_eq!(fault.code, ExceptionCode::IllegalDataValue);
        let fault = decode_request(&[0x04, 0x00, 0x00, 0x00, 0x7E]).unwrap_err();
        assert_eq!(fault.code, ExceptionCode::IllegalDataValue);
    }

    #[test]
    fn unsupported_function_is_exception_01() {
        let fault = decode_request(&[0x2B, 0x0E, 0x01, 0x00]).unwrap_err();
        assert_eq!(fault.function, 0x2B);
        assert_eq!(fault.code, ExceptionCode::IllegalFunction);
    }

    #[test]
    fn fc05_accepts_only_canonical_values() {
        assert_eq!(
            decode_request(&[0x05, 0x00, 0x10, 0xFF, 0x00]).unwrap(),
            Request::WriteSingleCoil {
                addr: 16,
                value: true
            }
        );
        assert_eq!(
            decode_request(&[0x05, 0x00, 0x10, 0x00, 0x00]).unwrap(),
            Request::WriteSingleCoil {
                addr: 16,
                value: false
            }
        );
        let fault = decode_request(&[0x05, 0x00, 0x10, 0x12, 0x34]).unwrap_err();
        assert_eq!(fault.code, ExceptionCode::IllegalDataValue);
    }

    #[test]
    fn fc15_checks_byte_count() {
        // 3 coils: byte count must be 1
        let request = decode_request(&[0x0F, 0x00, 0x00, 0x00, 0x03, 0x01, 0b0000_0101]).unwrap();
        assert_eq!(
            request,
            Request::WriteMultipleCoils {
                addr: 0,
                values: vec![true, false, true]
            }
        );
        let fault =
            decode_request(&[0x0F, 0x00, 0x00, 0x00, 0x03, 0x02, 0x05, 0x00]).unwrap_err();
        assert_eq!(fault.code, ExceptionCode::IllegalDataValue);
    }

    #[test]
    fn fc16_roundtrips_values() {
        let request =
            decode_request(&[0x10, 0x00, 0x1E, 0x00, 0x02, 0x04, 0x00, 0xE1, 0x01, 0x2C]).unwrap();
        assert_eq!(
            request,
            Request::WriteMultipleRegisters {
                addr: 30,
                values: vec![0x00E1, 0x012C]
            }
        );
    }

    #[test]
    fn encodes_register_response() {
        let adu = encode_response(
            0x0102,
            0x02,
            &Ok(Response::Registers {
                function: 0x03,
                values: vec![225],
            }),
        );
        assert_eq!(
            adu,
            vec![0x01, 0x02, 0x00, 0x00, 0x00, 0x05, 0x02, 0x03, 0x02, 0x00, 0xE1]
        );
    }

    #[test]
    fn encodes_exception_response() {
        let adu = encode_response(
            0x0001,
            0x01,
            &Err(RequestFault::new(0x03, ExceptionCode::IllegalDataAddress)),
        );
        assert_eq!(adu, vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02]);
    }

    #[test]
    fn bit_packing_is_lsb_first() {
        let bits = vec![true, false, true, true, false, false, false, false, true];
        assert_eq!(pack_bits(&bits), vec![0b0000_1101, 0b0000_0001]);
        assert_eq!(unpack_bits(&[0b0000_1101, 0b0000_0001], 9), bits);
    }
}
