use bytes::{BufMut, Bytes, BytesMut};
use strum_macros::{Display, FromRepr};

use crate::error::{BusError, Result};

use super::addresses::*;
use super::frame::crc16;


/// Modbus function codes spoken on this bus.
#[derive(Display, FromRepr, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    ReadInputRegisters = 0x04,
    WriteSingleRegister = 0x06,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    /// Function code of the exception reply to this function.
    pub fn exception(self) -> u8 {
        self as u8 | super::frame::EXCEPTION_FLAG
    }
}


/// A request from the master, with register numbers already converted to
/// 0-based protocol addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    ReadInputRegisters {
        slave: u8,
        address: u16,
        count: u16
    },
    WriteSingleRegister {
        slave: u8,
        address: u16,
        value: [u8; 2]
    },
    WriteMultipleRegisters {
        slave: u8,
        address: u16,
        values: Bytes
    }
}

/// Convert a 1-based register number within `base`'s block to a protocol address.
fn protocol_address(register: u16, base: u16) -> Result<u16> {
    register.checked_sub(base)
        .ok_or_else(|| BusError::InvalidRequest(format!("register {register} is below {base}")))
}

impl Request {
    /// Read `count` input registers starting at `start_register` (30001-based).
    pub fn read_input_registers(slave: u8, start_register: u16, count: u16) -> Result<Self> {
        if !(1..=MAX_READ_REGISTERS).contains(&count) {
            return Err(BusError::InvalidRequest(format!(
                "cannot read {count} registers (1 to {MAX_READ_REGISTERS} allowed)"
            )))
        }

        Ok(Self::ReadInputRegisters {
            slave,
            address: protocol_address(start_register, INPUT_REGISTER_BASE)?,
            count
        })
    }

    /// Write one holding register (40001-based).
    pub fn write_single_register(slave: u8, register: u16, value: [u8; 2]) -> Result<Self> {
        Ok(Self::WriteSingleRegister {
            slave,
            address: protocol_address(register, HOLDING_REGISTER_BASE)?,
            value
        })
    }

    /// Write consecutive holding registers (40001-based) from big-endian register values.
    pub fn write_multiple_registers(slave: u8, register: u16, values: &[u8]) -> Result<Self> {
        if values.is_empty() || values.len() % 2 != 0 {
            return Err(BusError::InvalidRequest(format!(
                "register payload must be a whole number of registers, got {} bytes", values.len()
            )))
        }

        let count = values.len() / 2;
        if count > MAX_WRITE_REGISTERS as usize {
            return Err(BusError::InvalidRequest(format!(
                "cannot write {count} registers (at most {MAX_WRITE_REGISTERS} allowed)"
            )))
        }

        Ok(Self::WriteMultipleRegisters {
            slave,
            address: protocol_address(register, HOLDING_REGISTER_BASE)?,
            values: Bytes::copy_from_slice(values)
        })
    }

    pub fn slave(&self) -> u8 {
        match self {
            Request::ReadInputRegisters { slave, .. } |
            Request::WriteSingleRegister { slave, .. } |
            Request::WriteMultipleRegisters { slave, .. } => *slave,
        }
    }

    pub fn function(&self) -> FunctionCode {
        match self {
            Request::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            Request::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Request::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    /// Size of the encoded frame, checksum included.
    pub fn frame_len(&self) -> usize {
        match self {
            Request::ReadInputRegisters { .. } | Request::WriteSingleRegister { .. } => 8,
            Request::WriteMultipleRegisters { values, .. } => 9 + values.len(),
        }
    }

    /// Append the RTU frame for this request to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        let start = dst.len();
        dst.reserve(self.frame_len());

        dst.put_u8(self.slave());
        dst.put_u8(self.function() as u8);

        match self {
            Request::ReadInputRegisters { address, count, .. } => {
                dst.put_u16(*address);
                dst.put_u16(*count);
            },
            Request::WriteSingleRegister { address, value, .. } => {
                dst.put_u16(*address);
                dst.put_slice(value);
            },
            Request::WriteMultipleRegisters { address, values, .. } => {
                dst.put_u16(*address);
                dst.put_u16((values.len() / 2) as u16);
                dst.put_u8(values.len() as u8);
                dst.put_slice(values);
            }
        }

        let checksum = crc16(&dst[start..]);
        dst.put_u16_le(checksum);
    }

    pub fn to_frame(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.frame_len());
        self.encode(&mut buf);
        buf.freeze()
    }
}


pub fn build_read_input_registers(slave: u8, start_register: u16, count: u16) -> Result<Bytes> {
    Ok(Request::read_input_registers(slave, start_register, count)?.to_frame())
}

pub fn build_write_single_register(slave: u8, register: u16, value: [u8; 2]) -> Result<Bytes> {
    Ok(Request::write_single_register(slave, register, value)?.to_frame())
}

pub fn build_write_multiple_registers(slave: u8, register: u16, values: &[u8]) -> Result<Bytes> {
    Ok(Request::write_multiple_registers(slave, register, values)?.to_frame())
}
