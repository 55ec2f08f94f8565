//! Slave side of the adaptor protocol, for bench testing without hardware.

use std::{collections::HashMap, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, TryStreamExt};
use tokio::{io::{AsyncRead, AsyncWrite}, sync::Mutex, time::Instant};
use tokio_util::codec::Framed;
use tracing::{debug, info};

use crate::protocol::{addresses::*, codec::AdaptorCodec, commands::{FunctionCode, Request}, frame::crc16};
use crate::unit::{CapabilityBlock, StatusBlock, Unit, UnitKind};


/// Modbus exception codes
pub const ILLEGAL_FUNCTION: u8 = 0x01;
pub const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
pub const ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Fan, cool, heat, auto and dry modes; 16-32C cooling, 10-30C heating.
pub const AIR_CONDITIONER_CAPABILITIES: CapabilityBlock = [0x08, 0x1f, 16, 32, 10, 30];

/// Fan mode only.
pub const VENTILATION_CAPABILITIES: CapabilityBlock = [0x00, 0x01, 0, 0, 0, 0];


fn input_address(register: u16) -> u16 {
    register - INPUT_REGISTER_BASE
}

fn holding_address(register: u16) -> u16 {
    register - HOLDING_REGISTER_BASE
}


pub struct Adaptor {
    slave: u8,
    input: HashMap<u16, u16>,
    holding: HashMap<u16, u16>,
    kinds: [Option<UnitKind>; UNIT_COUNT],
    fail_next: Option<u8>,
    received: Vec<(Instant, Request)>,
}

impl Default for Adaptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Adaptor {
    /// A ready adaptor with no units connected.
    pub fn new() -> Self {
        let mut input = HashMap::new();

        input.insert(input_address(ADAPTOR_STATUS), 0x0001);
        input.insert(input_address(CONNECTION_STATUS), 0x0000);

        let capability_registers = UNIT_COUNT as u16 * CAPABILITY_REGISTERS_PER_UNIT;
        for i in 0..capability_registers {
            input.insert(input_address(CAPABILITY_FIRST) + i, 0);
        }

        let status_registers = STATUS_PAGES * MAX_READ_REGISTERS;
        for i in 0..status_registers {
            input.insert(input_address(STATUS_FIRST) + i, 0);
        }

        let mut holding = HashMap::new();
        for i in 0..UNIT_COUNT as u16 * CONTROL_REGISTERS_PER_UNIT {
            holding.insert(holding_address(CONTROL_FIRST) + i, 0);
        }

        Self {
            slave: DEFAULT_SLAVE,
            input,
            holding,
            kinds: [None; UNIT_COUNT],
            fail_next: None,
            received: Vec::new()
        }
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.input.insert(input_address(ADAPTOR_STATUS), ready as u16);
    }

    /// Connect a unit to slot `index`.
    pub fn connect(&mut self, index: usize, capabilities: CapabilityBlock, status: StatusBlock) {
        let mask = self.input.entry(input_address(CONNECTION_STATUS)).or_default();
        *mask |= 1 << index;

        let capability = input_address(CAPABILITY_FIRST) + index as u16 * CAPABILITY_REGISTERS_PER_UNIT;
        for (i, pair) in capabilities.chunks_exact(2).enumerate() {
            self.input.insert(capability + i as u16, u16::from_be_bytes([pair[0], pair[1]]));
        }

        let status_address = input_address(STATUS_FIRST) + index as u16 * STATUS_REGISTERS_PER_UNIT;
        for (i, pair) in status.chunks_exact(2).enumerate() {
            self.input.insert(status_address + i as u16, u16::from_be_bytes([pair[0], pair[1]]));
        }

        self.kinds[index] = Some(Unit::new(index as u8, capabilities).kind());
    }

    /// Overwrite one status register of a connected unit, as if the unit changed state by itself.
    pub fn set_status_register(&mut self, index: usize, offset: usize, value: u16) {
        let address = input_address(STATUS_FIRST) + (index * STATUS_REGISTERS_PER_UNIT as usize + offset) as u16;
        self.input.insert(address, value);
    }

    /// Answer the next request with the given exception code.
    pub fn fail_next(&mut self, code: u8) {
        self.fail_next = Some(code);
    }

    /// Every request received so far, with its arrival time.
    pub fn received(&self) -> &[(Instant, Request)] {
        &self.received
    }

    pub fn holding_register(&self, register: u16) -> Option<u16> {
        self.holding.get(&holding_address(register)).copied()
    }

    fn exception(&self, function: FunctionCode, code: u8) -> Bytes {
        respond(&[self.slave, function.exception(), code])
    }

    /// Check a write to `address`, returning the exception code to reply with if it is refused.
    fn check_write(&self, address: u16) -> Result<(), u8> {
        if !self.holding.contains_key(&address) {
            return Err(ILLEGAL_DATA_ADDRESS)
        }

        // ventilation units only accept their first control register
        let unit = (address / CONTROL_REGISTERS_PER_UNIT) as usize;
        let offset = address % CONTROL_REGISTERS_PER_UNIT;

        match self.kinds.get(unit) {
            Some(Some(UnitKind::HeatReclaimVentilation)) if offset > 0 => Err(ILLEGAL_DATA_ADDRESS),
            _ => Ok(())
        }
    }

    fn write(&mut self, address: u16, value: u16) {
        self.holding.insert(address, value);

        // the unit picks up control writes in its status registers
        let unit = address / CONTROL_REGISTERS_PER_UNIT;
        let offset = address % CONTROL_REGISTERS_PER_UNIT;
        let status = input_address(STATUS_FIRST) + unit * STATUS_REGISTERS_PER_UNIT + offset;
        self.input.insert(status, value);
    }

    /// Handle one request. `None` means the request was not addressed to this adaptor.
    pub fn handle(&mut self, request: Request) -> Option<Bytes> {
        self.received.push((Instant::now(), request.clone()));

        if request.slave() != self.slave {
            return None
        }

        let function = request.function();

        if let Some(code) = self.fail_next.take() {
            return Some(self.exception(function, code))
        }

        let response = match request {
            Request::ReadInputRegisters { address, count, .. } => {
                if !(1..=MAX_READ_REGISTERS).contains(&count) {
                    return Some(self.exception(function, ILLEGAL_DATA_VALUE))
                }

                let mut data = BytesMut::with_capacity(count as usize * 2);
                for i in 0..count {
                    match self.input.get(&address.wrapping_add(i)) {
                        Some(value) => data.put_u16(*value),
                        None => return Some(self.exception(function, ILLEGAL_DATA_ADDRESS))
                    }
                }

                let mut frame = vec![self.slave, function as u8, data.len() as u8];
                frame.extend_from_slice(&data);

                respond(&frame)
            },
            Request::WriteSingleRegister { address, value, .. } => {
                if let Err(code) = self.check_write(address) {
                    return Some(self.exception(function, code))
                }

                self.write(address, u16::from_be_bytes(value));

                request.to_frame()
            },
            Request::WriteMultipleRegisters { address, ref values, .. } => {
                let count = (values.len() / 2) as u16;

                if let Some(code) = (0..count).find_map(|i| self.check_write(address.wrapping_add(i)).err()) {
                    return Some(self.exception(function, code))
                }

                for (i, pair) in values.chunks_exact(2).enumerate() {
                    self.write(address + i as u16, u16::from_be_bytes([pair[0], pair[1]]));
                }

                let mut frame = vec![self.slave, function as u8];
                frame.extend_from_slice(&address.to_be_bytes());
                frame.extend_from_slice(&count.to_be_bytes());

                respond(&frame)
            }
        };

        Some(response)
    }
}

fn respond(frame: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(frame.len() + 2);
    buf.put_slice(frame);
    buf.put_u16_le(crc16(frame));
    buf.freeze()
}


/// Answer requests arriving on `port` until it closes.
pub async fn serve<T>(port: T, adaptor: Arc<Mutex<Adaptor>>) -> std::io::Result<()> where
    T: AsyncRead + AsyncWrite + Unpin
{
    let mut framed = Framed::new(port, AdaptorCodec::new());

    while let Some(request) = framed.try_next().await? {
        debug!("request: {request:?}");

        let response = adaptor.lock().await.handle(request);

        if let Some(response) = response {
            framed.send(response).await?;
        }
    }

    info!("master disconnected");

    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{register_data, validate};
    use crate::error::BusError;

    fn status(first: u8) -> StatusBlock {
        [0, first, 0, 2, 0, 250, 0, 0, 0, 230, 0, 0]
    }

    #[test]
    fn test_read_connection_status() {
        let mut adaptor = Adaptor::new();
        adaptor.connect(0, AIR_CONDITIONER_CAPABILITIES, status(1));
        adaptor.connect(9, VENTILATION_CAPABILITIES, status(0));

        let response = adaptor.handle(Request::read_input_registers(1, CONNECTION_STATUS, 1).unwrap()).unwrap();
        let frame = validate(&response).unwrap();

        assert_eq!(register_data(&frame, 1).unwrap(), &[0x02, 0x01]);
    }

    #[test]
    fn test_read_out_of_range() {
        let mut adaptor = Adaptor::new();

        let response = adaptor.handle(Request::read_input_registers(1, 30003, 1).unwrap()).unwrap();
        assert!(matches!(validate(&response), Err(BusError::ExceptionResponse { function: 0x84, code: Some(ILLEGAL_DATA_ADDRESS) })));
    }

    #[test]
    fn test_ventilation_write_refused() {
        let mut adaptor = Adaptor::new();
        adaptor.connect(1, VENTILATION_CAPABILITIES, status(0));

        // 2nd register of unit 1
        let request = Request::write_multiple_registers(1, 40001 + 3, &[0, 1, 0, 2]).unwrap();
        let response = adaptor.handle(request).unwrap();
        assert!(matches!(validate(&response), Err(BusError::ExceptionResponse { function: 0x90, .. })));

        let request = Request::write_multiple_registers(1, 40001 + 3, &[0, 1]).unwrap();
        let response = adaptor.handle(request).unwrap();
        assert!(validate(&response).is_ok());
        assert_eq!(adaptor.holding_register(40004), Some(1));
    }

    #[test]
    fn test_other_slave_ignored() {
        let mut adaptor = Adaptor::new();

        assert!(adaptor.handle(Request::read_input_registers(2, 30001, 1).unwrap()).is_none());
        assert_eq!(adaptor.received().len(), 1);
    }
}
