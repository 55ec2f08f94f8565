/// Slave address of the adaptor. There is only ever one on the bus.
pub const DEFAULT_SLAVE: u8 = 1;

/// Number of addressable unit slots behind the adaptor.
pub const UNIT_COUNT: usize = 16;

// input registers (read only, function 0x04)
pub const INPUT_REGISTER_BASE: u16 = 30001;

pub const ADAPTOR_STATUS: u16 = 30001;
pub const CONNECTION_STATUS: u16 = 30002;

/// 3 registers per unit
pub const CAPABILITY_FIRST: u16 = 31001;
pub const CAPABILITY_REGISTERS_PER_UNIT: u16 = 3;
pub const CAPABILITY_UNITS_PER_PAGE: usize = 8;

/// 6 registers per unit
pub const STATUS_FIRST: u16 = 32001;
pub const STATUS_REGISTERS_PER_UNIT: u16 = 6;
pub const STATUS_PAGES: u16 = 3;

// holding registers (function 0x06 / 0x10)
pub const HOLDING_REGISTER_BASE: u16 = 40001;

/// 3 registers per unit
pub const CONTROL_FIRST: u16 = 40001;
pub const CONTROL_REGISTERS_PER_UNIT: u16 = 3;

/// Largest read the adaptor answers in one response.
pub const MAX_READ_REGISTERS: u16 = 32;

/// Largest multi-register write the adaptor accepts.
pub const MAX_WRITE_REGISTERS: u16 = 30;

/// Largest chunk the adaptor emits at a time. A shorter chunk ends a response.
pub const MAX_CHUNK: usize = 32;
