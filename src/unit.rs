use packed_struct::prelude::*;
use strum_macros::Display;


/// Raw status registers of one unit: 6 big-endian registers from the 32001+ block.
pub type StatusBlock = [u8; 12];

/// Raw capability registers of one unit: 3 big-endian registers from the 31001+ block.
pub type CapabilityBlock = [u8; 6];


/// Capability registers of a unit.
///
/// Register 1 is a mode bitmask (bit 0 is the least significant bit of the
/// big-endian register, i.e. msb0 bit 15). The temperature limits are whole
/// degrees Celsius.
#[derive(PackedStruct, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[packed_struct(bit_numbering="msb0", size_bytes="6")]
pub struct Capabilities {
    // register 1, high byte

    #[packed_field(bits="0")]
    pub fan_volume: bool,

    #[packed_field(bits="4")]
    pub fan_direction: bool,

    // register 1, low byte

    #[packed_field(bits="11")]
    pub dry_mode: bool,

    #[packed_field(bits="12")]
    pub auto_mode: bool,

    #[packed_field(bits="13")]
    pub heating_mode: bool,

    #[packed_field(bits="14")]
    pub cooling_mode: bool,

    #[packed_field(bits="15")]
    pub fan_mode: bool,

    // registers 2 & 3

    #[packed_field(bytes="2")]
    pub cooling_lower_limit: i8,

    #[packed_field(bytes="3")]
    pub cooling_upper_limit: i8,

    #[packed_field(bytes="4")]
    pub heating_lower_limit: i8,

    #[packed_field(bytes="5")]
    pub heating_upper_limit: i8,
}


#[derive(Display, Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitKind {
    #[strum(serialize = "Air Conditioner")]
    AirConditioner,

    #[strum(serialize = "Heat Reclaim Ventilation")]
    HeatReclaimVentilation,
}

impl UnitKind {
    /// Number of control registers the refresh write-back may touch.
    ///
    /// Writing the 2nd and 3rd registers of a ventilation unit makes the adaptor
    /// answer with an exception.
    pub fn writable_registers(self) -> usize {
        match self {
            UnitKind::AirConditioner => 3,
            UnitKind::HeatReclaimVentilation => 1,
        }
    }
}


/// One present unit behind the adaptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unit {
    index: u8,
    capability_block: CapabilityBlock,
    capabilities: Capabilities,
    status: Option<StatusBlock>,
}

impl Unit {
    pub fn new(index: u8, capability_block: CapabilityBlock) -> Self {
        // every bit pattern of the block is a valid `Capabilities`
        let capabilities = Capabilities::unpack(&capability_block).unwrap_or_default();

        Self {
            index,
            capability_block,
            capabilities,
            status: None
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn capability_block(&self) -> &CapabilityBlock {
        &self.capability_block
    }

    /// Units that can both cool and heat are air conditioners; anything else is ventilation.
    pub fn kind(&self) -> UnitKind {
        if self.capabilities.cooling_mode && self.capabilities.heating_mode {
            UnitKind::AirConditioner
        } else {
            UnitKind::HeatReclaimVentilation
        }
    }

    /// The last status block read from the adaptor, with any writes since applied.
    pub fn status(&self) -> Option<&StatusBlock> {
        self.status.as_ref()
    }

    pub(crate) fn set_status(&mut self, status: StatusBlock) {
        self.status = Some(status);
    }

    /// Patch one register of the status block.
    pub(crate) fn set_register(&mut self, offset: usize, value: [u8; 2]) {
        if let Some(status) = self.status.as_mut() {
            status[offset * 2..offset * 2 + 2].copy_from_slice(&value);
        }
    }

    /// The bytes this unit contributes to a refresh write-back, if its status is known.
    pub fn write_back(&self) -> Option<&[u8]> {
        let len = self.kind().writable_registers() * 2;
        self.status.as_ref().map(|status| &status[..len])
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_unpack() {
        // fan, cool, heat, auto, dry + fan direction + fan volume
        let block = [0x88, 0x1f, 16, 32, 10, 30];
        let unit = Unit::new(3, block);
        let caps = unit.capabilities();

        assert!(caps.fan_mode);
        assert!(caps.cooling_mode);
        assert!(caps.heating_mode);
        assert!(caps.auto_mode);
        assert!(caps.dry_mode);
        assert!(caps.fan_direction);
        assert!(caps.fan_volume);
        assert_eq!(caps.cooling_lower_limit, 16);
        assert_eq!(caps.cooling_upper_limit, 32);
        assert_eq!(caps.heating_lower_limit, 10);
        assert_eq!(caps.heating_upper_limit, 30);

        assert_eq!(unit.index(), 3);
        assert_eq!(unit.kind(), UnitKind::AirConditioner);
    }

    #[test]
    fn test_negative_limits() {
        let unit = Unit::new(0, [0x00, 0x06, 0xfb, 0x00, 0xf6, 0x05]);

        assert_eq!(unit.capabilities().cooling_lower_limit, -5);
        assert_eq!(unit.capabilities().heating_lower_limit, -10);
    }

    #[test]
    fn test_kind() {
        // cooling only
        assert_eq!(Unit::new(0, [0x00, 0x02, 0, 0, 0, 0]).kind(), UnitKind::HeatReclaimVentilation);
        // heating only
        assert_eq!(Unit::new(0, [0x00, 0x04, 0, 0, 0, 0]).kind(), UnitKind::HeatReclaimVentilation);
        // fan only
        assert_eq!(Unit::new(0, [0x00, 0x01, 0, 0, 0, 0]).kind(), UnitKind::HeatReclaimVentilation);
        assert_eq!(Unit::new(0, [0x00, 0x06, 0, 0, 0, 0]).kind(), UnitKind::AirConditioner);
    }

    #[test]
    fn test_write_back() {
        let status = [0, 1, 0, 2, 0, 250, 1, 1, 0, 230, 0, 0];

        let mut ac = Unit::new(0, [0x00, 0x06, 0, 0, 0, 0]);
        assert!(ac.write_back().is_none());

        ac.set_status(status);
        assert_eq!(ac.write_back(), Some(&status[..6]));

        ac.set_register(2, [0x00, 0xf0]);
        assert_eq!(ac.write_back(), Some(&[0, 1, 0, 2, 0, 0xf0][..]));

        let mut hrv = Unit::new(1, [0x00, 0x01, 0, 0, 0, 0]);
        hrv.set_status(status);
        assert_eq!(hrv.write_back(), Some(&status[..2]));
    }
}
