/// Dataflash status register, read with the 0xD7 command.
#[derive(Copy, Clone, Debug)]
pub struct StatusRegister(pub u8);

impl StatusRegister {
    /// Get RDY bit: set when the device is ready for a flash command.
    pub fn get_ready(&self) -> bool {
        self.0 & 0b1000_0000 != 0
    }

    /// Get COMP bit: result of the last buffer/page compare.
    pub fn get_compare(&self) -> bool {
        self.0 & 0b0100_0000 != 0
    }

    /// Get the density code (bits 5:3), the index into the geometry
    /// lookup table.
    pub fn get_density_code(&self) -> u8 {
        (self.0 & 0b0011_1000) >> 3
    }

    /// Get PROTECT bit: sector protection enabled.
    pub fn get_protect(&self) -> bool {
        self.0 & 0b0000_0010 != 0
    }

    /// Get PAGE SIZE bit: set when the device is strapped to the
    /// power-of-two page size.
    ///
    /// This strapping is one-time-programmable on real parts, so it is
    /// read once at init and never expected to change.
    pub fn get_binary_page_size(&self) -> bool {
        self.0 & 0b0000_0001 != 0
    }
}
