/// Store the ID read off a dataflash device.
///
/// The manufacturer ID, device ID and extended device ID are read using
/// the 0x9F command; the density code is parsed out of the status
/// register rather than the ID response, because the ID bytes do not
/// distinguish page-size strapping.
#[derive(Copy, Clone, Debug)]
pub struct DataflashID {
    pub manufacturer_id: u8,
    pub device_id: u8,
    pub extended_device_id: u8,
    pub density_code: u8,
}

impl DataflashID {
    /// Look up a manufacturer name from the JEDEC ID.
    #[cfg(feature = "std")]
    pub fn manufacturer_name(&self) -> Option<&'static str> {
        jep106::JEP106Code::new(0, self.manufacturer_id & 0x7F).get()
    }
}

#[cfg(feature = "std")]
impl std::fmt::Display for DataflashID {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mfn = match self.manufacturer_name() {
            Some(mfn) => format!(" ({})", mfn),
            None => "".to_string(),
        };
        write!(
            f,
            "Manufacturer 0x{:02X}{}, Device 0x{:02X}/0x{:02X}, Density code {}",
            self.manufacturer_id, mfn, self.device_id, self.extended_device_id, self.density_code
        )
    }
}
