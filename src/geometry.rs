//! Per-density geometry constants for the AT45DB dataflash family.
//!
//! The density code read out of the status register (bits 5:3) indexes a
//! static table of eight device variants; everything the engine needs to
//! address the part is data in that table, so no per-variant dispatch
//! exists anywhere else.

/// Geometry of one dataflash variant, resolved once at init and read-only
/// for the rest of the session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// Marketing density name, e.g. "512K" for the AT45DB011.
    pub density_name: &'static str,
    /// Number of bits in the intra-page address field.
    pub page_bits: u8,
    /// Address shift used to build page-addressed command fields.
    pub addr_shift: u8,
    /// Native (non-power-of-two) page size in bytes.
    pub page_size: u16,
    /// Total page count.
    pub pages: u16,
    /// Number of erase sectors.
    pub sectors: u8,
    /// Erase-code shift for the split sector 0 (sub-sectors 0a/0b).
    pub sector0_erase_shift: u8,
    /// Erase-code shift for every other sector.
    pub sector_erase_shift: u8,
}

/// Lookup table indexed by the density code, covering 512K to 64M parts.
static GEOMETRIES: [Geometry; 8] = [
    Geometry {
        density_name: "512K",
        page_bits: 9,
        addr_shift: 0,
        page_size: 264,
        pages: 256,
        sectors: 4,
        sector0_erase_shift: 4,
        sector_erase_shift: 8,
    },
    Geometry {
        density_name: "1M",
        page_bits: 9,
        addr_shift: 0,
        page_size: 264,
        pages: 512,
        sectors: 4,
        sector0_erase_shift: 4,
        sector_erase_shift: 8,
    },
    Geometry {
        density_name: "2M",
        page_bits: 9,
        addr_shift: 0,
        page_size: 264,
        pages: 1024,
        sectors: 4,
        sector0_erase_shift: 4,
        sector_erase_shift: 8,
    },
    Geometry {
        density_name: "4M",
        page_bits: 9,
        addr_shift: 0,
        page_size: 264,
        pages: 2048,
        sectors: 8,
        sector0_erase_shift: 4,
        sector_erase_shift: 9,
    },
    Geometry {
        density_name: "8M",
        page_bits: 9,
        addr_shift: 0,
        page_size: 264,
        pages: 4096,
        sectors: 16,
        sector0_erase_shift: 4,
        sector_erase_shift: 9,
    },
    Geometry {
        density_name: "16M",
        page_bits: 10,
        addr_shift: 1,
        page_size: 528,
        pages: 4096,
        sectors: 16,
        sector0_erase_shift: 5,
        sector_erase_shift: 10,
    },
    Geometry {
        density_name: "32M",
        page_bits: 10,
        addr_shift: 1,
        page_size: 528,
        pages: 8192,
        sectors: 64,
        sector0_erase_shift: 5,
        sector_erase_shift: 9,
    },
    Geometry {
        density_name: "64M",
        page_bits: 11,
        addr_shift: 2,
        page_size: 1056,
        pages: 8192,
        sectors: 32,
        sector0_erase_shift: 6,
        sector_erase_shift: 11,
    },
];

impl Geometry {
    /// Look up the geometry for a density code read from the status
    /// register.
    pub fn from_density_code(code: u8) -> Option<&'static Geometry> {
        GEOMETRIES.get(code as usize)
    }

    /// Effective page size in bytes.
    ///
    /// Parts strapped to the power-of-two ("binary") page size drop the
    /// extra 8 bytes per 256: `256 << addr_shift` instead of the native
    /// odd size.
    pub fn page_size(&self, binary_page_size: bool) -> u32 {
        if binary_page_size {
            256 << self.addr_shift
        } else {
            self.page_size as u32
        }
    }

    /// Total memory in bytes, pages times effective page size.
    pub fn total_memory(&self, binary_page_size: bool) -> u32 {
        self.pages as u32 * self.page_size(binary_page_size)
    }
}
