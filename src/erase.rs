//! Sector-erase command-code computation.
//!
//! The sector-erase instruction takes a 16-bit address code whose sector
//! field position varies per device, and sector 0 is split into two
//! sub-sectors (0a/0b) with a narrower address field than all the others.
//! That split is a quirk of the device family's addressing scheme and has
//! to be reproduced bit for bit. The field layouts, from the datasheets:
//!
//! ```text
//! sector 0a/0b          other sectors
//! ------------          -------------
//! 011 xxxxxPPP PPPPxxxx 011 xxxxxxPP xxxxxxxx  (4 sectors)
//! 021 xxxxxPPP PPPPxxxx 021 xxxxxPPP xxxxxxxx  (8 sectors)
//! 041 xxxxPPPP PPPPxxxx 041 xxxxPPPx xxxxxxxx  (8 sectors)
//! 081 xxxPPPPP PPPPxxxx 081 xxxPPPPx xxxxxxxx  (16 sectors)
//! 161 xxPPPPPP PPPxxxxx 161 xxPPPPxx xxxxxxxx  (16 sectors)
//! 321 xPPPPPPP PPPxxxxx 321 xPPPPPPx xxxxxxxx  (64 sectors)
//! 642 PPPPPPPP PPxxxxxx 642 PPPPPxxx xxxxxxxx  (32 sectors)
//! ```
//!
//! For binary page sizes every shift drops by one bit position.

use crate::geometry::Geometry;

/// Erase command codes covering one logical sector.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SectorEraseCodes {
    /// One command erases the whole sector.
    Single(u16),
    /// Sector 0 takes two commands, one per sub-sector (0a, then 0b).
    Split(u16, u16),
}

/// Compute the erase command code(s) for `sector` on the given geometry.
pub(crate) fn sector_erase_codes(
    geometry: &Geometry,
    binary_page_size: bool,
    sector: u8,
) -> SectorEraseCodes {
    let mut shift = if sector == 0 {
        geometry.sector0_erase_shift
    } else {
        geometry.sector_erase_shift
    };
    if binary_page_size {
        shift -= 1;
    }

    if sector == 0 {
        SectorEraseCodes::Split(0, 1u16 << shift)
    } else {
        SectorEraseCodes::Single((sector as u16) << shift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(code: u8) -> &'static Geometry {
        Geometry::from_density_code(code).unwrap()
    }

    #[test]
    fn sector_zero_is_split_into_two_sub_sectors() {
        // 512K part, native pages: 0a is code 0, 0b is 1 << 4.
        assert_eq!(
            sector_erase_codes(geometry(0), false, 0),
            SectorEraseCodes::Split(0, 0x0010)
        );
        // 16M part: 0b moves up to 1 << 5.
        assert_eq!(
            sector_erase_codes(geometry(5), false, 0),
            SectorEraseCodes::Split(0, 0x0020)
        );
        // 64M part: 1 << 6.
        assert_eq!(
            sector_erase_codes(geometry(7), false, 0),
            SectorEraseCodes::Split(0, 0x0040)
        );
    }

    #[test]
    fn other_sectors_use_the_wide_field() {
        assert_eq!(
            sector_erase_codes(geometry(0), false, 2),
            SectorEraseCodes::Single(2 << 8)
        );
        assert_eq!(
            sector_erase_codes(geometry(4), false, 15),
            SectorEraseCodes::Single(15 << 9)
        );
        assert_eq!(
            sector_erase_codes(geometry(7), false, 31),
            SectorEraseCodes::Single(31 << 11)
        );
    }

    #[test]
    fn binary_page_size_drops_one_bit_position() {
        assert_eq!(
            sector_erase_codes(geometry(0), true, 0),
            SectorEraseCodes::Split(0, 0x0008)
        );
        assert_eq!(
            sector_erase_codes(geometry(0), true, 3),
            SectorEraseCodes::Single(3 << 7)
        );
        assert_eq!(
            sector_erase_codes(geometry(6), true, 63),
            SectorEraseCodes::Single(63 << 8)
        );
    }
}
