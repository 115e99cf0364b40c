// Licensed under the Apache-2.0 and MIT licenses.

//! dataflash
//!
//! This crate provides an append-only storage engine for AT45DB-series
//! SPI dataflash memories, including device identification, the double
//! buffered page write cursor, used-memory discovery, and sector erase.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;
use alloc::vec::Vec;

use core::time::Duration;
#[cfg(feature = "std")]
use indicatif::{ProgressBar, ProgressStyle};

pub mod erase;
pub mod geometry;
pub mod id;
pub mod sreg;

pub use geometry::Geometry;
pub use id::DataflashID;
pub use sreg::StatusRegister;

use erase::SectorEraseCodes;

/// Value the device reads back from erased memory.
pub const ERASED_BYTE: u8 = 0xFF;

/// Number of consecutive erased bytes after the probe address that must be
/// seen before an address is considered part of unwritten memory.
const EMPTY_SIGNATURE_LEN: u32 = 0xFF;

/// JEDEC manufacturer ID for Atmel/Adesto, the dataflash vendor.
const MANUFACTURER_ATMEL: u8 = 0x1F;

/// Family bits of the device ID byte; the density code plus one occupies
/// the low bits.
const DEVICE_FAMILY: u8 = 1 << 5;

/// Default bound on the non-blocking readiness poll during identification.
const DEFAULT_IDENT_READY_POLLS: u32 = 0xFE;

#[cfg(feature = "std")]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Unrecognised manufacturer ID 0x{manufacturer_id:02X}.")]
    InvalidManufacturer { manufacturer_id: u8 },
    #[error("Unexpected device ID 0x{device_id:02X} for density code {density_code}.")]
    InvalidDevice { device_id: u8, density_code: u8 },
    #[error("Density code {density_code} does not match any known geometry.")]
    UnknownGeometry { density_code: u8 },
    #[error("Device did not become ready during identification.")]
    NotReady,
    #[error("Storage engine used before a successful init().")]
    Uninitialised,

    #[error(transparent)]
    Access(#[from] anyhow::Error),
}
#[cfg(not(feature = "std"))]
#[derive(Debug)]
pub enum Error<E> {
    InvalidManufacturer { manufacturer_id: u8 },
    InvalidDevice { device_id: u8, density_code: u8 },
    UnknownGeometry { density_code: u8 },
    NotReady,
    Uninitialised,

    Access(E),
}

#[cfg(feature = "std")]
pub type Result<T> = std::result::Result<T, Error>;
#[cfg(not(feature = "std"))]
pub type Result<T> = core::result::Result<T, Error<()>>;

#[cfg(feature = "std")]
pub type AnyhowResult<T> = anyhow::Result<T>;
#[cfg(not(feature = "std"))]
pub type AnyhowResult<T> = Result<T>;

/// Outcome of an erase pass.
///
/// A user abort between sector erases is a valid early termination, not a
/// failure; cursor and used-memory state are left as of the last completed
/// sector.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EraseStatus {
    Complete,
    Aborted { erased_sectors: u32 },
}

/// Trait for objects which provide access to a dataflash device.
///
/// Unlike generic SPI flash, the dataflash command set relies on open-ended
/// frames (buffer writes and continuous reads stream for as long as chip
/// select stays asserted), so providers expose chip-select framing and a
/// single-byte duplex exchange rather than whole-buffer transfers.
///
/// Providers only need to implement `select()`, `deselect()`, `exchange()`
/// and `sleep()`; the remaining methods are host-service hooks with no-op
/// defaults.
pub trait DataflashAccess {
    /// Assert chip select, starting a new command frame.
    fn select(&mut self) -> AnyhowResult<()>;

    /// Deassert chip select, ending the current command frame.
    ///
    /// Buffered commands (page program, page load, sector erase) are
    /// latched by the device on this edge.
    fn deselect(&mut self) -> AnyhowResult<()>;

    /// Write one byte to the bus while capturing the byte clocked back.
    fn exchange(&mut self, tx: u8) -> AnyhowResult<u8>;

    /// Write one byte to the bus, ignoring the byte clocked back.
    fn write_byte(&mut self, tx: u8) -> AnyhowResult<()> {
        // Default implementation uses `exchange()` and ignores the result.
        self.exchange(tx)?;
        Ok(())
    }

    fn sleep(&mut self, dur: Duration);

    /// Liveness signal, invoked on every busy-wait poll iteration.
    fn feed_watchdog(&mut self) {}

    /// Pulse the device reset line, where the board wires one up.
    fn reset_device(&mut self) -> AnyhowResult<()> {
        Ok(())
    }

    /// Reset any streaming-cipher chaining state.
    ///
    /// Invoked by `seek()` unconditionally: every seek is a new logical
    /// write position and must not continue a chain started elsewhere.
    fn reset_cipher_chain(&mut self) {}

    /// Poll for a pending user abort request, checked between sector
    /// erases.
    fn abort_requested(&mut self) -> AnyhowResult<bool> {
        Ok(false)
    }
}

/// Dataflash storage engine.
///
/// This struct owns the write cursor, the used-memory high-water mark and
/// the double-buffering state, and provides the append/flush/seek/erase
/// operations over a `DataflashAccess` provider. All operations are
/// synchronous with respect to the caller; the only pipelining is the
/// commit-then-continue overlap inside `write()`.
pub struct Dataflash<'a, A: DataflashAccess> {
    access: &'a mut A,

    /// Once identified, ID details are cached.
    id: Option<DataflashID>,

    /// Resolved at init from the density code; read-only thereafter.
    geometry: Option<&'static Geometry>,

    /// True when the device is strapped to the power-of-two page size.
    binary_page_size: bool,

    /// Effective page size in bytes for this session.
    page_size: u32,

    /// Total memory capacity in bytes, pages x page size.
    total_memory: u32,

    /// Logical append position. `current_page` and `current_addr` are
    /// always kept consistent with it; one is never updated without the
    /// others before a flash command is issued.
    current_byte: u32,
    current_page: u32,
    current_addr: u32,

    /// High-water mark of memory known to contain data. Distinct from
    /// `current_byte`: it tracks the furthest point ever written, while
    /// the cursor may sit earlier after a reposition.
    used_memory: u32,

    /// True iff the active SRAM buffer holds bytes not yet committed to
    /// flash; sole gate for whether `flush()` touches the device.
    dirty: bool,

    /// Which of the two on-chip SRAM buffers is active; toggled on every
    /// page commit to double-buffer page programming.
    using_second_buffer: bool,

    powered_on: bool,

    /// When set, used-memory discovery rounds its result up to this block
    /// size so cursor resumption lands on a cipher-block boundary.
    cipher_block_size: Option<u32>,

    /// Bound on the non-blocking readiness poll during identification.
    ident_ready_polls: u32,
}

impl<'a, A: DataflashAccess> Dataflash<'a, A> {
    #[cfg(feature = "std")]
    const DATA_PROGRESS_TPL: &'static str =
        " {msg} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}; {eta_precise})";
    #[cfg(feature = "std")]
    const DATA_PROGRESS_CHARS: &'static str = "=> ";

    /// Create a new Dataflash instance using the given access provider.
    pub fn new(access: &'a mut A) -> Self {
        Dataflash {
            access,
            id: None,
            geometry: None,
            binary_page_size: false,
            page_size: 0,
            total_memory: 0,
            current_byte: 0,
            current_page: 0,
            current_addr: 0,
            used_memory: 0,
            dirty: false,
            using_second_buffer: false,
            powered_on: false,
            cipher_block_size: None,
            ident_ready_polls: DEFAULT_IDENT_READY_POLLS,
        }
    }

    /// Get the block size used-memory discovery rounds up to, if set.
    pub fn cipher_block_size(&self) -> Option<u32> {
        self.cipher_block_size
    }

    /// Set the cipher block size in bytes.
    ///
    /// When upstream writes are enciphered, set this to the cipher's block
    /// size so that the append position recovered at init always lands on
    /// a block boundary.
    pub fn set_cipher_block_size(&mut self, n: u32) {
        assert!(n > 0, "set_cipher_block_size: n must be at least 1");
        self.cipher_block_size = Some(n);
    }

    /// Get the bound on the identification readiness poll.
    pub fn ident_ready_polls(&self) -> u32 {
        self.ident_ready_polls
    }

    /// Set the bound on the identification readiness poll.
    ///
    /// `init()` fails with `Error::NotReady` once this many status polls
    /// have been made without the ready bit being observed.
    pub fn set_ident_ready_polls(&mut self, n: u32) {
        self.ident_ready_polls = n;
    }

    /// Get the total memory capacity in bytes; 0 before `init()`.
    pub fn total_memory(&self) -> u32 {
        self.total_memory
    }

    /// Get the used-memory high-water mark in bytes.
    pub fn used_memory(&self) -> u32 {
        self.used_memory
    }

    /// Get the logical append position in bytes.
    pub fn current_byte(&self) -> u32 {
        self.current_byte
    }

    /// Get the effective page size in bytes for this session; 0 before
    /// `init()`.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Get the resolved device geometry, if `init()` has succeeded.
    pub fn geometry(&self) -> Option<&'static Geometry> {
        self.geometry
    }

    /// Get the device ID, if `init()` has read it.
    pub fn get_id(&self) -> Option<DataflashID> {
        self.id
    }

    /// Check whether the device is powered up.
    pub fn is_powered_on(&self) -> bool {
        self.powered_on
    }

    /// Identify the device and prime the storage engine.
    ///
    /// Reads and validates the identification response, resolves the
    /// geometry from the density code in the status register, derives the
    /// total capacity, discovers the used-memory boundary and seeks to it
    /// so the first `write()` appends after the existing data.
    ///
    /// Callers are expected to retry a bounded number of times with a
    /// short delay on error; persistent storage must not be assumed
    /// usable after the retries are exhausted.
    pub fn init(&mut self) -> Result<&'static Geometry> {
        log::debug!("Initialising dataflash");

        self.access.reset_device()?;
        self.powered_on = true;

        self.reselect()?;
        self.access.write_byte(Command::ReadId.into())?;
        let manufacturer_id = self.access.exchange(0)?;
        let device_id = self.access.exchange(0)?;
        let extended_device_id = self.access.exchange(0)?;
        let _device_string_len = self.access.exchange(0)?;

        // The density lives in the status register, not the ID response.
        let status = self.read_status()?;
        let density_code = status.get_density_code();

        let mut ready = false;
        for _ in 0..self.ident_ready_polls {
            if self.read_status()?.get_ready() {
                ready = true;
                break;
            }
        }
        self.access.deselect()?;
        if !ready {
            log::error!("Device not ready after {} polls", self.ident_ready_polls);
            return Err(Error::NotReady);
        }

        if manufacturer_id != MANUFACTURER_ATMEL {
            log::error!("Unrecognised manufacturer ID 0x{:02X}", manufacturer_id);
            return Err(Error::InvalidManufacturer { manufacturer_id });
        }
        if device_id != DEVICE_FAMILY | (density_code + 1) {
            log::error!(
                "Unexpected device ID 0x{:02X} for density code {}",
                device_id,
                density_code
            );
            return Err(Error::InvalidDevice { device_id, density_code });
        }

        let id = DataflashID {
            manufacturer_id,
            device_id,
            extended_device_id,
            density_code,
        };
        log::debug!("Read ID: {:?}", id);
        self.id = Some(id);

        let geometry = Geometry::from_density_code(density_code)
            .ok_or(Error::UnknownGeometry { density_code })?;
        self.geometry = Some(geometry);
        self.binary_page_size = self.read_status()?.get_binary_page_size();
        self.page_size = geometry.page_size(self.binary_page_size);
        self.total_memory = geometry.total_memory(self.binary_page_size);
        log::debug!(
            "Geometry {}: page size {} ({}), {} pages, {} bytes total",
            geometry.density_name,
            self.page_size,
            if self.binary_page_size { "binary" } else { "native" },
            geometry.pages,
            self.total_memory
        );

        self.used_memory = self.find_used_memory()?;
        log::debug!("Used memory: {} bytes", self.used_memory);

        // Prime the cursor so the first seek() cannot skip the page load
        // (the page index can never match) and cannot flush uninitialised
        // SRAM buffer contents.
        self.current_page = u32::MAX;
        self.dirty = false;
        self.seek(self.used_memory)?;

        Ok(geometry)
    }

    /// Append `data` at the write cursor, staging it through the active
    /// on-chip SRAM buffer.
    ///
    /// The request is truncated to the remaining capacity and the number
    /// of bytes accepted is returned; 0 is a normal outcome once the
    /// medium fills, not an error. A zero-length result performs no
    /// transport exchange.
    ///
    /// Whenever a page fills, the buffer is committed to flash and
    /// streaming continues into the other SRAM buffer without waiting for
    /// the commit to finish; the readiness wait before the next
    /// flash-directed command enforces the ordering.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.geometry.is_none() {
            return Err(Error::Uninitialised);
        }

        let remaining = (self.total_memory - self.current_byte) as usize;
        let length = data.len().min(remaining);
        if length == 0 {
            log::trace!("write: no space left or nothing to write");
            return Ok(0);
        }
        log::trace!(
            "write: {} bytes at byte {} (page {}, offset {})",
            length,
            self.current_byte,
            self.current_page,
            self.current_addr
        );

        self.reselect()?;
        self.open_buffer_write(self.current_addr)?;

        let mut bytes_left = self.page_size - self.current_addr;
        for &byte in &data[..length] {
            self.access.write_byte(byte)?;
            if bytes_left > 1 {
                bytes_left -= 1;
            } else {
                // Page full: commit it and keep streaming into the other
                // buffer while the device programs this one.
                bytes_left = self.page_size;
                self.commit_buffer(self.current_page)?;
                self.using_second_buffer = !self.using_second_buffer;
                self.current_page += 1;
                self.reselect()?;
                self.open_buffer_write(0)?;
            }
        }

        self.current_byte += length as u32;
        self.current_addr = (self.current_addr + length as u32) % self.page_size;
        // An exactly filled page was already committed in the loop.
        self.dirty = self.current_addr != 0;

        self.access.deselect()?;
        Ok(length)
    }

    /// Commit any partially filled page buffer to flash.
    ///
    /// The unwritten tail of the page buffer is padded with the erased
    /// filler byte first, so a later full-page read returns a
    /// deterministic value for untouched bytes. The cursor does not move
    /// and the active buffer does not change; no-op on the device unless
    /// the buffer is dirty.
    pub fn flush(&mut self) -> Result<()> {
        // Publish the high-water mark even when the last write landed
        // exactly on a page boundary and left the buffer clean.
        if self.used_memory < self.current_byte {
            self.used_memory = self.current_byte;
        }

        if !self.dirty {
            return Ok(());
        }
        log::trace!(
            "flush: committing page {} (offset {})",
            self.current_page,
            self.current_addr
        );

        self.pad_buffer_tail()?;
        self.commit_buffer(self.current_page)?;
        self.dirty = false;
        Ok(())
    }

    /// Reposition the write cursor to `offset`.
    ///
    /// Any dirty page buffer is flushed first, so no buffered data is
    /// silently lost. `offset` is clamped to the total capacity, and a
    /// seek past the used-memory mark extends it: a caller deliberately
    /// seeking there intends to treat the region as used. If the target
    /// page differs from the buffered one, its current contents are
    /// loaded into the active SRAM buffer so partial-page writes preserve
    /// the unwritten tail.
    pub fn seek(&mut self, offset: u32) -> Result<()> {
        let geometry = self.geometry.ok_or(Error::Uninitialised)?;
        log::trace!("seek: to byte {}", offset);

        self.flush()?;

        let offset = offset.min(self.total_memory);
        if offset > self.used_memory {
            self.used_memory = offset;
        }

        self.current_byte = offset;
        self.current_addr = offset % self.page_size;
        let new_page = offset / self.page_size;
        if new_page != self.current_page {
            self.current_page = new_page;
            // A seek to exactly the end of memory lands on a page index
            // one past the last page; there is nothing to load there and
            // nothing can be written before the next seek.
            if new_page < geometry.pages as u32 {
                self.load_page(new_page)?;
            }
        }

        // Every seek is a new logical write position; a streaming cipher
        // must not continue its chain from a different one.
        self.access.reset_cipher_chain();
        Ok(())
    }

    /// Erase the used sectors, or every sector when `all` is set.
    ///
    /// See `erase_cb()`.
    pub fn erase(&mut self, all: bool) -> Result<EraseStatus> {
        self.erase_cb(all, |_| {})
    }

    /// Erase the used sectors, or every sector when `all` is set.
    ///
    /// When `all` is false, only the sectors covering `[0, used_memory)`
    /// are erased and the rest of the medium is preserved. The access
    /// provider's abort poll is checked between sectors; on abort the
    /// cursor and used-memory mark are left as of the last completed
    /// sector. On completion the cursor returns to 0 and the used-memory
    /// mark is reset.
    ///
    /// Calls `cb` with the number of sectors erased so far.
    pub fn erase_cb<F: Fn(u32)>(&mut self, all: bool, cb: F) -> Result<EraseStatus> {
        let geometry = self.geometry.ok_or(Error::Uninitialised)?;
        if self.total_memory == 0 || geometry.sectors == 0 {
            return Ok(EraseStatus::Complete);
        }

        // No data may linger in the SRAM buffer: it would be committed
        // into freshly erased memory later.
        self.flush()?;

        let count = self.sectors_to_erase(geometry, all);
        log::debug!("Erasing {} of {} sectors", count, geometry.sectors);

        cb(0);
        for sector in 0..count {
            if self.access.abort_requested()? {
                log::debug!("Erase aborted by user after {} sectors", sector);
                self.access.deselect()?;
                return Ok(EraseStatus::Aborted { erased_sectors: sector });
            }
            self.erase_sector(geometry, sector as u8)?;
            cb(sector + 1);
        }

        self.seek(0)?;
        self.used_memory = self.current_byte;
        log::debug!("Erase complete");
        Ok(EraseStatus::Complete)
    }

    /// Erase the used sectors, or every sector when `all` is set, drawing
    /// a progress bar to the terminal.
    #[cfg(feature = "std")]
    pub fn erase_progress(&mut self, all: bool) -> Result<EraseStatus> {
        let geometry = self.geometry.ok_or(Error::Uninitialised)?;
        let count = if self.total_memory == 0 || geometry.sectors == 0 {
            0
        } else {
            self.sectors_to_erase(geometry, all)
        };
        let pb = ProgressBar::new(count as u64).with_style(
            ProgressStyle::default_bar()
                .template(" {msg} [{bar:40}] {pos}/{len} sectors")
                .progress_chars(Self::DATA_PROGRESS_CHARS),
        );
        pb.set_message("Erasing");
        let result = self.erase_cb(all, |n| pb.set_position(n as u64));
        pb.finish();
        result
    }

    /// Discover the boundary between written and erased memory.
    ///
    /// Binary search over `[0, total_memory)` with an
    /// is-this-region-erased probe; each step costs one streaming read of
    /// a small window, so the whole search is O(log2 n) reads and runs
    /// once per boot. The result is rounded up to the cipher block size
    /// when one is configured.
    pub fn find_used_memory(&mut self) -> Result<u32> {
        if self.geometry.is_none() {
            return Err(Error::Uninitialised);
        }

        let mut start = 0u32;
        let mut stop = self.total_memory;
        let mut addr = 0u32;

        while start != stop {
            let previous = addr;
            addr = start + (stop - start) / 2;
            if addr == previous {
                // Two-element range: the midpoint no longer moves.
                break;
            }
            if self.is_memory_empty(addr)? {
                stop = addr;
            } else {
                start = addr;
            }
        }

        if let Some(block) = self.cipher_block_size {
            let partial = stop % block;
            if partial != 0 {
                stop += block - partial;
            }
        }

        log::debug!("Used-memory boundary: {}", stop);
        Ok(stop)
    }

    /// Start a streaming read at logical byte `addr`.
    ///
    /// After this returns, every `read_byte()` call yields the next
    /// physical byte with no further addressing overhead, until
    /// `end_continuous_read()` closes the frame. This is a read-only side
    /// channel: it does not touch the write cursor, but it must not be
    /// interleaved with buffered writes to the same page without flushing
    /// first.
    pub fn enable_continuous_read(&mut self, addr: u32) -> Result<()> {
        let geometry = self.geometry.ok_or(Error::Uninitialised)?;

        self.wait_ready()?;
        self.reselect()?;
        self.access.write_byte(Command::ContinuousArrayRead.into())?;

        if self.binary_page_size {
            // Binary page sizes pack page and offset into one address.
            self.access.write_byte((addr >> 16) as u8)?;
            self.access.write_byte((addr >> 8) as u8)?;
            self.access.write_byte(addr as u8)?;
        } else {
            let page_bits = geometry.page_bits as u32;
            let page = addr / self.page_size;
            let offset = addr % self.page_size;
            self.access.write_byte((page >> (16 - page_bits)) as u8)?;
            self.access
                .write_byte(((page << (page_bits - 8)) + (offset >> 8)) as u8)?;
            self.access.write_byte(offset as u8)?;
        }

        // One dummy byte initiates the device's internal address pointer.
        self.access.write_byte(0)?;
        Ok(())
    }

    /// Read the next byte of an open continuous-read stream.
    pub fn read_byte(&mut self) -> Result<u8> {
        Ok(self.access.exchange(0)?)
    }

    /// Close an open continuous-read stream.
    pub fn end_continuous_read(&mut self) -> Result<()> {
        Ok(self.access.deselect()?)
    }

    /// Read `length` bytes starting at logical byte `addr` using a single
    /// continuous-read stream.
    pub fn read(&mut self, addr: u32, length: usize) -> Result<Vec<u8>> {
        self.read_cb(addr, length, |_| {})
    }

    /// Read `length` bytes starting at logical byte `addr`, calling `cb`
    /// at regular intervals with the number of bytes read so far.
    pub fn read_cb<F: Fn(usize)>(&mut self, addr: u32, length: usize, cb: F) -> Result<Vec<u8>> {
        self.enable_continuous_read(addr)?;
        let mut data = Vec::with_capacity(length);
        cb(0);
        let result = (|| -> Result<()> {
            for i in 0..length {
                data.push(self.access.exchange(0)?);
                if (i + 1) % 1024 == 0 {
                    cb(i + 1);
                }
            }
            Ok(())
        })();
        self.access.deselect()?;
        result?;
        cb(data.len());
        Ok(data)
    }

    /// Read `length` bytes starting at logical byte `addr`, drawing a
    /// progress bar to the terminal during the read.
    #[cfg(feature = "std")]
    pub fn read_progress(&mut self, addr: u32, length: usize) -> Result<Vec<u8>> {
        let pb = ProgressBar::new(length as u64).with_style(
            ProgressStyle::default_bar()
                .template(Self::DATA_PROGRESS_TPL)
                .progress_chars(Self::DATA_PROGRESS_CHARS),
        );
        pb.set_message("Reading");
        let result = self.read_cb(addr, length, |n| pb.set_position(n as u64));
        pb.finish();
        result
    }

    /// Put the device into deep power down.
    ///
    /// Refused silently while the device is mid-operation: powering down
    /// during an internal transfer would corrupt it. Idempotent.
    pub fn power_down(&mut self) -> Result<()> {
        if !self.powered_on {
            return Ok(());
        }
        if !self.is_ready()? {
            log::debug!("Power down skipped: device busy");
            return Ok(());
        }

        log::debug!("Sending power down command");
        self.reselect()?;
        self.access.write_byte(Command::PowerDown.into())?;
        self.access.deselect()?;
        self.access.sleep(Duration::from_micros(3));
        self.powered_on = false;
        Ok(())
    }

    /// Wake the device from deep power down. Idempotent.
    pub fn power_up(&mut self) -> Result<()> {
        if self.powered_on {
            return Ok(());
        }

        log::debug!("Sending power up command");
        self.reselect()?;
        self.access.write_byte(Command::PowerUp.into())?;
        self.access.deselect()?;
        self.access.sleep(Duration::from_micros(35));
        self.powered_on = true;
        Ok(())
    }

    /// Check whether the device is ready to execute a flash command.
    ///
    /// Buffer reads and writes are accepted even while busy; reads,
    /// page commits, erases and power down are not.
    pub fn is_ready(&mut self) -> Result<bool> {
        self.read_status().map(|status| status.get_ready())
    }

    /// Block until the device reports ready, feeding the watchdog on
    /// every poll.
    ///
    /// There is no timeout: a device that never becomes ready hangs the
    /// caller. This is the engine's only busy wait.
    pub fn wait_ready(&mut self) -> Result<()> {
        while !self.read_status()?.get_ready() {
            self.access.feed_watchdog();
        }
        Ok(())
    }

    /// Read the device status register.
    pub fn read_status(&mut self) -> Result<StatusRegister> {
        self.reselect()?;
        self.access.write_byte(Command::StatusRegister.into())?;
        let status = self.access.exchange(0)?;
        self.access.deselect()?;
        Ok(StatusRegister(status))
    }

    /// Cycle chip select, resetting the device command decoder.
    fn reselect(&mut self) -> Result<()> {
        self.access.deselect()?;
        self.access.select()?;
        Ok(())
    }

    /// Send a buffer-write command header for the active SRAM buffer,
    /// positioned at `addr` within the buffer. Data bytes stream until
    /// the frame ends.
    fn open_buffer_write(&mut self, addr: u32) -> Result<()> {
        let op = if self.using_second_buffer {
            Command::Buf2Write
        } else {
            Command::Buf1Write
        };
        self.access.write_byte(op.into())?;
        self.access.write_byte(0)?;
        self.access.write_byte((addr >> 8) as u8)?;
        self.access.write_byte(addr as u8)?;
        Ok(())
    }

    /// Commit the active SRAM buffer to physical page `page`.
    ///
    /// The program operation is latched when the frame ends and runs
    /// asynchronously; the readiness wait at the start of the next flash
    /// command enforces completion.
    fn commit_buffer(&mut self, page: u32) -> Result<()> {
        log::trace!("commit_buffer({})", page);
        let addr = self.page_command_addr(page);
        let op = if self.using_second_buffer {
            Command::Buf2ToFlash
        } else {
            Command::Buf1ToFlash
        };

        self.wait_ready()?;
        self.reselect()?;
        self.access.write_byte(op.into())?;
        self.access.write_byte((addr >> 8) as u8)?;
        self.access.write_byte(addr as u8)?;
        self.access.write_byte(0)?;
        self.access.deselect()?;
        Ok(())
    }

    /// Load physical page `page` into the active SRAM buffer.
    ///
    /// Not blocking: the transfer is latched when the frame ends, and the
    /// next readiness wait picks up the dependency.
    fn load_page(&mut self, page: u32) -> Result<()> {
        log::trace!("load_page({})", page);
        let addr = self.page_command_addr(page);
        let op = if self.using_second_buffer {
            Command::FlashToBuf2Transfer
        } else {
            Command::FlashToBuf1Transfer
        };

        self.wait_ready()?;
        self.reselect()?;
        self.access.write_byte(op.into())?;
        self.access.write_byte((addr >> 8) as u8)?;
        self.access.write_byte(addr as u8)?;
        self.access.write_byte(0)?;
        self.access.deselect()?;
        Ok(())
    }

    /// Pad the unwritten tail of the active SRAM buffer with the erased
    /// filler byte.
    fn pad_buffer_tail(&mut self) -> Result<()> {
        let remaining = self.page_size - self.current_addr;
        if remaining == 0 {
            return Ok(());
        }

        self.reselect()?;
        self.open_buffer_write(self.current_addr)?;
        for _ in 0..remaining {
            self.access.write_byte(ERASED_BYTE)?;
        }
        self.access.deselect()?;
        Ok(())
    }

    /// Command address field for a page, per the active geometry.
    fn page_command_addr(&self, page: u32) -> u32 {
        let geometry = match self.geometry {
            Some(geometry) => geometry,
            None => return 0,
        };
        if self.binary_page_size {
            page << geometry.addr_shift
        } else {
            page << (geometry.addr_shift + 1)
        }
    }

    /// Minimum number of sectors covering `[0, used_memory)`, or all of
    /// them.
    fn sectors_to_erase(&self, geometry: &Geometry, all: bool) -> u32 {
        let sectors = geometry.sectors as u32;
        if all {
            sectors
        } else {
            // The quotient form can overshoot by one when the medium is
            // completely full.
            sectors.min(1 + self.used_memory / (self.total_memory / sectors))
        }
    }

    /// Erase one sector, issuing both sub-sector commands for sector 0.
    fn erase_sector(&mut self, geometry: &'static Geometry, sector: u8) -> Result<()> {
        log::trace!("erase_sector({})", sector);
        match erase::sector_erase_codes(geometry, self.binary_page_size, sector) {
            SectorEraseCodes::Single(code) => self.issue_sector_erase(code)?,
            SectorEraseCodes::Split(first, second) => {
                self.issue_sector_erase(first)?;
                self.issue_sector_erase(second)?;
            }
        }
        Ok(())
    }

    /// Issue one raw sector-erase command with a precomputed address code.
    fn issue_sector_erase(&mut self, code: u16) -> Result<()> {
        self.wait_ready()?;
        self.reselect()?;
        self.access.write_byte(Command::SectorErase.into())?;
        self.access.write_byte((code >> 8) as u8)?;
        self.access.write_byte(code as u8)?;
        self.access.write_byte(0)?;
        self.access.deselect()?;
        Ok(())
    }

    /// Probe whether `addr` and a following run of bytes are all erased.
    ///
    /// Out-of-range addresses are defined as non-empty so the discovery
    /// search can never treat memory beyond the end as blank.
    fn is_memory_empty(&mut self, addr: u32) -> Result<bool> {
        if addr >= self.total_memory {
            return Ok(false);
        }

        self.enable_continuous_read(addr)?;
        let verdict = self.scan_erased_run(addr);
        self.access.deselect()?;
        verdict
    }

    /// Inspect the first byte of an open stream plus up to the signature
    /// length of subsequent bytes, clamped to the end of memory.
    fn scan_erased_run(&mut self, addr: u32) -> Result<bool> {
        if self.access.exchange(0)? != ERASED_BYTE {
            return Ok(false);
        }
        let run = EMPTY_SIGNATURE_LEN.min(self.total_memory - addr - 1);
        for _ in 0..run {
            if self.access.exchange(0)? != ERASED_BYTE {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Dataflash command opcodes.
///
/// These are taken from the AT45DB161D datasheet and apply across the
/// family. The command protocol is bit-exact to the device's documented
/// instruction set and must stay that way for hardware compatibility.
#[derive(Copy, Clone, Debug, num_enum::IntoPrimitive)]
#[allow(unused)]
#[repr(u8)]
enum Command {
    // Read commands.
    FlashPageRead = 0xD2,
    FlashToBuf1Transfer = 0x53,
    Buf1Read = 0xD4,
    FlashToBuf2Transfer = 0x55,
    Buf2Read = 0xD6,
    StatusRegister = 0xD7,
    ContinuousArrayRead = 0x0B,

    // Program and erase commands.
    AutoPageRewriteBuf1 = 0x58,
    AutoPageRewriteBuf2 = 0x59,
    FlashToBuf1Compare = 0x60,
    FlashToBuf2Compare = 0x61,
    FlashProgBuf1 = 0x82,
    Buf1ToFlashWithErase = 0x83,
    Buf1Write = 0x84,
    FlashProgBuf2 = 0x85,
    Buf2ToFlashWithErase = 0x86,
    Buf2Write = 0x87,
    Buf1ToFlash = 0x88,
    Buf2ToFlash = 0x89,
    PageErase = 0x81,
    BlockErase = 0x50,
    SectorErase = 0x7C,

    // Identification and power management.
    ReadId = 0x9F,
    PowerDown = 0xB9,
    PowerUp = 0xAB,
}
