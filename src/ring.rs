//! Byte level access to the log's logical address space: N blocks concatenated to a ring, where
//! the first 8 bytes of every block are reserved for the start marker.

use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{
    ERASED_WORD, FLASH_SECTOR_SIZE, MARKER_SIZE, START_MARKER, WORD_SIZE, read_aligned,
    read_word, write_padded,
};
use crate::{CfgLog, platform::AlignedOps};
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::trace;

pub(crate) const BLOCK_SIZE: u32 = FLASH_SECTOR_SIZE as u32;

impl<T: Platform> CfgLog<T> {
    pub(crate) fn ring_size(&self) -> u32 {
        self.blocks * BLOCK_SIZE
    }

    pub(crate) fn wrap(&self, addr: u32) -> u32 {
        addr % self.ring_size()
    }

    pub(crate) fn block_of(&self, addr: u32) -> u32 {
        self.wrap(addr) / BLOCK_SIZE
    }

    pub(crate) fn next_block(&self, block: u32) -> u32 {
        (block + 1) % self.blocks
    }

    fn physical(&self, addr: u32) -> u32 {
        self.base_address + self.wrap(addr)
    }

    /// Reads `buf.len()` bytes starting at the logical address `addr`. Reads crossing a block
    /// boundary continue behind the reservation of the following block.
    pub(crate) fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<usize, Error> {
        #[cfg(feature = "defmt")]
        trace!("read: @{:#06x}[{}]", addr, buf.len());

        let mut addr = self.wrap(addr);
        let mut done = 0;
        while done < buf.len() {
            let block_end = (addr / BLOCK_SIZE + 1) * BLOCK_SIZE;
            let chunk = (buf.len() - done).min((block_end - addr) as usize);
            let physical = self.physical(addr);
            read_aligned(&mut self.hal, physical, &mut buf[done..done + chunk])
                .map_err(|_| Error::FlashError)?;

            done += chunk;
            addr += chunk as u32;
            if addr == block_end && done < buf.len() {
                addr = self.wrap(addr) + MARKER_SIZE as u32;
            }
        }

        Ok(done)
    }

    /// Writes `bytes` to the logical address `addr` and returns how far a cursor placed at `addr`
    /// has to move: the written length rounded up to full words plus the reservation of every
    /// block entered on the way.
    pub(crate) fn write(&mut self, addr: u32, bytes: &[u8]) -> Result<u32, Error> {
        #[cfg(feature = "defmt")]
        trace!("write: @{:#06x}[{}]", addr, bytes.len());

        #[cfg(feature = "debug-logs")]
        println!("  ring: write {:#06x}[{}]", addr, bytes.len());

        let mut addr = self.wrap(addr);
        let mut done = 0;
        let mut advance = 0;
        while done < bytes.len() {
            let block_end = (addr / BLOCK_SIZE + 1) * BLOCK_SIZE;
            let chunk = (bytes.len() - done).min((block_end - addr) as usize);
            let physical = self.physical(addr);
            write_padded(&mut self.hal, physical, &bytes[done..done + chunk])?;

            let step = T::align_write_ceil(chunk) as u32;
            done += chunk;
            addr += step;
            advance += step;
            if addr == block_end && done < bytes.len() {
                addr = self.wrap(addr) + MARKER_SIZE as u32;
                advance += MARKER_SIZE as u32;
            }
        }

        Ok(advance)
    }

    pub(crate) fn erase_block(&mut self, block: u32) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("erase_block: {}", block);

        #[cfg(feature = "debug-logs")]
        println!("  ring: erase block {block}");

        let from = self.physical(block * BLOCK_SIZE);
        self.hal
            .erase(from, from + BLOCK_SIZE)
            .map_err(|_| Error::FlashError)
    }

    /// The two reserved words at the start of a block
    pub(crate) fn read_reservation(&mut self, block: u32) -> Result<[u32; 2], Error> {
        let mut buf = [0u8; MARKER_SIZE];
        self.read(block * BLOCK_SIZE, &mut buf)?;
        Ok([read_word(&buf, 0), read_word(&buf, WORD_SIZE)])
    }

    pub(crate) fn has_marker(&mut self, block: u32) -> Result<bool, Error> {
        Ok(self.read_reservation(block)?[0] == START_MARKER)
    }

    /// Writes the start marker pointing at `start` into the reservation of `block`.
    pub(crate) fn write_marker(&mut self, block: u32, start: u32) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("write_marker: {} -> {:#06x}", block, start);

        #[cfg(feature = "debug-logs")]
        println!("  ring: marker in block {block} -> {start:#06x}");

        let mut raw = [0u8; MARKER_SIZE];
        raw[..WORD_SIZE].copy_from_slice(&START_MARKER.to_le_bytes());
        raw[WORD_SIZE..].copy_from_slice(&start.to_le_bytes());
        self.write(block * BLOCK_SIZE, &raw)?;
        Ok(())
    }

    /// Allocates a buffer for a full block image. This is the only sizeable allocation of the
    /// log, so it is done fallibly.
    pub(crate) fn block_buffer(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(FLASH_SECTOR_SIZE)
            .map_err(|_| Error::OutOfMemory)?;
        buf.resize(FLASH_SECTOR_SIZE, 0xFF);
        Ok(buf)
    }

    pub(crate) fn read_block(&mut self, block: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.read(block * BLOCK_SIZE, &mut buf[..FLASH_SECTOR_SIZE])?;
        Ok(())
    }

    /// Whether every byte of the block, reservation included, is still erased.
    pub(crate) fn is_blank(&mut self, block: u32) -> Result<bool, Error> {
        self.is_erased_from(block, 0)
    }

    /// Whether the block holds neither a start marker nor records. The start address word may
    /// be set.
    pub(crate) fn is_unused(&mut self, block: u32) -> Result<bool, Error> {
        Ok(self.read_reservation(block)?[0] == ERASED_WORD
            && self.is_erased_from(block, MARKER_SIZE as u32)?)
    }

    fn is_erased_from(&mut self, block: u32, from: u32) -> Result<bool, Error> {
        let mut chunk = [0u8; 64];
        let base = block * BLOCK_SIZE;
        for offset in (from..BLOCK_SIZE).step_by(chunk.len()) {
            let chunk = &mut chunk[..(BLOCK_SIZE - offset).min(64) as usize];
            self.read(base + offset, chunk)?;
            if chunk
                .chunks_exact(WORD_SIZE)
                .any(|word| read_word(word, 0) != ERASED_WORD)
            {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
