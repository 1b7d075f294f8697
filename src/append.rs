use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{
    HEADER_SIZE, Header, ID_EXTRA_DATA, Kind, MARKER_SIZE, MAX_RECORD_SIZE, SPI_FLASH_RECORD,
    WORD_SIZE, aligned_payload_len,
};
use crate::ring::BLOCK_SIZE;
use crate::CfgLog;
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::{trace, warn};

/// Largest filler record: the length byte counts the payload only.
const MAX_FILL_SIZE: u32 = 256;

/// Largest record `put` has to stage: a blob of 255 bytes plus its header.
const MAX_STAGED_SIZE: usize = HEADER_SIZE + aligned_payload_len(Kind::Structure, u8::MAX);

/// Room a freshly entered block offers behind its reservation
const BLOCK_ROOM: u32 = BLOCK_SIZE - MARKER_SIZE as u32;

/// A record of the reclaimed block that has to be carried forward.
struct Carry {
    header: Header,
    /// Payload offset inside the block image
    offset: usize,
    /// Setting slot to repoint once the copy is written
    setting: Option<u8>,
    /// Extra data source to tombstone once all copies are written
    source: Option<u32>,
}

/// Everything a reclaim needs, gathered before the first flash write.
struct Reclaim {
    block: u32,
    image: Vec<u8>,
    carry: Vec<Carry>,
    /// Bytes the copies take up
    size: u32,
}

impl<T: Platform> CfgLog<T> {
    /// Appends a record and returns the address of its payload. Rolls over to the next block and
    /// reclaims the oldest one where needed.
    pub(crate) fn append(&mut self, header: Header, payload: &[u8]) -> Result<u32, Error> {
        #[cfg(feature = "defmt")]
        trace!("append: {}", header);

        #[cfg(feature = "debug-logs")]
        println!("  append: {header:?}");

        let total = HEADER_SIZE + aligned_payload_len(header.kind()?, header.len);
        if total > MAX_RECORD_SIZE {
            return Err(Error::ValueTooLong);
        }

        self.reserve(total as u32)?;
        self.put(header, payload)
    }

    /// Bytes left in the block holding the cursor
    pub(crate) fn remaining(&self) -> u32 {
        let block = (self.cursor - 1) / BLOCK_SIZE;
        (block + 1) * BLOCK_SIZE - self.cursor
    }

    /// Makes room for `total` bytes at the cursor. At most one block is rolled over and at most
    /// one block is reclaimed. The flash stays untouched if that isn't enough or if the reclaim
    /// can't be prepared.
    fn reserve(&mut self, total: u32) -> Result<(), Error> {
        if self.remaining() >= total {
            return Ok(());
        }

        let block = (self.cursor - 1) / BLOCK_SIZE;
        let next = self.next_block(block);
        if next == self.block_of(self.start) {
            // the free block invariant has been violated behind our back
            return Err(Error::CorruptedData);
        }

        let oldest = self.next_block(next);
        let reclaim = match self.has_marker(oldest)? {
            true => Some(self.prepare_reclaim(oldest)?),
            false => None,
        };
        let copies = reclaim.as_ref().map_or(0, |r| r.size);
        if copies + total > BLOCK_ROOM {
            #[cfg(feature = "defmt")]
            warn!("no room for {} bytes behind {} bytes of copies", total, copies);

            return Err(Error::FlashFull);
        }

        self.roll(next)?;
        if let Some(reclaim) = reclaim {
            self.carry_forward(reclaim)?;
        }
        Ok(())
    }

    /// Writes a record at the cursor, the caller made sure that it fits into the current block.
    /// Header, payload and zero padding go to the flash as a single write.
    fn put(&mut self, header: Header, payload: &[u8]) -> Result<u32, Error> {
        let kind = header.kind()?;
        let len = match kind.is_scalar() {
            true => WORD_SIZE,
            false => header.len as usize,
        };
        let size = HEADER_SIZE + aligned_payload_len(kind, header.len);

        let mut record = [0u8; MAX_STAGED_SIZE];
        record[..HEADER_SIZE].copy_from_slice(&header.encode());
        record[HEADER_SIZE..HEADER_SIZE + len].copy_from_slice(&payload[..len]);

        let addr = self.cursor;
        let advance = self.write(addr, &record[..size])?;
        self.cursor += advance;
        Ok(self.wrap(addr + HEADER_SIZE as u32))
    }

    /// Closes the current block with filler records and moves the cursor behind the reservation
    /// of `next`.
    fn roll(&mut self, next: u32) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("roll: -> {}", next);

        self.fill(self.cursor, self.remaining())?;

        if !self.is_blank(next)? {
            #[cfg(feature = "defmt")]
            warn!("block {} not erased, erasing it now", next);

            #[cfg(feature = "debug-logs")]
            println!("  append: block {next} not erased");

            self.erase_block(next)?;
        }
        self.cursor = self.first_record_address(next);
        Ok(())
    }

    /// Pads `gap` bytes at `addr` with filler records. Only the headers are written, the padding
    /// itself stays erased.
    fn fill(&mut self, mut addr: u32, mut gap: u32) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("fill: @{:#06x}[{}]", addr, gap);

        while gap > 0 {
            let chunk = gap.min(MAX_FILL_SIZE);
            let header = Header::fill((chunk - HEADER_SIZE as u32) as u8);
            self.write(addr, &header.encode())?;
            addr += chunk;
            gap -= chunk;
        }
        self.cursor = addr;
        Ok(())
    }

    /// Carries the still relevant records of `block` forward to the cursor, erases it and moves
    /// the start marker to the following block.
    pub(crate) fn reclaim(&mut self, block: u32) -> Result<(), Error> {
        let reclaim = self.prepare_reclaim(block)?;
        if reclaim.size > self.remaining() {
            return Err(Error::FlashFull);
        }
        self.carry_forward(reclaim)
    }

    /// Reads `block` and lists what has to survive it: settings stored in the block and
    /// persistent extra data. Temporary extra data is dropped. Doesn't write.
    fn prepare_reclaim(&mut self, block: u32) -> Result<Reclaim, Error> {
        #[cfg(feature = "defmt")]
        trace!("prepare_reclaim: block {}", block);

        let mut image = self.block_buffer()?;
        self.read_block(block, &mut image)?;

        let mut carry: Vec<Carry> = Vec::new();
        for (id, setting) in self.settings.flash_resident() {
            if self.block_of(setting.addr) != block {
                continue;
            }
            carry.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
            carry.push(Carry {
                header: Header::new(id, setting.kind, setting.len),
                offset: (setting.addr % BLOCK_SIZE) as usize,
                setting: Some(id),
                source: None,
            });
        }

        // a damaged tail only costs the extra data behind it
        let records = match self.block_records(block, &image) {
            Ok(records) => records,
            Err(Error::OutOfMemory) => return Err(Error::OutOfMemory),
            Err(_) => {
                #[cfg(feature = "defmt")]
                warn!("block {} is damaged, extra data may be lost", block);
                Vec::new()
            }
        };
        for record in records {
            if record.header.id != ID_EXTRA_DATA || record.header.is_tombstone() {
                continue;
            }
            carry.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
            carry.push(Carry {
                header: record.header,
                offset: (record.addr % BLOCK_SIZE) as usize,
                setting: None,
                source: Some(record.addr),
            });
        }

        let size = carry
            .iter()
            .map(|c| HEADER_SIZE + c.header.payload_len().unwrap_or(0))
            .sum::<usize>() as u32;
        Ok(Reclaim {
            block,
            image,
            carry,
            size,
        })
    }

    /// Writes the copies, tombstones the carried extra data, erases the block and hands the
    /// start marker on.
    fn carry_forward(&mut self, reclaim: Reclaim) -> Result<(), Error> {
        let Reclaim {
            block,
            image,
            carry,
            ..
        } = reclaim;

        #[cfg(feature = "defmt")]
        warn!("reclaim: block {}, {} copies", block, carry.len());

        #[cfg(feature = "debug-logs")]
        println!("  append: reclaim block {block}, {} copies", carry.len());

        for c in &carry {
            let end = c.offset + c.header.payload_len().unwrap_or(0);
            let mut header = c.header;
            header.valid = SPI_FLASH_RECORD;
            let addr = self.put(header, &image[c.offset..end])?;
            if let Some(id) = c.setting {
                self.settings.relocate(id, addr);
            }
        }

        for c in &carry {
            if let Some(source) = c.source {
                self.tombstone(source, &c.header)?;
            }
        }

        self.erase_block(block)?;
        let next = self.next_block(block);
        let start = self.first_record_address(next);
        self.write_marker(next, start)?;
        self.start = start;

        Ok(())
    }
}
