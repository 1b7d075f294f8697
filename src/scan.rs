use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{
    HEADER_SIZE, Header, ID_EXTRA_DATA, ID_EXTRA_DATA_TEMP, ID_MAX, MARKER_SIZE, WORD_SIZE,
    read_word,
};
use crate::ring::BLOCK_SIZE;
use crate::{CfgLog, RecordStatistics};
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::trace;

/// What a `scan` visitor wants to happen to the record it was shown.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScanAction {
    Keep,
    /// Tombstone the record once the scan is complete.
    Invalidate,
}

/// A record as found on the flash.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LogRecord {
    /// Logical address of the payload, the same address `save_*` returned for it.
    pub addr: u32,
    pub header: Header,
}

/// A record inside a block image handed to a walker.
pub(crate) struct Record<'a> {
    pub(crate) header: Header,
    /// Logical payload address
    pub(crate) addr: u32,
    /// Payload, padded to full words
    pub(crate) payload: &'a [u8],
}

pub(crate) enum Step {
    Record { offset: usize, header: Header },
    /// Offset of the end-of-list sentinel
    Sentinel(usize),
    BlockEnd,
}

/// Decodes the next record of a block image, starting at `offset` and skipping filler words. On
/// success `offset` points behind the returned record.
pub(crate) fn step(buf: &[u8], offset: &mut usize) -> Result<Step, Error> {
    while *offset < buf.len() {
        let header = Header::from_word(read_word(buf, *offset));
        if header.is_sentinel() {
            return Ok(Step::Sentinel(*offset));
        }
        if header.is_filler() {
            *offset += WORD_SIZE;
            continue;
        }

        if !header.is_live() {
            return Err(Error::CorruptedData);
        }
        let len = header.record_len().ok_or(Error::CorruptedData)?;
        if *offset + len > buf.len() {
            return Err(Error::CorruptedData);
        }

        let at = *offset;
        *offset += len;
        return Ok(Step::Record { offset: at, header });
    }
    Ok(Step::BlockEnd)
}

impl RecordStatistics {
    pub(crate) fn count(&mut self, header: &Header) {
        if header.is_fill_record() {
            self.fill += 1;
        } else if header.is_tombstone() {
            self.tombstoned += 1;
        } else if header.id < ID_MAX {
            self.settings += 1;
        } else if header.id == ID_EXTRA_DATA {
            self.extra += 1;
        } else if header.id == ID_EXTRA_DATA_TEMP {
            self.extra_temp += 1;
        }
    }
}

impl<T: Platform> CfgLog<T> {
    /// Walks all records from `start` to the end-of-list sentinel and returns the sentinel's
    /// address. Fill records and tombstones are passed to `visit` as well.
    pub(crate) fn walk<F>(&mut self, start: u32, mut visit: F) -> Result<u32, Error>
    where
        F: FnMut(&Record) -> Result<(), Error>,
    {
        #[cfg(feature = "defmt")]
        trace!("walk: from {:#06x}", start);

        let start = self.wrap(start);
        let start_block = start / BLOCK_SIZE;
        let mut offset = (start % BLOCK_SIZE) as usize;
        if offset < MARKER_SIZE {
            return Err(Error::CorruptedData);
        }

        let mut buf = self.block_buffer()?;
        let mut block = start_block;
        loop {
            self.read_block(block, &mut buf)?;
            self.hal.feed();

            loop {
                match step(&buf, &mut offset)? {
                    Step::Sentinel(at) => return Ok(block * BLOCK_SIZE + at as u32),
                    Step::BlockEnd => break,
                    Step::Record { offset: at, header } => {
                        let payload_at = at + HEADER_SIZE;
                        visit(&Record {
                            header,
                            addr: block * BLOCK_SIZE + payload_at as u32,
                            payload: &buf[payload_at..offset],
                        })?;
                        self.hal.feed();
                    }
                }
            }

            block = self.next_block(block);
            if block == start_block {
                // the chain of full blocks closed the ring, there is no room for a sentinel
                return Err(Error::CorruptedData);
            }
            offset = MARKER_SIZE;
        }
    }

    pub(crate) fn scan_records<F>(&mut self, id: u8, mut visit: F) -> Result<(), Error>
    where
        F: FnMut(&[u8], u32) -> ScanAction,
    {
        #[cfg(feature = "defmt")]
        trace!("scan_records: {:#04x}", id);

        let mut doomed: Vec<(u32, Header)> = Vec::new();
        self.walk(self.start, |record| {
            let header = &record.header;
            if header.id != id || header.is_tombstone() {
                return Ok(());
            }

            let len = match header.kind()?.is_scalar() {
                true => record.payload.len(),
                false => header.len as usize,
            };
            if visit(&record.payload[..len], record.addr) == ScanAction::Invalidate {
                doomed
                    .try_reserve(1)
                    .map_err(|_| Error::OutOfMemory)?;
                doomed.push((record.addr, record.header));
            }
            Ok(())
        })?;

        let mut rebuild = false;
        for (addr, header) in doomed {
            self.tombstone(addr, &header)?;
            rebuild |= self.settings.points_to(header.id, addr);
        }
        if rebuild {
            self.replay()?;
        }

        Ok(())
    }

    pub(crate) fn collect_records(&mut self) -> Result<Vec<LogRecord>, Error> {
        let mut records = Vec::new();
        self.walk(self.start, |record| {
            records.push(LogRecord {
                addr: record.addr,
                header: record.header,
            });
            Ok(())
        })?;
        Ok(records)
    }

    /// Walks a single block image the way `walk` does and returns the records that belong to
    /// the log. Used where the record boundaries of one block are needed without the rest of
    /// the chain.
    pub(crate) fn block_records(&self, block: u32, buf: &[u8]) -> Result<Vec<LogRecord>, Error> {
        let mut offset = self.first_record_offset(block);
        let mut records = Vec::new();
        while let Step::Record { offset: at, header } = step(buf, &mut offset)? {
            records.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
            records.push(LogRecord {
                addr: block * BLOCK_SIZE + (at + HEADER_SIZE) as u32,
                header,
            });
        }
        Ok(records)
    }

    /// Records of the start block begin where the marker points, in all other blocks right
    /// behind the reservation.
    pub(crate) fn first_record_offset(&self, block: u32) -> usize {
        if block == self.block_of(self.start) {
            (self.start % BLOCK_SIZE) as usize
        } else {
            MARKER_SIZE
        }
    }

    /// Overwrites the header of the record whose payload is at `addr` with its tombstoned form.
    /// Only bits are cleared, the record keeps its length.
    pub(crate) fn tombstone(&mut self, addr: u32, header: &Header) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("tombstone: @{:#06x}", addr);

        #[cfg(feature = "debug-logs")]
        println!("  scan: tombstone {addr:#06x} {header:?}");

        let header_addr = addr - HEADER_SIZE as u32;
        self.write(header_addr, &header.tombstoned().encode())?;
        Ok(())
    }
}
