#![doc = include_str ! ("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

mod append;
pub mod error;
mod get;
pub mod platform;
pub mod provider;
mod raw;
mod recovery;
mod registry;
mod ring;
mod scan;
mod set;

pub use get::Get;
pub use raw::{Header, ID_EXTRA_DATA, ID_EXTRA_DATA_TEMP, ID_MAX, Kind};
pub use scan::{LogRecord, ScanAction};
pub use set::Set;

extern crate alloc;

use crate::error::Error;
use crate::platform::Platform;
use crate::provider::{Provider, Providers};
use crate::raw::{FLASH_SECTOR_SIZE, ID_SKIP_DATA, MARKER_SIZE, WORD_SIZE};
use crate::recovery::BlockState;
use crate::registry::Registry;
use crate::ring::BLOCK_SIZE;
use alloc::string::String;
use alloc::vec::Vec;

#[derive(Debug, Clone, PartialEq)]
pub struct LogStatistics {
    pub blocks: BlockStatistics,
    pub records_per_block: Vec<RecordStatistics>,
    pub records_overall: RecordStatistics,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BlockStatistics {
    pub empty: u32,
    /// Blocks that still have room behind their last record
    pub active: u32,
    pub full: u32,
    pub corrupted: u32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordStatistics {
    pub settings: u32,
    pub extra: u32,
    pub extra_temp: u32,
    pub tombstoned: u32,
    pub fill: u32,
}

/// The CfgLog struct owns the flash partition and keeps the current value of every indexed
/// setting in memory. Extra data is only ever found by scanning the log.
pub struct CfgLog<T: Platform> {
    pub(crate) hal: T,
    pub(crate) base_address: u32,
    pub(crate) blocks: u32,
    pub(crate) faulted: bool,

    /// Logical address of the oldest record, as stored in the start marker
    pub(crate) start: u32,
    /// Logical address behind the newest record, in `(0, blocks * 4096]`
    pub(crate) cursor: u32,

    pub(crate) settings: Registry,
    pub(crate) defaults: Registry,
}

impl<T: Platform> CfgLog<T> {
    /// Mounts the log in the given partition:
    /// 1. Seeds the settings with the defaults of all providers, earlier providers win
    /// 2. Locates the start marker, checks the integrity of every block if there isn't exactly one
    /// 3. Replays the log, the newest record of a setting wins
    ///
    /// Blocks that can't be explained are erased, a log that can't be repaired is formatted.
    pub fn new(
        partition_offset: usize,
        partition_size: usize,
        hal: T,
        providers: &[&dyn Provider],
    ) -> Result<CfgLog<T>, Error> {
        if !partition_offset.is_multiple_of(FLASH_SECTOR_SIZE) {
            return Err(Error::InvalidPartitionOffset);
        }

        if !partition_size.is_multiple_of(FLASH_SECTOR_SIZE) {
            return Err(Error::InvalidPartitionSize);
        }

        let blocks = partition_size / FLASH_SECTOR_SIZE;
        if blocks < 2 || partition_offset.saturating_add(partition_size) > u32::MAX as usize {
            return Err(Error::InvalidPartitionSize);
        }

        let mut defaults = Registry::new();
        for default in Providers::new(providers).defaults() {
            defaults.seed(default)?;
        }

        let mut log: CfgLog<T> = Self {
            hal,
            base_address: partition_offset as u32,
            blocks: blocks as u32,
            faulted: false,
            start: MARKER_SIZE as u32,
            cursor: MARKER_SIZE as u32,
            settings: defaults.clone(),
            defaults,
        };

        match log.mount() {
            Ok(()) => Ok(log),
            Err(Error::FlashError) => {
                log.faulted = true;
                Err(Error::FlashError)
            }
            Err(e) => Err(e),
        }
    }

    /// Get a value of an indexed setting.
    ///
    /// Supported types are bool (Flag), i32 and u32 (Number), Ipv4Addr (IpAddr), String (Text),
    /// Vec<i32> (NumArray) and Vec<u8> (any blob kind).
    pub fn get<R>(&mut self, id: u8) -> Result<R, Error>
    where
        CfgLog<T>: Get<R>,
    {
        let result = Get::get(self, id);
        self.track(result)
    }

    /// Set a value and append it to the log. Returns the address of the payload.
    ///
    /// Type support:
    ///  * bool, i32, u32, Ipv4Addr: stored as a single word
    ///  * &str, &[u8], &[i32]: up to 255 bytes
    pub fn set<R>(&mut self, id: u8, value: R) -> Result<u32, Error>
    where
        CfgLog<T>: Set<R>,
    {
        self.ensure_healthy()?;
        let result = Set::set(self, id, value);
        self.track(result)
    }

    /// Copies a blob value into `buf` and terminates it with a zero byte. Values that don't fit
    /// are truncated to `buf.len() - 1` bytes. Returns the number of bytes copied, terminator
    /// excluded.
    pub fn get_str(&mut self, id: u8, buf: &mut [u8]) -> Result<usize, Error> {
        let result = self.get_setting_str(id, buf);
        self.track(result)
    }

    /// Scalar value of an indexed setting, 0 if the id is unknown or not a scalar.
    pub fn get_int(&self, id: u8) -> i32 {
        self.get_setting_int(id)
    }

    /// Any setting except structures, rendered as text
    pub fn get_text(&mut self, id: u8) -> Result<String, Error> {
        let result = self.get_setting_text(id);
        self.track(result)
    }

    /// Appends a blob record. `id` is either an indexed setting or one of the extra data ids.
    pub fn save_str(&mut self, id: u8, bytes: &[u8], kind: Kind) -> Result<u32, Error> {
        self.ensure_healthy()?;
        let result = self.save_setting_str(id, bytes, kind);
        self.track(result)
    }

    /// Appends a scalar record.
    pub fn save_int(&mut self, id: u8, value: i32, kind: Kind) -> Result<u32, Error> {
        self.ensure_healthy()?;
        let result = self.save_setting_int(id, value, kind);
        self.track(result)
    }

    /// Converts `text` to `kind` and appends it. Meant to be paired with a keyword lookup:
    ///
    /// ```ignore
    /// let keyword = providers.keyword("mqtt_port").ok_or(Error::NotFound)?;
    /// log.save_text(keyword.id, keyword.kind, "1883")?;
    /// ```
    pub fn save_text(&mut self, id: u8, kind: Kind, text: &str) -> Result<u32, Error> {
        self.ensure_healthy()?;
        let result = self.save_setting_text(id, kind, text);
        self.track(result)
    }

    /// Visits every live record with the given id, oldest first, with its payload and payload
    /// address. Records the visitor asks to invalidate are tombstoned after the scan.
    pub fn scan<F>(&mut self, id: u8, visit: F) -> Result<(), Error>
    where
        F: FnMut(&[u8], u32) -> ScanAction,
    {
        if id == ID_SKIP_DATA {
            return Err(Error::InvalidId(id));
        }
        self.ensure_healthy()?;
        let result = self.scan_records(id, visit);
        self.track(result)
    }

    /// Tombstones the record whose payload starts at `addr`. Tombstoning a record twice is a
    /// no-op.
    pub fn invalidate(&mut self, addr: u32) -> Result<u32, Error> {
        self.ensure_healthy()?;
        let result = self.invalidate_record(addr);
        self.track(result)
    }

    /// Reads from the log's address space, e.g. a payload found by `scan`.
    pub fn raw_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<usize, Error> {
        self.check_address(addr)?;
        let result = self.read(addr, buf);
        self.track(result)
    }

    /// Writes into the log's address space. Flash bits can only be cleared, so this is only
    /// useful to update payloads in place. Returns how far a cursor at `addr` would move.
    pub fn raw_write(&mut self, addr: u32, bytes: &[u8]) -> Result<u32, Error> {
        self.ensure_healthy()?;
        self.check_address(addr)?;
        let result = self.write(addr, bytes);
        self.track(result)
    }

    /// All records of the log, oldest first. Fill records and tombstones included.
    pub fn records(&mut self) -> Result<Vec<LogRecord>, Error> {
        self.ensure_healthy()?;
        let result = self.collect_records();
        self.track(result)
    }

    /// Locates the start of the log. Repairs and remounts the log if the start marker doesn't
    /// match the mounted state.
    pub fn find_log_start(&mut self) -> Result<u32, Error> {
        self.ensure_healthy()?;
        let result = match self.locate_start() {
            Ok(start) if start == self.start => Ok(start),
            Ok(_) => self.mount().map(|()| self.start),
            Err(e) => Err(e),
        };
        self.track(result)
    }

    /// Validates every block, erases what can't be explained and remounts the log. Returns the
    /// address of the oldest record.
    pub fn check_integrity(&mut self) -> Result<u32, Error> {
        self.ensure_healthy()?;
        let result = self.repair().and_then(|start| {
            self.start = start;
            self.replay_or_reset()
        });
        let result = result.map(|()| self.start);
        self.track(result)
    }

    /// Erases the partition. All settings fall back to their defaults.
    pub fn format(&mut self) -> Result<(), Error> {
        self.ensure_healthy()?;
        let result = self.reset();
        self.track(result)
    }

    /// Returns detailed statistics about the usage of the log
    pub fn statistics(&mut self) -> Result<LogStatistics, Error> {
        self.ensure_healthy()?;

        let mut blocks = BlockStatistics::default();
        let mut buf = self.block_buffer()?;
        let mut records_per_block = Vec::with_capacity(self.blocks as usize);
        for block in 0..self.blocks {
            let result = self.read_block(block, &mut buf);
            self.track(result)?;

            let (state, records) = recovery::survey(block * BLOCK_SIZE, &buf);
            match state {
                BlockState::Empty => blocks.empty += 1,
                BlockState::Open { .. } => blocks.active += 1,
                BlockState::Full { .. } => blocks.full += 1,
                BlockState::Invalid => blocks.corrupted += 1,
            }
            records_per_block.push(records);
        }

        let records_overall = records_per_block.iter().fold(
            RecordStatistics::default(),
            |acc, x| RecordStatistics {
                settings: acc.settings + x.settings,
                extra: acc.extra + x.extra,
                extra_temp: acc.extra_temp + x.extra_temp,
                tombstoned: acc.tombstoned + x.tombstoned,
                fill: acc.fill + x.fill,
            },
        );

        Ok(LogStatistics {
            blocks,
            records_per_block,
            records_overall,
        })
    }

    fn ensure_healthy(&self) -> Result<(), Error> {
        match self.faulted {
            true => Err(Error::FlashError),
            false => Ok(()),
        }
    }

    fn track<R>(&mut self, result: Result<R, Error>) -> Result<R, Error> {
        if let Err(Error::FlashError) = result {
            self.faulted = true;
        }
        result
    }

    fn check_address(&self, addr: u32) -> Result<(), Error> {
        if addr >= self.ring_size() || !addr.is_multiple_of(WORD_SIZE as u32) {
            return Err(Error::AddressOutOfRange(addr));
        }
        Ok(())
    }
}
