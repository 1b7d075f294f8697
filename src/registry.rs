use crate::error::Error;
use crate::platform::Platform;
use crate::provider::{DefaultSetting, Value, parse};
use crate::raw::{
    Header, ID_EXTRA_DATA, ID_EXTRA_DATA_TEMP, ID_MAX, Kind, MARKER_SIZE, MAX_BLOB_SIZE,
    WORD_SIZE, read_word,
};
use crate::ring::BLOCK_SIZE;
use crate::scan::Record;
use crate::CfgLog;
use alloc::borrow::Cow;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use core::net::Ipv4Addr;
#[cfg(feature = "defmt")]
use defmt::{error, trace, warn};

/// Where the current value of a setting lives.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Source {
    /// Compiled in scalar
    Value(u32),
    /// Compiled in blob, borrowed from the provider's table unless it had to be converted
    Blob(Cow<'static, [u8]>),
    /// Payload address of the saved record, scalars are cached
    Flash { addr: u32, value: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Setting {
    pub(crate) kind: Kind,
    pub(crate) len: u8,
    pub(crate) source: Source,
}

impl Setting {
    fn scalar(&self) -> Option<u32> {
        match self.source {
            Source::Value(value) | Source::Flash { value, .. } if self.kind.is_scalar() => {
                Some(value)
            }
            _ => None,
        }
    }
}

/// A setting whose value is stored in the log
pub(crate) struct Resident {
    pub(crate) addr: u32,
    pub(crate) kind: Kind,
    pub(crate) len: u8,
}

/// One slot per indexed setting.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Registry {
    slots: Vec<Option<Setting>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            slots: vec![None; ID_MAX as usize],
        }
    }

    /// Takes over a compiled-in default unless an earlier provider already claimed the id.
    pub(crate) fn seed(&mut self, default: &'static DefaultSetting) -> Result<(), Error> {
        let slot = self
            .slots
            .get_mut(default.id as usize)
            .ok_or(Error::InvalidId(default.id))?;
        if slot.is_some() {
            return Ok(());
        }

        let (len, source) = match parse(default.kind, default.text)? {
            Value::Scalar(value) => (WORD_SIZE as u8, Source::Value(value)),
            Value::Blob(blob) => (blob.len() as u8, Source::Blob(blob)),
        };
        *slot = Some(Setting {
            kind: default.kind,
            len,
            source,
        });
        Ok(())
    }

    pub(crate) fn get(&self, id: u8) -> Option<&Setting> {
        self.slots.get(id as usize).and_then(Option::as_ref)
    }

    pub(crate) fn store(
        &mut self,
        id: u8,
        header: &Header,
        addr: u32,
        value: u32,
    ) -> Result<(), Error> {
        if let Some(slot) = self.slots.get_mut(id as usize) {
            *slot = Some(Setting {
                kind: header.kind()?,
                len: header.len,
                source: Source::Flash { addr, value },
            });
        }
        Ok(())
    }

    /// Replays a record of the log, newer records replace older ones.
    pub(crate) fn apply(&mut self, record: &Record) -> Result<(), Error> {
        let header = &record.header;
        match header.kind()? {
            Kind::FillData => Ok(()),
            kind if kind.is_scalar() => {
                self.store(header.id, header, record.addr, read_word(record.payload, 0))
            }
            _ => self.store(header.id, header, record.addr, 0),
        }
    }

    pub(crate) fn relocate(&mut self, id: u8, to: u32) {
        if let Some(Some(Setting {
            source: Source::Flash { addr, .. },
            ..
        })) = self.slots.get_mut(id as usize)
        {
            *addr = to;
        }
    }

    pub(crate) fn points_to(&self, id: u8, addr: u32) -> bool {
        matches!(
            self.get(id),
            Some(Setting { source: Source::Flash { addr: current, .. }, .. }) if *current == addr
        )
    }

    pub(crate) fn flash_resident(&self) -> impl Iterator<Item = (u8, Resident)> + '_ {
        self.slots.iter().enumerate().filter_map(|(id, slot)| match slot {
            Some(Setting {
                kind,
                len,
                source: Source::Flash { addr, .. },
            }) => Some((
                id as u8,
                Resident {
                    addr: *addr,
                    kind: *kind,
                    len: *len,
                },
            )),
            _ => None,
        })
    }
}

fn check_id(id: u8) -> Result<(), Error> {
    match id {
        id if id < ID_MAX => Ok(()),
        ID_EXTRA_DATA | ID_EXTRA_DATA_TEMP => Ok(()),
        _ => Err(Error::InvalidId(id)),
    }
}

impl<T: Platform> CfgLog<T> {
    /// Establishes the start of the log, replays it and repairs whatever stands in the way.
    pub(crate) fn mount(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("mount");

        self.start = self.locate_start()?;
        match self.replay() {
            Err(Error::CorruptedData) => {}
            other => return other,
        }

        #[cfg(feature = "defmt")]
        warn!("log inconsistent, checking integrity");

        #[cfg(feature = "debug-logs")]
        println!("  registry: log inconsistent, checking integrity");

        self.start = self.repair()?;
        self.replay_or_reset()
    }

    /// Replays a freshly repaired log. Falls back to an empty log if even that fails.
    pub(crate) fn replay_or_reset(&mut self) -> Result<(), Error> {
        match self.replay() {
            Err(Error::CorruptedData) => {
                #[cfg(feature = "defmt")]
                error!("log can't be repaired, starting over");

                #[cfg(feature = "debug-logs")]
                println!("  registry: log can't be repaired, starting over");

                self.reset()
            }
            other => other,
        }
    }

    /// Rebuilds the registry from the defaults and the log, last write wins. Also recomputes
    /// the cursor from the position of the end-of-list sentinel.
    pub(crate) fn replay(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("replay: from {:#06x}", self.start);

        let mut settings = self.defaults.clone();
        let sentinel = self.walk(self.start, |record| {
            if record.header.id < ID_MAX && !record.header.is_tombstone() {
                settings.apply(record)?;
            }
            Ok(())
        })?;

        self.cursor = self.settle(sentinel)?;
        self.settings = settings;

        // the writer entered the block in front of the oldest one, but the oldest one hasn't
        // been reclaimed yet
        let start_block = self.block_of(self.start);
        if self.next_block((self.cursor - 1) / BLOCK_SIZE) == start_block {
            #[cfg(feature = "defmt")]
            warn!("finishing reclaim of block {}", start_block);

            #[cfg(feature = "debug-logs")]
            println!("  registry: finishing reclaim of block {start_block}");

            match self.reclaim(start_block) {
                Err(Error::FlashFull) => {
                    #[cfg(feature = "defmt")]
                    error!("no room to finish the reclaim, dropping block {}", start_block);

                    self.start = self.drop_block(start_block)?;
                    return self.replay();
                }
                other => other?,
            }
        }
        Ok(())
    }

    /// Maps the sentinel's address onto the cursor and verifies that every block between the
    /// cursor and the start of the log is unused.
    fn settle(&mut self, sentinel: u32) -> Result<u32, Error> {
        let start_block = self.block_of(self.start);
        let block = self.block_of(sentinel);

        // a sentinel right behind the reservation means the previous block was completed
        let cursor = match sentinel % BLOCK_SIZE == MARKER_SIZE as u32 && block != start_block {
            true if block == 0 => self.ring_size(),
            true => block * BLOCK_SIZE,
            false => sentinel,
        };

        let mut block = self.next_block((cursor - 1) / BLOCK_SIZE);
        while block != start_block {
            if !self.is_unused(block)? {
                return Err(Error::CorruptedData);
            }
            block = self.next_block(block);
        }

        Ok(cursor)
    }

    /// Erases all blocks and starts an empty log, settings fall back to their defaults.
    pub(crate) fn reset(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        warn!("format");

        for block in 0..self.blocks {
            self.erase_block(block)?;
        }
        let start = self.first_record_address(0);
        self.write_marker(0, start)?;

        self.start = start;
        self.cursor = start;
        self.settings = self.defaults.clone();
        Ok(())
    }

    pub(crate) fn get_setting_str(&mut self, id: u8, buf: &mut [u8]) -> Result<usize, Error> {
        #[cfg(feature = "defmt")]
        trace!("get_setting_str: {:#04x}", id);

        if buf.is_empty() {
            return Err(Error::BufferTooSmall);
        }

        let setting = self.settings.get(id).ok_or(Error::NotFound)?;
        if setting.kind.is_scalar() {
            return Err(Error::KindMismatch(setting.kind));
        }

        let len = (setting.len as usize).min(buf.len() - 1);
        let flash_addr = match &setting.source {
            Source::Flash { addr, .. } => Some(*addr),
            Source::Blob(blob) => {
                buf[..len].copy_from_slice(&blob[..len]);
                None
            }
            Source::Value(_) => return Err(Error::KindMismatch(setting.kind)),
        };
        if let Some(addr) = flash_addr {
            self.read(addr, &mut buf[..len])?;
        }

        buf[len] = 0;
        Ok(len)
    }

    pub(crate) fn get_setting_int(&self, id: u8) -> i32 {
        self.settings
            .get(id)
            .and_then(Setting::scalar)
            .map(u32::cast_signed)
            .unwrap_or(0)
    }

    /// Scalar value of a setting, `kind` has to match the stored kind.
    pub(crate) fn get_scalar(&self, id: u8, kind: Kind) -> Result<u32, Error> {
        let setting = self.settings.get(id).ok_or(Error::NotFound)?;
        if setting.kind != kind {
            return Err(Error::KindMismatch(setting.kind));
        }
        setting.scalar().ok_or(Error::KindMismatch(setting.kind))
    }

    /// Blob value of a setting, `accept` decides which kinds are acceptable.
    pub(crate) fn get_blob(&mut self, id: u8, accept: fn(Kind) -> bool) -> Result<Vec<u8>, Error> {
        #[cfg(feature = "defmt")]
        trace!("get_blob: {:#04x}", id);

        let setting = self.settings.get(id).ok_or(Error::NotFound)?;
        if setting.kind.is_scalar() || !accept(setting.kind) {
            return Err(Error::KindMismatch(setting.kind));
        }

        let mut data = vec![0u8; setting.len as usize];
        let flash_addr = match &setting.source {
            Source::Flash { addr, .. } => Some(*addr),
            Source::Blob(blob) => {
                let len = data.len();
                data.copy_from_slice(&blob[..len]);
                None
            }
            Source::Value(_) => return Err(Error::KindMismatch(setting.kind)),
        };
        if let Some(addr) = flash_addr {
            self.read(addr, &mut data)?;
        }
        Ok(data)
    }

    /// Renders any setting except structures as text, the inverse of `save_setting_text`.
    pub(crate) fn get_setting_text(&mut self, id: u8) -> Result<String, Error> {
        let kind = self.settings.get(id).ok_or(Error::NotFound)?.kind;
        match kind {
            Kind::Text => {
                let data = self.get_blob(id, |kind| kind == Kind::Text)?;
                String::from_utf8(data).map_err(|_| Error::CorruptedData)
            }
            Kind::Number => Ok(self.get_scalar(id, kind)?.cast_signed().to_string()),
            Kind::Flag => Ok(((self.get_scalar(id, kind)? != 0) as u8).to_string()),
            Kind::IpAddr => {
                let value = self.get_scalar(id, kind)?;
                Ok(Ipv4Addr::from(value.to_le_bytes()).to_string())
            }
            Kind::NumArray => {
                let data = self.get_blob(id, |kind| kind == Kind::NumArray)?;
                let values: Vec<String> = data
                    .chunks_exact(WORD_SIZE)
                    .map(|chunk| read_word(chunk, 0).cast_signed().to_string())
                    .collect();
                Ok(values.join(","))
            }
            Kind::Structure | Kind::FillData => Err(Error::KindMismatch(kind)),
        }
    }

    pub(crate) fn save_setting_str(
        &mut self,
        id: u8,
        bytes: &[u8],
        kind: Kind,
    ) -> Result<u32, Error> {
        #[cfg(feature = "defmt")]
        trace!("save_setting_str: {:#04x}", id);

        #[cfg(feature = "debug-logs")]
        println!("  registry: save_str {id:#04x} {kind} [{}]", bytes.len());

        check_id(id)?;
        if kind.is_scalar() || kind == Kind::FillData {
            return Err(Error::InvalidKind(kind as u8));
        }
        if bytes.len() > MAX_BLOB_SIZE {
            return Err(Error::ValueTooLong);
        }

        let header = Header::new(id, kind, bytes.len() as u8);
        let addr = self.append(header, bytes)?;
        self.settings.store(id, &header, addr, 0)?;
        Ok(addr)
    }

    pub(crate) fn save_setting_int(
        &mut self,
        id: u8,
        value: i32,
        kind: Kind,
    ) -> Result<u32, Error> {
        #[cfg(feature = "defmt")]
        trace!("save_setting_int: {:#04x}", id);

        #[cfg(feature = "debug-logs")]
        println!("  registry: save_int {id:#04x} {kind} {value}");

        check_id(id)?;
        if !kind.is_scalar() {
            return Err(Error::InvalidKind(kind as u8));
        }

        let header = Header::new(id, kind, WORD_SIZE as u8);
        let addr = self.append(header, &value.to_le_bytes())?;
        self.settings.store(id, &header, addr, value.cast_unsigned())?;
        Ok(addr)
    }

    pub(crate) fn save_setting_text(
        &mut self,
        id: u8,
        kind: Kind,
        text: &str,
    ) -> Result<u32, Error> {
        match parse(kind, text)? {
            Value::Scalar(value) => self.save_setting_int(id, value.cast_signed(), kind),
            Value::Blob(bytes) => self.save_setting_str(id, &bytes, kind),
        }
    }

    /// Tombstones the record whose payload starts at `addr`. When it held the current value of
    /// a setting, the registry is rebuilt so that the previous value becomes visible again.
    pub(crate) fn invalidate_record(&mut self, addr: u32) -> Result<u32, Error> {
        #[cfg(feature = "defmt")]
        trace!("invalidate_record: @{:#06x}", addr);

        if addr >= self.ring_size() || !addr.is_multiple_of(WORD_SIZE as u32) {
            return Err(Error::AddressOutOfRange(addr));
        }

        let block = self.block_of(addr);
        let mut buf = self.block_buffer()?;
        self.read_block(block, &mut buf)?;
        let record = self
            .block_records(block, &buf)
            .ok()
            .and_then(|records| records.into_iter().find(|record| record.addr == addr))
            .filter(|record| !record.header.is_fill_record())
            .ok_or(Error::NotFound)?;

        if record.header.is_tombstone() {
            return Ok(addr);
        }

        self.tombstone(addr, &record.header)?;
        if self.settings.points_to(record.header.id, addr) {
            self.replay()?;
        }
        Ok(addr)
    }
}
