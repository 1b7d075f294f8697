//! On-flash layout of the log. Everything in here is bit-exact with the layout of devices in the
//! field, so their logs can be mounted as is.

use crate::error::Error;
use crate::platform::{AlignedOps, Platform};
use alloc::vec;
use alloc::vec::Vec;
use core::fmt::{Debug, Formatter};
#[cfg(feature = "defmt")]
use defmt::trace;

pub(crate) const FLASH_SECTOR_SIZE: usize = 4096;
pub(crate) const WORD_SIZE: usize = 4;

/// The first two words of every block are reserved for the start marker.
pub(crate) const MARKER_SIZE: usize = 2 * WORD_SIZE;
pub(crate) const START_MARKER: u32 = 0xE567_6643;

pub(crate) const HEADER_SIZE: usize = WORD_SIZE;
/// A record has to fit into the space after the marker of a single block.
pub(crate) const MAX_RECORD_SIZE: usize = FLASH_SECTOR_SIZE - MARKER_SIZE;
pub(crate) const MAX_BLOB_SIZE: usize = u8::MAX as usize;

/// Value of an erased flash word, doubles as end-of-list sentinel.
pub(crate) const ERASED_WORD: u32 = u32::MAX;
/// An all-zero word between records is skipped.
pub(crate) const FILL_WORD: u32 = 0;

/// Ids below are indexed settings, one registry slot per id.
pub const ID_MAX: u8 = 0xF0;
/// Extra data that survives compaction, e.g. switching timer entries.
pub const ID_EXTRA_DATA: u8 = 0xF1;
/// Extra data that is dropped on compaction, e.g. history lines.
pub const ID_EXTRA_DATA_TEMP: u8 = 0xF3;
/// Pads the unused tail of a block before the writer moves on.
pub(crate) const ID_SKIP_DATA: u8 = 0xFF;

/// Validity tags. Everything at or above `RECORD_VALID` is structurally live.
pub(crate) const RECORD_VALID: u8 = 0xF0;
pub(crate) const RECORD_ERASED: u8 = 0xF0;
pub(crate) const SPI_FLASH_RECORD: u8 = 0xFE;

#[derive(strum::FromRepr, strum::Display, Debug, Eq, PartialEq, Copy, Clone)]
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Kind {
    Text = 1,
    Number = 2,
    IpAddr = 3,
    Flag = 4,
    NumArray = 5,
    Structure = 6,
    FillData = 7,
}

impl Kind {
    /// Scalar kinds always carry a single 4 byte value word, regardless of the length field.
    pub const fn is_scalar(&self) -> bool {
        matches!(self, Kind::Number | Kind::IpAddr | Kind::Flag)
    }
}

/// Payload length of a record, rounded up to the next word.
pub const fn aligned_payload_len(kind: Kind, len: u8) -> usize {
    if kind.is_scalar() {
        WORD_SIZE
    } else {
        (len as usize + WORD_SIZE - 1) & !(WORD_SIZE - 1)
    }
}

/// The 4 byte record header. Stored as a single little-endian word with the id in the lowest
/// byte: `{id, kind, len, valid}`.
#[derive(Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Header {
    pub id: u8,
    /// Raw kind byte, see [`Header::kind`]
    pub kind: u8,
    /// Payload length before alignment. Informational only for scalar kinds.
    pub len: u8,
    pub valid: u8,
}

impl Header {
    pub const fn new(id: u8, kind: Kind, len: u8) -> Self {
        Self {
            id,
            kind: kind as u8,
            len,
            valid: SPI_FLASH_RECORD,
        }
    }

    pub(crate) const fn fill(len: u8) -> Self {
        Self::new(ID_SKIP_DATA, Kind::FillData, len)
    }

    pub const fn decode(raw: [u8; HEADER_SIZE]) -> Self {
        let [id, kind, len, valid] = raw;
        Self {
            id,
            kind,
            len,
            valid,
        }
    }

    pub const fn encode(&self) -> [u8; HEADER_SIZE] {
        [self.id, self.kind, self.len, self.valid]
    }

    pub const fn from_word(word: u32) -> Self {
        Self::decode(word.to_le_bytes())
    }

    pub const fn to_word(&self) -> u32 {
        u32::from_le_bytes(self.encode())
    }

    /// Erased flash, nothing has been written here yet.
    pub const fn is_sentinel(&self) -> bool {
        self.to_word() == ERASED_WORD
    }

    pub const fn is_filler(&self) -> bool {
        self.to_word() == FILL_WORD
    }

    pub const fn is_live(&self) -> bool {
        !self.is_sentinel() && self.valid >= RECORD_VALID
    }

    pub const fn is_tombstone(&self) -> bool {
        self.valid == RECORD_ERASED
    }

    pub const fn is_fill_record(&self) -> bool {
        self.id == ID_SKIP_DATA
    }

    pub fn kind(&self) -> Result<Kind, Error> {
        Kind::from_repr(self.kind).ok_or(Error::InvalidKind(self.kind))
    }

    /// Aligned payload length, `None` if the kind is unknown and the record can't be skipped.
    pub fn payload_len(&self) -> Option<usize> {
        Kind::from_repr(self.kind).map(|kind| aligned_payload_len(kind, self.len))
    }

    pub fn record_len(&self) -> Option<usize> {
        self.payload_len().map(|len| HEADER_SIZE + len)
    }

    pub(crate) const fn tombstoned(&self) -> Self {
        Self {
            valid: RECORD_ERASED,
            ..*self
        }
    }
}

impl Debug for Header {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let id = self.id;
        let len = self.len;
        let valid = self.valid;
        match Kind::from_repr(self.kind) {
            Some(kind) => f.write_fmt(format_args!(
                "Header {{ id: 0x{id:0>2x}, kind: {kind:<9}, len: {len:>3}, valid: 0x{valid:0>2x} }}"
            )),
            None => f.write_fmt(format_args!("Header {{ raw: 0x{:0>8x} }}", self.to_word())),
        }
    }
}

#[inline(always)]
pub(crate) fn read_word(buf: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; WORD_SIZE];
    raw.copy_from_slice(&buf[offset..offset + WORD_SIZE]);
    u32::from_le_bytes(raw)
}

/// Writes `bytes` at `offset` with a single flash operation. A partial tail word is padded with
/// zeros.
pub(crate) fn write_padded<T: Platform>(
    hal: &mut T,
    offset: u32,
    bytes: &[u8],
) -> Result<(), Error> {
    #[cfg(feature = "defmt")]
    trace!("write_padded @{:#08x}: [{}]", offset, bytes.len());

    let padded_len = T::align_write_ceil(bytes.len());
    if padded_len == bytes.len() {
        return hal.write(offset, bytes).map_err(|_| Error::FlashError);
    }

    let mut padded = Vec::new();
    padded
        .try_reserve_exact(padded_len)
        .map_err(|_| Error::OutOfMemory)?;
    padded.extend_from_slice(bytes);
    padded.resize(padded_len, 0);
    hal.write(offset, &padded).map_err(|_| Error::FlashError)
}

#[inline(always)]
pub(crate) fn read_aligned<T: Platform>(
    hal: &mut T,
    offset: u32,
    bytes: &mut [u8],
) -> Result<(), T::Error> {
    if bytes.len().is_multiple_of(T::READ_SIZE) {
        hal.read(offset, bytes)
    } else {
        let pivot = T::align_read_floor(bytes.len());
        let (header, trailer) = bytes.split_at_mut(pivot);
        if !header.is_empty() {
            hal.read(offset, header)?;
        }

        let mut buf = vec![0xFFu8; T::READ_SIZE];
        hal.read(offset + (pivot as u32), &mut buf)?;
        let len = trailer.len();
        trailer.copy_from_slice(&buf[..len]);

        Ok(())
    }
}
