use crate::raw;
use thiserror::Error;

pub use raw::Kind;

/// Errors that can occur while using the configuration log. Structural corruption found on the
/// flash is repaired while mounting and never reported here, so a caller usually only has to
/// handle NotFound and KindMismatch. Marked as non-exhaustive to allow for future additions.
#[derive(Error, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The partition offset has to be aligned to the size of a flash block (4k)
    #[error("invalid partition offset")]
    InvalidPartitionOffset,

    /// The partition size has to be a multiple of the flash block size (4k) and span at least
    /// two blocks
    #[error("invalid partition size")]
    InvalidPartitionSize,

    /// The internal error value is returned from the provided `&mut impl NorFlash`
    #[error("internal flash error")]
    FlashError,

    /// No value for the id. Either no default exists and nothing has been saved yet, or the
    /// record was lost while repairing a corrupted log.
    #[error("id not found")]
    NotFound,

    /// The id is reserved for the log itself and can't be used here.
    #[error("invalid id: {0:#04x}")]
    InvalidId(u8),

    /// The stored value has a different kind than requested; the encountered kind is reported
    #[error("kind mismatch: {0}")]
    KindMismatch(Kind),

    /// The raw kind byte doesn't name a known kind, or the kind can't be used for this operation
    #[error("invalid kind: {0}")]
    InvalidKind(u8),

    /// Blob values are limited to 255 bytes, a record must always fit into a single block
    #[error("value too long")]
    ValueTooLong,

    /// Text couldn't be converted to a value of the setting's kind, e.g. a malformed ip address
    #[error("invalid value")]
    InvalidValue,

    /// The destination buffer can't even hold the terminating zero
    #[error("buffer too small")]
    BufferTooSmall,

    /// The address doesn't point to a record payload inside the log
    #[error("address out of range: {0:#06x}")]
    AddressOutOfRange(u32),

    /// Record data on the flash is structurally inconsistent
    #[error("corrupted data")]
    CorruptedData,

    /// The live data doesn't leave room for the new record, even after reclaiming blocks.
    #[error("flash full")]
    FlashFull,

    /// A helper buffer couldn't be allocated; nothing was written.
    #[error("out of memory")]
    OutOfMemory,
}
