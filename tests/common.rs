#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use esp_cfglog::Kind;
use esp_cfglog::provider::{DefaultSetting, Keyword, Provider};

pub const FLASH_SECTOR_SIZE: usize = 4096;
// Taken from https://github.com/esp-rs/esp-hal/blob/main/esp-storage/src/stub.rs
pub const WORD_SIZE: usize = 4;
pub const MARKER_SIZE: usize = 8;
pub const START_MARKER: u32 = 0xE567_6643;

pub const HOSTNAME: u8 = 1;
pub const PORT: u8 = 2;
pub const GATEWAY: u8 = 3;
pub const ENABLED: u8 = 4;
pub const SCHEDULE: u8 = 5;

/// Compiled-in settings of a relay with a network and a timer module.
pub struct Relay;

impl Provider for Relay {
    fn keywords(&self) -> &'static [Keyword] {
        &[
            Keyword { token: "hostname", id: HOSTNAME, kind: Kind::Text },
            Keyword { token: "mqtt_port", id: PORT, kind: Kind::Number },
            Keyword { token: "gateway", id: GATEWAY, kind: Kind::IpAddr },
            Keyword { token: "enabled", id: ENABLED, kind: Kind::Flag },
            Keyword { token: "schedule", id: SCHEDULE, kind: Kind::NumArray },
        ]
    }

    fn defaults(&self) -> &'static [DefaultSetting] {
        &[
            DefaultSetting { id: HOSTNAME, kind: Kind::Text, text: "relay" },
            DefaultSetting { id: PORT, kind: Kind::Number, text: "0x75B" },
            DefaultSetting { id: GATEWAY, kind: Kind::IpAddr, text: "192.168.4.1" },
            DefaultSetting { id: ENABLED, kind: Kind::Flag, text: "7" },
            DefaultSetting { id: SCHEDULE, kind: Kind::NumArray, text: "1,,2,3" },
        ]
    }
}

/// Registered after `Relay`, its default for `HOSTNAME` loses.
pub struct Fallback;

impl Provider for Fallback {
    fn defaults(&self) -> &'static [DefaultSetting] {
        &[
            DefaultSetting { id: HOSTNAME, kind: Kind::Text, text: "fallback" },
            DefaultSetting { id: 6, kind: Kind::Number, text: "-12" },
        ]
    }
}

pub const PROVIDERS: &[&dyn Provider] = &[&Relay, &Fallback];

#[derive(Default)]
pub struct Flash {
    pub buf: Vec<u8>,
    pub fail_after_operation: usize,
    pub operations: Vec<Operation>,
    pub feeds: usize,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
}

impl Flash {
    pub fn new(blocks: usize) -> Self {
        Self {
            buf: vec![0xffu8; FLASH_SECTOR_SIZE * blocks],
            fail_after_operation: usize::MAX,
            ..Default::default()
        }
    }

    pub fn new_with_fault(blocks: usize, fail_after_operation: usize) -> Self {
        Self {
            buf: vec![0xffu8; FLASH_SECTOR_SIZE * blocks],
            fail_after_operation,
            ..Default::default()
        }
    }

    /// Same content, no history
    pub fn power_cycle(&self, fail_after_operation: usize) -> Self {
        Self {
            buf: self.buf.clone(),
            fail_after_operation,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
    }

    pub fn erases(&self) -> Vec<u32> {
        self.operations
            .iter()
            .filter_map(|op| match op {
                Operation::Erase { offset, .. } => Some(*offset),
                _ => None,
            })
            .collect()
    }

    pub fn writes(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Write { .. }))
            .count()
    }

    pub fn word(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.buf[offset..offset + WORD_SIZE].try_into().unwrap())
    }

    /// Overwrites a word behind the driver's back, erased bits included.
    pub fn corrupt(&mut self, offset: usize, value: u32) {
        self.buf[offset..offset + WORD_SIZE].copy_from_slice(&value.to_le_bytes());
    }

    pub fn is_blank(&self, block: usize) -> bool {
        self.buf[block * FLASH_SECTOR_SIZE..(block + 1) * FLASH_SECTOR_SIZE]
            .iter()
            .all(|&b| b == 0xff)
    }

    pub fn dump_operations(&self) {
        println!("Operations:");
        for op in &self.operations {
            println!("  {:?}", op);
        }
    }
}

#[derive(Debug)]
pub struct FlashError;

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl ErrorType for Flash {
    type Error = FlashError;
}

impl ReadNorFlash for Flash {
    const READ_SIZE: usize = WORD_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::READ_SIZE as _));

        println!(
            "    flash: read:  0x{offset:04X}[0x{:04X}] #{:>2}",
            bytes.len(),
            self.operations.len()
        );
        if self.operations.len() >= self.fail_after_operation {
            println!("    flash: FAULT");
            return Err(FlashError);
        }
        self.operations.push(Operation::Read {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl NorFlash for Flash {
    const WRITE_SIZE: usize = WORD_SIZE;

    const ERASE_SIZE: usize = FLASH_SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from.is_multiple_of(Self::ERASE_SIZE as _));
        assert!(to.is_multiple_of(Self::ERASE_SIZE as _));

        println!(
            "    flash: erase: {from:04X} - {to:04X} #{:>2}",
            self.operations.len()
        );

        if self.operations.len() >= self.fail_after_operation {
            println!("    flash: FAULT");
            return Err(FlashError);
        }

        self.operations.push(Operation::Erase {
            offset: from,
            len: (to - from) as usize,
        });

        for addr in from..to {
            self.buf[addr as usize] = 0xff;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::WRITE_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::WRITE_SIZE as _));

        println!(
            "    flash: write: 0x{offset:04X}[0x{:04X}] #{:>2}",
            bytes.len(),
            self.operations.len()
        );

        if self.operations.len() >= self.fail_after_operation {
            println!("    flash: FAULT");
            return Err(FlashError);
        }
        assert!(!bytes.is_empty());

        self.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        for (i, &val) in bytes.iter().enumerate() {
            // NOR flash can only flip bits from 1 to 0
            self.buf[offset + i] &= val;
        }
        Ok(())
    }
}

impl esp_cfglog::platform::Watchdog for Flash {
    fn feed(&mut self) {
        self.feeds += 1;
    }
}
