use embedded_storage::nor_flash::{ErrorType, NorFlash, ReadNorFlash};

/// Everything the log needs from the host: raw NOR flash access and a way to keep the watchdog
/// quiet while a full ring is being walked. See README.md for an example implementation.
pub trait Platform: Watchdog + NorFlash {}

impl<T: Watchdog + NorFlash> Platform for T {}

/// Keep-alive signal for the host's watchdog. Walking all blocks of the log takes longer than the
/// default watchdog timeout on the ESP8266, so long scans call `feed` once per record.
pub trait Watchdog {
    fn feed(&mut self);
}

impl<T: Watchdog> Watchdog for &mut T {
    fn feed(&mut self) {
        (**self).feed()
    }
}

/// Pairs a flash driver with a feed callback for hosts whose watchdog isn't reachable from the
/// flash driver itself.
///
/// Usage: `FeedOnScan::new(flash, || rwdt.feed())`
pub struct FeedOnScan<F, W> {
    flash: F,
    feed: W,
}

impl<F, W: FnMut()> FeedOnScan<F, W> {
    pub fn new(flash: F, feed: W) -> Self {
        Self { flash, feed }
    }

    pub fn into_inner(self) -> F {
        self.flash
    }
}

impl<F, W: FnMut()> Watchdog for FeedOnScan<F, W> {
    fn feed(&mut self) {
        (self.feed)()
    }
}

impl<F: ErrorType, W> ErrorType for FeedOnScan<F, W> {
    type Error = F::Error;
}

impl<F: ReadNorFlash, W> ReadNorFlash for FeedOnScan<F, W> {
    const READ_SIZE: usize = F::READ_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.flash.read(offset, bytes)
    }

    fn capacity(&self) -> usize {
        self.flash.capacity()
    }
}

impl<F: NorFlash, W> NorFlash for FeedOnScan<F, W> {
    const WRITE_SIZE: usize = F::WRITE_SIZE;
    const ERASE_SIZE: usize = F::ERASE_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        self.flash.erase(from, to)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.flash.write(offset, bytes)
    }
}

pub trait AlignedOps: Platform {
    fn align_read_floor(size: usize) -> usize {
        align_floor(size, Self::READ_SIZE)
    }

    fn align_write_ceil(size: usize) -> usize {
        align_ceil(size, Self::WRITE_SIZE)
    }
}

#[inline(always)]
pub(crate) const fn align_ceil(size: usize, alignment: usize) -> usize {
    if alignment.is_power_of_two() {
        size.saturating_add(alignment - 1) & !(alignment - 1)
    } else {
        size.saturating_add(alignment - 1) / alignment * alignment
    }
}

#[inline(always)]
const fn align_floor(size: usize, alignment: usize) -> usize {
    if alignment.is_power_of_two() {
        size & !(alignment - 1)
    } else {
        size / alignment * alignment
    }
}

impl<T: Platform> AlignedOps for T {}

#[cfg(any(
    feature = "esp32",
    feature = "esp32s2",
    feature = "esp32s3",
    feature = "esp32c2",
    feature = "esp32c3",
    feature = "esp32c6",
    feature = "esp32h2",
))]
mod chip {
    use esp_storage::FlashStorage;

    use crate::platform::Watchdog;

    // The RTC and timer group watchdogs belong to the application. Wrap the storage in
    // `FeedOnScan` to feed them during long scans.
    impl Watchdog for FlashStorage<'_> {
        fn feed(&mut self) {}
    }
}
