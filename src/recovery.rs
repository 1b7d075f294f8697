use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{ERASED_WORD, MARKER_SIZE, START_MARKER, WORD_SIZE, read_word};
use crate::ring::BLOCK_SIZE;
use crate::scan::{Step, step};
use crate::{CfgLog, RecordStatistics};
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::{error, trace, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum BlockState {
    /// Erased, including the reservation
    Empty,
    /// Holds records followed by the end-of-list sentinel
    Open { marked: bool },
    /// Records run up to the end of the block
    Full { marked: bool },
    Invalid,
}

impl BlockState {
    fn is_marked(&self) -> bool {
        matches!(
            self,
            BlockState::Open { marked: true } | BlockState::Full { marked: true }
        )
    }

    fn holds_data(&self) -> bool {
        matches!(self, BlockState::Open { .. } | BlockState::Full { .. })
    }
}

/// Whether a marker found in the block at `base` may point at `start`.
pub(crate) fn is_valid_start(base: u32, start: u32) -> bool {
    start.is_multiple_of(WORD_SIZE as u32)
        && start >= base + MARKER_SIZE as u32
        && start < base + BLOCK_SIZE
}

/// Classifies a block image and counts its records. Every word behind the reservation has to be
/// explained by a record, a filler word or the erased tail behind the sentinel.
pub(crate) fn survey(base: u32, buf: &[u8]) -> (BlockState, RecordStatistics) {
    let mut stats = RecordStatistics::default();
    let marked = match read_word(buf, 0) {
        START_MARKER => true,
        ERASED_WORD => false,
        _ => return (BlockState::Invalid, RecordStatistics::default()),
    };

    // unmarked blocks may carry a stale start address, only the marker word counts
    let start = read_word(buf, WORD_SIZE);
    let mut offset = match marked {
        true if is_valid_start(base, start) => (start - base) as usize,
        true => return (BlockState::Invalid, RecordStatistics::default()),
        false => MARKER_SIZE,
    };
    let first = offset;

    loop {
        match step(buf, &mut offset) {
            Ok(Step::Record { header, .. }) => stats.count(&header),
            Ok(Step::Sentinel(at)) => {
                if buf[at..].iter().any(|&b| b != 0xFF) {
                    return (BlockState::Invalid, RecordStatistics::default());
                }
                let state = match !marked && at == first {
                    true => BlockState::Empty,
                    false => BlockState::Open { marked },
                };
                return (state, stats);
            }
            Ok(Step::BlockEnd) => return (BlockState::Full { marked }, stats),
            Err(_) => return (BlockState::Invalid, RecordStatistics::default()),
        }
    }
}

impl<T: Platform> CfgLog<T> {
    /// Looks at the reservation of every block. Exactly one start marker with a plausible offset
    /// is taken as is, anything else triggers a full integrity check.
    pub(crate) fn locate_start(&mut self) -> Result<u32, Error> {
        #[cfg(feature = "defmt")]
        trace!("locate_start");

        let mut markers = 0;
        let mut found = None;
        for block in 0..self.blocks {
            let [magic, start] = self.read_reservation(block)?;
            if magic == START_MARKER {
                markers += 1;
                found = Some((block, start));
            }
        }

        match found {
            Some((block, start)) if markers == 1 && is_valid_start(block * BLOCK_SIZE, start) => {
                Ok(start)
            }
            _ => {
                #[cfg(feature = "defmt")]
                warn!("no unique start marker ({} found)", markers);

                #[cfg(feature = "debug-logs")]
                println!("  recovery: no unique start marker ({markers} found)");

                self.repair()
            }
        }
    }

    /// Validates every block, erases the ones that can't be explained, picks the oldest block,
    /// makes sure it carries the only start marker and that at least one erased block follows
    /// the newest one. Returns the address of the first record.
    pub(crate) fn repair(&mut self) -> Result<u32, Error> {
        #[cfg(feature = "defmt")]
        warn!("check_integrity");

        #[cfg(feature = "debug-logs")]
        println!("  recovery: check integrity");

        let n = self.blocks as usize;
        let mut buf = self.block_buffer()?;
        let mut states = Vec::with_capacity(n);
        let mut populated = Vec::with_capacity(n);
        for block in 0..self.blocks {
            self.read_block(block, &mut buf)?;
            self.hal.feed();

            let (mut state, records) = survey(block * BLOCK_SIZE, &buf);
            populated.push(records != RecordStatistics::default());
            if state == BlockState::Invalid {
                #[cfg(feature = "defmt")]
                error!("erasing corrupted block {}", block);

                #[cfg(feature = "debug-logs")]
                println!("  recovery: erasing corrupted block {block}");

                self.erase_block(block)?;
                state = BlockState::Empty;
            }
            states.push(state);
        }
        drop(buf);

        let prev = |i: usize| (i + n - 1) % n;
        let marked: Vec<usize> = (0..n).filter(|&i| states[i].is_marked()).collect();

        let start_block = if let Some(&fallback) = marked.first() {
            // a marker in front of records beats a stray one
            let chosen = marked
                .iter()
                .copied()
                .find(|&i| populated[i] && states[prev(i)] == BlockState::Empty)
                .or_else(|| marked.iter().copied().find(|&i| populated[i]))
                .unwrap_or(fallback);
            for &i in marked.iter().filter(|&&i| i != chosen) {
                #[cfg(feature = "defmt")]
                warn!("erasing block {} with a second start marker", i);

                self.erase_block(i as u32)?;
                states[i] = BlockState::Empty;
            }
            chosen
        } else {
            // The marker got lost between erasing the reclaimed block and writing the new one,
            // or the log was never initialized. The oldest data follows an erased block.
            let oldest = (0..n)
                .find(|&i| states[i].holds_data() && states[prev(i)] == BlockState::Empty)
                .or_else(|| {
                    (0..n).find(|&i| {
                        states[i].holds_data() && matches!(states[prev(i)], BlockState::Open { .. })
                    })
                })
                .unwrap_or(0);

            #[cfg(feature = "defmt")]
            warn!("writing start marker to block {}", oldest);

            self.write_marker(oldest as u32, self.first_record_address(oldest as u32))?;
            oldest
        };

        // follow the chain of full blocks, whatever comes after its end is unreachable
        let mut last = start_block;
        while matches!(states[last], BlockState::Full { .. }) {
            let next = (last + 1) % n;
            if next == start_block || !states[next].holds_data() {
                break;
            }
            last = next;
        }

        let mut block = (last + 1) % n;
        while block != start_block {
            if states[block] != BlockState::Empty {
                #[cfg(feature = "defmt")]
                warn!("erasing unreachable block {}", block);

                #[cfg(feature = "debug-logs")]
                println!("  recovery: erasing unreachable block {block}");

                self.erase_block(block as u32)?;
                states[block] = BlockState::Empty;
            }
            block = (block + 1) % n;
        }

        // an open block in front of the oldest one is an interrupted reclaim, which the replay
        // finishes
        if (last + 1) % n == start_block && !matches!(states[last], BlockState::Open { .. }) {
            // no erased block left for the writer, give up the oldest one
            #[cfg(feature = "defmt")]
            warn!("ring closed, dropping block {}", start_block);

            #[cfg(feature = "debug-logs")]
            println!("  recovery: ring closed, dropping block {start_block}");

            return self.drop_block(start_block as u32);
        }

        let start_block = start_block as u32;
        match self.read_reservation(start_block)? {
            [START_MARKER, start] => Ok(start),
            _ => Err(Error::CorruptedData),
        }
    }

    /// Gives up the oldest block: erases it and moves the start marker to the following block.
    pub(crate) fn drop_block(&mut self, block: u32) -> Result<u32, Error> {
        self.erase_block(block)?;
        let next = self.next_block(block);
        let start = self.first_record_address(next);
        self.write_marker(next, start)?;
        Ok(start)
    }

    pub(crate) fn first_record_address(&self, block: u32) -> u32 {
        block * BLOCK_SIZE + MARKER_SIZE as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::{HEADER_SIZE, Header, Kind};
    use alloc::vec;

    fn block(marker: Option<u32>, records: &[Header]) -> Vec<u8> {
        let mut buf = vec![0xFFu8; BLOCK_SIZE as usize];
        if let Some(start) = marker {
            buf[..4].copy_from_slice(&START_MARKER.to_le_bytes());
            buf[4..8].copy_from_slice(&start.to_le_bytes());
        }
        let mut offset = MARKER_SIZE;
        for header in records {
            buf[offset..offset + HEADER_SIZE].copy_from_slice(&header.encode());
            let len = header.record_len().unwrap_or(HEADER_SIZE);
            buf[offset + HEADER_SIZE..offset + len].fill(0);
            offset += len;
        }
        buf
    }

    #[test]
    fn test_survey_states() {
        let text = Header::new(1, Kind::Text, 5);

        assert_eq!(survey(0, &block(None, &[])).0, BlockState::Empty);
        assert_eq!(
            survey(0, &block(Some(8), &[])).0,
            BlockState::Open { marked: true }
        );

        let (state, stats) = survey(4096, &block(None, &[text, text.tombstoned()]));
        assert_eq!(state, BlockState::Open { marked: false });
        assert_eq!(stats.settings, 1);
        assert_eq!(stats.tombstoned, 1);

        let filled = block(None, &[text, Header::fill(244), Header::fill(252)]);
        assert_eq!(survey(0, &filled).0, BlockState::Open { marked: false });

        // 12 + 15 * 256 + 236 bytes behind the reservation
        let records: Vec<Header> = [text]
            .into_iter()
            .chain(core::iter::repeat_n(Header::fill(252), 15))
            .chain([Header::fill(232)])
            .collect();
        assert_eq!(survey(0, &block(None, &records)).0, BlockState::Full { marked: false });
    }

    #[test]
    fn test_survey_stale_start_word() {
        let text = Header::new(1, Kind::Text, 5);

        // a write ending on the block boundary leaves the start address of the next block
        let mut buf = block(None, &[text]);
        buf[4..8].copy_from_slice(&4104u32.to_le_bytes());
        let (state, stats) = survey(4096, &buf);
        assert_eq!(state, BlockState::Open { marked: false });
        assert_eq!(stats.settings, 1);

        let mut buf = block(None, &[]);
        buf[4..8].copy_from_slice(&8u32.to_le_bytes());
        assert_eq!(survey(0, &buf).0, BlockState::Empty);
    }

    #[test]
    fn test_survey_invalid() {
        let mut buf = block(None, &[]);
        buf[..4].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        assert_eq!(survey(0, &buf).0, BlockState::Invalid);

        // marker pointing into another block
        assert_eq!(survey(0, &block(Some(4104), &[])).0, BlockState::Invalid);

        // data behind the sentinel
        let mut buf = block(None, &[]);
        buf[100] = 0x00;
        assert_eq!(survey(0, &buf).0, BlockState::Invalid);

        // record running past the end of the block
        let mut buf = block(None, &[]);
        buf[4092..4096].copy_from_slice(&Header::new(1, Kind::Text, 100).encode());
        buf[8..4092].fill(0);
        assert_eq!(survey(0, &buf).0, BlockState::Invalid);
    }
}
