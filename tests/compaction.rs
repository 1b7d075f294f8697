mod common;

mod compaction {
    use crate::common;
    use esp_cfglog::error::Error;
    use esp_cfglog::{
        BlockStatistics, CfgLog, Header, ID_EXTRA_DATA, ID_EXTRA_DATA_TEMP, Kind, LogRecord,
        ScanAction,
    };
    use pretty_assertions::assert_eq;

    /// Payload that makes up a 256 byte record
    const LARGE: usize = 252;

    fn scan(log: &mut CfgLog<&mut common::Flash>, id: u8) -> Vec<(Vec<u8>, u32)> {
        let mut found = Vec::new();
        log.scan(id, |payload, addr| {
            found.push((payload.to_vec(), addr));
            ScanAction::Keep
        })
        .unwrap();
        found
    }

    #[test]
    fn filler_closes_block() {
        let mut flash = common::Flash::new(3);
        let mut log = CfgLog::new(0, flash.len(), &mut flash, &[]).unwrap();

        // 15 records end at 0x0F08, the remaining 248 bytes can't take another one
        for i in 0..15u8 {
            log.save_str(20, &[i; LARGE], Kind::Structure).unwrap();
        }
        let addr = log.save_str(20, &[15; LARGE], Kind::Structure).unwrap();
        assert_eq!(addr, 4096 + 8 + 4);

        let records = log.records().unwrap();
        assert_eq!(records.len(), 17);
        assert_eq!(
            records[15],
            LogRecord {
                addr: 3852,
                header: Header::new(0xFF, Kind::FillData, 244),
            }
        );
        assert_eq!(
            records[16],
            LogRecord {
                addr: 4108,
                header: Header::new(20, Kind::Structure, LARGE as u8),
            }
        );

        let statistics = log.statistics().unwrap();
        assert_eq!(
            statistics.blocks,
            BlockStatistics {
                empty: 1,
                active: 1,
                full: 1,
                corrupted: 0,
            }
        );
        assert_eq!(statistics.records_overall.settings, 16);
        assert_eq!(statistics.records_overall.fill, 1);

        assert_eq!(
            flash.word(3848),
            Header::new(0xFF, Kind::FillData, 244).to_word()
        );
        assert!(flash.buf[3852..4096].iter().all(|&b| b == 0xFF));
        // the reservation of the next block stays erased
        assert_eq!(flash.word(4096), 0xFFFF_FFFF);
        assert_eq!(flash.word(4100), 0xFFFF_FFFF);
        assert_eq!(flash.erases(), vec![]);

        let mut log = CfgLog::new(0, flash.len(), &mut flash, &[]).unwrap();
        assert_eq!(log.records().unwrap(), records);
        assert_eq!(log.get::<Vec<u8>>(20).unwrap(), vec![15; LARGE]);
    }

    #[test]
    fn reclaim_keeps_live_data() {
        let mut flash = common::Flash::new(3);
        let mut log = CfgLog::new(0, flash.len(), &mut flash, &[]).unwrap();

        assert_eq!(log.save_str(1, b"alpha", Kind::Text).unwrap(), 12);
        assert_eq!(log.save_int(2, 42, Kind::Number).unwrap(), 24);
        assert_eq!(
            log.save_str(ID_EXTRA_DATA, b"keep me", Kind::Structure)
                .unwrap(),
            32
        );
        assert_eq!(
            log.save_str(ID_EXTRA_DATA_TEMP, b"drop me", Kind::Structure)
                .unwrap(),
            44
        );

        // blocks 0 and 1 take 15 large records each
        for i in 0..30u8 {
            log.save_str(20, &[i; LARGE], Kind::Structure).unwrap();
        }
        assert_eq!(log.find_log_start().unwrap(), 8);

        // entering block 2 reclaims block 0: its copies go first
        let addr = log.save_str(20, &[30; LARGE], Kind::Structure).unwrap();
        assert_eq!(addr, 8236);
        assert_eq!(log.find_log_start().unwrap(), 4104);

        assert_eq!(log.get::<String>(1).unwrap(), "alpha");
        assert_eq!(log.get_int(2), 42);
        assert_eq!(log.get::<Vec<u8>>(20).unwrap(), vec![30; LARGE]);
        assert_eq!(
            scan(&mut log, ID_EXTRA_DATA),
            vec![(b"keep me".to_vec(), 8224)]
        );
        assert_eq!(scan(&mut log, ID_EXTRA_DATA_TEMP), vec![]);

        assert_eq!(flash.erases(), vec![0]);
        assert!(flash.is_blank(0));
        assert_eq!(flash.word(4096), common::START_MARKER);
        assert_eq!(flash.word(4100), 4104);
        assert_eq!(
            flash.word(8192 + 8),
            Header::new(1, Kind::Text, 5).to_word()
        );

        let mut log = CfgLog::new(0, flash.len(), &mut flash, &[]).unwrap();
        assert_eq!(log.get::<String>(1).unwrap(), "alpha");
        assert_eq!(log.get_int(2), 42);
        assert_eq!(log.get::<Vec<u8>>(20).unwrap(), vec![30; LARGE]);
        assert_eq!(
            scan(&mut log, ID_EXTRA_DATA),
            vec![(b"keep me".to_vec(), 8224)]
        );
        assert_eq!(scan(&mut log, ID_EXTRA_DATA_TEMP), vec![]);
    }

    #[test]
    fn many_rounds() {
        let mut flash = common::Flash::new(3);
        let mut log = CfgLog::new(0, flash.len(), &mut flash, &[]).unwrap();

        log.save_str(1, b"alpha", Kind::Text).unwrap();
        log.save_str(ID_EXTRA_DATA, b"keep me", Kind::Structure)
            .unwrap();
        for i in 0..200u32 {
            log.save_str(20, &[i as u8; LARGE], Kind::Structure)
                .unwrap();
            if i == 100 {
                log.save_str(ID_EXTRA_DATA_TEMP, b"recent", Kind::Structure)
                    .unwrap();
            }
        }

        let check = |log: &mut CfgLog<&mut common::Flash>| {
            assert_eq!(log.get::<String>(1).unwrap(), "alpha");
            assert_eq!(log.get::<Vec<u8>>(20).unwrap(), vec![199; LARGE]);
            let kept: Vec<Vec<u8>> = scan(log, ID_EXTRA_DATA)
                .into_iter()
                .map(|(payload, _)| payload)
                .collect();
            assert_eq!(kept, vec![b"keep me".to_vec()]);
            // the temporary record was written more than two blocks ago
            assert_eq!(scan(log, ID_EXTRA_DATA_TEMP), vec![]);

            let statistics = log.statistics().unwrap();
            assert_eq!(statistics.blocks.corrupted, 0);
            assert_eq!(statistics.blocks.empty, 1);
        };

        check(&mut log);
        let mut log = CfgLog::new(0, flash.len(), &mut flash, &[]).unwrap();
        check(&mut log);
    }

    #[test]
    fn flash_full() {
        let mut flash = common::Flash::new(3);
        let mut log = CfgLog::new(0, flash.len(), &mut flash, &[]).unwrap();

        // two blocks of distinct settings can't be reclaimed into a single free block
        for id in 0..30u8 {
            log.save_str(id, &[id; LARGE], Kind::Structure).unwrap();
        }
        let records = log.records().unwrap();
        let writes = flash.writes();

        // the copies of block 0 plus the new record exceed a block: nothing is written
        let mut log = CfgLog::new(0, flash.len(), &mut flash, &[]).unwrap();
        assert_eq!(
            log.save_str(30, &[30; LARGE], Kind::Structure),
            Err(Error::FlashFull)
        );
        assert_eq!(
            log.save_str(30, &[30; LARGE], Kind::Structure),
            Err(Error::FlashFull)
        );
        assert_eq!(log.records().unwrap(), records);
        assert_eq!(flash.writes(), writes);

        let mut log = CfgLog::new(0, flash.len(), &mut flash, &[]).unwrap();
        assert_eq!(
            log.save_str(30, &[30; LARGE], Kind::Structure),
            Err(Error::FlashFull)
        );
        for id in 0..30u8 {
            assert_eq!(log.get::<Vec<u8>>(id).unwrap(), vec![id; LARGE]);
        }
        assert_eq!(log.get::<Vec<u8>>(30), Err(Error::NotFound));

        // small records still fit into the open block
        log.save_int(31, 7, Kind::Number).unwrap();

        let mut log = CfgLog::new(0, flash.len(), &mut flash, &[]).unwrap();
        for id in 0..30u8 {
            assert_eq!(log.get::<Vec<u8>>(id).unwrap(), vec![id; LARGE]);
        }
        assert_eq!(log.get_int(31), 7);
        assert_eq!(log.statistics().unwrap().blocks.corrupted, 0);
        assert!(flash.is_blank(2));
        assert_eq!(flash.erases(), vec![]);
    }
}
