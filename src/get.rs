//! The `Get<T>` trait and its implementation in this module allows providing a single generic,
//! overloaded function `get<T>()` for all supported types of the log.

use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{Kind, WORD_SIZE, read_word};
use crate::CfgLog;
use alloc::string::String;
use alloc::vec::Vec;
use core::net::Ipv4Addr;

pub trait Get<T> {
    fn get(&mut self, id: u8) -> Result<T, Error>;
}

impl<T, G: Get<T>> Get<T> for &mut G {
    fn get(&mut self, id: u8) -> Result<T, Error> {
        (*self).get(id)
    }
}

impl<T: Platform> Get<bool> for CfgLog<T> {
    fn get(&mut self, id: u8) -> Result<bool, Error> {
        let value = self.get_scalar(id, Kind::Flag)?;
        Ok(value != 0)
    }
}

impl<T: Platform> Get<i32> for CfgLog<T> {
    fn get(&mut self, id: u8) -> Result<i32, Error> {
        let value = self.get_scalar(id, Kind::Number)?;
        Ok(value.cast_signed())
    }
}

impl<T: Platform> Get<u32> for CfgLog<T> {
    fn get(&mut self, id: u8) -> Result<u32, Error> {
        self.get_scalar(id, Kind::Number)
    }
}

impl<T: Platform> Get<Ipv4Addr> for CfgLog<T> {
    fn get(&mut self, id: u8) -> Result<Ipv4Addr, Error> {
        let value = self.get_scalar(id, Kind::IpAddr)?;
        Ok(Ipv4Addr::from(value.to_le_bytes()))
    }
}

impl<T: Platform> Get<String> for CfgLog<T> {
    fn get(&mut self, id: u8) -> Result<String, Error> {
        let data = self.get_blob(id, |kind| kind == Kind::Text)?;
        String::from_utf8(data).map_err(|_| Error::CorruptedData)
    }
}

/// Raw payload of any blob kind
impl<T: Platform> Get<Vec<u8>> for CfgLog<T> {
    fn get(&mut self, id: u8) -> Result<Vec<u8>, Error> {
        self.get_blob(id, |_| true)
    }
}

impl<T: Platform> Get<Vec<i32>> for CfgLog<T> {
    fn get(&mut self, id: u8) -> Result<Vec<i32>, Error> {
        let data = self.get_blob(id, |kind| kind == Kind::NumArray)?;
        Ok(data
            .chunks_exact(WORD_SIZE)
            .map(|chunk| read_word(chunk, 0).cast_signed())
            .collect())
    }
}
