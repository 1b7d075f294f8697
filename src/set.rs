use crate::error::Error;
use crate::platform::Platform;
use crate::raw::Kind;
use crate::CfgLog;
use alloc::vec::Vec;
use core::net::Ipv4Addr;

/// Counterpart of `Get<T>`. Returns the flash address of the written payload.
pub trait Set<T> {
    fn set(&mut self, id: u8, value: T) -> Result<u32, Error>;
}

impl<T, S: Set<T>> Set<T> for &mut S {
    fn set(&mut self, id: u8, value: T) -> Result<u32, Error> {
        (*self).set(id, value)
    }
}

impl<T: Platform> Set<bool> for CfgLog<T> {
    fn set(&mut self, id: u8, value: bool) -> Result<u32, Error> {
        self.save_setting_int(id, value as i32, Kind::Flag)
    }
}

impl<T: Platform> Set<i32> for CfgLog<T> {
    fn set(&mut self, id: u8, value: i32) -> Result<u32, Error> {
        self.save_setting_int(id, value, Kind::Number)
    }
}

impl<T: Platform> Set<u32> for CfgLog<T> {
    fn set(&mut self, id: u8, value: u32) -> Result<u32, Error> {
        self.save_setting_int(id, value.cast_signed(), Kind::Number)
    }
}

impl<T: Platform> Set<Ipv4Addr> for CfgLog<T> {
    fn set(&mut self, id: u8, value: Ipv4Addr) -> Result<u32, Error> {
        let value = u32::from_le_bytes(value.octets());
        self.save_setting_int(id, value.cast_signed(), Kind::IpAddr)
    }
}

impl<T: Platform> Set<&str> for CfgLog<T> {
    fn set(&mut self, id: u8, value: &str) -> Result<u32, Error> {
        self.save_setting_str(id, value.as_bytes(), Kind::Text)
    }
}

/// Stored as `Kind::Structure`
impl<T: Platform> Set<&[u8]> for CfgLog<T> {
    fn set(&mut self, id: u8, value: &[u8]) -> Result<u32, Error> {
        self.save_setting_str(id, value, Kind::Structure)
    }
}

impl<T: Platform> Set<&[i32]> for CfgLog<T> {
    fn set(&mut self, id: u8, value: &[i32]) -> Result<u32, Error> {
        let bytes: Vec<u8> = value.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.save_setting_str(id, &bytes, Kind::NumArray)
    }
}
