//! Compiled-in knowledge about settings. Every part of the firmware that owns settings (network,
//! mqtt, relay timers, ...) implements [`Provider`] and hands out static tables: keywords to map
//! form fields or commands onto ids, and default values as text. The providers are consulted in
//! order, the first one that knows an id or token wins.

use crate::error::Error;
use crate::raw::{Kind, MAX_BLOB_SIZE};
use alloc::borrow::Cow;
use alloc::vec::Vec;
use core::net::Ipv4Addr;

/// Maps a token onto a setting.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Keyword {
    pub token: &'static str,
    pub id: u8,
    pub kind: Kind,
}

/// Default value of a setting, written as text the way a user would enter it:
///  * Number: decimal, `0x` hex or `0` octal, optionally signed
///  * IpAddr: dotted quad
///  * Flag: a number, anything but zero is set
///  * NumArray: comma separated numbers
///  * Text, Structure: taken verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DefaultSetting {
    pub id: u8,
    pub kind: Kind,
    pub text: &'static str,
}

pub trait Provider {
    fn keywords(&self) -> &'static [Keyword] {
        &[]
    }

    fn defaults(&self) -> &'static [DefaultSetting] {
        &[]
    }
}

impl<P: Provider> Provider for &P {
    fn keywords(&self) -> &'static [Keyword] {
        (*self).keywords()
    }

    fn defaults(&self) -> &'static [DefaultSetting] {
        (*self).defaults()
    }
}

/// Ordered list of providers.
///
/// Usage: `Providers::new(&[&network::Settings, &mqtt::Settings]).keyword("mqtt_host")`
#[derive(Copy, Clone)]
pub struct Providers<'a> {
    list: &'a [&'a dyn Provider],
}

impl<'a> Providers<'a> {
    pub const fn new(list: &'a [&'a dyn Provider]) -> Self {
        Self { list }
    }

    pub fn keyword(&self, token: &str) -> Option<&'static Keyword> {
        self.keywords().find(|keyword| keyword.token == token)
    }

    pub fn keyword_by_id(&self, id: u8) -> Option<&'static Keyword> {
        self.keywords().find(|keyword| keyword.id == id)
    }

    pub fn keywords(self) -> impl Iterator<Item = &'static Keyword> + 'a {
        self.list.iter().flat_map(|provider| provider.keywords())
    }

    pub fn defaults(self) -> impl Iterator<Item = &'static DefaultSetting> + 'a {
        self.list.iter().flat_map(|provider| provider.defaults())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Value<'a> {
    Scalar(u32),
    Blob(Cow<'a, [u8]>),
}

/// Converts text into the stored representation of `kind`.
pub(crate) fn parse(kind: Kind, text: &str) -> Result<Value<'_>, Error> {
    let value = match kind {
        Kind::Text | Kind::Structure => Value::Blob(Cow::Borrowed(text.as_bytes())),
        Kind::Number => Value::Scalar(parse_int(text).cast_unsigned()),
        Kind::Flag => Value::Scalar((parse_int(text) != 0) as u32),
        Kind::IpAddr => {
            let ip: Ipv4Addr = text.trim().parse().map_err(|_| Error::InvalidValue)?;
            Value::Scalar(u32::from_le_bytes(ip.octets()))
        }
        Kind::NumArray => {
            let mut bytes = Vec::new();
            for field in text.split(',').filter(|field| !field.is_empty()) {
                bytes.extend_from_slice(&parse_int(field).to_le_bytes());
            }
            Value::Blob(Cow::Owned(bytes))
        }
        Kind::FillData => return Err(Error::InvalidKind(kind as u8)),
    };

    match &value {
        Value::Blob(bytes) if bytes.len() > MAX_BLOB_SIZE => Err(Error::ValueTooLong),
        _ => Ok(value),
    }
}

/// Lenient integer parsing: leading whitespace and a sign are accepted, the radix follows from
/// the prefix, parsing stops at the first invalid digit and saturates at the `i32` range.
pub(crate) fn parse_int(text: &str) -> i32 {
    let text = text.trim_start();
    let (negative, text) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };

    let (radix, digits) = if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        (16, hex)
    } else if text.len() > 1 && text.starts_with('0') {
        (8, &text[1..])
    } else {
        (10, text)
    };

    let limit = i32::MAX as i64 + 1;
    let mut value: i64 = 0;
    for digit in digits.chars().map_while(|c| c.to_digit(radix)) {
        value = (value * radix as i64 + digit as i64).min(limit);
    }

    let value = if negative { -value } else { value };
    value.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int("42"), 42);
        assert_eq!(parse_int("  -17 seconds"), -17);
        assert_eq!(parse_int("0x1F"), 31);
        assert_eq!(parse_int("010"), 8);
        assert_eq!(parse_int("0"), 0);
        assert_eq!(parse_int("abc"), 0);
        assert_eq!(parse_int("99999999999"), i32::MAX);
        assert_eq!(parse_int("-99999999999"), i32::MIN);
    }

    #[test]
    fn test_parse_values() {
        assert_eq!(
            parse(Kind::IpAddr, "192.168.4.1"),
            Ok(Value::Scalar(u32::from_le_bytes([192, 168, 4, 1])))
        );
        assert_eq!(parse(Kind::IpAddr, "192.168.4"), Err(Error::InvalidValue));
        assert_eq!(parse(Kind::Flag, "7"), Ok(Value::Scalar(1)));
        assert_eq!(
            parse(Kind::NumArray, "1,,-2,0x10"),
            Ok(Value::Blob(Cow::Owned(
                [1i32, -2, 16]
                    .iter()
                    .flat_map(|v| v.to_le_bytes())
                    .collect()
            )))
        );
        assert_eq!(
            parse(Kind::FillData, ""),
            Err(Error::InvalidKind(Kind::FillData as u8))
        );
    }
}
