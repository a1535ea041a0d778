// Copyright 2024 tessera
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Human readable byte sizes for configuration files, e.g. `4KiB`, `1.5MiB`.

use std::{
    fmt::{self, Debug, Display},
    str::FromStr,
};

use serde::{
    de::{self, Unexpected, Visitor},
    Deserialize, Deserializer, Serialize, Serializer,
};

pub const B: u64 = 1;
pub const KIB: u64 = B << 10;
pub const MIB: u64 = KIB << 10;
pub const GIB: u64 = MIB << 10;
pub const TIB: u64 = GIB << 10;

const UNITS: [(u64, &str); 4] = [(TIB, "TiB"), (GIB, "GiB"), (MIB, "MiB"), (KIB, "KiB")];

#[derive(Clone, Copy, Default, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct ReadableSize(pub u64);

impl ReadableSize {
    pub const fn kb(count: u64) -> ReadableSize { ReadableSize(count * KIB) }

    pub const fn mb(count: u64) -> ReadableSize { ReadableSize(count * MIB) }

    pub const fn as_bytes(self) -> u64 { self.0 }

    pub const fn as_bytes_usize(self) -> usize { self.0 as usize }
}

impl From<usize> for ReadableSize {
    fn from(value: usize) -> Self { ReadableSize(value as u64) }
}

impl FromStr for ReadableSize {
    type Err = String;

    fn from_str(s: &str) -> Result<ReadableSize, String> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.is_ascii() {
            return Err(format!("{:?} is not a valid size", s));
        }
        let digits = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(digits);
        let unit = match unit.trim() {
            "" | "B" => B,
            "K" | "KB" | "KiB" => KIB,
            "M" | "MB" | "MiB" => MIB,
            "G" | "GB" | "GiB" => GIB,
            "T" | "TB" | "TiB" => TIB,
            other => return Err(format!("unknown size unit {:?} in {:?}", other, s)),
        };
        if let Ok(whole) = number.parse::<u64>() {
            return whole
                .checked_mul(unit)
                .map(ReadableSize)
                .ok_or_else(|| format!("size {:?} overflows", s));
        }
        number
            .parse::<f64>()
            .map(|n| ReadableSize((n * unit as f64) as u64))
            .map_err(|_| format!("invalid size string: {:?}", s))
    }
}

impl Display for ReadableSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (unit, name) in UNITS {
            if self.0 >= unit {
                return if self.0 % unit == 0 {
                    write!(f, "{}{}", self.0 / unit, name)
                } else {
                    write!(f, "{:.1}{}", self.0 as f64 / unit as f64, name)
                };
            }
        }
        write!(f, "{}B", self.0)
    }
}

impl Debug for ReadableSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self) }
}

impl Serialize for ReadableSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Only exact multiples round trip through the string form.
        match UNITS.iter().find(|(unit, _)| self.0 >= *unit && self.0 % unit == 0) {
            Some((unit, name)) => serializer.serialize_str(&format!("{}{}", self.0 / unit, name)),
            None => serializer.serialize_u64(self.0),
        }
    }
}

impl<'de> Deserialize<'de> for ReadableSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SizeVisitor;

        impl<'de> Visitor<'de> for SizeVisitor {
            type Value = ReadableSize;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a byte count or a size string like \"4KiB\"")
            }

            fn visit_i64<E: de::Error>(self, size: i64) -> Result<ReadableSize, E> {
                u64::try_from(size)
                    .map(ReadableSize)
                    .map_err(|_| E::invalid_value(Unexpected::Signed(size), &self))
            }

            fn visit_u64<E: de::Error>(self, size: u64) -> Result<ReadableSize, E> {
                Ok(ReadableSize(size))
            }

            fn visit_str<E: de::Error>(self, size: &str) -> Result<ReadableSize, E> {
                size.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(SizeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        assert_eq!("4096".parse::<ReadableSize>().unwrap(), ReadableSize(4096));
        assert_eq!("4KiB".parse::<ReadableSize>().unwrap(), ReadableSize::kb(4));
        assert_eq!(" 2 MB ".parse::<ReadableSize>().unwrap(), ReadableSize::mb(2));
        assert_eq!("1.5K".parse::<ReadableSize>().unwrap(), ReadableSize(1536));
        assert!("12 parsecs".parse::<ReadableSize>().is_err());
        assert!("".parse::<ReadableSize>().is_err());
    }

    #[test]
    fn display() {
        assert_eq!(ReadableSize(12).to_string(), "12B");
        assert_eq!(ReadableSize::kb(4).to_string(), "4KiB");
        assert_eq!(ReadableSize(1536).to_string(), "1.5KiB");
        assert_eq!(ReadableSize::mb(3).to_string(), "3MiB");
    }

    #[test]
    fn serde_round_trip() {
        let json = serde_json::to_string(&ReadableSize::mb(4)).unwrap();
        assert_eq!(json, "\"4MiB\"");
        let back: ReadableSize = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ReadableSize::mb(4));
        let raw: ReadableSize = serde_json::from_str("1000").unwrap();
        assert_eq!(raw, ReadableSize(1000));
    }
}
