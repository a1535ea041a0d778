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

//! The typed codec shared by every buffer kind.
//!
//! Implementors provide raw byte movement, the provided methods layer the
//! big-endian primitives, VBC integers and strings on top.

use snafu::{ensure, OptionExt, ResultExt};

use crate::{
    charset::{Charset, CharsetError},
    err::{EncodingSnafu, MalformedVbcSnafu, NullValueSnafu, OutOfRangeSnafu, Result},
    vbc,
};

const MEDIUM_MASK: u32 = 0x00FF_FFFF;

pub trait Readable {
    /// Bytes left to read.
    fn remaining(&self) -> usize;

    fn read_u8(&mut self) -> Result<u8>;

    /// Fill `dst` completely, or fail without consuming anything.
    fn read_exact(&mut self, dst: &mut [u8]) -> Result<()>;

    fn skip(&mut self, n: usize) -> Result<()>;

    /// Decode the next `len` bytes as a string.
    fn read_str(&mut self, len: usize, charset: Charset) -> Result<String> {
        let bytes = self.read_vec(len)?;
        charset.decode(&bytes).context(EncodingSnafu)
    }

    fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read_exact(&mut out)?;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        self.read_exact(&mut out)?;
        Ok(out)
    }

    fn read_i8(&mut self) -> Result<i8> { Ok(self.read_u8()? as i8) }

    fn read_bool(&mut self) -> Result<bool> { Ok(self.read_u8()? != 0) }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_be_bytes(self.read_array()?))
    }

    /// A single UTF-16 code unit. Surrogates are not characters on their own.
    fn read_char(&mut self) -> Result<char> {
        let unit = self.read_u16()?;
        char::from_u32(unit as u32)
            .ok_or(CharsetError::Malformed {
                charset: Charset::Utf16Be,
                offset:  0,
            })
            .context(EncodingSnafu)
    }

    /// Three bytes, sign extended.
    fn read_medium(&mut self) -> Result<i32> {
        let raw = self.read_unsigned_medium()?;
        Ok(((raw << 8) as i32) >> 8)
    }

    fn read_unsigned_medium(&mut self) -> Result<u32> {
        let [a, b, c] = self.read_array::<3>()?;
        Ok(u32::from_be_bytes([0, a, b, c]))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.read_array()?))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.read_array()?))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// `None` is the VBC null.
    fn read_vbc_i32(&mut self) -> Result<Option<i32>> {
        vbc::decode_i32(|| self.read_u8())
    }

    fn read_vbc_i64(&mut self) -> Result<Option<i64>> {
        vbc::decode_i64(|| self.read_u8())
    }

    /// Like [Readable::read_vbc_i32] but null is an error.
    fn read_vbc_i32_required(&mut self) -> Result<i32> {
        match self.read_vbc_i32()? {
            Some(v) => Ok(v),
            None => NullValueSnafu.fail(),
        }
    }

    fn read_vbc_i64_required(&mut self) -> Result<i64> {
        match self.read_vbc_i64()? {
            Some(v) => Ok(v),
            None => NullValueSnafu.fail(),
        }
    }

    /// A VBC byte length followed by UTF-8 bytes.
    fn read_string(&mut self) -> Result<Option<String>> {
        self.read_string_with(Charset::Utf8)
    }

    fn read_string_with(&mut self, charset: Charset) -> Result<Option<String>> {
        let len = match self.read_vbc_i32()? {
            Some(len) => len,
            None => return Ok(None),
        };
        ensure!(
            len >= 0,
            MalformedVbcSnafu {
                reason: "negative string length",
            }
        );
        let len = len as usize;
        ensure!(
            len <= self.remaining(),
            OutOfRangeSnafu {
                op:     "read string",
                offset: 0usize,
                len,
                limit:  self.remaining(),
            }
        );
        self.read_str(len, charset).map(Some)
    }
}

pub trait Writable {
    fn write_u8(&mut self, value: u8) -> Result<()>;

    fn write_slice(&mut self, src: &[u8]) -> Result<()>;

    fn write_i8(&mut self, value: i8) -> Result<()> { self.write_u8(value as u8) }

    fn write_bool(&mut self, value: bool) -> Result<()> { self.write_u8(value as u8) }

    fn write_u16(&mut self, value: u16) -> Result<()> { self.write_slice(&value.to_be_bytes()) }

    fn write_i16(&mut self, value: i16) -> Result<()> { self.write_slice(&value.to_be_bytes()) }

    /// One UTF-16 code unit, characters outside the BMP do not fit.
    fn write_char(&mut self, value: char) -> Result<()> {
        let mut units = [0u16; 2];
        match value.encode_utf16(&mut units) {
            [unit] => self.write_u16(*unit),
            _ => Err(CharsetError::Unmappable {
                charset: Charset::Utf16Be,
                ch:      value,
            })
            .context(EncodingSnafu),
        }
    }

    /// The low 24 bits of `value`.
    fn write_medium(&mut self, value: i32) -> Result<()> {
        let [_, a, b, c] = ((value as u32) & MEDIUM_MASK).to_be_bytes();
        self.write_slice(&[a, b, c])
    }

    fn write_i32(&mut self, value: i32) -> Result<()> { self.write_slice(&value.to_be_bytes()) }

    fn write_u32(&mut self, value: u32) -> Result<()> { self.write_slice(&value.to_be_bytes()) }

    fn write_i64(&mut self, value: i64) -> Result<()> { self.write_slice(&value.to_be_bytes()) }

    fn write_u64(&mut self, value: u64) -> Result<()> { self.write_slice(&value.to_be_bytes()) }

    fn write_f32(&mut self, value: f32) -> Result<()> { self.write_u32(value.to_bits()) }

    fn write_f64(&mut self, value: f64) -> Result<()> { self.write_u64(value.to_bits()) }

    fn write_vbc_i32(&mut self, value: i32) -> Result<()> {
        self.write_slice(&vbc::encode_i32(value))
    }

    fn write_vbc_i64(&mut self, value: i64) -> Result<()> {
        self.write_slice(&vbc::encode_i64(value))
    }

    fn write_vbc_null(&mut self) -> Result<()> { self.write_u8(vbc::VBC_NULL) }

    /// Raw encoded bytes, no length prefix.
    fn write_str(&mut self, value: &str, charset: Charset) -> Result<()> {
        let encoded = charset.encode(value).context(EncodingSnafu)?;
        self.write_slice(&encoded)
    }

    /// A VBC byte length followed by UTF-8 bytes, `None` writes the VBC null.
    fn write_string(&mut self, value: Option<&str>) -> Result<()> {
        self.write_string_with(value, Charset::Utf8)
    }

    fn write_string_with(&mut self, value: Option<&str>, charset: Charset) -> Result<()> {
        let Some(value) = value else {
            return self.write_vbc_null();
        };
        let encoded = charset.encode(value).context(EncodingSnafu)?;
        let len = i32::try_from(encoded.len()).ok().context(OutOfRangeSnafu {
            op:     "string length",
            offset: 0usize,
            len:    encoded.len(),
            limit:  i32::MAX as usize,
        })?;
        self.write_vbc_i32(len)?;
        self.write_slice(&encoded)
    }
}
