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

//! Variable byte code (VBC): the signed variable length integer encoding.
//!
//! Layout, least significant group first:
//!
//! ```text
//!   first byte   E S m m m m m m    E = end bit, S = sign bit, 6 magnitude bits
//!   next bytes   E m m m m m m m    7 magnitude bits each
//! ```
//!
//! The end bit is set on the last byte only. The magnitude is unsigned, the
//! sign lives in the first byte alone. A single byte with end and sign set
//! and zero magnitude (`0xC0`) encodes null, a true zero is `0x80`.
//!
//! `i32::MIN` and `i64::MIN` have no positive counterpart, so they are
//! written as fixed sequences: the sign byte `0x40`, zero bytes, and a
//! terminal byte holding the single top magnitude bit (`0x90` after three
//! zero bytes for `i32`, `0x82` after eight for `i64`). Decoders match those
//! before negating anything.

use std::ops::Deref;

use snafu::ensure;

use crate::err::{MalformedVbcSnafu, Result};

pub const END_BIT: u8 = 0b1000_0000;
pub const SIGN_BIT: u8 = 0b0100_0000;
const FIRST_MASK: u8 = 0b0011_1111;
const NEXT_MASK: u8 = 0b0111_1111;

/// Single byte null encoding, "negative zero".
pub const VBC_NULL: u8 = END_BIT | SIGN_BIT;
pub const VBC_ZERO: u8 = END_BIT;

pub const MAX_I32_LEN: usize = 5;
pub const MAX_I64_LEN: usize = 10;

pub const I32_MIN_ENCODED: [u8; MAX_I32_LEN] = [SIGN_BIT, 0, 0, 0, END_BIT | 0x10];
pub const I64_MIN_ENCODED: [u8; MAX_I64_LEN] = [SIGN_BIT, 0, 0, 0, 0, 0, 0, 0, 0, END_BIT | 0x02];

/// An encoded value, at most [MAX_I64_LEN] bytes, kept on the stack.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Encoded {
    bytes: [u8; MAX_I64_LEN],
    len:   usize,
}

impl Encoded {
    fn from_slice(src: &[u8]) -> Self {
        let mut bytes = [0u8; MAX_I64_LEN];
        bytes[..src.len()].copy_from_slice(src);
        Self {
            bytes,
            len: src.len(),
        }
    }

    pub fn as_slice(&self) -> &[u8] { &self.bytes[..self.len] }
}

impl Deref for Encoded {
    type Target = [u8];

    fn deref(&self) -> &[u8] { self.as_slice() }
}

impl std::fmt::Debug for Encoded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Encoded(")?;
        for (i, b) in self.as_slice().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:08b}", b)?;
        }
        write!(f, ")")
    }
}

fn encode_magnitude(negative: bool, magnitude: u64) -> Encoded {
    let mut bytes = [0u8; MAX_I64_LEN];
    bytes[0] = (magnitude as u8) & FIRST_MASK;
    if negative {
        bytes[0] |= SIGN_BIT;
    }
    let mut rest = magnitude >> 6;
    let mut len = 1;
    while rest != 0 {
        bytes[len] = (rest as u8) & NEXT_MASK;
        rest >>= 7;
        len += 1;
    }
    bytes[len - 1] |= END_BIT;
    Encoded { bytes, len }
}

pub fn encode_i32(value: i32) -> Encoded {
    if value == i32::MIN {
        return Encoded::from_slice(&I32_MIN_ENCODED);
    }
    encode_magnitude(value < 0, value.unsigned_abs() as u64)
}

pub fn encode_i64(value: i64) -> Encoded {
    if value == i64::MIN {
        return Encoded::from_slice(&I64_MIN_ENCODED);
    }
    encode_magnitude(value < 0, value.unsigned_abs())
}

pub fn encode_null() -> Encoded { Encoded::from_slice(&[VBC_NULL]) }

pub fn encoded_len_i64(value: i64) -> usize { encode_i64(value).len }

pub fn encoded_len_i32(value: i32) -> usize { encode_i32(value).len }

/// Per width decode parameters.
struct Width {
    max_len:      usize,
    min_terminal: u8,
    /// Largest magnitude a non-MIN value can carry.
    max_abs:      u128,
}

const I32_WIDTH: Width = Width {
    max_len:      MAX_I32_LEN,
    min_terminal: I32_MIN_ENCODED[MAX_I32_LEN - 1],
    max_abs:      i32::MAX as u128,
};

const I64_WIDTH: Width = Width {
    max_len:      MAX_I64_LEN,
    min_terminal: I64_MIN_ENCODED[MAX_I64_LEN - 1],
    max_abs:      i64::MAX as u128,
};

enum Decoded {
    Null,
    Min,
    Value(i128),
}

fn decode_with<F>(width: &Width, mut next: F) -> Result<Decoded>
where
    F: FnMut() -> Result<u8>,
{
    let first = next()?;
    let negative = first & SIGN_BIT != 0;
    let mut magnitude = (first & FIRST_MASK) as u128;
    if first & END_BIT != 0 {
        if negative && magnitude == 0 {
            return Ok(Decoded::Null);
        }
        return Ok(Decoded::Value(signed(negative, magnitude)));
    }

    let mut shift = 6;
    let mut len = 1;
    loop {
        let byte = next()?;
        len += 1;
        ensure!(
            len <= width.max_len,
            MalformedVbcSnafu {
                reason: "longer than the widest encoding",
            }
        );
        let last = byte & END_BIT != 0;
        if last && negative && magnitude == 0 && len == width.max_len && byte == width.min_terminal
        {
            return Ok(Decoded::Min);
        }
        magnitude |= ((byte & NEXT_MASK) as u128) << shift;
        shift += 7;
        if last {
            break;
        }
    }
    ensure!(
        magnitude <= width.max_abs,
        MalformedVbcSnafu {
            reason: "magnitude overflows the target width",
        }
    );
    ensure!(
        !(negative && magnitude == 0),
        MalformedVbcSnafu {
            reason: "multi-byte negative zero",
        }
    );
    Ok(Decoded::Value(signed(negative, magnitude)))
}

fn signed(negative: bool, magnitude: u128) -> i128 {
    if negative {
        -(magnitude as i128)
    } else {
        magnitude as i128
    }
}

/// Decode one value, pulling bytes from `next`. `None` is the null sentinel.
pub fn decode_i32<F>(next: F) -> Result<Option<i32>>
where
    F: FnMut() -> Result<u8>,
{
    Ok(match decode_with(&I32_WIDTH, next)? {
        Decoded::Null => None,
        Decoded::Min => Some(i32::MIN),
        Decoded::Value(v) => Some(v as i32),
    })
}

pub fn decode_i64<F>(next: F) -> Result<Option<i64>>
where
    F: FnMut() -> Result<u8>,
{
    Ok(match decode_with(&I64_WIDTH, next)? {
        Decoded::Null => None,
        Decoded::Min => Some(i64::MIN),
        Decoded::Value(v) => Some(v as i64),
    })
}

/// Decode from the front of a slice, returning the value and bytes consumed.
pub fn decode_i64_from_slice(src: &[u8]) -> Result<(Option<i64>, usize)> {
    let mut pos = 0;
    let value = decode_i64(|| {
        let byte = src.get(pos).copied();
        pos += 1;
        byte.ok_or_else(|| {
            crate::err::OutOfRangeSnafu {
                op:     "vbc decode",
                offset: pos - 1,
                len:    1usize,
                limit:  src.len(),
            }
            .build()
        })
    })?;
    Ok((value, pos))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    fn decode32(bytes: &[u8]) -> Result<Option<i32>> {
        let mut iter = bytes.iter().copied();
        decode_i32(|| {
            iter.next().ok_or_else(|| {
                MalformedVbcSnafu {
                    reason: "truncated",
                }
                .build()
            })
        })
    }

    fn decode64(bytes: &[u8]) -> Result<Option<i64>> {
        decode_i64_from_slice(bytes).map(|(v, _)| v)
    }

    #[rstest]
    #[case(0, &[0b1000_0000])]
    #[case(1, &[0b1000_0001])]
    #[case(-1, &[0b1100_0001])]
    #[case(63, &[0b1011_1111])]
    #[case(64, &[0b0000_0000, 0b1000_0001])]
    #[case(-229, &[0b0110_0101, 0b1000_0011])]
    #[case(229, &[0b0010_0101, 0b1000_0011])]
    #[case(i32::MAX, &[0x3F, 0x7F, 0x7F, 0x7F, 0x8F])]
    #[case(i32::MIN, &I32_MIN_ENCODED)]
    fn i32_layout(#[case] value: i32, #[case] expected: &[u8]) {
        let encoded = encode_i32(value);
        assert_eq!(encoded.as_slice(), expected, "{:?}", encoded);
        assert_eq!(decode32(expected).unwrap(), Some(value));
    }

    #[rstest]
    #[case(0)]
    #[case(-1)]
    #[case(i64::MAX)]
    #[case(i64::MIN)]
    #[case(i64::MIN + 1)]
    #[case(i32::MIN as i64)]
    fn i64_edges(#[case] value: i64) {
        let encoded = encode_i64(value);
        assert!(encoded.len() <= MAX_I64_LEN);
        assert_eq!(decode64(&encoded).unwrap(), Some(value));
    }

    #[test]
    fn min_values_use_fixed_sequences() {
        assert_eq!(encode_i64(i64::MIN).as_slice(), &I64_MIN_ENCODED);
        assert_eq!(encode_i32(i32::MIN).as_slice(), &I32_MIN_ENCODED);
        // i32::MIN read as a 64-bit value is just a regular negative number.
        assert_eq!(decode64(&I32_MIN_ENCODED).unwrap(), Some(i32::MIN as i64));
        // i64::MIN does not fit 32 bits.
        assert!(decode32(&I64_MIN_ENCODED).is_err());
    }

    #[test]
    fn null_is_not_zero() {
        assert_eq!(encode_null().as_slice(), &[VBC_NULL]);
        assert_eq!(decode32(&[VBC_NULL]).unwrap(), None);
        assert_eq!(decode64(&[VBC_NULL]).unwrap(), None);
        assert_eq!(decode32(&[VBC_ZERO]).unwrap(), Some(0));
    }

    #[test]
    fn malformed_input() {
        // i32::MAX + 1 as a positive magnitude.
        assert!(decode32(&[0x00, 0x00, 0x00, 0x00, 0x90]).is_err());
        // Six bytes never fit 32 bits.
        assert!(decode32(&[0, 0, 0, 0, 0, 0x81]).is_err());
        assert!(decode32(&[0x40, 0x80]).is_err());
        // Missing terminator.
        assert!(decode64(&[0x00, 0x01]).is_err());
    }

    #[test]
    fn consumed_length() {
        let mut bytes = encode_i64(-300_000).to_vec();
        bytes.push(0xFF);
        let (value, used) = decode_i64_from_slice(&bytes).unwrap();
        assert_eq!(value, Some(-300_000));
        assert_eq!(used, bytes.len() - 1);
        assert_eq!(encoded_len_i64(-300_000), used);
    }

    proptest! {
        #[test]
        fn i32_round_trip(value in any::<i32>()) {
            let encoded = encode_i32(value);
            prop_assert_eq!(encoded.len(), encoded_len_i32(value));
            prop_assert_eq!(decode32(&encoded).unwrap(), Some(value));
        }

        #[test]
        fn i64_round_trip(value in any::<i64>()) {
            prop_assert_eq!(decode64(&encode_i64(value)).unwrap(), Some(value));
        }
    }
}
