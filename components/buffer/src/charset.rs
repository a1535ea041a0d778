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

//! Character sets for string fields, with a streaming decoder that keeps a
//! partially received character between calls.

use std::{
    borrow::Cow,
    fmt::{Display, Formatter},
};

use serde::{Deserialize, Serialize};
use snafu::Snafu;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Charset {
    #[default]
    Utf8,
    Utf16Be,
    Ascii,
}

impl Display for Charset {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Charset::Utf8 => "UTF-8",
            Charset::Utf16Be => "UTF-16BE",
            Charset::Ascii => "US-ASCII",
        })
    }
}

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum CharsetError {
    #[snafu(display("malformed {} input at byte {}", charset, offset))]
    Malformed { charset: Charset, offset: usize },

    #[snafu(display("{:?} cannot be represented in {}", ch, charset))]
    Unmappable { charset: Charset, ch: char },

    #[snafu(display("input ends inside a {} character", charset))]
    Truncated { charset: Charset },
}

impl Charset {
    pub fn encode<'a>(&self, s: &'a str) -> Result<Cow<'a, [u8]>, CharsetError> {
        match self {
            Charset::Utf8 => Ok(Cow::Borrowed(s.as_bytes())),
            Charset::Utf16Be => Ok(Cow::Owned(
                s.encode_utf16().flat_map(|unit| unit.to_be_bytes()).collect(),
            )),
            Charset::Ascii => match s.chars().find(|c| !c.is_ascii()) {
                Some(ch) => UnmappableSnafu { charset: *self, ch }.fail(),
                None => Ok(Cow::Borrowed(s.as_bytes())),
            },
        }
    }

    /// Decode a complete byte sequence.
    pub fn decode(&self, bytes: &[u8]) -> Result<String, CharsetError> {
        let mut out = String::with_capacity(bytes.len());
        let mut decoder = Decoder::new(*self);
        decoder.feed(bytes, &mut out)?;
        decoder.finish()?;
        Ok(out)
    }
}

/// Incremental decoder. Bytes of a character cut by a segment edge wait in
/// `pending` until the rest arrives.
#[derive(Debug, Clone)]
pub struct Decoder {
    charset:     Charset,
    pending:     [u8; 4],
    pending_len: usize,
    consumed:    usize,
}

impl Decoder {
    pub fn new(charset: Charset) -> Self {
        Self {
            charset,
            pending: [0; 4],
            pending_len: 0,
            consumed: 0,
        }
    }

    pub fn has_pending(&self) -> bool { self.pending_len > 0 }

    pub fn feed(&mut self, input: &[u8], out: &mut String) -> Result<(), CharsetError> {
        match self.charset {
            Charset::Utf8 => self.feed_utf8(input, out),
            Charset::Utf16Be => self.feed_utf16(input, out),
            Charset::Ascii => self.feed_ascii(input, out),
        }
    }

    /// Fails when the input stopped in the middle of a character.
    pub fn finish(self) -> Result<(), CharsetError> {
        if self.has_pending() {
            return TruncatedSnafu {
                charset: self.charset,
            }
            .fail();
        }
        Ok(())
    }

    fn malformed(&self, at: usize) -> CharsetError {
        CharsetError::Malformed {
            charset: self.charset,
            offset:  self.consumed + at,
        }
    }

    fn feed_ascii(&mut self, input: &[u8], out: &mut String) -> Result<(), CharsetError> {
        if let Some(at) = input.iter().position(|b| !b.is_ascii()) {
            out.extend(input[..at].iter().map(|&b| b as char));
            return Err(self.malformed(at));
        }
        out.extend(input.iter().map(|&b| b as char));
        self.consumed += input.len();
        Ok(())
    }

    fn feed_utf8(&mut self, mut input: &[u8], out: &mut String) -> Result<(), CharsetError> {
        if self.pending_len > 0 {
            let width = utf8_width(self.pending[0]).ok_or_else(|| self.malformed(0))?;
            let take = (width - self.pending_len).min(input.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&input[..take]);
            self.pending_len += take;
            input = &input[take..];
            if self.pending_len < width {
                return Ok(());
            }
            match std::str::from_utf8(&self.pending[..width]) {
                Ok(s) => out.push_str(s),
                Err(_) => return Err(self.malformed(0)),
            }
            self.consumed += take;
            self.pending_len = 0;
        }

        match std::str::from_utf8(input) {
            Ok(s) => {
                out.push_str(s);
                self.consumed += input.len();
                Ok(())
            }
            Err(e) => {
                let valid = e.valid_up_to();
                // valid_up_to guarantees the prefix parses.
                out.push_str(std::str::from_utf8(&input[..valid]).unwrap_or_default());
                match e.error_len() {
                    Some(_) => Err(self.malformed(valid)),
                    None => {
                        let tail = &input[valid..];
                        self.pending[..tail.len()].copy_from_slice(tail);
                        self.pending_len = tail.len();
                        self.consumed += input.len();
                        Ok(())
                    }
                }
            }
        }
    }

    fn feed_utf16(&mut self, input: &[u8], out: &mut String) -> Result<(), CharsetError> {
        for (at, &byte) in input.iter().enumerate() {
            self.pending[self.pending_len] = byte;
            self.pending_len += 1;
            match self.pending_len {
                2 => {
                    let unit = u16::from_be_bytes([self.pending[0], self.pending[1]]);
                    match unit {
                        0xD800..=0xDBFF => continue,
                        0xDC00..=0xDFFF => return Err(self.malformed(at)),
                        _ => {
                            out.push(char::from_u32(unit as u32).ok_or_else(|| self.malformed(at))?);
                            self.pending_len = 0;
                        }
                    }
                }
                4 => {
                    let high = u16::from_be_bytes([self.pending[0], self.pending[1]]);
                    let low = u16::from_be_bytes([self.pending[2], self.pending[3]]);
                    let ch = char::decode_utf16([high, low])
                        .next()
                        .and_then(|r| r.ok())
                        .ok_or_else(|| self.malformed(at))?;
                    out.push(ch);
                    self.pending_len = 0;
                }
                _ => {}
            }
        }
        self.consumed += input.len();
        Ok(())
    }
}

fn utf8_width(first: u8) -> Option<usize> {
    match first {
        0x00..=0x7F => Some(1),
        0xC0..=0xDF => Some(2),
        0xE0..=0xEF => Some(3),
        0xF0..=0xF7 => Some(4),
        _ => None,
    }
}
