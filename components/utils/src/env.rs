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

use std::{error::Error, str::FromStr};

use snafu::{whatever, ResultExt, Whatever};
use tessera_common::ENV_PREFIX;

/// Reads `TESSERA_<key>` for the current process.
///
/// The lookup goes through [dotenvy], so a `.env` file in the current or a
/// parent directory is honoured. An unset variable is `Ok(None)`, not an
/// error.
#[track_caller]
pub fn var(key: &str) -> Result<Option<String>, Whatever> {
    let name = format!("{ENV_PREFIX}{key}");
    match dotenvy::var(&name) {
        Ok(content) => Ok(Some(content)),
        Err(dotenvy::Error::EnvVar(std::env::VarError::NotPresent)) => Ok(None),
        Err(error) => whatever!(Err(error), "Failed to read {name} environment variable"),
    }
}

/// Like [var], and parses the value when it is set.
#[track_caller]
pub fn var_parsed<R>(key: &str) -> Result<Option<R>, Whatever>
where
    R: FromStr,
    R::Err: Error + Send + Sync + 'static,
{
    match var(key)? {
        Some(content) => Ok(Some(content.parse().with_whatever_context(|e| {
            format!("Failed to parse {ENV_PREFIX}{key} environment variable; {e}")
        })?)),
        None => Ok(None),
    }
}

/// Like [var_parsed] for types whose parse error is a plain message, such as
/// [crate::readable_size::ReadableSize].
#[track_caller]
pub fn var_parsed_with<R, F>(key: &str, parse: F) -> Result<Option<R>, Whatever>
where
    F: FnOnce(&str) -> Result<R, String>,
{
    match var(key)? {
        Some(content) => match parse(&content) {
            Ok(v) => Ok(Some(v)),
            Err(e) => whatever!("Failed to parse {ENV_PREFIX}{key} environment variable; {e}"),
        },
        None => Ok(None),
    }
}
