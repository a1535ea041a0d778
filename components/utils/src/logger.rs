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

use snafu::{ResultExt, Whatever};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Environment variable that overrides [LoggingConfig::default_filter].
pub const LOG_ENV: &str = "TESSERA_LOG";

/// Configuration for tessera logging.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Whether to print logs to stdout. Nothing else is wired up, so
    /// turning this off silences the subscriber entirely.
    pub log_to_stdout: bool,
    /// The default filter directive (in the sense of
    /// [tracing_subscriber::filter::EnvFilter]) to use for logs. Will be
    /// overridden by the `TESSERA_LOG` environment variable if set.
    pub default_filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_to_stdout: true,
            default_filter: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn init_tracing_subscriber(self) -> Result<(), Whatever> {
        let env_filter = create_env_filter(&self.default_filter);
        // Don't create the subscribers if we'll never emit any logs
        if env_filter.max_level_hint() == Some(LevelFilter::OFF) || !self.log_to_stdout {
            return Ok(());
        }
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_ansi(supports_color::on(supports_color::Stream::Stdout).is_some())
            .with_filter(env_filter);

        tracing_subscriber::registry()
            .with(fmt_layer)
            .try_init()
            .whatever_context("a global tracing subscriber is already installed")
    }
}

/// Install a plain fmt subscriber for tests, ignoring the error when another
/// test in the same binary got there first.
pub fn install_fmt_log() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(create_env_filter("debug"))
        .with_test_writer()
        .try_init();
}

/// Create the filter from the TESSERA_LOG environment variable or the
/// default directive if that variable is unset. [EnvFilter] isn't [Clone],
/// so every layer asks for a fresh one.
fn create_env_filter(filter: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(filter))
}
