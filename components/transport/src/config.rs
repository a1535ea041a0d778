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

use std::path::Path;

use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use tessera_buffer::{new_chunk_manager, ChunkManagerRef, OverflowPolicy, PoolConfig};
use tessera_common::{BASE_WEIGHT, DEFAULT_BASE_QUANTUM_BONUS, MAX_QUEUE_WEIGHT, MIN_QUEUE_WEIGHT};
use tessera_utils::{env, readable_size::ReadableSize};
use tracing::debug;

use crate::err::{ConfigSnafu, EnvOverrideSnafu, InvalidWeightSnafu, ReadConfigSnafu, Result};

/// Overrides [PoolConfig::max_pooled_size], e.g. `TESSERA_POOL_MAX_SIZE=1MiB`.
pub const POOL_MAX_SIZE_ENV: &str = "POOL_MAX_SIZE";
/// Overrides [PoolConfig::overflow], `strict` or `aggressive`.
pub const POOL_OVERFLOW_ENV: &str = "POOL_OVERFLOW";
/// Overrides [WriteQueueConfig::base_quantum_bonus].
pub const QUEUE_BONUS_ENV: &str = "QUEUE_BONUS";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WriteQueueConfig {
    /// One entry per weighted queue, priority `i` uses `weights[i]`. Each
    /// must lie in `[0.05, 1.0]`.
    pub weights:            Vec<f32>,
    /// The quantum weighted queues share in a round where the base queue had
    /// nothing to send.
    pub base_quantum_bonus: ReadableSize,
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self {
            weights:            vec![1.0, 0.5],
            base_quantum_bonus: ReadableSize(DEFAULT_BASE_QUANTUM_BONUS as u64),
        }
    }
}

impl WriteQueueConfig {
    pub fn with_weights(mut self, weights: impl Into<Vec<f32>>) -> Self {
        self.weights = weights.into();
        self
    }

    pub fn with_base_quantum_bonus(mut self, bonus: usize) -> Self {
        self.base_quantum_bonus = ReadableSize(bonus as u64);
        self
    }

    /// Integer weights relative to [BASE_WEIGHT], rejecting any float weight
    /// outside the allowed range.
    pub fn normalized_weights(&self) -> Result<Vec<u32>> {
        self.weights
            .iter()
            .enumerate()
            .map(|(index, &weight)| -> Result<u32> {
                ensure!(
                    (MIN_QUEUE_WEIGHT..=MAX_QUEUE_WEIGHT).contains(&weight),
                    InvalidWeightSnafu {
                        index,
                        weight,
                        min: MIN_QUEUE_WEIGHT,
                        max: MAX_QUEUE_WEIGHT,
                    }
                );
                Ok((weight * BASE_WEIGHT as f32).round() as u32)
            })
            .collect()
    }
}

/// Everything the transport core reads from the outer config layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    pub pool:        PoolConfig,
    pub write_queue: WriteQueueConfig,
}

impl TransportConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context(ConfigSnafu)
    }

    /// Read a TOML file, then let `TESSERA_*` variables override it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context(ReadConfigSnafu { path })?;
        let config = Self::from_toml_str(&content)?.apply_env_overrides()?;
        debug!("loaded transport config from {}: {:?}", path.display(), config);
        Ok(config)
    }

    pub fn apply_env_overrides(mut self) -> Result<Self> {
        if let Some(size) =
            env::var_parsed_with(POOL_MAX_SIZE_ENV, |s| s.parse::<ReadableSize>())
                .context(EnvOverrideSnafu)?
        {
            self.pool.max_pooled_size = size;
        }
        if let Some(overflow) =
            env::var_parsed_with(POOL_OVERFLOW_ENV, |s| s.parse::<OverflowPolicy>())
                .context(EnvOverrideSnafu)?
        {
            self.pool.overflow = overflow;
        }
        if let Some(bonus) = env::var_parsed_with(QUEUE_BONUS_ENV, |s| s.parse::<ReadableSize>())
            .context(EnvOverrideSnafu)?
        {
            self.write_queue.base_quantum_bonus = bonus;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.write_queue.normalized_weights()?;
        Ok(())
    }

    pub fn new_chunk_manager(&self) -> Result<ChunkManagerRef> {
        Ok(new_chunk_manager(self.pool.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rstest::rstest;

    use super::*;
    use crate::err::Error;

    #[test]
    fn toml_round_trip() {
        let config = TransportConfig::from_toml_str(
            r#"
            [pool]
            max_pooled_size = "1MiB"
            bucket_capacity = 64
            overflow = "aggressive"
            storage = "native"

            [write_queue]
            weights = [1.0, 0.25, 0.05]
            base_quantum_bonus = "16KiB"
            "#,
        )
        .unwrap();
        assert_eq!(config.pool.max_pooled_size, ReadableSize::mb(1));
        assert_eq!(config.pool.bucket_capacity, 64);
        assert_eq!(config.pool.overflow, OverflowPolicy::Aggressive);
        assert_eq!(config.write_queue.normalized_weights().unwrap(), vec![100, 25, 5]);
        assert_eq!(config.write_queue.base_quantum_bonus, ReadableSize::kb(16));

        let printed = toml::to_string(&config).unwrap();
        assert_eq!(TransportConfig::from_toml_str(&printed).unwrap(), config);
    }

    #[test]
    fn missing_sections_take_defaults() {
        let config = TransportConfig::from_toml_str("").unwrap();
        assert_eq!(config, TransportConfig::default());
        assert_eq!(
            config.write_queue.base_quantum_bonus.as_bytes_usize(),
            DEFAULT_BASE_QUANTUM_BONUS
        );
        config.validate().unwrap();
    }

    #[rstest]
    #[case(vec![0.04])]
    #[case(vec![1.0, 1.5])]
    #[case(vec![f32::NAN])]
    fn weights_out_of_bounds(#[case] weights: Vec<f32>) {
        let config = WriteQueueConfig::default().with_weights(weights);
        let err = config.normalized_weights().unwrap_err();
        assert!(matches!(err, Error::InvalidWeight { .. }));
        assert!(err.is_configuration());
    }

    #[test]
    fn malformed_toml() {
        let err = TransportConfig::from_toml_str("[pool]\nbucket_capacity = \"many\"").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn load_applies_env_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[write_queue]\nweights = [0.5]").unwrap();

        std::env::set_var("TESSERA_POOL_OVERFLOW", "aggressive");
        std::env::set_var("TESSERA_QUEUE_BONUS", "8KiB");
        let config = TransportConfig::load(file.path()).unwrap();
        std::env::remove_var("TESSERA_POOL_OVERFLOW");
        std::env::remove_var("TESSERA_QUEUE_BONUS");

        assert_eq!(config.write_queue.weights, vec![0.5]);
        assert_eq!(config.pool.overflow, OverflowPolicy::Aggressive);
        assert_eq!(config.write_queue.base_quantum_bonus, ReadableSize::kb(8));
    }

    #[test]
    fn missing_file() {
        let err = TransportConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, Error::ReadConfig { .. }));
    }
}
