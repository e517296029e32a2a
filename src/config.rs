// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use thiserror::Error;

/// Force one residency class onto every managed argument, bypassing the
/// placement machinery. `Auto` enables the full engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalMode {
    Auto,
    Um,
    Dev,
    Host,
    Hyb,
    SoftDev,
}

/// Admission order of a region's arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankOrder {
    /// Ascending predicted reuse distance, ties by ascending rank.
    ReuseDistance,
    /// Ascending reuse rank alone.
    Reuse,
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("device capacity must not be zero")]
    ZeroCapacity,
    #[error("device memory ratio {0} is outside [0, 1]")]
    RatioOutOfRange(f64),
}

/// Tunables of the placement engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Device memory capacity in bytes.
    pub total_dev_size: u64,
    /// Headroom tolerated above capacity for non-managed arguments.
    pub budget_slack: u64,
    /// Device share of a ratio-split (HYB) mapping.
    pub dev_mem_ratio: f64,
    /// Allow nominating one buffer per region for partial mapping.
    pub partial_map: bool,
    /// When false, sparse buffers use a soft device mapping instead of
    /// on-demand unified memory.
    pub demand_paging: bool,
    pub mode: GlobalMode,
    pub rank_order: RankOrder,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            total_dev_size: 1 << 30,
            budget_slack: 1024,
            dev_mem_ratio: 0.5,
            partial_map: true,
            demand_paging: true,
            mode: GlobalMode::Auto,
            rank_order: RankOrder::ReuseDistance,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.total_dev_size == 0 {
            return Err(ValidationError::ZeroCapacity);
        }
        if !(0.0..=1.0).contains(&self.dev_mem_ratio) {
            return Err(ValidationError::RatioOutOfRange(self.dev_mem_ratio));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_configs() {
        let config = EngineConfig {
            total_dev_size: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ValidationError::ZeroCapacity));

        let config = EngineConfig {
            dev_mem_ratio: 1.5,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ValidationError::RatioOutOfRange(1.5))
        );
    }
}
